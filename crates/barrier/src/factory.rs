use std::sync::Arc;

use shared::error::CommonError;
use shared::libsql::{establish_db_connection, inject_auth_token_to_db_url};
use shared::primitives::SqlMigrationLoader;
use tracing::info;

use crate::config::BarrierConfig;
use crate::logic::{
    BarrierService, BarrierServiceOptions, RootKeks, UnsealMode, UnsealSecretSource,
    derive_root_keks, load_unseal_secrets,
};
use crate::repository::{BarrierKeyRepositoryLike, Repository};

/// Loads the unseal secrets and derives the root KEK candidates for `mode`.
/// The secrets are dropped (and zeroized) before this returns.
pub fn unseal(
    sources: &[UnsealSecretSource],
    mode: UnsealMode,
    options: &BarrierServiceOptions,
) -> Result<RootKeks, CommonError> {
    let root_keks = {
        let secrets = load_unseal_secrets(sources)?;
        derive_root_keks(&secrets, mode, options.kdf_label)?
    };
    info!(
        sources = sources.len(),
        candidates = root_keks.len(),
        mode = ?mode,
        kdf_label = %options.kdf_label,
        "barrier unsealed"
    );
    Ok(root_keks)
}

/// Unseals and returns a service over `repository`.
pub fn unseal_barrier_service(
    sources: &[UnsealSecretSource],
    mode: UnsealMode,
    repository: Arc<dyn BarrierKeyRepositoryLike>,
    options: BarrierServiceOptions,
) -> Result<BarrierService, CommonError> {
    let root_keks = unseal(sources, mode, &options)?;
    Ok(BarrierService::new(repository, root_keks, options))
}

/// Builds a service from configuration: unseals, then connects to the
/// database and applies the barrier migrations. Nothing touches the database
/// unless unsealing succeeds. The returned database handle must outlive the
/// service.
pub async fn create_barrier_service(
    config: &BarrierConfig,
) -> Result<(libsql::Database, BarrierService), CommonError> {
    config.validate()?;
    let options = config.service_options();
    let root_keks = unseal(&config.unseal_sources(), config.unseal_mode(), &options)?;

    let db_url = inject_auth_token_to_db_url(&config.db_conn_string, &config.db_auth_token)?;
    let (db, conn) =
        establish_db_connection(&db_url, Some(Repository::load_sql_migrations())).await?;
    let repository = Arc::new(Repository::new(conn));

    Ok((db, BarrierService::new(repository, root_keks, options)))
}
