use std::collections::BTreeMap;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use crate::error::CommonError;
use libsql::params::IntoParams;
use libsql::{BatchRows, Database, Rows};
use tempfile::TempDir;
use tracing::{debug, info};
use url::Url;

/// Writes `migrations` (file name to contents) into a fresh temporary
/// directory. The directory is removed when the returned handle drops.
pub fn write_migrations_to_temp_dir(
    migrations: &BTreeMap<&str, &str>,
) -> Result<TempDir, CommonError> {
    let temp_dir = TempDir::new()?;

    for (filename, contents) in migrations {
        let file_path = temp_dir.path().join(filename);
        fs::write(file_path, contents)?;
    }

    Ok(temp_dir)
}

#[derive(Debug, Clone)]
pub struct Connection(pub libsql::Connection);

impl Connection {
    pub fn new(connection: libsql::Connection) -> Self {
        Self(connection)
    }
}

impl Deref for Connection {
    type Target = libsql::Connection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[macro_export]
macro_rules! execute_with_retry {
    ($operation:expr) => {
        execute_with_retry!($operation, 10)
    };
    ($operation:expr, $max_retries:expr) => {{
        async {
            let mut _retries = 0u32;
            let _max_retries: u32 = $max_retries;

            loop {
                match $operation.await {
                    Ok(result) => break Ok(result),
                    Err(err) => {
                        let err_str = err.to_string();
                        if err_str.contains("database is locked") || err_str.contains("SQLITE_BUSY")
                        {
                            tracing::warn!("Database is locked, retrying... {:?}", err);
                            if _retries >= _max_retries {
                                break Err(err);
                            }

                            _retries += 1;

                            let delay_us = 10_000 * (1 << _retries.min(6));
                            tokio::time::sleep(std::time::Duration::from_micros(delay_us)).await;
                        } else {
                            tracing::debug!("Error executing with retry: {:?}", err);
                            break Err(err);
                        }
                    }
                }
            }
        }
        .await
    }};
}

impl Connection {
    /// Execute sql query provided some type that implements [`IntoParams`] returning
    /// on success the number of rows that were changed.
    ///
    /// Busy and locked errors are retried with exponential backoff.
    pub async fn execute(&self, sql: &str, params: impl IntoParams) -> libsql::Result<u64> {
        tracing::trace!("executing `{}`", sql);
        let params = params.into_params()?;
        execute_with_retry!(self.0.execute(sql, params.clone()), 10)
    }

    /// Execute a batch set of statements.
    pub async fn execute_batch(&self, sql: &str) -> libsql::Result<BatchRows> {
        tracing::trace!("executing batch `{}`", sql);
        execute_with_retry!(self.0.execute_batch(sql), 10)
    }

    /// Execute sql query provided some type that implements [`IntoParams`] returning
    /// on success the [`Rows`].
    pub async fn query(&self, sql: &str, params: impl IntoParams) -> libsql::Result<Rows> {
        tracing::trace!("querying `{}`", sql);
        let stmt = self.prepare(sql).await?;
        let params = params.into_params()?;
        execute_with_retry!(stmt.query(params.clone()), 10)
    }
}

pub struct LocalConnectionParams {
    pub path_to_db_file: PathBuf,
}

pub struct RemoteReplicaConnectionParams {
    pub path_to_db_file: PathBuf,
    pub remote_url: String,
    pub auth_token: String,
}

pub struct RemoteConnectionParams {
    pub remote_url: String,
    pub auth_token: String,
}

pub enum ConnectionType {
    Local(LocalConnectionParams),
    RemoteReplica(RemoteReplicaConnectionParams),
    Remote(RemoteConnectionParams),
}

fn get_libsql_path(url: &Url) -> PathBuf {
    if url.as_str().starts_with("libsql://./") {
        PathBuf::from(format!(".{}", url.path()))
    } else {
        PathBuf::from(url.path())
    }
}

fn required_query_param(url: &Url, key: &str, mode: &str) -> Result<String, CommonError> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, value)| value.to_string())
        .ok_or_else(|| {
            CommonError::Unknown(anyhow::anyhow!(
                "missing {key} query parameter for {mode} connection"
            ))
        })
}

impl TryFrom<Url> for ConnectionType {
    type Error = CommonError;
    fn try_from(url: Url) -> Result<Self, Self::Error> {
        if url.scheme() != "libsql" {
            let scheme = url.scheme();
            return Err(CommonError::Unknown(anyhow::anyhow!(
                "invalid scheme: {scheme}"
            )));
        }

        let mode = required_query_param(&url, "mode", "libsql")?;

        match mode.as_str() {
            "local" => Ok(ConnectionType::Local(LocalConnectionParams {
                path_to_db_file: get_libsql_path(&url),
            })),
            "remote_replica" => {
                let mut remote_url = url.clone();
                remote_url.set_query(None);

                let auth_token = required_query_param(&url, "auth", &mode)?;
                let path_to_db_file = required_query_param(&url, "path", &mode)?;

                Ok(ConnectionType::RemoteReplica(
                    RemoteReplicaConnectionParams {
                        path_to_db_file: PathBuf::from(path_to_db_file),
                        remote_url: remote_url.to_string(),
                        auth_token,
                    },
                ))
            }
            "remote" => {
                let mut remote_url = url.clone();
                remote_url.set_query(None);

                let auth_token = required_query_param(&url, "auth", &mode)?;

                Ok(ConnectionType::Remote(RemoteConnectionParams {
                    remote_url: remote_url.to_string(),
                    auth_token,
                }))
            }
            _ => Err(CommonError::Unknown(anyhow::anyhow!(
                "invalid mode: {mode}"
            ))),
        }
    }
}

pub fn inject_auth_token_to_db_url(
    url: &Url,
    auth_token: &Option<String>,
) -> Result<Url, CommonError> {
    let mut conn_url = url.clone();
    if let Some(auth_token) = auth_token {
        conn_url.query_pairs_mut().append_pair("auth", auth_token);
    }
    Ok(conn_url)
}

/// Migrations keyed by backend ("sqlite"), then by file name.
pub type Migrations<'a> = BTreeMap<&'a str, BTreeMap<&'a str, &'a str>>;

pub fn merge_nested_migrations<'a>(mergable_migrations: Vec<Migrations<'a>>) -> Migrations<'a> {
    let mut target = Migrations::new();
    for other in mergable_migrations {
        for (outer_key, inner_map) in other {
            target
                .entry(outer_key)
                .and_modify(|existing_inner| {
                    for (inner_key, value) in inner_map.iter() {
                        existing_inner.insert(*inner_key, *value);
                    }
                })
                .or_insert(inner_map);
        }
    }
    target
}

/// Applies every `.up.` sqlite migration through `libsql_migration`, which
/// records applied files in its `libsql_migrations` table and skips them on
/// later runs.
pub async fn run_migrations(
    conn: &Connection,
    migrations: &Migrations<'_>,
) -> Result<(), CommonError> {
    let Some(sqlite_migrations) = migrations.get("sqlite") else {
        debug!("no sqlite migrations to run");
        return Ok(());
    };

    let migrations_to_run = sqlite_migrations
        .iter()
        .filter(|(name, _)| name.contains(".up."))
        .map(|(name, contents)| (*name, *contents))
        .collect::<BTreeMap<&str, &str>>();

    let temp_dir = write_migrations_to_temp_dir(&migrations_to_run)?;
    let applied = libsql_migration::dir::migrate(&conn.0, temp_dir.path().to_path_buf()).await?;
    info!(
        migrations = migrations_to_run.len(),
        applied, "sqlite migrations up to date"
    );

    Ok(())
}

fn create_db_file_parent_dir(parent_path: Option<&Path>) -> Result<(), CommonError> {
    if let Some(path) = parent_path
        && !path.as_os_str().is_empty()
        && !std::fs::exists(path)?
    {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

pub async fn establish_db_connection<'a>(
    connection_string: &Url,
    migrations: Option<Migrations<'a>>,
) -> Result<(Database, Connection), CommonError> {
    let connection_type = ConnectionType::try_from(connection_string.clone())?;

    let (db, conn) = match connection_type {
        ConnectionType::Local(params) => {
            info!(path = %params.path_to_db_file.display(), "establishing local connection");
            create_db_file_parent_dir(params.path_to_db_file.parent())?;
            let db = libsql::Builder::new_local(params.path_to_db_file.clone())
                .build()
                .await?;
            let conn = db.connect()?;
            (db, conn)
        }
        ConnectionType::RemoteReplica(params) => {
            info!("establishing remote replica connection");
            create_db_file_parent_dir(params.path_to_db_file.parent())?;
            let db = libsql::Builder::new_remote_replica(
                params.path_to_db_file.clone(),
                params.remote_url.clone(),
                params.auth_token.clone(),
            )
            .read_your_writes(true)
            .build()
            .await?;
            let conn = db.connect()?;
            (db, conn)
        }
        ConnectionType::Remote(params) => {
            info!("establishing remote connection");
            let db =
                libsql::Builder::new_remote(params.remote_url.clone(), params.auth_token.clone())
                    .build()
                    .await?;
            let conn = db.connect()?;
            (db, conn)
        }
    };

    let conn = Connection(conn);

    if let Some(migrations) = migrations {
        run_migrations(&conn, &migrations).await?;
    }

    Ok((db, conn))
}
