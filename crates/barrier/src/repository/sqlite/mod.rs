#![allow(non_camel_case_types)]
mod queries;
mod raw_impl;

use std::collections::BTreeMap;

use anyhow::Context;
use shared::{error::CommonError, primitives::SqlMigrationLoader};
use shared_macros::load_sql_migrations;

use crate::logic::keys::{BarrierKey, KeyType, KeyVersion};
use crate::repository::{
    BarrierKeyRepositoryLike, CreateBarrierKey, VersionAssignment, key_not_found,
};
use queries::{
    get_barrier_key_by_version, get_latest_barrier_key, insert_barrier_key_params,
    insert_first_barrier_key, insert_next_barrier_key,
};

#[derive(Clone)]
pub struct Repository {
    conn: shared::libsql::Connection,
}

impl Repository {
    pub fn new(conn: shared::libsql::Connection) -> Self {
        Self { conn }
    }
}

fn is_unique_violation(err: &libsql::Error) -> bool {
    let msg = err.to_string();
    msg.contains("UNIQUE constraint failed") || msg.contains("PRIMARY KEY")
}

#[async_trait::async_trait]
impl BarrierKeyRepositoryLike for Repository {
    async fn create_key(&self, params: &CreateBarrierKey) -> Result<BarrierKey, CommonError> {
        let kdf_label = params.kdf_label.map(|label| label.as_str().to_string());
        let sqlc_params = insert_barrier_key_params {
            key_type: &params.key_type,
            parent_version: &params.parent_version,
            kdf_label: &kdf_label,
            nonce: &params.wrapped.nonce,
            ciphertext: &params.wrapped.ciphertext,
            tag: &params.wrapped.tag,
            created_at: &params.created_at,
        };

        let inserted = match params.assignment {
            VersionAssignment::Next => insert_next_barrier_key(&self.conn, sqlc_params).await,
            VersionAssignment::First => insert_first_barrier_key(&self.conn, sqlc_params).await,
        };

        let version = match inserted {
            Ok(Some(version)) => version,
            Ok(None) => {
                return Err(CommonError::conflict(format!(
                    "{} tier already has a first version",
                    params.key_type
                )));
            }
            Err(e) if is_unique_violation(&e) => {
                return Err(CommonError::Conflict {
                    msg: format!("concurrent insert of a {} key version", params.key_type),
                    source: Some(e.into()),
                });
            }
            Err(e) => {
                let e = anyhow::Error::from(e).context(format!(
                    "Failed to create {} barrier key",
                    params.key_type
                ));
                return Err(CommonError::Repository {
                    msg: e.to_string(),
                    source: Some(e),
                });
            }
        };

        Ok(params.clone().into_key(version))
    }

    async fn get_latest_key(&self, key_type: KeyType) -> Result<BarrierKey, CommonError> {
        let row = get_latest_barrier_key(&self.conn, &key_type)
            .await
            .with_context(|| format!("Failed to get latest {key_type} barrier key"))
            .map_err(|e| CommonError::Repository {
                msg: e.to_string(),
                source: Some(e),
            })?;

        row.ok_or_else(|| key_not_found(key_type, None))?
            .try_into()
    }

    async fn get_key_by_version(
        &self,
        key_type: KeyType,
        version: KeyVersion,
    ) -> Result<BarrierKey, CommonError> {
        let row = get_barrier_key_by_version(&self.conn, &key_type, &version)
            .await
            .with_context(|| format!("Failed to get {key_type} barrier key version {version}"))
            .map_err(|e| CommonError::Repository {
                msg: e.to_string(),
                source: Some(e),
            })?;

        row.ok_or_else(|| key_not_found(key_type, Some(version)))?
            .try_into()
    }
}

impl SqlMigrationLoader for Repository {
    fn load_sql_migrations() -> BTreeMap<&'static str, BTreeMap<&'static str, &'static str>> {
        load_sql_migrations!("dbs/barrier/migrations")
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::logic::envelope::SealedBox;
    use crate::logic::kdf::KdfLabel;
    use shared::error::ErrorKind;
    use shared::primitives::{SqlMigrationLoader, WrappedChronoDateTime};
    use shared::test_utils::repository::setup_in_memory_database;

    fn create_params(key_type: KeyType, assignment: VersionAssignment) -> CreateBarrierKey {
        let is_root = key_type == KeyType::Root;
        CreateBarrierKey {
            key_type,
            assignment,
            parent_version: (!is_root).then_some(KeyVersion::FIRST),
            kdf_label: is_root.then_some(KdfLabel::V1),
            wrapped: SealedBox {
                nonce: [7u8; 12],
                ciphertext: vec![1, 2, 3, 4],
                tag: [9u8; 16],
            },
            created_at: WrappedChronoDateTime::now(),
        }
    }

    async fn setup_repo() -> (libsql::Database, Repository) {
        let (db, conn) = setup_in_memory_database(vec![Repository::load_sql_migrations()])
            .await
            .unwrap();
        (db, Repository::new(conn))
    }

    #[test]
    fn test_migrations_are_embedded_for_sqlite() {
        let migrations = Repository::load_sql_migrations();
        let sqlite = migrations.get("sqlite").unwrap();
        assert!(
            sqlite
                .keys()
                .any(|name| name.contains("barrier_key") && name.contains(".up."))
        );
    }

    #[tokio::test]
    async fn test_get_latest_on_empty_tier_is_not_found() {
        shared::setup_test!();
        let (_db, repo) = setup_repo().await;

        for key_type in KeyType::ALL {
            let err = repo.get_latest_key(key_type).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound);
        }
    }

    #[tokio::test]
    async fn test_create_and_get_key_roundtrip() {
        shared::setup_test!();
        let (_db, repo) = setup_repo().await;

        let params = create_params(KeyType::Root, VersionAssignment::First);
        let created = repo.create_key(&params).await.unwrap();
        assert_eq!(created.version, KeyVersion::FIRST);

        let fetched = repo
            .get_key_by_version(KeyType::Root, KeyVersion::FIRST)
            .await
            .unwrap();
        assert_eq!(fetched.key_type, KeyType::Root);
        assert_eq!(fetched.kdf_label, Some(KdfLabel::V1));
        assert_eq!(fetched.parent_version, None);
        assert_eq!(fetched.wrapped, params.wrapped);
        assert_eq!(fetched.created_at, params.created_at);

        let latest = repo.get_latest_key(KeyType::Root).await.unwrap();
        assert_eq!(latest, fetched);
    }

    #[tokio::test]
    async fn test_next_assignment_increments_per_tier() {
        shared::setup_test!();
        let (_db, repo) = setup_repo().await;

        for expected in 1..=3 {
            let key = repo
                .create_key(&create_params(KeyType::Content, VersionAssignment::Next))
                .await
                .unwrap();
            assert_eq!(key.version.get(), expected);
        }
        let intermediate = repo
            .create_key(&create_params(
                KeyType::Intermediate,
                VersionAssignment::Next,
            ))
            .await
            .unwrap();
        assert_eq!(intermediate.version, KeyVersion::FIRST);

        let latest = repo.get_latest_key(KeyType::Content).await.unwrap();
        assert_eq!(latest.version.get(), 3);

        let err = repo
            .get_key_by_version(KeyType::Content, KeyVersion::new(4).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(matches!(
            err,
            CommonError::NotFound { ref lookup_id, .. } if lookup_id == "content:4"
        ));
    }

    #[tokio::test]
    async fn test_first_assignment_conflicts_when_tier_exists() {
        shared::setup_test!();
        let (_db, repo) = setup_repo().await;

        repo.create_key(&create_params(
            KeyType::Intermediate,
            VersionAssignment::First,
        ))
        .await
        .unwrap();
        let err = repo
            .create_key(&create_params(
                KeyType::Intermediate,
                VersionAssignment::First,
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        // the failed attempt must not have written anything
        let latest = repo.get_latest_key(KeyType::Intermediate).await.unwrap();
        assert_eq!(latest.version, KeyVersion::FIRST);
    }

    #[tokio::test]
    async fn test_schema_rejects_root_without_kdf_label() {
        shared::setup_test!();
        let (_db, repo) = setup_repo().await;

        let mut params = create_params(KeyType::Root, VersionAssignment::Next);
        params.kdf_label = None;
        let err = repo.create_key(&params).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_concurrent_writers_on_separate_connections_get_unique_versions() {
        shared::setup_test!();
        let dir = tempfile::tempdir().unwrap();
        let url = url::Url::parse(&format!(
            "libsql://{}/barrier.db?mode=local",
            dir.path().display()
        ))
        .unwrap();
        let (db, conn) =
            shared::libsql::establish_db_connection(&url, Some(Repository::load_sql_migrations()))
                .await
                .unwrap();

        let mut repos = vec![Repository::new(conn)];
        for _ in 0..7 {
            repos.push(Repository::new(shared::libsql::Connection::new(
                db.connect().unwrap(),
            )));
        }

        let writes = repos.iter().flat_map(|repo| {
            (0..4).map(move |_| async move {
                repo.create_key(&create_params(KeyType::Content, VersionAssignment::Next))
                    .await
                    .unwrap()
                    .version
                    .get()
            })
        });
        let mut versions = futures::future::join_all(writes).await;
        versions.sort_unstable();

        assert_eq!(versions, (1..=32).collect::<Vec<i64>>());
    }
}
