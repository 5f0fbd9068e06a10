use std::collections::BTreeMap;

use parking_lot::Mutex;
use shared::error::CommonError;

use crate::logic::keys::{BarrierKey, KeyType, KeyVersion};
use crate::repository::{
    BarrierKeyRepositoryLike, CreateBarrierKey, VersionAssignment, key_not_found,
};

/// Process-local repository. Version assignment and insert happen under one
/// lock, which gives the same guarantees as the SQLite unique constraint.
#[derive(Default)]
pub struct MemoryRepository {
    keys: Mutex<BTreeMap<(KeyType, KeyVersion), BarrierKey>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn latest_version(
        keys: &BTreeMap<(KeyType, KeyVersion), BarrierKey>,
        key_type: KeyType,
    ) -> Option<KeyVersion> {
        keys.range((key_type, KeyVersion::FIRST)..)
            .take_while(|((t, _), _)| *t == key_type)
            .last()
            .map(|((_, version), _)| *version)
    }

    /// Overwrites a stored key in place. Only for simulating storage corruption.
    #[cfg(all(test, feature = "unit_test"))]
    pub(crate) fn corrupt_key(
        &self,
        key_type: KeyType,
        version: KeyVersion,
        f: impl FnOnce(&mut BarrierKey),
    ) {
        if let Some(key) = self.keys.lock().get_mut(&(key_type, version)) {
            f(key);
        }
    }
}

#[async_trait::async_trait]
impl BarrierKeyRepositoryLike for MemoryRepository {
    async fn create_key(&self, params: &CreateBarrierKey) -> Result<BarrierKey, CommonError> {
        let mut keys = self.keys.lock();
        let latest = Self::latest_version(&keys, params.key_type);

        let version = match (params.assignment, latest) {
            (VersionAssignment::First, Some(_)) => {
                return Err(CommonError::conflict(format!(
                    "{} tier already has a first version",
                    params.key_type
                )));
            }
            (VersionAssignment::First, None) | (VersionAssignment::Next, None) => {
                KeyVersion::FIRST
            }
            (VersionAssignment::Next, Some(latest)) => KeyVersion::new(latest.get() + 1)
                .ok_or_else(|| {
                    CommonError::conflict(format!("{} version space exhausted", params.key_type))
                })?,
        };

        let key = params.clone().into_key(version);
        keys.insert((key.key_type, key.version), key.clone());
        Ok(key)
    }

    async fn get_latest_key(&self, key_type: KeyType) -> Result<BarrierKey, CommonError> {
        let keys = self.keys.lock();
        Self::latest_version(&keys, key_type)
            .and_then(|version| keys.get(&(key_type, version)).cloned())
            .ok_or_else(|| key_not_found(key_type, None))
    }

    async fn get_key_by_version(
        &self,
        key_type: KeyType,
        version: KeyVersion,
    ) -> Result<BarrierKey, CommonError> {
        self.keys
            .lock()
            .get(&(key_type, version))
            .cloned()
            .ok_or_else(|| key_not_found(key_type, Some(version)))
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use std::sync::Arc;

    use super::*;
    use crate::logic::envelope::SealedBox;
    use shared::error::ErrorKind;
    use shared::primitives::WrappedChronoDateTime;

    fn params(key_type: KeyType, assignment: VersionAssignment) -> CreateBarrierKey {
        CreateBarrierKey {
            key_type,
            assignment,
            parent_version: key_type.parent().map(|_| KeyVersion::FIRST),
            kdf_label: None,
            wrapped: SealedBox {
                nonce: [0u8; 12],
                ciphertext: vec![1, 2, 3],
                tag: [0u8; 16],
            },
            created_at: WrappedChronoDateTime::now(),
        }
    }

    #[tokio::test]
    async fn test_empty_tier_is_not_found() {
        let repo = MemoryRepository::new();
        let err = repo.get_latest_key(KeyType::Root).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = repo
            .get_key_by_version(KeyType::Root, KeyVersion::FIRST)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_next_assignment_is_per_tier() {
        let repo = MemoryRepository::new();
        for expected in 1..=3 {
            let key = repo
                .create_key(&params(KeyType::Content, VersionAssignment::Next))
                .await
                .unwrap();
            assert_eq!(key.version.get(), expected);
        }
        let key = repo
            .create_key(&params(KeyType::Intermediate, VersionAssignment::Next))
            .await
            .unwrap();
        assert_eq!(key.version, KeyVersion::FIRST);

        let latest = repo.get_latest_key(KeyType::Content).await.unwrap();
        assert_eq!(latest.version.get(), 3);
        let latest = repo.get_latest_key(KeyType::Intermediate).await.unwrap();
        assert_eq!(latest.version.get(), 1);
    }

    #[tokio::test]
    async fn test_first_assignment_conflicts_on_populated_tier() {
        let repo = MemoryRepository::new();
        repo.create_key(&params(KeyType::Root, VersionAssignment::First))
            .await
            .unwrap();
        let err = repo
            .create_key(&params(KeyType::Root, VersionAssignment::First))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_never_share_a_version() {
        let repo = Arc::new(MemoryRepository::new());
        let handles = (0..32).map(|_| {
            let repo = repo.clone();
            tokio::spawn(async move {
                repo.create_key(&params(KeyType::Content, VersionAssignment::Next))
                    .await
                    .unwrap()
                    .version
                    .get()
            })
        });

        let mut versions: Vec<i64> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        versions.sort_unstable();
        assert_eq!(versions, (1..=32).collect::<Vec<i64>>());
    }
}
