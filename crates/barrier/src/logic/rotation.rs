use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use shared::error::CommonError;
use tracing::{info, warn};

use super::{BarrierKeyEvent, BarrierKeyEventSender, publish_event};
use crate::logic::hierarchy::KeyHierarchy;
use crate::logic::keys::{KeyType, KeyVersion};

pub const MIN_ROTATION_REASON_CHARS: usize = 10;
pub const MAX_ROTATION_REASON_CHARS: usize = 500;
pub const DEFAULT_ROTATION_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    Idle,
    Rotating,
}

/// Reasons are counted in characters, not bytes.
pub fn validate_rotation_reason(reason: &str) -> Result<(), CommonError> {
    let len = reason.chars().count();
    if !(MIN_ROTATION_REASON_CHARS..=MAX_ROTATION_REASON_CHARS).contains(&len) {
        return Err(CommonError::validation_failed(format!(
            "rotation reason must be between {MIN_ROTATION_REASON_CHARS} and {MAX_ROTATION_REASON_CHARS} characters, got {len}"
        )));
    }
    if reason.trim().is_empty() {
        return Err(CommonError::validation_failed(
            "rotation reason must not be blank",
        ));
    }
    Ok(())
}

#[derive(Default)]
struct TierRotation {
    lock: tokio::sync::Mutex<()>,
    rotating: AtomicBool,
}

/// Marks a tier as rotating until dropped, including on early return.
struct RotatingGuard<'a>(&'a AtomicBool);

impl<'a> RotatingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for RotatingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Appends new key versions. Rotations of one tier are serialized in-process;
/// across processes the repository's version assignment is the arbiter and a
/// lost race surfaces as `Conflict`, which is retried a bounded number of times.
pub struct RotationOrchestrator {
    hierarchy: Arc<KeyHierarchy>,
    max_attempts: u32,
    tiers: [TierRotation; 3],
    on_change_tx: BarrierKeyEventSender,
}

impl RotationOrchestrator {
    pub fn new(
        hierarchy: Arc<KeyHierarchy>,
        max_attempts: u32,
        on_change_tx: BarrierKeyEventSender,
    ) -> Self {
        Self {
            hierarchy,
            max_attempts: max_attempts.max(1),
            tiers: Default::default(),
            on_change_tx,
        }
    }

    fn tier(&self, key_type: KeyType) -> &TierRotation {
        match key_type {
            KeyType::Root => &self.tiers[0],
            KeyType::Intermediate => &self.tiers[1],
            KeyType::Content => &self.tiers[2],
        }
    }

    pub fn state(&self, key_type: KeyType) -> RotationState {
        if self.tier(key_type).rotating.load(Ordering::Acquire) {
            RotationState::Rotating
        } else {
            RotationState::Idle
        }
    }

    /// Creates the next version of `key_type`. Older versions are untouched, so
    /// everything sealed under them stays decryptable. Child tiers keep their
    /// current keys; only keys created afterwards are wrapped by the new one.
    pub async fn rotate(&self, key_type: KeyType, reason: &str) -> Result<KeyVersion, CommonError> {
        validate_rotation_reason(reason)?;

        let tier = self.tier(key_type);
        let _serialized = tier.lock.lock().await;
        let _rotating = RotatingGuard::enter(&tier.rotating);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.hierarchy.create_next_version(key_type).await {
                Ok(key) => {
                    info!(
                        key_type = %key_type,
                        version = %key.version,
                        reason = %reason,
                        "rotated barrier key"
                    );
                    publish_event(
                        &self.on_change_tx,
                        BarrierKeyEvent::KeyRotated {
                            key_type,
                            version: key.version,
                            reason: reason.to_string(),
                        },
                    );
                    return Ok(key.version);
                }
                Err(e) if e.is_conflict() && attempt < self.max_attempts => {
                    warn!(
                        key_type = %key_type,
                        attempt,
                        max_attempts = self.max_attempts,
                        "rotation lost a version race, retrying: {e}"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::logic::kdf::{KdfLabel, derive_root_kek};
    use crate::logic::unseal::{UnsealSecretSource, load_unseal_secrets};
    use crate::repository::{BarrierKeyRepositoryLike, CreateBarrierKey, MemoryRepository};
    use shared::error::ErrorKind;
    use zeroize::Zeroizing;

    use crate::logic::keys::BarrierKey;

    /// Fails the first `conflicts` rotation inserts as if another writer won.
    struct ConflictingRepository {
        inner: MemoryRepository,
        conflicts: AtomicU32,
        attempts: AtomicU32,
    }

    impl ConflictingRepository {
        fn new(conflicts: u32) -> Self {
            Self {
                inner: MemoryRepository::new(),
                conflicts: AtomicU32::new(conflicts),
                attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl BarrierKeyRepositoryLike for ConflictingRepository {
        async fn create_key(&self, params: &CreateBarrierKey) -> Result<BarrierKey, CommonError> {
            if params.key_type == KeyType::Content {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                let remaining = self.conflicts.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.conflicts.store(remaining - 1, Ordering::SeqCst);
                    return Err(CommonError::conflict("simulated concurrent writer"));
                }
            }
            self.inner.create_key(params).await
        }

        async fn get_latest_key(&self, key_type: KeyType) -> Result<BarrierKey, CommonError> {
            self.inner.get_latest_key(key_type).await
        }

        async fn get_key_by_version(
            &self,
            key_type: KeyType,
            version: KeyVersion,
        ) -> Result<BarrierKey, CommonError> {
            self.inner.get_key_by_version(key_type, version).await
        }
    }

    const REASON: &str = "scheduled quarterly rotation";

    fn setup(
        repo: Arc<dyn BarrierKeyRepositoryLike>,
        max_attempts: u32,
    ) -> (Arc<KeyHierarchy>, RotationOrchestrator, BarrierKeyEventSender) {
        let secrets = load_unseal_secrets(&[UnsealSecretSource::Bytes {
            name: "test".to_string(),
            bytes: Zeroizing::new(vec![3u8; 32]),
        }])
        .unwrap();
        let kek = derive_root_kek(&secrets, KdfLabel::V1).unwrap();
        let (tx, _rx) = tokio::sync::broadcast::channel(64);
        let hierarchy = Arc::new(KeyHierarchy::new(repo, kek, KdfLabel::V1, tx.clone()));
        let orchestrator = RotationOrchestrator::new(hierarchy.clone(), max_attempts, tx.clone());
        (hierarchy, orchestrator, tx)
    }

    #[test]
    fn test_reason_length_bounds() {
        assert!(validate_rotation_reason(&"a".repeat(9)).is_err());
        assert!(validate_rotation_reason(&"a".repeat(10)).is_ok());
        assert!(validate_rotation_reason(&"a".repeat(500)).is_ok());
        assert!(validate_rotation_reason(&"a".repeat(501)).is_err());
        assert!(validate_rotation_reason("").is_err());
    }

    #[test]
    fn test_reason_length_counts_characters() {
        // 10 characters, 30 bytes
        assert!(validate_rotation_reason(&"鍵".repeat(10)).is_ok());
        // 9 characters, 27 bytes
        assert!(validate_rotation_reason(&"鍵".repeat(9)).is_err());
        // 500 characters, 2000 bytes
        assert!(validate_rotation_reason(&"🔑".repeat(500)).is_ok());
    }

    #[test]
    fn test_blank_reason_is_rejected() {
        let err = validate_rotation_reason(&" ".repeat(20)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn test_invalid_reason_writes_nothing() {
        shared::setup_test!();
        let repo = Arc::new(MemoryRepository::new());
        let (hierarchy, orchestrator, tx) = setup(repo, 3);
        let mut rx = tx.subscribe();

        let too_short = "a".repeat(MIN_ROTATION_REASON_CHARS - 1);
        let too_long = "a".repeat(MAX_ROTATION_REASON_CHARS + 1);
        for key_type in KeyType::ALL {
            for reason in [too_short.as_str(), too_long.as_str()] {
                let err = orchestrator.rotate(key_type, reason).await.unwrap_err();
                assert_eq!(err.kind(), ErrorKind::ValidationFailed);
                assert_eq!(orchestrator.state(key_type), RotationState::Idle);
            }

            let err = hierarchy.get_latest(key_type).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound);
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rotation_appends_and_keeps_old_data_readable() {
        shared::setup_test!();
        let repo = Arc::new(MemoryRepository::new());
        let (hierarchy, orchestrator, _tx) = setup(repo, 3);

        let before = hierarchy.encrypt(b"before rotation").await.unwrap();

        let content_v2 = orchestrator.rotate(KeyType::Content, REASON).await.unwrap();
        assert_eq!(content_v2.get(), 2);
        let intermediate_v2 = orchestrator
            .rotate(KeyType::Intermediate, REASON)
            .await
            .unwrap();
        assert_eq!(intermediate_v2.get(), 2);
        let root_v2 = orchestrator.rotate(KeyType::Root, REASON).await.unwrap();
        assert_eq!(root_v2.get(), 2);

        // old versions are still there and still open
        for key_type in KeyType::ALL {
            assert!(
                hierarchy
                    .get_by_version(key_type, KeyVersion::FIRST)
                    .await
                    .is_ok()
            );
        }
        let plaintext = hierarchy.decrypt(&before).await.unwrap();
        assert_eq!(plaintext.as_slice(), b"before rotation");

        // new data goes to the rotated content key
        let after = hierarchy.encrypt(b"after rotation").await.unwrap();
        assert_eq!(after.version, content_v2);
        assert_eq!(
            hierarchy.decrypt(&after).await.unwrap().as_slice(),
            b"after rotation"
        );
    }

    #[tokio::test]
    async fn test_rotated_child_is_wrapped_by_latest_parent() {
        shared::setup_test!();
        let repo = Arc::new(MemoryRepository::new());
        let (hierarchy, orchestrator, _tx) = setup(repo, 3);

        orchestrator
            .rotate(KeyType::Intermediate, REASON)
            .await
            .unwrap();
        let content = orchestrator.rotate(KeyType::Content, REASON).await.unwrap();

        let key = hierarchy
            .get_by_version(KeyType::Content, content)
            .await
            .unwrap();
        let latest_intermediate = hierarchy.get_latest(KeyType::Intermediate).await.unwrap();
        assert_eq!(key.parent_version, Some(latest_intermediate.version));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rotations_get_unique_versions() {
        shared::setup_test!();
        let repo = Arc::new(MemoryRepository::new());
        let (_hierarchy, orchestrator, _tx) = setup(repo, 3);
        let orchestrator = Arc::new(orchestrator);

        let handles = (0..10).map(|_| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.rotate(KeyType::Content, REASON).await })
        });
        let mut versions = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|result| result.unwrap().unwrap().get())
            .collect::<Vec<_>>();
        versions.sort_unstable();

        assert_eq!(versions, (1..=10).collect::<Vec<i64>>());
        assert_eq!(orchestrator.state(KeyType::Content), RotationState::Idle);
    }

    #[tokio::test]
    async fn test_conflict_is_retried_within_budget() {
        shared::setup_test!();
        let repo = Arc::new(ConflictingRepository::new(2));
        let (_hierarchy, orchestrator, _tx) = setup(repo.clone(), 3);

        let version = orchestrator.rotate(KeyType::Content, REASON).await.unwrap();
        assert_eq!(version, KeyVersion::FIRST);
        assert_eq!(repo.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_conflict_surfaces_when_budget_is_exhausted() {
        shared::setup_test!();
        let repo = Arc::new(ConflictingRepository::new(5));
        let (_hierarchy, orchestrator, _tx) = setup(repo.clone(), 3);

        let err = orchestrator
            .rotate(KeyType::Content, REASON)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(repo.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(orchestrator.state(KeyType::Content), RotationState::Idle);
    }

    #[tokio::test]
    async fn test_rotation_publishes_event() {
        shared::setup_test!();
        let repo = Arc::new(MemoryRepository::new());
        let (_hierarchy, orchestrator, tx) = setup(repo, 3);
        let mut rx = tx.subscribe();

        let version = orchestrator.rotate(KeyType::Root, REASON).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            BarrierKeyEvent::KeyRotated {
                key_type: KeyType::Root,
                version,
                reason: REASON.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_state_reports_rotating_while_in_progress() {
        shared::setup_test!();
        let repo = Arc::new(MemoryRepository::new());
        let (_hierarchy, orchestrator, _tx) = setup(repo, 3);

        let tier = orchestrator.tier(KeyType::Intermediate);
        {
            let _rotating = RotatingGuard::enter(&tier.rotating);
            assert_eq!(
                orchestrator.state(KeyType::Intermediate),
                RotationState::Rotating
            );
            assert_eq!(orchestrator.state(KeyType::Content), RotationState::Idle);
        }
        assert_eq!(
            orchestrator.state(KeyType::Intermediate),
            RotationState::Idle
        );
    }
}
