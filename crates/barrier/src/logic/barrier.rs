use std::sync::Arc;

use shared::error::CommonError;
use tracing::{info, warn};
use zeroize::Zeroizing;

use super::{BarrierKeyEventReceiver, BarrierKeyEventSender};
use crate::logic::envelope::{EncryptedString, Envelope};
use crate::logic::hierarchy::KeyHierarchy;
use crate::logic::kdf::{KdfLabel, RootKeks};
use crate::logic::keys::{BarrierKey, KeyType, KeyVersion};
use crate::logic::rotation::{DEFAULT_ROTATION_MAX_ATTEMPTS, RotationOrchestrator, RotationState};
use crate::repository::BarrierKeyRepositoryLike;

pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct BarrierServiceOptions {
    pub kdf_label: KdfLabel,
    pub rotation_max_attempts: u32,
    pub event_channel_capacity: usize,
}

impl Default for BarrierServiceOptions {
    fn default() -> Self {
        Self {
            kdf_label: KdfLabel::CURRENT,
            rotation_max_attempts: DEFAULT_ROTATION_MAX_ATTEMPTS,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

pub struct BarrierServiceInner {
    hierarchy: Arc<KeyHierarchy>,
    rotation: RotationOrchestrator,
    on_change_tx: BarrierKeyEventSender,
}

/// Entry point for sealing and opening application data. Cheap to clone.
#[derive(Clone)]
pub struct BarrierService(pub Arc<BarrierServiceInner>);

impl BarrierService {
    pub fn new(
        repository: Arc<dyn BarrierKeyRepositoryLike>,
        root_keks: impl Into<RootKeks>,
        options: BarrierServiceOptions,
    ) -> Self {
        let (on_change_tx, _) =
            tokio::sync::broadcast::channel(options.event_channel_capacity.max(1));
        let hierarchy = Arc::new(KeyHierarchy::new(
            repository,
            root_keks,
            options.kdf_label,
            on_change_tx.clone(),
        ));
        let rotation = RotationOrchestrator::new(
            hierarchy.clone(),
            options.rotation_max_attempts,
            on_change_tx.clone(),
        );

        Self(Arc::new(BarrierServiceInner {
            hierarchy,
            rotation,
            on_change_tx,
        }))
    }

    fn ensure_open(&self) -> Result<(), CommonError> {
        self.0.hierarchy.ensure_open()
    }

    pub fn hierarchy(&self) -> &KeyHierarchy {
        &self.0.hierarchy
    }

    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Envelope, CommonError> {
        self.ensure_open()?;
        self.0.hierarchy.encrypt(plaintext).await
    }

    /// Opens an envelope produced by [`BarrierService::encrypt`]. Callers that
    /// report failures outward should use [`CommonError::to_external`], which
    /// does not tell a missing key apart from a forged ciphertext.
    pub async fn decrypt(&self, envelope: &Envelope) -> Result<Zeroizing<Vec<u8>>, CommonError> {
        self.ensure_open()?;
        self.0.hierarchy.decrypt(envelope).await.inspect_err(|e| {
            warn!(
                kind = ?e.kind(),
                key_type = %envelope.key_type,
                version = %envelope.version,
                "decrypt failed: {e}"
            );
        })
    }

    pub async fn encrypt_string(&self, data: &str) -> Result<EncryptedString, CommonError> {
        let envelope = self.encrypt(data.as_bytes()).await?;
        Ok(EncryptedString::from(&envelope))
    }

    pub async fn decrypt_string(&self, data: &EncryptedString) -> Result<String, CommonError> {
        let envelope = Envelope::try_from(data)?;
        let plaintext = self.decrypt(&envelope).await?;
        String::from_utf8(plaintext.to_vec()).map_err(|e| {
            CommonError::Unknown(anyhow::anyhow!("decrypted data is not valid UTF-8: {e}"))
        })
    }

    pub async fn rotate(&self, key_type: KeyType, reason: &str) -> Result<KeyVersion, CommonError> {
        self.ensure_open()?;
        self.0.rotation.rotate(key_type, reason).await
    }

    pub fn rotation_state(&self, key_type: KeyType) -> RotationState {
        self.0.rotation.state(key_type)
    }

    pub async fn get_latest(&self, key_type: KeyType) -> Result<BarrierKey, CommonError> {
        self.ensure_open()?;
        self.0.hierarchy.get_latest(key_type).await
    }

    pub async fn get_by_version(
        &self,
        key_type: KeyType,
        version: KeyVersion,
    ) -> Result<BarrierKey, CommonError> {
        self.ensure_open()?;
        self.0.hierarchy.get_by_version(key_type, version).await
    }

    pub fn subscribe(&self) -> BarrierKeyEventReceiver {
        self.0.on_change_tx.subscribe()
    }

    /// Drops all unwrapped key material. Later calls fail with `Fatal`,
    /// including calls already in flight. Calling this more than once is a
    /// no-op.
    pub fn shutdown(&self) {
        if self.0.hierarchy.close() {
            info!("barrier service shut down");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.0.hierarchy.is_closed()
    }
}
