// Barrier key hierarchy: unseal secrets -> root KEK -> root -> intermediate -> content -> data.

pub mod barrier;
pub mod envelope;
pub mod hierarchy;
pub mod kdf;
pub mod keys;
pub mod rotation;
pub mod unseal;

pub use barrier::*;
pub use envelope::{EncryptedString, Envelope, SealedBox, SymmetricKey};
pub use hierarchy::*;
pub use kdf::{KdfLabel, RootKek, RootKeks, derive_root_kek, derive_root_keks};
pub use keys::*;
pub use rotation::*;
pub use unseal::*;

// Key lifecycle events
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BarrierKeyEvent {
    /// First version of a tier, created lazily on first use.
    KeyBootstrapped {
        key_type: KeyType,
        version: KeyVersion,
    },
    KeyRotated {
        key_type: KeyType,
        version: KeyVersion,
        reason: String,
    },
}

pub type BarrierKeyEventSender = tokio::sync::broadcast::Sender<BarrierKeyEvent>;
pub type BarrierKeyEventReceiver = tokio::sync::broadcast::Receiver<BarrierKeyEvent>;

/// Publishes an event. Having no subscribers is not an error.
pub(crate) fn publish_event(on_change_tx: &BarrierKeyEventSender, event: BarrierKeyEvent) {
    if let Err(e) = on_change_tx.send(event) {
        tracing::trace!("no subscribers for barrier key event: {:?}", e.0);
    }
}
