mod memory;
mod sqlite;

pub use memory::MemoryRepository;
pub use sqlite::Repository;

use shared::{error::CommonError, primitives::WrappedChronoDateTime};

use crate::logic::envelope::SealedBox;
use crate::logic::kdf::KdfLabel;
use crate::logic::keys::{BarrierKey, KeyType, KeyVersion};

/// How the repository picks the version of a new key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionAssignment {
    /// One past the highest stored version of the tier.
    Next,
    /// Version 1, only if the tier is empty. A populated tier is a `Conflict`.
    First,
}

#[derive(Debug, Clone)]
pub struct CreateBarrierKey {
    pub key_type: KeyType,
    pub assignment: VersionAssignment,
    pub parent_version: Option<KeyVersion>,
    pub kdf_label: Option<KdfLabel>,
    pub wrapped: SealedBox,
    pub created_at: WrappedChronoDateTime,
}

impl CreateBarrierKey {
    pub(crate) fn into_key(self, version: KeyVersion) -> BarrierKey {
        BarrierKey {
            key_type: self.key_type,
            version,
            parent_version: self.parent_version,
            kdf_label: self.kdf_label,
            wrapped: self.wrapped,
            created_at: self.created_at,
        }
    }
}

/// Persistence seam for the key hierarchy. Implementations assign versions
/// themselves, atomically with the insert, and never hand out a version twice
/// for the same tier.
#[async_trait::async_trait]
pub trait BarrierKeyRepositoryLike: Send + Sync {
    /// Stores a new key and returns it with its assigned version. A lost race
    /// for a version is reported as `Conflict`.
    async fn create_key(&self, params: &CreateBarrierKey) -> Result<BarrierKey, CommonError>;

    /// Highest version of the tier, or `NotFound` if the tier is empty.
    async fn get_latest_key(&self, key_type: KeyType) -> Result<BarrierKey, CommonError>;

    async fn get_key_by_version(
        &self,
        key_type: KeyType,
        version: KeyVersion,
    ) -> Result<BarrierKey, CommonError>;
}

pub(crate) fn key_not_found(key_type: KeyType, version: Option<KeyVersion>) -> CommonError {
    let msg = match version {
        Some(version) => format!("{key_type} key version {version} not found"),
        None => format!("no {key_type} key exists"),
    };
    CommonError::not_found(msg, crate::logic::keys::lookup_id(key_type, version))
}
