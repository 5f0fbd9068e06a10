use shared::error::CommonError;

use super::queries::Row_barrier_key;
use crate::logic::envelope::{NONCE_LEN, SealedBox, TAG_LEN};
use crate::logic::kdf::KdfLabel;
use crate::logic::keys::BarrierKey;

impl TryFrom<Row_barrier_key> for BarrierKey {
    type Error = CommonError;

    fn try_from(row: Row_barrier_key) -> Result<Self, Self::Error> {
        let lookup_id = crate::logic::keys::lookup_id(row.key_type, Some(row.version));

        let nonce: [u8; NONCE_LEN] = row.nonce.as_slice().try_into().map_err(|_| {
            CommonError::Repository {
                msg: format!("stored nonce for {lookup_id} has length {}", row.nonce.len()),
                source: None,
            }
        })?;
        let tag: [u8; TAG_LEN] = row.tag.as_slice().try_into().map_err(|_| {
            CommonError::Repository {
                msg: format!("stored tag for {lookup_id} has length {}", row.tag.len()),
                source: None,
            }
        })?;
        let kdf_label = row
            .kdf_label
            .as_deref()
            .map(str::parse::<KdfLabel>)
            .transpose()?;

        Ok(BarrierKey {
            key_type: row.key_type,
            version: row.version,
            parent_version: row.parent_version,
            kdf_label,
            wrapped: SealedBox {
                nonce,
                ciphertext: row.ciphertext,
                tag,
            },
            created_at: row.created_at,
        })
    }
}
