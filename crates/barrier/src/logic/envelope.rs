// AEAD primitives shared by every tier of the hierarchy, and the self-describing
// envelope handed back to callers of encrypt.

use aes_gcm::{
    Aes256Gcm, Key, Nonce, Tag,
    aead::{AeadInPlace, KeyInit, OsRng},
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use shared::error::CommonError;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::logic::keys::{KeyType, KeyVersion};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// A 256-bit AES key. Used for every tier as well as for wrapping by the root KEK.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        let key = SymmetricKey(bytes);
        bytes.zeroize();
        key
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        SymmetricKey(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CommonError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CommonError::Unknown(anyhow::anyhow!(
                "Invalid key length: expected {KEY_LEN} bytes for AES-256, got {}",
                bytes.len()
            ))
        })?;
        Ok(SymmetricKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey(************)")
    }
}

/// Output of [`seal`]: nonce, ciphertext and the detached authentication tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedBox {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Encrypts `plaintext` with AES-256-GCM under a nonce drawn from the OS RNG
/// inside this call. Callers never supply a nonce.
pub fn seal(key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> Result<SealedBox, CommonError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut buffer = plaintext.to_vec();
    let tag = match cipher.encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut buffer)
    {
        Ok(tag) => tag,
        Err(e) => {
            buffer.zeroize();
            return Err(CommonError::Unknown(anyhow::anyhow!(
                "Encryption failed: {e}"
            )));
        }
    };

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(SealedBox {
        nonce,
        ciphertext: buffer,
        tag: tag_bytes,
    })
}

/// Decrypts and authenticates a [`SealedBox`]. Any mismatch of key, nonce,
/// ciphertext, tag or associated data yields `AuthenticationFailed` and no
/// plaintext.
pub fn open(
    key: &SymmetricKey,
    sealed: &SealedBox,
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CommonError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut buffer = Zeroizing::new(sealed.ciphertext.clone());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&sealed.nonce),
            aad,
            buffer.as_mut_slice(),
            Tag::from_slice(&sealed.tag),
        )
        .map_err(|_| CommonError::authentication_failed("ciphertext failed authentication"))?;

    Ok(buffer)
}

const ENVELOPE_FORMAT_V1: u8 = 0x01;
const ENVELOPE_HEADER_LEN: usize = 1 + 1 + 8 + NONCE_LEN + TAG_LEN;

/// Ciphertext as returned by encrypt. Carries the tier and version of the key
/// that produced it so decrypt can find that exact version later.
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    pub key_type: KeyType,
    pub version: KeyVersion,
    pub sealed: SealedBox,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("key_type", &self.key_type)
            .field("version", &self.version)
            .field("ciphertext_len", &self.sealed.ciphertext.len())
            .finish()
    }
}

impl Envelope {
    /// `[format][key type][version u64 BE][nonce][tag][ciphertext]`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + self.sealed.ciphertext.len());
        out.push(ENVELOPE_FORMAT_V1);
        out.push(self.key_type.to_wire());
        out.extend_from_slice(&self.version.to_wire().to_be_bytes());
        out.extend_from_slice(&self.sealed.nonce);
        out.extend_from_slice(&self.sealed.tag);
        out.extend_from_slice(&self.sealed.ciphertext);
        out
    }

    /// Parses an envelope. Malformed input is reported as `AuthenticationFailed`
    /// since it can only come from corruption or tampering.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CommonError> {
        if bytes.len() < ENVELOPE_HEADER_LEN {
            return Err(CommonError::authentication_failed(format!(
                "envelope is truncated: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0] != ENVELOPE_FORMAT_V1 {
            return Err(CommonError::authentication_failed(format!(
                "unknown envelope format: {}",
                bytes[0]
            )));
        }

        let key_type = KeyType::from_wire(bytes[1]).ok_or_else(|| {
            CommonError::authentication_failed(format!("unknown envelope key type: {}", bytes[1]))
        })?;

        let mut version = [0u8; 8];
        version.copy_from_slice(&bytes[2..10]);
        let version = KeyVersion::from_wire(u64::from_be_bytes(version)).ok_or_else(|| {
            CommonError::authentication_failed("envelope version is out of range")
        })?;

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[10..10 + NONCE_LEN]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&bytes[10 + NONCE_LEN..ENVELOPE_HEADER_LEN]);

        Ok(Envelope {
            key_type,
            version,
            sealed: SealedBox {
                nonce,
                ciphertext: bytes[ENVELOPE_HEADER_LEN..].to_vec(),
                tag,
            },
        })
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct EncryptedString(pub String);

impl std::fmt::Debug for EncryptedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptedString(************)")
    }
}

impl From<&Envelope> for EncryptedString {
    fn from(envelope: &Envelope) -> Self {
        EncryptedString(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            envelope.to_bytes(),
        ))
    }
}

impl TryFrom<&EncryptedString> for Envelope {
    type Error = CommonError;

    fn try_from(value: &EncryptedString) -> Result<Self, Self::Error> {
        let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &value.0)
            .map_err(|e| CommonError::AuthenticationFailed {
                msg: "envelope is not valid base64".to_string(),
                source: Some(e.into()),
            })?;
        Envelope::from_bytes(&bytes)
    }
}
