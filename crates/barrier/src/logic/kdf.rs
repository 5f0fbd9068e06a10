use hkdf::Hkdf;
use sha2::Sha256;
use shared::error::CommonError;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::logic::unseal::{UnsealMode, UnsealSecrets};

pub const ROOT_KEK_LEN: usize = 32;

/// Versioned derivation scheme for the root KEK. The label is stored on every
/// root key record so that a new scheme can be introduced next to the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KdfLabel {
    V1,
}

impl KdfLabel {
    pub const CURRENT: KdfLabel = KdfLabel::V1;

    pub fn as_str(&self) -> &'static str {
        match self {
            KdfLabel::V1 => "hkdf-sha256/v1",
        }
    }

    fn salt(&self) -> &'static [u8] {
        match self {
            KdfLabel::V1 => b"barrier-root-kek-salt/v1",
        }
    }

    fn info(&self) -> &'static [u8] {
        match self {
            KdfLabel::V1 => b"barrier-root-kek/v1",
        }
    }
}

impl std::fmt::Display for KdfLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KdfLabel {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hkdf-sha256/v1" => Ok(KdfLabel::V1),
            _ => Err(CommonError::Repository {
                msg: format!("unknown kdf label: {s}"),
                source: None,
            }),
        }
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootKek([u8; ROOT_KEK_LEN]);

impl RootKek {
    pub fn as_bytes(&self) -> &[u8; ROOT_KEK_LEN] {
        &self.0
    }
}

impl PartialEq for RootKek {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for RootKek {}

impl std::fmt::Debug for RootKek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RootKek(************)")
    }
}

/// Root KEK candidates for one unsealed instance. New root keys are wrapped
/// under the primary; unwrapping tries the primary, then each fallback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootKeks {
    primary: RootKek,
    fallbacks: Vec<RootKek>,
}

impl RootKeks {
    pub fn primary(&self) -> &RootKek {
        &self.primary
    }

    pub fn iter(&self) -> impl Iterator<Item = &RootKek> {
        std::iter::once(&self.primary).chain(self.fallbacks.iter())
    }

    pub fn len(&self) -> usize {
        1 + self.fallbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl From<RootKek> for RootKeks {
    fn from(primary: RootKek) -> Self {
        RootKeks {
            primary,
            fallbacks: Vec::new(),
        }
    }
}

/// Derives the root KEK candidates for `mode`. [`UnsealMode::All`] yields a
/// single candidate over every secret. [`UnsealMode::ChooseN`] yields one per
/// combination of `n` secrets, the lowest combination by value first.
pub fn derive_root_keks(
    secrets: &UnsealSecrets,
    mode: UnsealMode,
    label: KdfLabel,
) -> Result<RootKeks, CommonError> {
    mode.validate(secrets.len())?;

    match mode {
        UnsealMode::All => Ok(derive_root_kek(secrets, label)?.into()),
        UnsealMode::ChooseN { n } => {
            let mut candidates = secrets
                .combinations(n)
                .into_iter()
                .map(|subset| derive_root_kek(&subset, label));
            let primary = candidates.next().ok_or_else(|| {
                CommonError::fatal(format!(
                    "no combination of {n} out of {} unseal secrets",
                    secrets.len()
                ))
            })??;
            let fallbacks = candidates.collect::<Result<Vec<_>, _>>()?;
            Ok(RootKeks { primary, fallbacks })
        }
    }
}

/// Derives the root KEK from the unseal secrets with HKDF-SHA256.
///
/// The input keying material is every secret, length-prefixed and sorted by
/// value, so the result does not depend on the order the secrets were
/// configured in.
pub fn derive_root_kek(secrets: &UnsealSecrets, label: KdfLabel) -> Result<RootKek, CommonError> {
    let mut sorted: Vec<&[u8]> = secrets.iter().map(|s| s.as_bytes()).collect();
    sorted.sort_unstable();

    let total_len: usize = sorted.iter().map(|s| 4 + s.len()).sum();
    let mut ikm = Zeroizing::new(Vec::with_capacity(total_len));
    for secret in sorted {
        let len = u32::try_from(secret.len())
            .map_err(|_| CommonError::fatal("unseal secret is too large to derive from"))?;
        ikm.extend_from_slice(&len.to_be_bytes());
        ikm.extend_from_slice(secret);
    }

    let hk = Hkdf::<Sha256>::new(Some(label.salt()), &ikm);
    let mut okm = [0u8; ROOT_KEK_LEN];
    let expanded = hk.expand(label.info(), &mut okm);

    let kek = RootKek(okm);
    okm.zeroize();

    match expanded {
        Ok(()) => Ok(kek),
        Err(e) => Err(CommonError::fatal(format!(
            "root kek derivation ({label}) failed: {e}"
        ))),
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::logic::unseal::{UnsealSecretSource, load_unseal_secrets};
    use zeroize::Zeroizing;

    fn secrets(values: &[&[u8]]) -> UnsealSecrets {
        let sources: Vec<UnsealSecretSource> = values
            .iter()
            .enumerate()
            .map(|(i, bytes)| UnsealSecretSource::Bytes {
                name: format!("secret-{i}"),
                bytes: Zeroizing::new(bytes.to_vec()),
            })
            .collect();
        load_unseal_secrets(&sources).unwrap()
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_root_kek(&secrets(&[&[7u8; 32], &[8u8; 32]]), KdfLabel::V1).unwrap();
        let b = derive_root_kek(&secrets(&[&[7u8; 32], &[8u8; 32]]), KdfLabel::V1).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a, b);
    }

    #[test]
    fn test_derivation_ignores_secret_order() {
        let a = derive_root_kek(&secrets(&[&[7u8; 32], &[8u8; 32]]), KdfLabel::V1).unwrap();
        let b = derive_root_kek(&secrets(&[&[8u8; 32], &[7u8; 32]]), KdfLabel::V1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_secrets_derive_different_keks() {
        let a = derive_root_kek(&secrets(&[&[7u8; 32]]), KdfLabel::V1).unwrap();
        let b = derive_root_kek(&secrets(&[&[6u8; 32]]), KdfLabel::V1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_length_prefix_separates_secret_boundaries() {
        // the same concatenated bytes split differently must not collide
        let mut joined = vec![1u8; 32];
        joined.extend_from_slice(&[2u8; 40]);
        let a =
            derive_root_kek(&secrets(&[&joined[..36], &joined[36..]]), KdfLabel::V1).unwrap();
        let b = derive_root_kek(&secrets(&[&joined[..]]), KdfLabel::V1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_kdf_label_roundtrips_through_str() {
        let label: KdfLabel = KdfLabel::CURRENT.as_str().parse().unwrap();
        assert_eq!(label, KdfLabel::V1);
        assert!("hkdf-sha512/v9".parse::<KdfLabel>().is_err());
    }

    #[test]
    fn test_root_kek_debug_is_redacted() {
        let kek = derive_root_kek(&secrets(&[&[7u8; 32]]), KdfLabel::V1).unwrap();
        assert_eq!(format!("{kek:?}"), "RootKek(************)");
    }

    fn numbered_secrets(count: u8) -> UnsealSecrets {
        let values: Vec<Vec<u8>> = (0..count)
            .map(|i| (0..32u8).map(|j| i * 10 + j).collect())
            .collect();
        let refs: Vec<&[u8]> = values.iter().map(|v| v.as_slice()).collect();
        secrets(&refs)
    }

    #[test]
    fn test_all_mode_yields_single_candidate() {
        let all = numbered_secrets(3);
        let keks = derive_root_keks(&all, UnsealMode::All, KdfLabel::V1).unwrap();
        assert_eq!(keks.len(), 1);
        assert_eq!(keks.primary(), &derive_root_kek(&all, KdfLabel::V1).unwrap());
    }

    #[test]
    fn test_choose_n_yields_one_candidate_per_combination() {
        for (total, n, expected) in [(3u8, 2, 3), (5, 3, 10), (6, 4, 15)] {
            let keks =
                derive_root_keks(&numbered_secrets(total), UnsealMode::ChooseN { n }, KdfLabel::V1)
                    .unwrap();
            assert_eq!(keks.len(), expected, "{n} of {total}");

            let candidates: Vec<&RootKek> = keks.iter().collect();
            for (i, a) in candidates.iter().enumerate() {
                for b in &candidates[i + 1..] {
                    assert_ne!(a, b);
                }
            }
        }
    }

    #[test]
    fn test_choose_n_primary_is_the_lowest_quorum() {
        let all = numbered_secrets(3);
        let keks = derive_root_keks(&all, UnsealMode::ChooseN { n: 2 }, KdfLabel::V1).unwrap();

        // secrets 0 and 1 sort lowest
        let lowest = numbered_secrets(2);
        assert_eq!(keks.primary(), &derive_root_kek(&lowest, KdfLabel::V1).unwrap());

        // a holder of just that quorum derives the same primary
        let quorum =
            derive_root_keks(&lowest, UnsealMode::ChooseN { n: 2 }, KdfLabel::V1).unwrap();
        assert_eq!(quorum.primary(), keks.primary());
    }

    #[test]
    fn test_choose_all_matches_all_mode() {
        let all = numbered_secrets(4);
        let chosen = derive_root_keks(&all, UnsealMode::ChooseN { n: 4 }, KdfLabel::V1).unwrap();
        let every = derive_root_keks(&all, UnsealMode::All, KdfLabel::V1).unwrap();
        assert_eq!(chosen, every);
    }

    #[test]
    fn test_choose_n_out_of_range_is_fatal() {
        let all = numbered_secrets(2);
        for n in [0, 3] {
            let err = derive_root_keks(&all, UnsealMode::ChooseN { n }, KdfLabel::V1).unwrap_err();
            assert_eq!(err.kind(), shared::error::ErrorKind::Fatal);
        }
    }
}
