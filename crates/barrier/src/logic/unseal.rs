// Unseal secret loading. Secrets are read once at startup and only ever live in
// process memory; every failure here is fatal because the service must not run
// with a partially initialised trust root.

use std::path::PathBuf;

use shared::error::CommonError;
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const MIN_UNSEAL_SECRET_LEN: usize = 32;
pub const MAX_UNSEAL_SECRET_LEN: usize = 4096;
pub const MAX_UNSEAL_SECRETS: usize = 16;

/// How many of the configured secrets take part in each root KEK derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnsealMode {
    #[default]
    All,
    /// Any `n` of the configured secrets. One KEK candidate is derived for
    /// every combination of `n` secrets.
    ChooseN { n: usize },
}

impl UnsealMode {
    pub fn validate(&self, secret_count: usize) -> Result<(), CommonError> {
        match *self {
            UnsealMode::ChooseN { n } if n == 0 || n > secret_count => Err(CommonError::fatal(
                format!("cannot choose {n} of {secret_count} unseal secrets"),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Clone)]
pub enum UnsealSecretSource {
    File(PathBuf),
    /// In-memory secret, for embedding callers and tests.
    Bytes {
        name: String,
        bytes: Zeroizing<Vec<u8>>,
    },
}

impl UnsealSecretSource {
    pub fn name(&self) -> String {
        match self {
            UnsealSecretSource::File(path) => path.display().to_string(),
            UnsealSecretSource::Bytes { name, .. } => name.clone(),
        }
    }

    fn read(&self) -> Result<Zeroizing<Vec<u8>>, CommonError> {
        match self {
            UnsealSecretSource::File(path) => {
                let bytes = std::fs::read(path).map_err(|e| CommonError::Fatal {
                    msg: format!("failed to read unseal secret {}", path.display()),
                    source: Some(e.into()),
                })?;
                Ok(Zeroizing::new(bytes))
            }
            UnsealSecretSource::Bytes { bytes, .. } => Ok(bytes.clone()),
        }
    }
}

impl std::fmt::Debug for UnsealSecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnsealSecretSource::File(path) => f.debug_tuple("File").field(path).finish(),
            UnsealSecretSource::Bytes { name, .. } => f
                .debug_struct("Bytes")
                .field("name", name)
                .field("bytes", &"************")
                .finish(),
        }
    }
}

impl From<PathBuf> for UnsealSecretSource {
    fn from(path: PathBuf) -> Self {
        UnsealSecretSource::File(path)
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct UnsealSecret(Vec<u8>);

impl UnsealSecret {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for UnsealSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UnsealSecret(************)")
    }
}

/// The full set of loaded unseal secrets, in configuration order.
#[derive(Clone, Debug)]
pub struct UnsealSecrets(Vec<UnsealSecret>);

impl UnsealSecrets {
    pub fn iter(&self) -> impl Iterator<Item = &UnsealSecret> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every subset of `n` secrets, in lexicographic order of the secrets'
    /// values. The order does not depend on how the secrets were configured.
    pub(crate) fn combinations(&self, n: usize) -> Vec<UnsealSecrets> {
        let mut sorted: Vec<&UnsealSecret> = self.0.iter().collect();
        sorted.sort_unstable_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

        let total = sorted.len();
        if n == 0 || n > total {
            return Vec::new();
        }

        let mut combinations = Vec::new();
        let mut indices: Vec<usize> = (0..n).collect();
        loop {
            combinations.push(UnsealSecrets(
                indices.iter().map(|&i| sorted[i].clone()).collect(),
            ));

            let Some(pos) = (0..n).rev().find(|&i| indices[i] != i + total - n) else {
                break;
            };
            indices[pos] += 1;
            for i in pos + 1..n {
                indices[i] = indices[i - 1] + 1;
            }
        }
        combinations
    }
}

fn trim_trailing_newline(bytes: &[u8]) -> &[u8] {
    bytes
        .strip_suffix(b"\r\n")
        .or_else(|| bytes.strip_suffix(b"\n"))
        .unwrap_or(bytes)
}

/// Reads every configured source. All sources are required.
pub fn load_unseal_secrets(sources: &[UnsealSecretSource]) -> Result<UnsealSecrets, CommonError> {
    if sources.is_empty() {
        return Err(CommonError::fatal("no unseal secret sources configured"));
    }
    if sources.len() > MAX_UNSEAL_SECRETS {
        return Err(CommonError::fatal(format!(
            "too many unseal secret sources: {} (maximum {MAX_UNSEAL_SECRETS})",
            sources.len()
        )));
    }

    let mut secrets: Vec<UnsealSecret> = Vec::with_capacity(sources.len());

    for source in sources {
        let name = source.name();
        let raw = source.read()?;
        let trimmed = trim_trailing_newline(&raw);

        if trimmed.is_empty() {
            return Err(CommonError::fatal(format!("unseal secret {name} is empty")));
        }
        if trimmed.len() < MIN_UNSEAL_SECRET_LEN {
            return Err(CommonError::fatal(format!(
                "unseal secret {name} is {} bytes, minimum is {MIN_UNSEAL_SECRET_LEN}",
                trimmed.len()
            )));
        }
        if trimmed.len() > MAX_UNSEAL_SECRET_LEN {
            return Err(CommonError::fatal(format!(
                "unseal secret {name} is {} bytes, maximum is {MAX_UNSEAL_SECRET_LEN}",
                trimmed.len()
            )));
        }

        let duplicate = secrets
            .iter()
            .any(|existing| bool::from(existing.as_bytes().ct_eq(trimmed)));
        if duplicate {
            return Err(CommonError::fatal(format!(
                "unseal secret {name} duplicates another configured secret"
            )));
        }

        debug!(source = %name, "loaded unseal secret");
        secrets.push(UnsealSecret(trimmed.to_vec()));
    }

    info!(count = secrets.len(), "unseal secrets loaded");
    Ok(UnsealSecrets(secrets))
}
