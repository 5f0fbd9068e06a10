use std::str::FromStr;

use serde::{Deserialize, Serialize};
use shared::{error::CommonError, primitives::WrappedChronoDateTime};

use crate::logic::envelope::SealedBox;
use crate::logic::kdf::KdfLabel;

/// The three tiers of the hierarchy, from the top down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Root,
    Intermediate,
    Content,
}

impl KeyType {
    pub const ALL: [KeyType; 3] = [KeyType::Root, KeyType::Intermediate, KeyType::Content];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Root => "root",
            KeyType::Intermediate => "intermediate",
            KeyType::Content => "content",
        }
    }

    /// The tier whose key wraps this one. Root keys are wrapped by the root KEK.
    pub fn parent(&self) -> Option<KeyType> {
        match self {
            KeyType::Root => None,
            KeyType::Intermediate => Some(KeyType::Root),
            KeyType::Content => Some(KeyType::Intermediate),
        }
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            KeyType::Root => 1,
            KeyType::Intermediate => 2,
            KeyType::Content => 3,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Option<KeyType> {
        match value {
            1 => Some(KeyType::Root),
            2 => Some(KeyType::Intermediate),
            3 => Some(KeyType::Content),
            _ => None,
        }
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(KeyType::Root),
            "intermediate" => Ok(KeyType::Intermediate),
            "content" => Ok(KeyType::Content),
            _ => Err(CommonError::Repository {
                msg: format!("Invalid key_type: {s}"),
                source: None,
            }),
        }
    }
}

impl From<KeyType> for libsql::Value {
    fn from(value: KeyType) -> Self {
        libsql::Value::Text(value.as_str().to_string())
    }
}

impl libsql::FromValue for KeyType {
    fn from_sql(val: libsql::Value) -> libsql::Result<Self>
    where
        Self: Sized,
    {
        match val {
            libsql::Value::Text(s) => {
                KeyType::from_str(&s).map_err(|_e| libsql::Error::InvalidColumnType)
            }
            libsql::Value::Null => Err(libsql::Error::NullValue),
            _ => Err(libsql::Error::InvalidColumnType),
        }
    }
}

/// Per-tier version number. Always positive; assigned by the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyVersion(i64);

impl KeyVersion {
    pub const FIRST: KeyVersion = KeyVersion(1);

    pub fn new(value: i64) -> Option<KeyVersion> {
        (value > 0).then_some(KeyVersion(value))
    }

    pub fn get(&self) -> i64 {
        self.0
    }

    pub(crate) fn to_wire(self) -> u64 {
        self.0 as u64
    }

    pub(crate) fn from_wire(value: u64) -> Option<KeyVersion> {
        i64::try_from(value).ok().and_then(KeyVersion::new)
    }
}

impl std::fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<KeyVersion> for libsql::Value {
    fn from(value: KeyVersion) -> Self {
        libsql::Value::Integer(value.0)
    }
}

impl libsql::FromValue for KeyVersion {
    fn from_sql(val: libsql::Value) -> libsql::Result<Self>
    where
        Self: Sized,
    {
        match val {
            libsql::Value::Integer(i) => KeyVersion::new(i).ok_or(libsql::Error::InvalidColumnType),
            libsql::Value::Null => Err(libsql::Error::NullValue),
            _ => Err(libsql::Error::InvalidColumnType),
        }
    }
}

/// A persisted, wrapped key of one tier.
///
/// `parent_version` names the version of the parent tier that wrapped this key;
/// root keys have none and instead record the KDF label of the KEK that wrapped
/// them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BarrierKey {
    pub key_type: KeyType,
    pub version: KeyVersion,
    pub parent_version: Option<KeyVersion>,
    pub kdf_label: Option<KdfLabel>,
    pub wrapped: SealedBox,
    pub created_at: WrappedChronoDateTime,
}

impl BarrierKey {
    pub fn lookup_id(&self) -> String {
        lookup_id(self.key_type, Some(self.version))
    }
}

/// Identifier used in `NotFound` errors: `content:3`, or `content:latest`.
pub fn lookup_id(key_type: KeyType, version: Option<KeyVersion>) -> String {
    match version {
        Some(version) => format!("{key_type}:{version}"),
        None => format!("{key_type}:latest"),
    }
}
