// Typed wrappers around the barrier_key statements. Each returns `None` when the
// statement produced no row.

use shared::libsql::Connection;
use shared::primitives::WrappedChronoDateTime;

use crate::logic::keys::{KeyType, KeyVersion};

const BARRIER_KEY_COLUMNS: &str =
    "key_type, version, parent_version, kdf_label, nonce, ciphertext, tag, created_at";

pub struct insert_barrier_key_params<'a> {
    pub key_type: &'a KeyType,
    pub parent_version: &'a Option<KeyVersion>,
    pub kdf_label: &'a Option<String>,
    pub nonce: &'a [u8],
    pub ciphertext: &'a [u8],
    pub tag: &'a [u8],
    pub created_at: &'a WrappedChronoDateTime,
}

impl insert_barrier_key_params<'_> {
    fn to_values(&self) -> Vec<libsql::Value> {
        vec![
            libsql::Value::from(*self.key_type),
            match self.parent_version {
                Some(version) => libsql::Value::from(*version),
                None => libsql::Value::Null,
            },
            match self.kdf_label {
                Some(label) => libsql::Value::Text(label.clone()),
                None => libsql::Value::Null,
            },
            libsql::Value::Blob(self.nonce.to_vec()),
            libsql::Value::Blob(self.ciphertext.to_vec()),
            libsql::Value::Blob(self.tag.to_vec()),
            libsql::Value::from(*self.created_at),
        ]
    }
}

#[derive(Debug)]
pub struct Row_barrier_key {
    pub key_type: KeyType,
    pub version: KeyVersion,
    pub parent_version: Option<KeyVersion>,
    pub kdf_label: Option<String>,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
    pub created_at: WrappedChronoDateTime,
}

fn optional<T: libsql::FromValue>(value: libsql::Value) -> libsql::Result<Option<T>> {
    match value {
        libsql::Value::Null => Ok(None),
        value => T::from_sql(value).map(Some),
    }
}

fn blob(value: libsql::Value) -> libsql::Result<Vec<u8>> {
    match value {
        libsql::Value::Blob(bytes) => Ok(bytes),
        libsql::Value::Null => Err(libsql::Error::NullValue),
        _ => Err(libsql::Error::InvalidColumnType),
    }
}

impl TryFrom<&libsql::Row> for Row_barrier_key {
    type Error = libsql::Error;

    fn try_from(row: &libsql::Row) -> Result<Self, Self::Error> {
        Ok(Row_barrier_key {
            key_type: row.get::<KeyType>(0)?,
            version: row.get::<KeyVersion>(1)?,
            parent_version: optional::<KeyVersion>(row.get_value(2)?)?,
            kdf_label: optional::<String>(row.get_value(3)?)?,
            nonce: blob(row.get_value(4)?)?,
            ciphertext: blob(row.get_value(5)?)?,
            tag: blob(row.get_value(6)?)?,
            created_at: row.get::<WrappedChronoDateTime>(7)?,
        })
    }
}

async fn returning_version(
    conn: &Connection,
    sql: &str,
    values: Vec<libsql::Value>,
) -> Result<Option<KeyVersion>, libsql::Error> {
    tracing::trace!("executing `{}`", sql);
    // the insert runs on the first step, so busy errors surface from `next`
    // and the whole statement is retried
    shared::execute_with_retry!(
        async {
            let mut rows = conn.0.query(sql, values.clone()).await?;
            let version = match rows.next().await? {
                Some(row) => Some(row.get::<KeyVersion>(0)?),
                None => None,
            };
            // step to completion so the statement's implicit transaction commits here
            while rows.next().await?.is_some() {}
            Ok::<_, libsql::Error>(version)
        },
        10
    )
}

/// Inserts the key as `MAX(version) + 1` of its tier, in one statement.
pub async fn insert_next_barrier_key(
    conn: &Connection,
    params: insert_barrier_key_params<'_>,
) -> Result<Option<KeyVersion>, libsql::Error> {
    let sql = format!(
        "INSERT INTO barrier_key ({BARRIER_KEY_COLUMNS})
SELECT ?1, COALESCE(MAX(version), 0) + 1, ?2, ?3, ?4, ?5, ?6, ?7
FROM barrier_key
WHERE key_type = ?1
RETURNING version"
    );
    returning_version(conn, &sql, params.to_values()).await
}

/// Inserts the key as version 1, only if its tier is still empty.
pub async fn insert_first_barrier_key(
    conn: &Connection,
    params: insert_barrier_key_params<'_>,
) -> Result<Option<KeyVersion>, libsql::Error> {
    let sql = format!(
        "INSERT INTO barrier_key ({BARRIER_KEY_COLUMNS})
SELECT ?1, 1, ?2, ?3, ?4, ?5, ?6, ?7
WHERE NOT EXISTS (SELECT 1 FROM barrier_key WHERE key_type = ?1)
RETURNING version"
    );
    returning_version(conn, &sql, params.to_values()).await
}

async fn single_row(
    conn: &Connection,
    sql: &str,
    values: Vec<libsql::Value>,
) -> Result<Option<Row_barrier_key>, libsql::Error> {
    tracing::trace!("executing `{}`", sql);
    shared::execute_with_retry!(
        async {
            let mut rows = conn.0.query(sql, values.clone()).await?;
            let row = match rows.next().await? {
                Some(row) => Some(Row_barrier_key::try_from(&row)?),
                None => None,
            };
            Ok::<_, libsql::Error>(row)
        },
        10
    )
}

pub async fn get_latest_barrier_key(
    conn: &Connection,
    key_type: &KeyType,
) -> Result<Option<Row_barrier_key>, libsql::Error> {
    let sql = format!(
        "SELECT {BARRIER_KEY_COLUMNS} FROM barrier_key
WHERE key_type = ?1
ORDER BY version DESC
LIMIT 1"
    );
    single_row(conn, &sql, vec![libsql::Value::from(*key_type)]).await
}

pub async fn get_barrier_key_by_version(
    conn: &Connection,
    key_type: &KeyType,
    version: &KeyVersion,
) -> Result<Option<Row_barrier_key>, libsql::Error> {
    let sql = format!(
        "SELECT {BARRIER_KEY_COLUMNS} FROM barrier_key
WHERE key_type = ?1 AND version = ?2"
    );
    single_row(
        conn,
        &sql,
        vec![libsql::Value::from(*key_type), libsql::Value::from(*version)],
    )
    .await
}
