use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use shared::{error::CommonError, primitives::WrappedChronoDateTime};
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::{BarrierKeyEvent, BarrierKeyEventSender, publish_event};
use crate::logic::envelope::{Envelope, SymmetricKey, open, seal};
use crate::logic::kdf::{KdfLabel, RootKeks};
use crate::logic::keys::{BarrierKey, KeyType, KeyVersion};
use crate::repository::{BarrierKeyRepositoryLike, CreateBarrierKey, VersionAssignment};

/// Associated data binding a wrapped key to the slot it was wrapped for.
fn wrap_aad(key_type: KeyType, parent_version: Option<KeyVersion>, kdf_label: KdfLabel) -> Vec<u8> {
    match (key_type.parent(), parent_version) {
        (Some(parent_type), Some(parent_version)) => {
            format!("barrier/v1/wrap/{key_type}/{parent_type}/{parent_version}").into_bytes()
        }
        _ => format!("barrier/v1/wrap/{key_type}/kek/{kdf_label}").into_bytes(),
    }
}

fn data_aad(version: KeyVersion) -> Vec<u8> {
    format!("barrier/v1/data/content/{version}").into_bytes()
}

/// Keeps the lookup id and kind of an error raised while resolving the parent
/// chain of `child`, adding which key was being unwrapped.
fn in_chain_of(err: CommonError, child: &BarrierKey) -> CommonError {
    match err {
        CommonError::NotFound {
            msg,
            lookup_id,
            source,
        } => CommonError::NotFound {
            msg: format!("{msg} (parent chain of {})", child.lookup_id()),
            lookup_id,
            source,
        },
        CommonError::AuthenticationFailed { msg, source } => CommonError::AuthenticationFailed {
            msg: format!("{msg} (parent chain of {})", child.lookup_id()),
            source,
        },
        other => other,
    }
}

// Unwrapped key cache

/// Unwrapped key material by `(tier, version)`. Persisted keys never change, so
/// entries stay valid until the cache is cleared.
#[derive(Default)]
pub struct UnwrappedKeyCache {
    keys: DashMap<(KeyType, KeyVersion), Arc<SymmetricKey>>,
}

impl UnwrappedKeyCache {
    pub fn get(&self, key_type: KeyType, version: KeyVersion) -> Option<Arc<SymmetricKey>> {
        self.keys
            .get(&(key_type, version))
            .map(|entry| entry.value().clone())
    }

    /// Inserts unless another caller got there first; returns the cached entry.
    fn insert(
        &self,
        key_type: KeyType,
        version: KeyVersion,
        key: SymmetricKey,
    ) -> Arc<SymmetricKey> {
        self.keys
            .entry((key_type, version))
            .or_insert_with(|| Arc::new(key))
            .value()
            .clone()
    }

    pub fn invalidate(&self, key_type: KeyType, version: KeyVersion) {
        self.keys.remove(&(key_type, version));
    }

    pub fn clear(&self) {
        self.keys.clear();
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Owns the three persisted tiers and the in-memory root KEKs that anchor them.
///
/// The KEKs are handed in at construction and never change, so several
/// hierarchies with different KEKs can live in one process. Once closed, no
/// operation returns key-derived output and the cache stays empty.
pub struct KeyHierarchy {
    repository: Arc<dyn BarrierKeyRepositoryLike>,
    root_kek: SymmetricKey,
    fallback_keks: Vec<SymmetricKey>,
    kdf_label: KdfLabel,
    cache: UnwrappedKeyCache,
    on_change_tx: BarrierKeyEventSender,
    closed: AtomicBool,
}

impl KeyHierarchy {
    pub fn new(
        repository: Arc<dyn BarrierKeyRepositoryLike>,
        root_keks: impl Into<RootKeks>,
        kdf_label: KdfLabel,
        on_change_tx: BarrierKeyEventSender,
    ) -> Self {
        let root_keks = root_keks.into();
        Self {
            repository,
            root_kek: SymmetricKey::from_bytes(*root_keks.primary().as_bytes()),
            fallback_keks: root_keks
                .iter()
                .skip(1)
                .map(|kek| SymmetricKey::from_bytes(*kek.as_bytes()))
                .collect(),
            kdf_label,
            cache: UnwrappedKeyCache::default(),
            on_change_tx,
            closed: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &UnwrappedKeyCache {
        &self.cache
    }

    /// Marks the hierarchy closed and drops every cached key. Returns `false`
    /// if it was already closed.
    pub fn close(&self) -> bool {
        let was_open = !self.closed.swap(true, Ordering::SeqCst);
        self.cache.clear();
        was_open
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn ensure_open(&self) -> Result<(), CommonError> {
        if self.is_closed() {
            return Err(CommonError::fatal("barrier service is closed"));
        }
        Ok(())
    }

    /// Caches freshly unwrapped material. An insert that races [`Self::close`]
    /// is undone and reported as closed.
    fn cache_unwrapped(
        &self,
        key_type: KeyType,
        version: KeyVersion,
        material: SymmetricKey,
    ) -> Result<Arc<SymmetricKey>, CommonError> {
        let material = self.cache.insert(key_type, version, material);
        if self.is_closed() {
            self.cache.clear();
            return Err(CommonError::fatal("barrier service is closed"));
        }
        Ok(material)
    }

    pub fn invalidate_cache(&self, key_type: KeyType, version: KeyVersion) {
        self.cache.invalidate(key_type, version);
    }

    /// Drops every unwrapped key held in memory.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub async fn get_latest(&self, key_type: KeyType) -> Result<BarrierKey, CommonError> {
        self.repository.get_latest_key(key_type).await
    }

    pub async fn get_by_version(
        &self,
        key_type: KeyType,
        version: KeyVersion,
    ) -> Result<BarrierKey, CommonError> {
        self.repository.get_key_by_version(key_type, version).await
    }

    fn unwrap_with(
        &self,
        wrapping_key: Option<&SymmetricKey>,
        key: &BarrierKey,
    ) -> Result<SymmetricKey, CommonError> {
        let aad = wrap_aad(key.key_type, key.parent_version, self.kdf_label);

        let material = match (key.key_type, wrapping_key) {
            (KeyType::Root, _) => {
                if key.kdf_label != Some(self.kdf_label) {
                    return Err(CommonError::authentication_failed(format!(
                        "{} was wrapped under kdf label {:?}, this instance derives {}",
                        key.lookup_id(),
                        key.kdf_label.map(|label| label.as_str()),
                        self.kdf_label
                    )));
                }
                let mut opened = open(&self.root_kek, &key.wrapped, &aad);
                for kek in &self.fallback_keks {
                    if opened.is_ok() {
                        break;
                    }
                    opened = open(kek, &key.wrapped, &aad);
                }
                opened
            }
            (_, Some(wrapping_key)) => open(wrapping_key, &key.wrapped, &aad),
            (_, None) => {
                return Err(CommonError::authentication_failed(format!(
                    "{} has no wrapping key",
                    key.lookup_id()
                )));
            }
        };

        let material = material.map_err(|e| match e {
            CommonError::AuthenticationFailed { source, .. } => {
                CommonError::AuthenticationFailed {
                    msg: format!("failed to unwrap {}", key.lookup_id()),
                    source,
                }
            }
            other => other,
        })?;
        SymmetricKey::from_slice(&material)
    }

    /// Unwraps `key` by walking up its parent chain (by version) until a cached
    /// key or the root KEK is reached, then unwrapping back down.
    pub async fn unwrap_key(&self, key: &BarrierKey) -> Result<Arc<SymmetricKey>, CommonError> {
        if let Some(cached) = self.cache.get(key.key_type, key.version) {
            return Ok(cached);
        }

        let mut pending = vec![key.clone()];
        let mut wrapping_key: Option<Arc<SymmetricKey>> = None;
        let mut current = key.clone();

        while let Some(parent_type) = current.key_type.parent() {
            let parent_version = current.parent_version.ok_or_else(|| {
                CommonError::authentication_failed(format!(
                    "{} does not record its parent version",
                    current.lookup_id()
                ))
            })?;

            if let Some(cached) = self.cache.get(parent_type, parent_version) {
                wrapping_key = Some(cached);
                break;
            }

            let parent = self
                .get_by_version(parent_type, parent_version)
                .await
                .map_err(|e| in_chain_of(e, key))?;
            pending.push(parent.clone());
            current = parent;
        }

        for pending_key in pending.iter().rev() {
            let material = self
                .unwrap_with(wrapping_key.as_deref(), pending_key)
                .map_err(|e| {
                    if pending_key.version == key.version && pending_key.key_type == key.key_type {
                        e
                    } else {
                        in_chain_of(e, key)
                    }
                })?;
            debug!(key = %pending_key.lookup_id(), "caching unwrapped key");
            wrapping_key = Some(self.cache_unwrapped(
                pending_key.key_type,
                pending_key.version,
                material,
            )?);
        }

        wrapping_key.ok_or_else(|| {
            CommonError::Unknown(anyhow::anyhow!(
                "unwrapping {} produced no key",
                key.lookup_id()
            ))
        })
    }

    /// Generates fresh key material for `key_type`, wraps it with `parent` (or
    /// the root KEK for the root tier) and persists it.
    async fn create_key(
        &self,
        key_type: KeyType,
        assignment: VersionAssignment,
        parent: Option<&(BarrierKey, Arc<SymmetricKey>)>,
    ) -> Result<(BarrierKey, Arc<SymmetricKey>), CommonError> {
        let material = SymmetricKey::generate();

        let (wrapping_key, parent_version, kdf_label) = match (key_type.parent(), parent) {
            (None, _) => (&self.root_kek, None, Some(self.kdf_label)),
            (Some(_), Some((parent_key, parent_material))) => {
                (parent_material.as_ref(), Some(parent_key.version), None)
            }
            (Some(parent_type), None) => {
                return Err(CommonError::Unknown(anyhow::anyhow!(
                    "cannot create a {key_type} key without a {parent_type} key"
                )));
            }
        };

        let aad = wrap_aad(key_type, parent_version, self.kdf_label);
        let wrapped = seal(wrapping_key, material.as_bytes(), &aad)?;

        let key = self
            .repository
            .create_key(&CreateBarrierKey {
                key_type,
                assignment,
                parent_version,
                kdf_label,
                wrapped,
                created_at: WrappedChronoDateTime::now(),
            })
            .await?;

        let material = self.cache_unwrapped(key.key_type, key.version, material)?;
        Ok((key, material))
    }

    /// Latest key of a tier, unwrapped. An empty tier is bootstrapped, parents
    /// first, so this only fails on storage or authentication errors.
    pub async fn latest_unwrapped(
        &self,
        key_type: KeyType,
    ) -> Result<(BarrierKey, Arc<SymmetricKey>), CommonError> {
        match self.get_latest(key_type).await {
            Ok(key) => {
                let material = self.unwrap_key(&key).await?;
                Ok((key, material))
            }
            Err(e) if e.is_not_found() => self.bootstrap(key_type).await,
            Err(e) => Err(e),
        }
    }

    async fn bootstrap(
        &self,
        key_type: KeyType,
    ) -> Result<(BarrierKey, Arc<SymmetricKey>), CommonError> {
        let lineage = KeyType::ALL.into_iter().take_while(|t| *t <= key_type);

        let mut parent: Option<(BarrierKey, Arc<SymmetricKey>)> = None;
        for tier in lineage {
            let existing = match self.get_latest(tier).await {
                Ok(key) => Some(key),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };

            let current = match existing {
                Some(key) => {
                    let material = self.unwrap_key(&key).await?;
                    (key, material)
                }
                None => match self
                    .create_key(tier, VersionAssignment::First, parent.as_ref())
                    .await
                {
                    Ok(created) => {
                        info!(key_type = %tier, version = %created.0.version, "bootstrapped barrier key");
                        publish_event(
                            &self.on_change_tx,
                            BarrierKeyEvent::KeyBootstrapped {
                                key_type: tier,
                                version: created.0.version,
                            },
                        );
                        created
                    }
                    Err(e) if e.is_conflict() => {
                        // another caller bootstrapped this tier first
                        debug!(key_type = %tier, "lost bootstrap race, reading winner");
                        let key = self.get_latest(tier).await?;
                        let material = self.unwrap_key(&key).await?;
                        (key, material)
                    }
                    Err(e) => return Err(e),
                },
            };
            parent = Some(current);
        }

        parent.ok_or_else(|| {
            CommonError::Unknown(anyhow::anyhow!("bootstrap of {key_type} produced no key"))
        })
    }

    /// Persists the next version of `key_type`, wrapped by the current latest
    /// parent. Used by rotation.
    pub async fn create_next_version(&self, key_type: KeyType) -> Result<BarrierKey, CommonError> {
        let parent = match key_type.parent() {
            Some(parent_type) => Some(self.latest_unwrapped(parent_type).await?),
            None => None,
        };

        let (key, _material) = self
            .create_key(key_type, VersionAssignment::Next, parent.as_ref())
            .await?;
        Ok(key)
    }

    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Envelope, CommonError> {
        self.ensure_open()?;
        let (key, material) = self.latest_unwrapped(KeyType::Content).await?;
        let sealed = seal(&material, plaintext, &data_aad(key.version))?;
        self.ensure_open()?;
        Ok(Envelope {
            key_type: KeyType::Content,
            version: key.version,
            sealed,
        })
    }

    pub async fn decrypt(&self, envelope: &Envelope) -> Result<Zeroizing<Vec<u8>>, CommonError> {
        if envelope.key_type != KeyType::Content {
            return Err(CommonError::authentication_failed(format!(
                "envelope references a {} key, data is only sealed by content keys",
                envelope.key_type
            )));
        }

        self.ensure_open()?;
        let key = self
            .get_by_version(KeyType::Content, envelope.version)
            .await?;
        let material = self.unwrap_key(&key).await?;

        let plaintext =
            open(&material, &envelope.sealed, &data_aad(envelope.version)).map_err(|e| match e {
                CommonError::AuthenticationFailed { source, .. } => {
                    CommonError::AuthenticationFailed {
                        msg: format!("data sealed under {} failed authentication", key.lookup_id()),
                        source,
                    }
                }
                other => other,
            })?;
        self.ensure_open()?;
        Ok(plaintext)
    }
}
