//! Key vault: storage and lookup of wrapped data encryption keys.
//!
//! [`KeyVaultStore`] sits on top of a [`KeyVaultBackend`] (a database
//! collection reached through a dedicated connection, a directory, memory)
//! and keeps a TTL cache of resolved keys keyed by id and by alt name.

mod collection;
mod memory;

pub use collection::CollectionKeyVault;
pub use memory::MemoryKeyVault;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, DateTime, Document, Uuid};

use crate::cache::SingleFlightCache;
use crate::error::Error;
use crate::kms::{master_key_from_bson, MasterKey};

/// Default time-to-live of resolved keys.
pub const DEFAULT_KEY_CACHE_TTL: Duration = Duration::from_secs(60);

/// Status value of an active key.
pub const STATUS_ACTIVE: i32 = 0;

/// A data encryption key as stored in the key vault.
///
/// The key material is wrapped by the master key named in
/// [`DataKey::master_key`]; plaintext material never lives in this type.
#[derive(Debug, Clone, PartialEq)]
pub struct DataKey {
    id: Uuid,
    key_material: Vec<u8>,
    master_key: MasterKey,
    key_alt_names: Vec<String>,
    creation_date: DateTime,
    update_date: DateTime,
    status: i32,
}

impl DataKey {
    /// Creates a new active key with a fresh id.
    #[must_use]
    pub fn new(master_key: MasterKey, key_material: Vec<u8>, key_alt_names: Vec<String>) -> Self {
        let now = DateTime::now();
        Self {
            id: Uuid::new(),
            key_material,
            master_key,
            key_alt_names,
            creation_date: now,
            update_date: now,
            status: STATUS_ACTIVE,
        }
    }

    /// Returns the key id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the wrapped key material.
    #[must_use]
    pub fn key_material(&self) -> &[u8] {
        &self.key_material
    }

    /// Returns the master key descriptor.
    #[must_use]
    pub const fn master_key(&self) -> &MasterKey {
        &self.master_key
    }

    /// Returns the alternate names.
    #[must_use]
    pub fn key_alt_names(&self) -> &[String] {
        &self.key_alt_names
    }

    /// Returns the creation time.
    #[must_use]
    pub const fn creation_date(&self) -> DateTime {
        self.creation_date
    }

    /// Returns the last update time.
    #[must_use]
    pub const fn update_date(&self) -> DateTime {
        self.update_date
    }

    /// Returns the key status.
    #[must_use]
    pub const fn status(&self) -> i32 {
        self.status
    }

    /// Renders the key as a key vault document.
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut document = doc! {
            "_id": self.id,
            "keyMaterial": Binary { subtype: BinarySubtype::Generic, bytes: self.key_material.clone() },
            "creationDate": self.creation_date,
            "updateDate": self.update_date,
            "status": self.status,
            "masterKey": self.master_key.to_document(),
        };
        if !self.key_alt_names.is_empty() {
            document.insert("keyAltNames", self.key_alt_names.clone());
        }
        document
    }

    /// Parses a key vault document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encoding` if a required field is missing or has the
    /// wrong type, and a KMS error if the master key descriptor is malformed.
    pub fn from_document(document: &Document) -> Result<Self, Error> {
        let id = match document.get("_id") {
            Some(Bson::Binary(binary)) => uuid_from_binary(binary)
                .ok_or_else(|| Error::Encoding("data key _id must be a UUID".to_string()))?,
            _ => return Err(Error::Encoding("data key has no UUID _id".to_string())),
        };

        let key_material = document
            .get_binary_generic("keyMaterial")
            .map_err(|_| Error::Encoding(format!("data key {id} has no keyMaterial")))?
            .clone();

        let master_key = document
            .get("masterKey")
            .ok_or_else(|| Error::Encoding(format!("data key {id} has no masterKey")))
            .and_then(|value| master_key_from_bson(value).map_err(Error::from))?;

        let key_alt_names = match document.get("keyAltNames") {
            None | Some(Bson::Null) => Vec::new(),
            Some(Bson::Array(names)) => names
                .iter()
                .map(|name| {
                    name.as_str().map(str::to_string).ok_or_else(|| {
                        Error::Encoding(format!("data key {id} has a non-string keyAltName"))
                    })
                })
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(Error::Encoding(format!("data key {id} keyAltNames must be an array")))
            }
        };

        let date = |field: &str| document.get_datetime(field).ok().copied();
        let creation_date = date("creationDate").unwrap_or_else(DateTime::now);

        Ok(Self {
            id,
            key_material,
            master_key,
            key_alt_names,
            creation_date,
            update_date: date("updateDate").unwrap_or(creation_date),
            status: document.get_i32("status").unwrap_or(STATUS_ACTIVE),
        })
    }

    fn add_alt_name(&mut self, name: &str) {
        if !self.key_alt_names.iter().any(|existing| existing == name) {
            self.key_alt_names.push(name.to_string());
        }
        self.update_date = DateTime::now();
    }
}

/// Reads a UUID from a 16-byte binary (subtype 4, or legacy subtype 3).
#[must_use]
pub fn uuid_from_binary(binary: &Binary) -> Option<Uuid> {
    if !matches!(binary.subtype, BinarySubtype::Uuid | BinarySubtype::UuidOld) {
        return None;
    }
    let bytes: [u8; 16] = binary.bytes.as_slice().try_into().ok()?;
    Some(Uuid::from_bytes(bytes))
}

/// Reference to a data key, by id or by alternate name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyRef {
    /// Key id
    Id(Uuid),
    /// One of the key's `keyAltNames`
    AltName(String),
}

impl KeyRef {
    /// Returns the key vault filter selecting this key.
    #[must_use]
    pub fn filter(&self) -> Document {
        match self {
            Self::Id(id) => doc! { "_id": *id },
            Self::AltName(name) => doc! { "keyAltNames": name },
        }
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {id}"),
            Self::AltName(name) => write!(f, "alt name '{name}'"),
        }
    }
}

/// Storage backend of a key vault.
#[async_trait]
pub trait KeyVaultBackend: Send + Sync {
    /// Returns every key document matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be read.
    async fn find(&self, filter: Document) -> Result<Vec<Document>, Error>;

    /// Stores a new key document.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be written.
    async fn insert(&self, document: Document) -> Result<(), Error>;

    /// Replaces the key document with the given id.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be written.
    async fn replace(&self, id: Uuid, document: Document) -> Result<(), Error>;
}

/// Data key store with a TTL cache over a backend.
pub struct KeyVaultStore {
    backend: Arc<dyn KeyVaultBackend>,
    cache: SingleFlightCache<KeyRef, DataKey>,
}

impl KeyVaultStore {
    /// Creates a store with the default 60 second cache TTL.
    #[must_use]
    pub fn new(backend: Arc<dyn KeyVaultBackend>) -> Self {
        Self::with_ttl(backend, DEFAULT_KEY_CACHE_TTL)
    }

    /// Creates a store whose cached keys expire after `ttl`.
    #[must_use]
    pub fn with_ttl(backend: Arc<dyn KeyVaultBackend>, ttl: Duration) -> Self {
        Self { backend, cache: SingleFlightCache::with_ttl(ttl) }
    }

    /// Returns every key matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails or a stored document is malformed.
    pub async fn find_keys(&self, filter: Document) -> Result<Vec<DataKey>, Error> {
        self.backend.find(filter).await?.iter().map(DataKey::from_document).collect()
    }

    /// Persists a new key and returns its id.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateAltName` if one of its alt names is already taken.
    pub async fn insert_key(&self, key: &DataKey) -> Result<Uuid, Error> {
        if let Some(name) = self.first_taken_alt_name(key.key_alt_names(), None).await? {
            return Err(Error::DuplicateAltName(name));
        }

        self.backend.insert(key.to_document()).await?;
        tracing::debug!(key_id = %key.id(), provider = key.master_key().provider(), "inserted data key");
        Ok(key.id())
    }

    /// Resolves a key reference, consulting the cache first.
    ///
    /// Concurrent lookups of the same reference share one backend read.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if no key matches; failures are never cached.
    pub async fn resolve(&self, key_ref: &KeyRef) -> Result<DataKey, Error> {
        if let Some(key) = self.cache.get(key_ref) {
            tracing::debug!(key = %key_ref, "key vault cache hit");
            return Ok(key);
        }

        let key = self
            .cache
            .get_or_try_fetch(key_ref.clone(), || async {
                tracing::debug!(key = %key_ref, "key vault cache miss");
                self.find_keys(key_ref.filter())
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::KeyNotFound(key_ref.to_string()))
            })
            .await?;

        if matches!(key_ref, KeyRef::AltName(_)) && self.cache.get(&KeyRef::Id(key.id())).is_none() {
            self.cache.insert(KeyRef::Id(key.id()), key.clone());
        }
        Ok(key)
    }

    /// Adds an alternate name to an existing key and returns the updated key.
    ///
    /// # Errors
    ///
    /// - `Error::KeyNotFound` if no key has this id
    /// - `Error::DuplicateAltName` if another key already uses the name
    pub async fn add_key_alt_name(&self, id: Uuid, name: &str) -> Result<DataKey, Error> {
        let mut key = self
            .find_keys(KeyRef::Id(id).filter())
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::KeyNotFound(KeyRef::Id(id).to_string()))?;

        if self.first_taken_alt_name(&[name.to_string()], Some(id)).await?.is_some() {
            return Err(Error::DuplicateAltName(name.to_string()));
        }

        key.add_alt_name(name);
        self.backend.replace(id, key.to_document()).await?;

        self.cache.invalidate(&KeyRef::Id(id));
        for alt_name in key.key_alt_names() {
            self.cache.invalidate(&KeyRef::AltName(alt_name.clone()));
        }
        tracing::debug!(key_id = %id, "added key alt name");
        Ok(key)
    }

    /// Drops every cached key.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Number of cached key references.
    #[must_use]
    pub fn cached_keys(&self) -> usize {
        self.cache.len()
    }

    async fn first_taken_alt_name(
        &self,
        names: &[String],
        except: Option<Uuid>,
    ) -> Result<Option<String>, Error> {
        if names.is_empty() {
            return Ok(None);
        }

        let filter = doc! { "keyAltNames": { "$in": names.to_vec() } };
        for existing in self.find_keys(filter).await? {
            if Some(existing.id()) == except {
                continue;
            }
            if let Some(name) = names.iter().find(|n| existing.key_alt_names().contains(*n)) {
                return Ok(Some(name.clone()));
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for KeyVaultStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyVaultStore").field("cached_keys", &self.cache.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_key(names: &[&str]) -> DataKey {
        DataKey::new(
            MasterKey::Local,
            vec![5; 112],
            names.iter().map(|n| (*n).to_string()).collect(),
        )
    }

    fn store() -> (Arc<MemoryKeyVault>, KeyVaultStore) {
        let backend = Arc::new(MemoryKeyVault::new());
        let store = KeyVaultStore::new(Arc::clone(&backend) as Arc<dyn KeyVaultBackend>);
        (backend, store)
    }

    #[test]
    fn test_document_round_trip() {
        let key = local_key(&["n"]);
        let document = key.to_document();

        assert!(matches!(document.get("_id"), Some(Bson::Binary(b)) if b.subtype == BinarySubtype::Uuid));
        assert_eq!(document.get_document("masterKey").unwrap(), &doc! { "provider": "local" });
        assert_eq!(DataKey::from_document(&document).unwrap(), key);
    }

    #[test]
    fn test_from_document_requires_fields() {
        let mut document = local_key(&[]).to_document();
        document.remove("keyMaterial");
        assert!(matches!(DataKey::from_document(&document), Err(Error::Encoding(_))));

        let document = doc! { "_id": 1, "keyMaterial": Binary { subtype: BinarySubtype::Generic, bytes: vec![] } };
        assert!(matches!(DataKey::from_document(&document), Err(Error::Encoding(_))));
    }

    #[tokio::test]
    async fn test_insert_and_resolve_by_id_and_alt_name() {
        let (_, store) = store();
        let key = local_key(&["alpha"]);
        let id = store.insert_key(&key).await.unwrap();

        assert_eq!(store.resolve(&KeyRef::Id(id)).await.unwrap(), key);
        assert_eq!(store.resolve(&KeyRef::AltName("alpha".into())).await.unwrap(), key);
    }

    #[tokio::test]
    async fn test_duplicate_alt_name_rejected() {
        let (backend, store) = store();
        store.insert_key(&local_key(&["alpha", "beta"])).await.unwrap();

        let err = store.insert_key(&local_key(&["gamma", "beta"])).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateAltName(ref name) if name == "beta"));
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_cached() {
        let (backend, store) = store();
        let missing = KeyRef::Id(Uuid::new());

        assert!(matches!(store.resolve(&missing).await, Err(Error::KeyNotFound(_))));
        assert_eq!(store.cached_keys(), 0);

        let key = local_key(&[]);
        backend.insert(key.to_document()).await.unwrap();
        assert_eq!(store.resolve(&KeyRef::Id(key.id())).await.unwrap(), key);
    }

    #[tokio::test]
    async fn test_alt_name_resolution_hits_cache() {
        let (backend, store) = store();
        store.insert_key(&local_key(&["alpha"])).await.unwrap();
        let alpha = KeyRef::AltName("alpha".into());

        store.resolve(&alpha).await.unwrap();
        let reads = backend.find_count();
        store.resolve(&alpha).await.unwrap();
        assert_eq!(backend.find_count(), reads);

        store.clear_cache();
        store.resolve(&alpha).await.unwrap();
        assert_eq!(backend.find_count(), reads + 1);
    }

    #[tokio::test]
    async fn test_cache_entries_expire() {
        let backend = Arc::new(MemoryKeyVault::new());
        let store = KeyVaultStore::with_ttl(
            Arc::clone(&backend) as Arc<dyn KeyVaultBackend>,
            Duration::from_millis(20),
        );
        let key = local_key(&[]);
        store.insert_key(&key).await.unwrap();

        store.resolve(&KeyRef::Id(key.id())).await.unwrap();
        let reads = backend.find_count();
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.resolve(&KeyRef::Id(key.id())).await.unwrap();
        assert_eq!(backend.find_count(), reads + 1);
    }

    #[tokio::test]
    async fn test_add_key_alt_name() {
        let (_, store) = store();
        let first = local_key(&["alpha"]);
        let second = local_key(&[]);
        store.insert_key(&first).await.unwrap();
        store.insert_key(&second).await.unwrap();

        let updated = store.add_key_alt_name(second.id(), "beta").await.unwrap();
        assert_eq!(updated.key_alt_names(), &["beta".to_string()]);
        assert!(updated.update_date() >= second.update_date());
        assert_eq!(store.resolve(&KeyRef::AltName("beta".into())).await.unwrap().id(), second.id());

        // Re-adding a name the key already has is allowed
        assert!(store.add_key_alt_name(first.id(), "alpha").await.is_ok());

        let err = store.add_key_alt_name(second.id(), "alpha").await.unwrap_err();
        assert!(matches!(err, Error::DuplicateAltName(_)));

        let err = store.add_key_alt_name(Uuid::new(), "gamma").await.unwrap_err();
        assert!(matches!(err, Error::KeyNotFound(_)));
    }

    #[tokio::test]
    async fn test_add_key_alt_name_refreshes_existing_alt_names() {
        let (_, store) = store();
        let key = local_key(&["alpha"]);
        store.insert_key(&key).await.unwrap();

        // Cache the key under its existing name
        let alpha = KeyRef::AltName("alpha".into());
        assert_eq!(store.resolve(&alpha).await.unwrap().key_alt_names(), &["alpha".to_string()]);

        store.add_key_alt_name(key.id(), "beta").await.unwrap();

        let expected = vec!["alpha".to_string(), "beta".to_string()];
        assert_eq!(store.resolve(&alpha).await.unwrap().key_alt_names(), expected.as_slice());
        assert_eq!(store.resolve(&KeyRef::Id(key.id())).await.unwrap().key_alt_names(), expected.as_slice());
    }
}
