//! Crypt backend: the mark / finalize / decrypt capability.
//!
//! The crypto context decides *when* each step runs; a [`CryptBackend`]
//! performs it. [`InProcessCrypt`] does the work in this process. An
//! implementation talking to an external helper over IPC can be plugged in
//! behind the same trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document, Uuid};

use crate::cipher::FieldCipher;
use crate::error::Error;
use crate::key_vault::{DataKey, KeyRef};
use crate::marking::{self, Placeholder};
use crate::schema::EncryptionSchema;
use crate::value::{is_placeholder_binary, EncryptedValue};

/// Unwrapped data keys available to one crypto context.
#[derive(Default, Clone)]
pub struct KeyRing {
    ciphers: HashMap<Uuid, Arc<FieldCipher>>,
    alt_names: HashMap<String, Uuid>,
}

impl KeyRing {
    /// Creates an empty key ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the cipher of `key`, indexed by its id and alt names.
    pub fn insert(&mut self, key: &DataKey, cipher: Arc<FieldCipher>) {
        for name in key.key_alt_names() {
            self.alt_names.insert(name.clone(), key.id());
        }
        self.ciphers.insert(key.id(), cipher);
    }

    /// Whether the cipher of key `id` is present.
    #[must_use]
    pub fn contains(&self, id: &Uuid) -> bool {
        self.ciphers.contains_key(id)
    }

    /// Number of keys held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ciphers.len()
    }

    /// Whether no key is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ciphers.is_empty()
    }

    /// Returns the key id and cipher a reference resolves to.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if the key is not in the ring.
    pub fn get(&self, key: &KeyRef) -> Result<(Uuid, &FieldCipher), Error> {
        let id = match key {
            KeyRef::Id(id) => *id,
            KeyRef::AltName(name) => {
                *self.alt_names.get(name).ok_or_else(|| Error::KeyNotFound(key.to_string()))?
            }
        };
        let cipher = self.ciphers.get(&id).ok_or_else(|| Error::KeyNotFound(key.to_string()))?;
        Ok((id, cipher))
    }
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing").field("keys", &self.ciphers.keys().collect::<Vec<_>>()).finish()
    }
}

/// Marking and cryptography over documents.
#[async_trait]
pub trait CryptBackend: Send + Sync {
    /// Replaces every value `command` must send encrypted with a placeholder.
    ///
    /// # Errors
    ///
    /// Returns error if the command conflicts with the schema.
    async fn mark(&self, command: &Document, schema: &EncryptionSchema) -> Result<Document, Error>;

    /// Replaces every placeholder with its encrypted value.
    ///
    /// # Errors
    ///
    /// Returns error if a key is missing or a value cannot be encrypted.
    async fn finalize(&self, marked: &Document, keys: &KeyRing) -> Result<Document, Error>;

    /// Replaces every encrypted value with its plaintext.
    ///
    /// # Errors
    ///
    /// Returns error if a key is missing or a value fails to decrypt.
    async fn decrypt(&self, document: &Document, keys: &KeyRing) -> Result<Document, Error>;
}

/// Backend running marking and encryption in-process.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessCrypt;

#[async_trait]
impl CryptBackend for InProcessCrypt {
    async fn mark(&self, command: &Document, schema: &EncryptionSchema) -> Result<Document, Error> {
        marking::mark_command(command, schema)
    }

    async fn finalize(&self, marked: &Document, keys: &KeyRing) -> Result<Document, Error> {
        marking::rewrite_encrypted_binaries(marked, &mut |binary| {
            if !is_placeholder_binary(binary) {
                return Ok(Bson::Binary(binary.clone()));
            }
            let placeholder = Placeholder::from_binary(binary)?;
            let (key_id, cipher) = keys.get(&placeholder.key)?;
            Ok(cipher.encrypt(key_id, placeholder.algorithm, &placeholder.value)?.into())
        })
    }

    async fn decrypt(&self, document: &Document, keys: &KeyRing) -> Result<Document, Error> {
        marking::rewrite_encrypted_binaries(document, &mut |binary| {
            if is_placeholder_binary(binary) {
                return Ok(Bson::Binary(binary.clone()));
            }
            let value = EncryptedValue::from_bytes(&binary.bytes)?;
            let (_, cipher) = keys.get(&KeyRef::Id(value.key_id()))?;
            cipher.decrypt(&value)
        })
    }
}
