//! Explicit encryption: data key creation and single value encrypt/decrypt.

use std::sync::Arc;
use std::time::Duration;

use bson::{Binary, Bson, Uuid};

use crate::crypt::InProcessCrypt;
use crate::engine::CryptEngine;
use crate::error::Error;
use crate::interceptor::CommandTransport;
use crate::kdf::generate_key_material;
use crate::key_vault::{CollectionKeyVault, DataKey, KeyRef, KeyVaultBackend, KeyVaultStore};
use crate::kms::{KmsProviders, MasterKey};
use crate::options::Namespace;
use crate::schema::SchemaRegistry;
use crate::value::{check_encryptable, Algorithm, EncryptedValue};

/// The key an explicit encryption uses: either its id or one of its alt names.
pub type EncryptKey = KeyRef;

/// Explicit encryption façade.
///
/// # Example
///
/// ```rust,no_run
/// # async fn demo(vault: std::sync::Arc<dyn fieldcrypt::interceptor::CommandTransport>) -> Result<(), fieldcrypt::Error> {
/// use fieldcrypt::prelude::*;
/// use secrecy::SecretVec;
///
/// let kms = KmsProviders::new().with_local(SecretVec::new(vec![7; 96]))?;
/// let encryption = ClientEncryption::new(vault, Namespace::new("admin", "datakeys"), kms);
///
/// let id = encryption.create_data_key("local", None, vec!["n".to_string()]).await?;
/// let encrypted = encryption
///     .encrypt(bson::Bson::String("000".into()), Algorithm::Deterministic, EncryptKey::Id(id))
///     .await?;
/// let value = encryption.decrypt(&bson::Bson::Binary(encrypted)).await?;
/// assert_eq!(value, bson::Bson::String("000".into()));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClientEncryption {
    engine: Arc<CryptEngine>,
}

impl ClientEncryption {
    /// Creates a façade storing data keys in the `key_vault_namespace`
    /// collection reached through `key_vault_client`.
    #[must_use]
    pub fn new(
        key_vault_client: Arc<dyn CommandTransport>,
        key_vault_namespace: Namespace,
        kms_providers: KmsProviders,
    ) -> Self {
        Self::with_backend(
            Arc::new(CollectionKeyVault::new(key_vault_client, key_vault_namespace)),
            kms_providers,
        )
    }

    /// Creates a façade over any key vault backend.
    #[must_use]
    pub fn with_backend(backend: Arc<dyn KeyVaultBackend>, kms_providers: KmsProviders) -> Self {
        let engine = CryptEngine::new(
            SchemaRegistry::new(Vec::new(), Duration::ZERO),
            KeyVaultStore::new(backend),
            kms_providers,
            Arc::new(InProcessCrypt),
        );
        Self { engine: Arc::new(engine) }
    }

    /// Creates a façade sharing the caches of an existing engine.
    #[must_use]
    pub const fn from_engine(engine: Arc<CryptEngine>) -> Self {
        Self { engine }
    }

    /// Returns the key vault store.
    #[must_use]
    pub fn key_vault(&self) -> &KeyVaultStore {
        self.engine.key_vault()
    }

    /// Creates a data key wrapped by the `provider` KMS and returns its id.
    ///
    /// Without a master key the provider's default descriptor is used.
    ///
    /// # Errors
    ///
    /// - `Error::Configuration` if the provider is not configured or the
    ///   master key belongs to another provider
    /// - `Error::Kms` if wrapping fails
    /// - `Error::DuplicateAltName` if an alt name is already taken
    pub async fn create_data_key(
        &self,
        provider: &str,
        master_key: Option<MasterKey>,
        key_alt_names: Vec<String>,
    ) -> Result<Uuid, Error> {
        let kms = self.engine.kms_providers().get(provider)?;
        let master_key = match master_key {
            Some(master_key) if master_key.provider() != provider => {
                return Err(Error::Configuration(format!(
                    "master key for provider '{}' given to provider '{provider}'",
                    master_key.provider()
                )));
            }
            Some(master_key) => master_key,
            None => kms.default_master_key()?,
        };

        let material = generate_key_material();
        let wrapped = kms.encrypt_key_material(&master_key, &material).await?;
        let key = DataKey::new(master_key, wrapped, key_alt_names);

        let id = self.engine.key_vault().insert_key(&key).await?;
        tracing::debug!(key_id = %id, provider, "created data key");
        Ok(id)
    }

    /// Encrypts `value` under `key`.
    ///
    /// # Errors
    ///
    /// - `Error::Encoding` or `Error::SchemaViolation` if the value cannot be
    ///   encrypted with `algorithm`
    /// - `Error::Encryption` carrying the cause (`KeyNotFound`, `Kms`, ...)
    ///   if the encryption pass fails
    pub async fn encrypt(&self, value: Bson, algorithm: Algorithm, key: EncryptKey) -> Result<Binary, Error> {
        check_encryptable(&value, algorithm)?;
        self.engine.encrypt_value(value, algorithm, key).await
    }

    /// Decrypts an encrypted value.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidEncryptedValue` if `value` is not a subtype 6 encrypted value
    /// - `Error::Encryption` carrying the cause if the decryption pass fails
    pub async fn decrypt(&self, value: &Bson) -> Result<Bson, Error> {
        let encrypted = match value {
            Bson::Binary(binary) => EncryptedValue::from_binary(binary)?,
            _ => {
                return Err(Error::InvalidEncryptedValue(
                    "value to decrypt must be a Binary with subtype 6".to_string(),
                ))
            }
        };
        self.engine.decrypt_value(&encrypted).await
    }

    /// Adds an alt name to the key `id` and returns the updated key.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` or `Error::DuplicateAltName`.
    pub async fn add_key_alt_name(&self, id: Uuid, name: &str) -> Result<DataKey, Error> {
        self.engine.key_vault().add_key_alt_name(id, name).await
    }
}
