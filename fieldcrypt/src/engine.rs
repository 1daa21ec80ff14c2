//! Crypto engine: drives crypto contexts against the schema registry, the
//! key vault, the KMS providers and the crypt backend.
//!
//! One engine is shared by every operation of a client. It owns the caches
//! (schemas, data keys, unwrapped key material); each operation gets its own
//! [`CryptoContext`].

use std::sync::Arc;

use bson::{Binary, Bson, Document, Uuid};
use futures::future::try_join_all;
use secrecy::ExposeSecret;

use crate::cache::SingleFlightCache;
use crate::cipher::FieldCipher;
use crate::context::{CryptoContext, State};
use crate::crypt::{CryptBackend, InProcessCrypt};
use crate::error::Error;
use crate::interceptor::CommandTransport;
use crate::key_vault::{CollectionKeyVault, DataKey, KeyRef, KeyVaultStore};
use crate::kms::KmsProviders;
use crate::options::{AutoEncryptionOpts, Namespace};
use crate::schema::{LocalSchemaMap, RemoteSchemaProvider, SchemaProvider, SchemaRegistry};
use crate::value::{Algorithm, EncryptedValue};

/// Shared machinery of automatic and explicit encryption.
pub struct CryptEngine {
    schemas: SchemaRegistry,
    key_vault: KeyVaultStore,
    kms: KmsProviders,
    backend: Arc<dyn CryptBackend>,
    materials: SingleFlightCache<Uuid, Arc<FieldCipher>>,
}

impl CryptEngine {
    /// Creates an engine from its parts.
    #[must_use]
    pub fn new(
        schemas: SchemaRegistry,
        key_vault: KeyVaultStore,
        kms: KmsProviders,
        backend: Arc<dyn CryptBackend>,
    ) -> Self {
        Self { schemas, key_vault, kms, backend, materials: SingleFlightCache::new() }
    }

    /// Creates the engine of an auto-encrypting client.
    ///
    /// Key vault reads go through the configured key vault client, or through
    /// `transport` when none is set. Schemas come from the schema map first,
    /// then from the server.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the schema map is invalid.
    pub fn from_opts(opts: &AutoEncryptionOpts, transport: Arc<dyn CommandTransport>) -> Result<Self, Error> {
        let key_vault_client = opts.key_vault_client().cloned().unwrap_or_else(|| Arc::clone(&transport));
        let key_vault = KeyVaultStore::with_ttl(
            Arc::new(CollectionKeyVault::new(key_vault_client, opts.key_vault_namespace().clone())),
            opts.key_cache_ttl(),
        );

        let mut providers: Vec<Arc<dyn SchemaProvider>> = Vec::with_capacity(2);
        if let Some(schema_map) = opts.schema_map() {
            providers.push(Arc::new(LocalSchemaMap::new(schema_map)?));
        }
        providers.push(Arc::new(RemoteSchemaProvider::new(transport)));
        let schemas = SchemaRegistry::new(providers, opts.key_cache_ttl());

        Ok(Self::new(schemas, key_vault, opts.kms_providers().clone(), Arc::new(InProcessCrypt)))
    }

    /// Returns the key vault store.
    #[must_use]
    pub const fn key_vault(&self) -> &KeyVaultStore {
        &self.key_vault
    }

    /// Returns the configured KMS providers.
    #[must_use]
    pub const fn kms_providers(&self) -> &KmsProviders {
        &self.kms
    }

    /// Encrypts the fields of `command` the schema of `namespace` protects.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encryption` carrying the cause if any step fails; the
    /// command must then not be sent.
    pub async fn encrypt_command(&self, namespace: Namespace, command: Document) -> Result<Document, Error> {
        self.run(CryptoContext::auto_encrypt(namespace, command)).await?.into_result()
    }

    /// Decrypts every encrypted value of `document`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encryption` carrying the cause if any value cannot be decrypted.
    pub async fn decrypt_document(&self, document: Document) -> Result<Document, Error> {
        self.run(CryptoContext::auto_decrypt(document)).await?.into_result()
    }

    /// Encrypts one value under the referenced key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encryption` carrying the cause if the key cannot be
    /// resolved or the value cannot be encrypted.
    pub async fn encrypt_value(&self, value: Bson, algorithm: Algorithm, key: KeyRef) -> Result<Binary, Error> {
        let ctx = CryptoContext::explicit_encrypt(value, algorithm, key)?;
        self.run(ctx).await?.into_encrypted_value()
    }

    /// Decrypts one encrypted value.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encryption` carrying the cause if the key cannot be
    /// resolved or authentication fails.
    pub async fn decrypt_value(&self, value: &EncryptedValue) -> Result<Bson, Error> {
        self.run(CryptoContext::explicit_decrypt(value)).await?.into_value()
    }

    /// Drops every cached schema, data key and key material.
    pub fn clear_caches(&self) {
        self.schemas.clear_cache();
        self.key_vault.clear_cache();
        self.materials.clear();
    }

    /// Number of data keys whose material is held unwrapped.
    #[must_use]
    pub fn cached_materials(&self) -> usize {
        self.materials.len()
    }

    /// Drives `ctx` to `Done`.
    ///
    /// # Errors
    ///
    /// Returns the failure wrapped by [`CryptoContext::fail`].
    pub async fn run(&self, mut ctx: CryptoContext) -> Result<CryptoContext, Error> {
        match self.drive(&mut ctx).await {
            Ok(()) => Ok(ctx),
            Err(err) => Err(ctx.fail(err)),
        }
    }

    async fn drive(&self, ctx: &mut CryptoContext) -> Result<(), Error> {
        loop {
            match ctx.state() {
                State::Start => ctx.start()?,
                State::NeedSchema => {
                    let namespace = ctx
                        .namespace()
                        .cloned()
                        .ok_or_else(|| Error::Configuration("crypto context has no namespace".to_string()))?;
                    let schema = self.schemas.resolve(&namespace).await?;
                    ctx.provide_schema(schema)?;
                }
                State::NeedMarkings => {
                    let schema = ctx
                        .schema()
                        .ok_or_else(|| Error::Configuration("crypto context has no schema".to_string()))?;
                    let marked = self.backend.mark(ctx.document(), schema).await?;
                    ctx.provide_markings(marked)?;
                }
                State::NeedKeys => {
                    let keys = try_join_all(ctx.key_requests().iter().map(|key| self.key_vault.resolve(key))).await?;
                    for key in keys {
                        ctx.provide_key(key)?;
                    }
                    ctx.keys_done()?;
                }
                State::NeedKms => {
                    let pending: Vec<DataKey> = ctx.kms_requests().into_iter().cloned().collect();
                    let ciphers = try_join_all(pending.iter().map(|key| self.unwrap_key(key))).await?;
                    for (key, cipher) in pending.iter().zip(ciphers) {
                        ctx.provide_material(key.id(), cipher)?;
                    }
                }
                State::Ready => {
                    let result = if ctx.kind().encrypts() {
                        self.backend.finalize(ctx.document(), ctx.key_ring()).await?
                    } else {
                        self.backend.decrypt(ctx.document(), ctx.key_ring()).await?
                    };
                    ctx.complete(result)?;
                }
                State::Done => return Ok(()),
                State::Error => {
                    return Err(Error::Configuration("crypto context already failed".to_string()));
                }
            }
        }
    }

    /// Returns the cipher of `key`, unwrapping its material through the KMS
    /// provider on the first use.
    async fn unwrap_key(&self, key: &DataKey) -> Result<Arc<FieldCipher>, Error> {
        self.materials
            .get_or_try_fetch(key.id(), || async {
                let provider = self.kms.get(key.master_key().provider())?;
                tracing::debug!(key_id = %key.id(), provider = provider.name(), "unwrapping data key");
                let material = provider.decrypt_key_material(key.master_key(), key.key_material()).await?;
                tracing::debug!(
                    key_id = %key.id(),
                    size = material.expose_secret().len(),
                    "data key unwrapped"
                );
                Ok::<_, Error>(Arc::new(FieldCipher::new(&material)?))
            })
            .await
    }
}

impl std::fmt::Debug for CryptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptEngine")
            .field("schemas", &self.schemas)
            .field("key_vault", &self.key_vault)
            .field("kms", &self.kms)
            .field("cached_materials", &self.materials.len())
            .finish_non_exhaustive()
    }
}
