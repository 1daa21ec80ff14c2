//! KMS provider abstraction for wrapping and unwrapping data key material.
//!
//! A data key's material is stored in the key vault encrypted ("wrapped") under
//! a master key held by a KMS provider. The provider is named in the data key's
//! `masterKey` descriptor; [`KmsProviders`] maps those names to implementations.

mod local;

pub use local::LocalKmsProvider;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use secrecy::SecretVec;

use crate::error::{Error, KmsError, KmsErrorKind};

/// Provider name of the local static master key.
pub const LOCAL_PROVIDER: &str = "local";

/// Provider name of AWS KMS.
pub const AWS_PROVIDER: &str = "aws";

/// Provider-specific description of the master key wrapping a data key.
#[derive(Debug, Clone, PartialEq)]
pub enum MasterKey {
    /// The local master key configured at startup.
    Local,
    /// An AWS KMS customer master key.
    Aws {
        /// AWS region, e.g. `us-east-1`
        region: String,
        /// Key ARN or alias
        key: String,
        /// Endpoint override (`host[:port]`)
        endpoint: Option<String>,
    },
    /// A provider this crate has no built-in descriptor for.
    Other {
        /// Provider name
        provider: String,
        /// Remaining descriptor fields
        fields: Document,
    },
}

impl MasterKey {
    /// Returns the provider name.
    #[must_use]
    pub fn provider(&self) -> &str {
        match self {
            Self::Local => LOCAL_PROVIDER,
            Self::Aws { .. } => AWS_PROVIDER,
            Self::Other { provider, .. } => provider,
        }
    }

    /// Renders the descriptor as stored in the key vault.
    #[must_use]
    pub fn to_document(&self) -> Document {
        match self {
            Self::Local => doc! { "provider": LOCAL_PROVIDER },
            Self::Aws { region, key, endpoint } => {
                let mut document = doc! { "provider": AWS_PROVIDER, "region": region, "key": key };
                if let Some(endpoint) = endpoint {
                    document.insert("endpoint", endpoint);
                }
                document
            }
            Self::Other { provider, fields } => {
                let mut document = doc! { "provider": provider };
                for (name, value) in fields {
                    document.insert(name.clone(), value.clone());
                }
                document
            }
        }
    }

    /// Parses a key vault descriptor.
    ///
    /// # Errors
    ///
    /// Returns a `MalformedDescriptor` KMS error when `provider` is missing or
    /// an AWS descriptor lacks `region` or `key`.
    pub fn from_document(document: &Document) -> Result<Self, KmsError> {
        let provider = document.get_str("provider").map_err(|_| {
            KmsError::new("unknown", KmsErrorKind::MalformedDescriptor, "masterKey has no provider")
        })?;

        match provider {
            LOCAL_PROVIDER => Ok(Self::Local),
            AWS_PROVIDER => {
                let field = |name: &str| {
                    document.get_str(name).map(str::to_string).map_err(|_| {
                        KmsError::new(
                            AWS_PROVIDER,
                            KmsErrorKind::MalformedDescriptor,
                            format!("masterKey requires a string '{name}'"),
                        )
                    })
                };
                Ok(Self::Aws {
                    region: field("region")?,
                    key: field("key")?,
                    endpoint: document.get_str("endpoint").ok().map(str::to_string),
                })
            }
            other => {
                let mut fields = document.clone();
                fields.remove("provider");
                Ok(Self::Other { provider: other.to_string(), fields })
            }
        }
    }
}

/// Wraps and unwraps data key material under a master key.
///
/// Implementations must be thread-safe (`Send + Sync`) to support
/// concurrent encryption operations. Errors must classify transient
/// failures (network, timeout) apart from terminal ones (authentication,
/// malformed descriptor) so callers can decide on retries; providers never
/// retry on their own.
#[async_trait]
pub trait KmsProvider: Send + Sync {
    /// Returns the provider name used in `masterKey.provider`.
    fn name(&self) -> &str;

    /// Returns the descriptor used when key creation does not supply one.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if this provider needs an explicit descriptor.
    fn default_master_key(&self) -> Result<MasterKey, Error> {
        Err(Error::Configuration(format!(
            "a master key is required to create data keys with the '{}' provider",
            self.name()
        )))
    }

    /// Wraps (encrypts) raw data key material. Used only during key creation.
    ///
    /// # Errors
    ///
    /// Returns a `KmsError` if the provider cannot wrap the material.
    async fn encrypt_key_material(
        &self,
        master_key: &MasterKey,
        material: &SecretVec<u8>,
    ) -> Result<Vec<u8>, KmsError>;

    /// Unwraps (decrypts) data key material.
    ///
    /// # Errors
    ///
    /// Returns a `KmsError` on network failure, authentication failure or a
    /// malformed descriptor.
    async fn decrypt_key_material(
        &self,
        master_key: &MasterKey,
        wrapped: &[u8],
    ) -> Result<SecretVec<u8>, KmsError>;
}

/// Registry of configured KMS providers, keyed by provider name.
///
/// Injected into each engine at construction; there is no process-wide
/// provider state, so engines with different credentials can coexist.
#[derive(Clone, Default)]
pub struct KmsProviders {
    providers: BTreeMap<String, Arc<dyn KmsProvider>>,
}

impl KmsProviders {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the `local` provider with the given 96-byte master key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the key has the wrong length.
    pub fn with_local(self, master_key: SecretVec<u8>) -> Result<Self, Error> {
        Ok(self.with_provider(Arc::new(LocalKmsProvider::new(master_key)?)))
    }

    /// Registers a provider under its own name, replacing any previous one.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn KmsProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Registers a provider under its own name, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn KmsProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Looks up a provider.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if no provider of that name is configured.
    pub fn get(&self, name: &str) -> Result<Arc<dyn KmsProvider>, Error> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("KMS provider '{name}' is not configured")))
    }

    /// Returns the configured provider names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Whether no provider is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for KmsProviders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsProviders").field("providers", &self.providers.keys()).finish()
    }
}

/// Converts a descriptor value (`Bson::Document`) into a [`MasterKey`].
///
/// # Errors
///
/// Returns a `MalformedDescriptor` KMS error for anything but a document.
pub fn master_key_from_bson(value: &Bson) -> Result<MasterKey, KmsError> {
    match value {
        Bson::Document(document) => MasterKey::from_document(document),
        _ => Err(KmsError::new(
            "unknown",
            KmsErrorKind::MalformedDescriptor,
            "masterKey must be a document",
        )),
    }
}
