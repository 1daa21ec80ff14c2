//! Configuration of auto-encryption and of the crypt helper.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use bson::Document;
use secrecy::{ExposeSecret, SecretString, SecretVec};
use serde::Deserialize;

use crate::error::Error;
use crate::interceptor::CommandTransport;
use crate::key_vault::DEFAULT_KEY_CACHE_TTL;
use crate::kms::KmsProviders;

/// Default key vault namespace.
pub const DEFAULT_KEY_VAULT_NAMESPACE: &str = "admin.datakeys";

/// Idle timeout passed to a spawned crypt helper unless the caller sets one.
pub const IDLE_SHUTDOWN_ARG: &str = "--idleShutdownTimeoutSecs=60";

/// A `database.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    /// Creates a namespace from its parts.
    #[must_use]
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self { db: db.into(), coll: coll.into() }
    }

    /// Parses `db.collection`; the collection part may itself contain dots.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if either part is missing.
    pub fn parse(namespace: &str) -> Result<Self, Error> {
        match namespace.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(Error::Configuration(format!(
                "invalid namespace '{namespace}': expected 'database.collection'"
            ))),
        }
    }

    /// Returns the database name.
    #[must_use]
    pub fn db(&self) -> &str {
        &self.db
    }

    /// Returns the collection name.
    #[must_use]
    pub fn coll(&self) -> &str {
        &self.coll
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Options for automatic encryption.
///
/// # Example
///
/// ```
/// use fieldcrypt::kdf::generate_key_material;
/// use fieldcrypt::kms::KmsProviders;
/// use fieldcrypt::options::{AutoEncryptionOpts, Namespace};
///
/// let opts = AutoEncryptionOpts::new(
///     KmsProviders::new().with_local(generate_key_material()).unwrap(),
///     Namespace::parse("keyvault.datakeys").unwrap(),
/// )
/// .with_bypass_auto_encryption(true);
///
/// assert!(opts.bypass_auto_encryption());
/// ```
#[derive(Clone)]
pub struct AutoEncryptionOpts {
    kms_providers: KmsProviders,
    key_vault_namespace: Namespace,
    key_vault_client: Option<Arc<dyn CommandTransport>>,
    schema_map: Option<HashMap<String, Document>>,
    bypass_auto_encryption: bool,
    key_cache_ttl: Duration,
    crypt_helper: CryptHelperOptions,
}

impl AutoEncryptionOpts {
    /// Creates options with the given providers and key vault namespace.
    #[must_use]
    pub fn new(kms_providers: KmsProviders, key_vault_namespace: Namespace) -> Self {
        Self { kms_providers, key_vault_namespace, ..Self::default() }
    }

    /// Sets the connection used for key vault reads and writes.
    #[must_use]
    pub fn with_key_vault_client(mut self, client: Arc<dyn CommandTransport>) -> Self {
        self.key_vault_client = Some(client);
        self
    }

    /// Sets local schemas, keyed by `db.collection`; they take precedence over server schemas.
    #[must_use]
    pub fn with_schema_map(mut self, schema_map: HashMap<String, Document>) -> Self {
        self.schema_map = Some(schema_map);
        self
    }

    /// Disables encryption of outgoing commands; replies are still decrypted.
    #[must_use]
    pub const fn with_bypass_auto_encryption(mut self, bypass: bool) -> Self {
        self.bypass_auto_encryption = bypass;
        self
    }

    /// Sets how long resolved keys and schemas stay cached.
    #[must_use]
    pub const fn with_key_cache_ttl(mut self, ttl: Duration) -> Self {
        self.key_cache_ttl = ttl;
        self
    }

    /// Sets the crypt helper options.
    #[must_use]
    pub fn with_crypt_helper(mut self, crypt_helper: CryptHelperOptions) -> Self {
        self.crypt_helper = crypt_helper;
        self
    }

    /// Returns the KMS providers.
    #[must_use]
    pub const fn kms_providers(&self) -> &KmsProviders {
        &self.kms_providers
    }

    /// Returns the key vault namespace.
    #[must_use]
    pub const fn key_vault_namespace(&self) -> &Namespace {
        &self.key_vault_namespace
    }

    /// Returns the key vault connection, if one was set.
    #[must_use]
    pub fn key_vault_client(&self) -> Option<&Arc<dyn CommandTransport>> {
        self.key_vault_client.as_ref()
    }

    /// Returns the local schema map, if one was set.
    #[must_use]
    pub const fn schema_map(&self) -> Option<&HashMap<String, Document>> {
        self.schema_map.as_ref()
    }

    /// Whether outgoing commands skip encryption.
    #[must_use]
    pub const fn bypass_auto_encryption(&self) -> bool {
        self.bypass_auto_encryption
    }

    /// Returns the cache TTL.
    #[must_use]
    pub const fn key_cache_ttl(&self) -> Duration {
        self.key_cache_ttl
    }

    /// Returns the crypt helper options.
    #[must_use]
    pub const fn crypt_helper(&self) -> &CryptHelperOptions {
        &self.crypt_helper
    }
}

impl Default for AutoEncryptionOpts {
    fn default() -> Self {
        Self {
            kms_providers: KmsProviders::new(),
            key_vault_namespace: Namespace::new("admin", "datakeys"),
            key_vault_client: None,
            schema_map: None,
            bypass_auto_encryption: false,
            key_cache_ttl: DEFAULT_KEY_CACHE_TTL,
            crypt_helper: CryptHelperOptions::default(),
        }
    }
}

impl fmt::Debug for AutoEncryptionOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoEncryptionOpts")
            .field("kms_providers", &self.kms_providers)
            .field("key_vault_namespace", &self.key_vault_namespace)
            .field("key_vault_client", &self.key_vault_client.is_some())
            .field("schema_map", &self.schema_map.as_ref().map(HashMap::len))
            .field("bypass_auto_encryption", &self.bypass_auto_encryption)
            .field("key_cache_ttl", &self.key_cache_ttl)
            .field("crypt_helper", &self.crypt_helper)
            .finish()
    }
}

/// How an external lifecycle manager reaches or spawns the crypt helper process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptHelperOptions {
    uri: String,
    bypass_spawn: bool,
    spawn_path: String,
    spawn_args: Vec<String>,
}

impl CryptHelperOptions {
    /// Sets the helper address.
    #[must_use]
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    /// Assumes the helper is already running.
    #[must_use]
    pub const fn with_bypass_spawn(mut self, bypass: bool) -> Self {
        self.bypass_spawn = bypass;
        self
    }

    /// Sets the helper executable.
    #[must_use]
    pub fn with_spawn_path(mut self, path: impl Into<String>) -> Self {
        self.spawn_path = path.into();
        self
    }

    /// Sets extra helper arguments.
    #[must_use]
    pub fn with_spawn_args(mut self, args: Vec<String>) -> Self {
        self.spawn_args = args;
        self
    }

    /// Returns the helper address.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Whether spawning is skipped.
    #[must_use]
    pub const fn bypass_spawn(&self) -> bool {
        self.bypass_spawn
    }

    /// Returns the helper executable.
    #[must_use]
    pub fn spawn_path(&self) -> &str {
        &self.spawn_path
    }

    /// Returns the arguments to spawn the helper with, ending with the idle
    /// shutdown timeout unless the caller chose one.
    #[must_use]
    pub fn spawn_args(&self) -> Vec<String> {
        let mut args = self.spawn_args.clone();
        if !args.iter().any(|arg| arg.starts_with("--idleShutdownTimeoutSecs")) {
            args.push(IDLE_SHUTDOWN_ARG.to_string());
        }
        args
    }
}

impl Default for CryptHelperOptions {
    fn default() -> Self {
        let uri = if cfg!(unix) {
            "mongodb://%2Ftmp%2Fmongocryptd.sock"
        } else {
            "mongodb://localhost:27020"
        };
        Self {
            uri: uri.to_string(),
            bypass_spawn: false,
            spawn_path: "mongocryptd".to_string(),
            spawn_args: Vec::new(),
        }
    }
}

/// KMS provider credentials as read from a configuration file.
///
/// ```json
/// { "local": { "key": "<base64 96 bytes>" } }
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct KmsProvidersConfig {
    /// Local master key
    #[serde(default)]
    pub local: Option<LocalKmsConfig>,
    /// AWS credentials
    #[serde(default)]
    pub aws: Option<AwsKmsConfig>,
}

/// Local provider configuration.
#[derive(Debug, Deserialize)]
pub struct LocalKmsConfig {
    /// Base64 encoded 96-byte master key
    pub key: SecretString,
}

impl LocalKmsConfig {
    /// Decodes the master key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the key is not valid base64.
    pub fn master_key(&self) -> Result<SecretVec<u8>, Error> {
        base64::engine::general_purpose::STANDARD
            .decode(self.key.expose_secret().trim())
            .map(SecretVec::new)
            .map_err(|e| Error::Configuration(format!("local master key is not base64: {e}")))
    }
}

/// AWS provider configuration.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsKmsConfig {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: SecretString,
    /// Session token for temporary credentials
    #[serde(default)]
    pub session_token: Option<SecretString>,
}

impl KmsProvidersConfig {
    /// Builds the registry of providers this crate implements (`local`).
    ///
    /// Other providers must be registered by their own crates.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the local key is malformed.
    pub fn local_providers(&self) -> Result<KmsProviders, Error> {
        match &self.local {
            Some(local) => KmsProviders::new().with_local(local.master_key()?),
            None => Ok(KmsProviders::new()),
        }
    }
}
