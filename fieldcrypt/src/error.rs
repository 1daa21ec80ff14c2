//! Error types for `fieldcrypt` operations.

use std::fmt;

/// Boxed error used as the underlying cause of KMS failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Server error code reported when a client fails to authenticate.
pub const AUTHENTICATION_FAILED_CODE: i32 = 18;

/// Main error type for `fieldcrypt` operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid setup (unconfigured KMS provider, bad namespace, malformed schema)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No usable encryption schema could be obtained for a namespace
    #[error("schema resolution failed for {namespace}: {reason}")]
    SchemaResolutionFailed {
        /// Namespace (`db.collection`) being resolved
        namespace: String,
        /// What went wrong
        reason: String,
    },

    /// A key id or key alt name did not resolve to a data key
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// A value conflicts with the encryption schema
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// A value cannot be encrypted or decoded
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A KMS provider failed to wrap or unwrap key material
    #[error(transparent)]
    Kms(#[from] KmsError),

    /// A failure occurring while an encrypt or decrypt pass was running
    #[error("encryption error: {0}")]
    Encryption(#[source] Box<Error>),

    /// A key alt name is already used by another data key
    #[error("duplicate key alt name: {0}")]
    DuplicateAltName(String),

    /// The value handed to decrypt is not an encrypted value
    #[error("{0}")]
    InvalidEncryptedValue(String),

    /// Authentication tag verification failed (data may be corrupted or tampered)
    #[error("authentication failed: ciphertext may be corrupted or tampered")]
    AuthenticationFailed,

    /// Unsupported encrypted value format version
    #[error("unsupported version: {version} (supported: {supported})")]
    UnsupportedVersion {
        /// The version found in the ciphertext
        version: u8,
        /// Supported versions
        supported: String,
    },

    /// The database or key vault replied with an error
    #[error(transparent)]
    Server(#[from] ServerError),

    /// BSON serialization or deserialization failed
    #[error("BSON error: {0}")]
    Bson(String),
}

impl Error {
    /// Wraps `self` as the cause of an [`Error::Encryption`].
    ///
    /// Configuration errors and errors that are already wrapped are returned unchanged.
    #[must_use]
    pub fn into_encryption_error(self) -> Self {
        match self {
            Self::Encryption(_) | Self::Configuration(_) => self,
            other => Self::Encryption(Box::new(other)),
        }
    }

    /// Returns the innermost cause, looking through [`Error::Encryption`] wrappers.
    #[must_use]
    pub fn root(&self) -> &Self {
        let mut current = self;
        while let Self::Encryption(cause) = current {
            current = cause;
        }
        current
    }

    /// Whether retrying the whole operation may succeed without any change.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self.root() {
            Self::Kms(err) => err.is_transient(),
            Self::Server(err) => err.is_network(),
            _ => false,
        }
    }
}

impl From<bson::ser::Error> for Error {
    fn from(err: bson::ser::Error) -> Self {
        Self::Bson(err.to_string())
    }
}

impl From<bson::de::Error> for Error {
    fn from(err: bson::de::Error) -> Self {
        Self::Bson(err.to_string())
    }
}

/// Error reply returned by a database or key vault connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("server error {code}: {message}")]
pub struct ServerError {
    /// Numeric server error code
    pub code: i32,
    /// Server supplied message
    pub message: String,
    /// The failure happened on the network rather than on the server
    pub network: bool,
}

impl ServerError {
    /// Creates an error reply with the given code.
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), network: false }
    }

    /// Creates a network failure (connection refused, reset, timed out).
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self { code: 0, message: message.into(), network: true }
    }

    /// Whether the server rejected the client's credentials.
    #[must_use]
    pub const fn is_authentication_failure(&self) -> bool {
        self.code == AUTHENTICATION_FAILED_CODE
    }

    /// Whether this is a network class failure.
    #[must_use]
    pub const fn is_network(&self) -> bool {
        self.network
    }
}

/// Classification of KMS failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmsErrorKind {
    /// Connection could not be established or was interrupted
    Network,
    /// The request did not complete in time
    Timeout,
    /// The service reported itself temporarily unavailable or throttled
    Unavailable,
    /// Credentials were missing, invalid or not authorized
    Authentication,
    /// The master key descriptor is missing fields or names the wrong provider
    MalformedDescriptor,
    /// The service refused the request (bad ciphertext, unknown key, ...)
    Rejected,
}

impl KmsErrorKind {
    /// Whether failures of this kind may succeed when retried.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::Unavailable)
    }
}

impl fmt::Display for KmsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network failure",
            Self::Timeout => "timeout",
            Self::Unavailable => "service unavailable",
            Self::Authentication => "authentication failure",
            Self::MalformedDescriptor => "malformed master key",
            Self::Rejected => "request rejected",
        };
        f.write_str(name)
    }
}

/// Errors raised by KMS providers.
#[derive(Debug)]
pub struct KmsError {
    provider: String,
    kind: KmsErrorKind,
    message: String,
    source: Option<BoxError>,
}

impl KmsError {
    /// Creates a new KMS error.
    #[must_use]
    pub fn new(provider: impl Into<String>, kind: KmsErrorKind, message: impl Into<String>) -> Self {
        Self { provider: provider.into(), kind, message: message.into(), source: None }
    }

    /// Attaches the underlying transport or service error.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Name of the provider that failed.
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Failure classification.
    #[must_use]
    pub const fn kind(&self) -> KmsErrorKind {
        self.kind
    }

    /// Human readable detail.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the failure is transient (network, timeout, throttling).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl fmt::Display for KmsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KMS error ({}, {}): {}", self.provider, self.kind, self.message)
    }
}

impl std::error::Error for KmsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|err| err as &(dyn std::error::Error + 'static))
    }
}
