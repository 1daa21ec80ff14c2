//! AWS KMS provider for `fieldcrypt`.
//!
//! Wraps and unwraps data key material with the AWS KMS `Encrypt` and
//! `Decrypt` APIs. The KMS key, region and optional endpoint come from each
//! data key's `masterKey` descriptor:
//!
//! ```json
//! { "provider": "aws", "region": "us-east-1", "key": "arn:aws:kms:...", "endpoint": "kms.us-east-1.amazonaws.com" }
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fieldcrypt::prelude::*;
//! use fieldcrypt_kms_aws::AwsKmsProvider;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Credentials from the default AWS chain
//! let provider = AwsKmsProvider::from_env().await;
//! let kms = KmsProviders::new().with_provider(Arc::new(provider));
//! # Ok(())
//! # }
//! ```
//!
//! # AWS Configuration
//!
//! [`AwsKmsProvider::from_env`] uses the AWS SDK's default credential chain:
//! - Environment variables (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`)
//! - AWS credentials file (`~/.aws/credentials`)
//! - IAM instance profile (for EC2)
//! - ECS task role
//! - Web identity token (for EKS)
//!
//! [`AwsKmsProvider::with_credentials`] uses static credentials, as found in
//! the `aws` section of a KMS providers configuration file.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_kms::config::{Credentials, Region};
use aws_sdk_kms::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::Client as KmsClient;
use fieldcrypt::kms::{KmsProvider, MasterKey, AWS_PROVIDER};
use fieldcrypt::options::AwsKmsConfig;
use fieldcrypt::{KmsError, KmsErrorKind};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretVec};
use thiserror::Error;

/// Error codes meaning the caller's credentials were refused.
const AUTHENTICATION_CODES: &[&str] = &[
    "UnrecognizedClientException",
    "AccessDeniedException",
    "InvalidSignatureException",
    "IncompleteSignature",
    "MissingAuthenticationToken",
    "ExpiredTokenException",
];

/// Error codes of temporary service conditions.
const UNAVAILABLE_CODES: &[&str] =
    &["ThrottlingException", "KMSInternalException", "KeyUnavailableException", "ServiceUnavailable"];

/// Errors specific to AWS KMS requests.
#[derive(Debug, Error)]
pub enum AwsKmsError {
    /// The data key's master key is not an AWS descriptor
    #[error("master key of provider '{0}' cannot be used with AWS KMS")]
    WrongProvider(String),

    /// A successful response lacked its payload
    #[error("KMS response has no {0}")]
    MissingOutput(&'static str),
}

impl From<AwsKmsError> for KmsError {
    fn from(err: AwsKmsError) -> Self {
        let kind = match err {
            AwsKmsError::WrongProvider(_) => KmsErrorKind::MalformedDescriptor,
            AwsKmsError::MissingOutput(_) => KmsErrorKind::Rejected,
        };
        Self::new(AWS_PROVIDER, kind, err.to_string())
    }
}

type ClientKey = (String, Option<String>);

/// AWS KMS provider.
///
/// One SDK client is kept per (region, endpoint) pair.
pub struct AwsKmsProvider {
    config: SdkConfig,
    credentials: Option<Credentials>,
    clients: Mutex<HashMap<ClientKey, KmsClient>>,
}

impl AwsKmsProvider {
    /// Creates a provider using the default AWS credential chain.
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Self { config, credentials: None, clients: Mutex::new(HashMap::new()) }
    }

    /// Creates a provider using static credentials.
    #[must_use]
    pub fn with_credentials(credentials: &AwsKmsConfig) -> Self {
        let credentials = Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.expose_secret().clone(),
            credentials.session_token.as_ref().map(|token| token.expose_secret().clone()),
            None,
            "fieldcrypt",
        );
        let config = SdkConfig::builder().behavior_version(BehaviorVersion::latest()).build();
        Self { config, credentials: Some(credentials), clients: Mutex::new(HashMap::new()) }
    }

    /// Number of SDK clients created so far.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    fn client(&self, region: &str, endpoint: Option<&str>) -> KmsClient {
        let key = (region.to_string(), endpoint.map(str::to_string));
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&key) {
            return client.clone();
        }

        let mut builder = aws_sdk_kms::config::Builder::from(&self.config).region(Region::new(region.to_string()));
        if let Some(credentials) = &self.credentials {
            builder = builder.credentials_provider(credentials.clone());
        }
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint_url(endpoint));
        }

        tracing::debug!(region, endpoint, "creating AWS KMS client");
        let client = KmsClient::from_conf(builder.build());
        clients.insert(key, client.clone());
        client
    }
}

impl std::fmt::Debug for AwsKmsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsKmsProvider")
            .field("static_credentials", &self.credentials.is_some())
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

/// Unpacks an AWS descriptor.
fn descriptor(master_key: &MasterKey) -> Result<(&str, &str, Option<&str>), AwsKmsError> {
    match master_key {
        MasterKey::Aws { region, key, endpoint } => Ok((region, key, endpoint.as_deref())),
        other => Err(AwsKmsError::WrongProvider(other.provider().to_string())),
    }
}

/// Endpoints may be given as a bare host; the SDK wants a URL.
fn endpoint_url(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}

fn classify_code(code: Option<&str>) -> KmsErrorKind {
    match code {
        Some(code) if AUTHENTICATION_CODES.contains(&code) => KmsErrorKind::Authentication,
        Some("DependencyTimeoutException") => KmsErrorKind::Timeout,
        Some(code) if UNAVAILABLE_CODES.contains(&code) => KmsErrorKind::Unavailable,
        _ => KmsErrorKind::Rejected,
    }
}

fn classify<E, R>(err: &SdkError<E, R>) -> KmsErrorKind
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::TimeoutError(_) => KmsErrorKind::Timeout,
        SdkError::DispatchFailure(failure) if failure.is_timeout() => KmsErrorKind::Timeout,
        SdkError::DispatchFailure(_) => KmsErrorKind::Network,
        SdkError::ServiceError(context) => classify_code(context.err().code()),
        _ => KmsErrorKind::Rejected,
    }
}

fn kms_error<E, R>(operation: &str, err: SdkError<E, R>) -> KmsError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let kind = classify(&err);
    tracing::debug!(operation, %kind, "AWS KMS request failed");
    KmsError::new(AWS_PROVIDER, kind, format!("KMS {operation} failed")).with_source(err)
}

#[async_trait]
impl KmsProvider for AwsKmsProvider {
    fn name(&self) -> &str {
        AWS_PROVIDER
    }

    async fn encrypt_key_material(
        &self,
        master_key: &MasterKey,
        material: &SecretVec<u8>,
    ) -> Result<Vec<u8>, KmsError> {
        let (region, key, endpoint) = descriptor(master_key)?;
        let response = self
            .client(region, endpoint)
            .encrypt()
            .key_id(key)
            .plaintext(Blob::new(material.expose_secret().clone()))
            .send()
            .await
            .map_err(|e| kms_error("encrypt", e))?;

        let ciphertext = response.ciphertext_blob().ok_or(AwsKmsError::MissingOutput("ciphertext"))?;
        Ok(ciphertext.as_ref().to_vec())
    }

    async fn decrypt_key_material(
        &self,
        master_key: &MasterKey,
        wrapped: &[u8],
    ) -> Result<SecretVec<u8>, KmsError> {
        let (region, key, endpoint) = descriptor(master_key)?;
        let response = self
            .client(region, endpoint)
            .decrypt()
            .key_id(key)
            .ciphertext_blob(Blob::new(wrapped.to_vec()))
            .send()
            .await
            .map_err(|e| kms_error("decrypt", e))?;

        let plaintext = response.plaintext().ok_or(AwsKmsError::MissingOutput("plaintext"))?;
        Ok(SecretVec::new(plaintext.as_ref().to_vec()))
    }
}
