//! # `fieldcrypt`
//!
//! Client-side field-level encryption for document databases.
//!
//! Fields named by a collection's encryption schema are encrypted before a
//! command leaves the process and decrypted when replies come back, so the
//! server only ever stores ciphertext.
//!
//! ## Features
//!
//! - Automatic encryption of `insert`, `update`, `delete`, `find`,
//!   `aggregate`, `distinct`, `count` and `findAndModify` commands
//! - Transparent decryption of replies, `getMore` batches included
//! - Deterministic encryption for equality queries, randomized otherwise
//! - Envelope encryption: data keys stored wrapped by a KMS master key
//! - Pluggable KMS providers, key vault backends and schema sources
//!
//! ## Example
//!
//! ```rust,ignore
//! use fieldcrypt::prelude::*;
//!
//! let kms = KmsProviders::new().with_local(master_key)?;
//! let opts = AutoEncryptionOpts::new(kms, Namespace::parse("admin.datakeys")?)
//!     .with_schema_map(schema_map);
//! let client = AutoEncryptingClient::new(driver, &opts)?;
//!
//! client.run_command("db", doc! { "insert": "people", "documents": [ { "ssn": "000" } ] }).await?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod cipher;
pub mod context;
pub mod crypt;
pub mod engine;
pub mod error;
pub mod explicit;
pub mod filter;
pub mod interceptor;
pub mod kdf;
pub mod key_vault;
pub mod kms;
pub mod marking;
pub mod options;
pub mod schema;
pub mod value;

pub use error::{Error, KmsError, KmsErrorKind, ServerError};

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::context::{CryptoContext, State};
    pub use crate::crypt::{CryptBackend, InProcessCrypt};
    pub use crate::engine::CryptEngine;
    pub use crate::error::{Error, KmsError, KmsErrorKind, ServerError};
    pub use crate::explicit::{ClientEncryption, EncryptKey};
    pub use crate::interceptor::{AutoEncryptingClient, CommandTransport};
    pub use crate::key_vault::{DataKey, KeyRef, KeyVaultBackend, KeyVaultStore};
    pub use crate::kms::{KmsProvider, KmsProviders, LocalKmsProvider, MasterKey};
    pub use crate::options::{AutoEncryptionOpts, CryptHelperOptions, Namespace};
    pub use crate::schema::{EncryptionSchema, SchemaProvider};
    pub use crate::value::{Algorithm, EncryptedValue};
}
