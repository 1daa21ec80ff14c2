//! Wire format for encrypted field values.
//!
//! An encrypted value travels as a BSON binary of subtype 6 whose payload is:
//!
//! ```text
//! [version:1][key_id:16][algorithm:1][ciphertext:N]
//! ```
//!
//! Subtype 6 binaries starting with a zero byte are intent-to-encrypt
//! placeholders produced by the marking pass, not encrypted values.

use std::fmt;
use std::str::FromStr;

use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Uuid};

use crate::error::Error;

/// Format version for encrypted values.
pub const FORMAT_VERSION: u8 = 1;

/// Leading byte of intent-to-encrypt placeholders.
pub const PLACEHOLDER_MARKER: u8 = 0;

/// Length of the header preceding the ciphertext.
pub const HEADER_SIZE: usize = 1 + 16 + 1;

/// Encryption algorithm applied to a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Same key and plaintext always produce the same ciphertext.
    Deterministic,
    /// Every encryption draws a fresh nonce.
    Random,
}

impl Algorithm {
    /// Returns the wire identifier.
    #[must_use]
    pub const fn id(self) -> u8 {
        match self {
            Self::Deterministic => 1,
            Self::Random => 2,
        }
    }

    /// Parses a wire identifier.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encoding` for unknown identifiers.
    pub fn from_id(id: u8) -> Result<Self, Error> {
        match id {
            1 => Ok(Self::Deterministic),
            2 => Ok(Self::Random),
            other => Err(Error::Encoding(format!("unknown algorithm id: {other}"))),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deterministic => f.write_str("Deterministic"),
            Self::Random => f.write_str("Random"),
        }
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.rsplit('-').next().unwrap_or(s);
        if name.eq_ignore_ascii_case("deterministic") {
            Ok(Self::Deterministic)
        } else if name.eq_ignore_ascii_case("random") {
            Ok(Self::Random)
        } else {
            Err(Error::Configuration(format!("unknown encryption algorithm: {s}")))
        }
    }
}

/// A value encrypted under a data key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedValue {
    key_id: Uuid,
    algorithm: Algorithm,
    ciphertext: Vec<u8>,
}

impl EncryptedValue {
    /// Creates an encrypted value from its parts.
    #[must_use]
    pub const fn new(key_id: Uuid, algorithm: Algorithm, ciphertext: Vec<u8>) -> Self {
        Self { key_id, algorithm, ciphertext }
    }

    /// Returns the id of the data key used for encryption.
    #[must_use]
    pub const fn key_id(&self) -> Uuid {
        self.key_id
    }

    /// Returns the algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Returns the ciphertext (nonce followed by AEAD output).
    #[must_use]
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Returns the header bytes, which are also bound as associated data.
    #[must_use]
    pub fn header(&self) -> [u8; HEADER_SIZE] {
        header_bytes(self.key_id, self.algorithm)
    }

    /// Serializes the value to its wire payload.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(&self.header());
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Parses a wire payload.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The payload is shorter than the header
    /// - The version is not supported
    /// - The algorithm id is unknown
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Encoding(format!(
                "encrypted value truncated: {} bytes (min: {HEADER_SIZE})",
                data.len()
            )));
        }

        let version = data[0];
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion {
                version,
                supported: FORMAT_VERSION.to_string(),
            });
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&data[1..17]);
        let algorithm = Algorithm::from_id(data[17])?;

        Ok(Self { key_id: Uuid::from_bytes(id), algorithm, ciphertext: data[HEADER_SIZE..].to_vec() })
    }

    /// Wraps the value in a subtype 6 binary.
    #[must_use]
    pub fn to_binary(&self) -> Binary {
        Binary { subtype: BinarySubtype::Encrypted, bytes: self.to_bytes() }
    }

    /// Parses a subtype 6 binary.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidEncryptedValue` if the binary has another subtype
    /// or is a placeholder, and the errors of [`EncryptedValue::from_bytes`] otherwise.
    pub fn from_binary(binary: &Binary) -> Result<Self, Error> {
        if !is_encrypted_binary(binary) {
            return Err(Error::InvalidEncryptedValue(
                "value to decrypt must be a Binary with subtype 6".to_string(),
            ));
        }
        Self::from_bytes(&binary.bytes)
    }
}

impl From<EncryptedValue> for Bson {
    fn from(value: EncryptedValue) -> Self {
        Self::Binary(value.to_binary())
    }
}

/// Builds the header for a key and algorithm.
#[must_use]
pub fn header_bytes(key_id: Uuid, algorithm: Algorithm) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0] = FORMAT_VERSION;
    header[1..17].copy_from_slice(&key_id.bytes());
    header[17] = algorithm.id();
    header
}

/// Whether a binary holds an encrypted value (subtype 6, not a placeholder).
#[must_use]
pub fn is_encrypted_binary(binary: &Binary) -> bool {
    binary.subtype == BinarySubtype::Encrypted
        && binary.bytes.first().is_some_and(|b| *b != PLACEHOLDER_MARKER)
}

/// Whether a binary is an intent-to-encrypt placeholder.
#[must_use]
pub fn is_placeholder_binary(binary: &Binary) -> bool {
    binary.subtype == BinarySubtype::Encrypted && binary.bytes.first() == Some(&PLACEHOLDER_MARKER)
}

/// Returns the schema spelling (`bsonType`) of a value's type.
#[must_use]
pub fn bson_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Array(_) => "array",
        Bson::Document(_) => "object",
        Bson::Boolean(_) => "bool",
        Bson::Null => "null",
        Bson::RegularExpression(_) => "regex",
        Bson::JavaScriptCode(_) => "javascript",
        Bson::JavaScriptCodeWithScope(_) => "javascriptWithScope",
        Bson::Int32(_) => "int",
        Bson::Int64(_) => "long",
        Bson::Timestamp(_) => "timestamp",
        Bson::Binary(_) => "binData",
        Bson::ObjectId(_) => "objectId",
        Bson::DateTime(_) => "date",
        Bson::Symbol(_) => "symbol",
        Bson::Decimal128(_) => "decimal",
        Bson::Undefined => "undefined",
        Bson::MaxKey => "maxKey",
        Bson::MinKey => "minKey",
        Bson::DbPointer(_) => "dbPointer",
    }
}

/// Checks that a value may be encrypted with the given algorithm.
///
/// # Errors
///
/// - `Error::SchemaViolation` if the value is already an encrypted value
/// - `Error::Encoding` if the type cannot be encrypted at all, or not with
///   the deterministic algorithm
pub fn check_encryptable(value: &Bson, algorithm: Algorithm) -> Result<(), Error> {
    if let Bson::Binary(binary) = value {
        if binary.subtype == BinarySubtype::Encrypted {
            return Err(Error::SchemaViolation(
                "cannot encrypt a value that is already encrypted".to_string(),
            ));
        }
    }

    let type_name = bson_type_name(value);
    match value {
        Bson::Null | Bson::Undefined | Bson::MinKey | Bson::MaxKey | Bson::Symbol(_) | Bson::DbPointer(_) => {
            Err(Error::Encoding(format!("cannot encrypt element of type {type_name}")))
        }
        Bson::Double(_)
        | Bson::Decimal128(_)
        | Bson::Boolean(_)
        | Bson::Document(_)
        | Bson::Array(_)
        | Bson::JavaScriptCodeWithScope(_)
            if algorithm == Algorithm::Deterministic =>
        {
            Err(Error::Encoding(format!(
                "cannot deterministically encrypt element of type {type_name}"
            )))
        }
        _ => Ok(()),
    }
}
