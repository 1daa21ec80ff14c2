//! Field value encryption under a data key.
//!
//! The plaintext is the BSON encoding of `{v: value}`, so the original type
//! travels inside the ciphertext and decryption is type preserving. The
//! encrypted value header (`version | key id | algorithm`) is bound as
//! associated data.
//!
//! # Nonces
//!
//! - **Deterministic**: `HMAC-SHA256(nonce_key, header || plaintext)[..12]`, so
//!   the same key and plaintext always produce byte-identical output. This
//!   reveals equality and should only be used for fields queried by equality.
//! - **Random**: 12 bytes from the OS RNG on every call.

use bson::{doc, Bson, Document, Uuid};
use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::Error;
use crate::kdf::{derive_subkey, KeyPurpose, DATA_KEY_SIZE, SUBKEY_SIZE};
use crate::value::{header_bytes, Algorithm, EncryptedValue};

type HmacSha256 = Hmac<Sha256>;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Field name wrapping the value inside the plaintext document.
const VALUE_FIELD: &str = "v";

/// Encrypts and decrypts field values with one data key.
///
/// # Example
///
/// ```
/// use bson::{Bson, Uuid};
/// use fieldcrypt::cipher::FieldCipher;
/// use fieldcrypt::kdf::generate_key_material;
/// use fieldcrypt::value::Algorithm;
///
/// let cipher = FieldCipher::new(&generate_key_material()).unwrap();
/// let key_id = Uuid::new();
///
/// let value = Bson::String("000".to_string());
/// let encrypted = cipher.encrypt(key_id, Algorithm::Deterministic, &value).unwrap();
/// assert_eq!(cipher.decrypt(&encrypted).unwrap(), value);
/// ```
pub struct FieldCipher {
    aead_key: Zeroizing<[u8; SUBKEY_SIZE]>,
    nonce_key: Zeroizing<[u8; SUBKEY_SIZE]>,
}

impl FieldCipher {
    /// Creates a cipher from decrypted data key material.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encoding` if the material is not 96 bytes long.
    pub fn new(material: &SecretVec<u8>) -> Result<Self, Error> {
        let len = material.expose_secret().len();
        if len != DATA_KEY_SIZE {
            return Err(Error::Encoding(format!(
                "invalid data key length: {len} bytes (expected: {DATA_KEY_SIZE})"
            )));
        }

        Ok(Self {
            aead_key: derive_subkey(material, KeyPurpose::FieldCipher)?,
            nonce_key: derive_subkey(material, KeyPurpose::FieldNonce)?,
        })
    }

    /// Encrypts a value under `key_id`.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized or the AEAD fails.
    pub fn encrypt(
        &self,
        key_id: Uuid,
        algorithm: Algorithm,
        value: &Bson,
    ) -> Result<EncryptedValue, Error> {
        let plaintext = Zeroizing::new(bson::to_vec(&doc! { VALUE_FIELD: value.clone() })?);
        let header = header_bytes(key_id, algorithm);

        let nonce_bytes = match algorithm {
            Algorithm::Deterministic => self.derive_nonce(&header, &plaintext)?,
            Algorithm::Random => {
                let mut nonce = [0u8; NONCE_SIZE];
                OsRng.fill_bytes(&mut nonce);
                nonce
            }
        };

        let cipher = ChaCha20Poly1305::new_from_slice(self.aead_key.as_slice())
            .map_err(|e| Error::Encoding(format!("invalid field key: {e}")))?;
        let sealed = cipher
            .encrypt(&Nonce::from(nonce_bytes), Payload { msg: &plaintext, aad: &header })
            .map_err(|e| Error::Encoding(format!("ChaCha20-Poly1305 encryption failed: {e}")))?;

        let mut ciphertext = Vec::with_capacity(NONCE_SIZE + sealed.len());
        ciphertext.extend_from_slice(&nonce_bytes);
        ciphertext.extend_from_slice(&sealed);

        Ok(EncryptedValue::new(key_id, algorithm, ciphertext))
    }

    /// Decrypts a value, restoring its original BSON type.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The ciphertext is shorter than a nonce
    /// - Authentication fails (wrong key, corrupted or tampered data)
    /// - The plaintext is not a valid wrapped value
    pub fn decrypt(&self, value: &EncryptedValue) -> Result<Bson, Error> {
        let ciphertext = value.ciphertext();
        if ciphertext.len() < NONCE_SIZE {
            return Err(Error::Encoding("ciphertext shorter than nonce".to_string()));
        }
        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_SIZE);
        let header = value.header();

        let cipher = ChaCha20Poly1305::new_from_slice(self.aead_key.as_slice())
            .map_err(|e| Error::Encoding(format!("invalid field key: {e}")))?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce_bytes), Payload { msg: sealed, aad: &header })
                .map_err(|_| Error::AuthenticationFailed)?,
        );

        let mut wrapper: Document = bson::from_slice(&plaintext)?;
        wrapper
            .remove(VALUE_FIELD)
            .ok_or_else(|| Error::Encoding("decrypted payload has no value".to_string()))
    }

    fn derive_nonce(&self, header: &[u8], plaintext: &[u8]) -> Result<[u8; NONCE_SIZE], Error> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.nonce_key.as_slice())
            .map_err(|e| Error::Encoding(format!("invalid nonce key: {e}")))?;
        mac.update(header);
        mac.update(plaintext);
        let digest = mac.finalize().into_bytes();

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&digest[..NONCE_SIZE]);
        Ok(nonce)
    }
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}
