//! Key generation and sub-key derivation using HKDF (HMAC-based Key Derivation Function).
//!
//! Data keys and local master keys are 96 bytes of random material. The field
//! cipher and the local KMS provider never use that material directly: they
//! derive purpose-bound 32-byte sub-keys with HKDF-SHA256.

use crate::error::Error;
use chacha20poly1305::aead::{rand_core::RngCore, OsRng};
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Size of data key material and local master keys in bytes.
pub const DATA_KEY_SIZE: usize = 96;

/// Size of derived sub-keys in bytes (256 bits).
pub const SUBKEY_SIZE: usize = 32;

/// Purpose of a derived sub-key, used as the HKDF `info` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    /// AEAD key for field values
    FieldCipher,
    /// MAC key for deterministic nonce derivation
    FieldNonce,
    /// Wrapping key of the local KMS provider
    LocalWrap,
}

impl KeyPurpose {
    /// Returns the domain separation label.
    #[must_use]
    pub const fn label(self) -> &'static [u8] {
        match self {
            Self::FieldCipher => b"fieldcrypt|field|aead",
            Self::FieldNonce => b"fieldcrypt|field|nonce",
            Self::LocalWrap => b"fieldcrypt|kms|local",
        }
    }
}

/// Derives a 32-byte sub-key for `purpose` from key material.
///
/// # Errors
///
/// Returns `Error::Configuration` if the material is empty.
///
/// # Example
///
/// ```
/// use fieldcrypt::kdf::{derive_subkey, KeyPurpose, DATA_KEY_SIZE};
/// use secrecy::SecretVec;
///
/// let material = SecretVec::new(vec![0u8; DATA_KEY_SIZE]);
/// let key = derive_subkey(&material, KeyPurpose::FieldCipher).expect("derivation failed");
/// assert_eq!(key.len(), 32);
/// ```
pub fn derive_subkey(
    material: &SecretVec<u8>,
    purpose: KeyPurpose,
) -> Result<Zeroizing<[u8; SUBKEY_SIZE]>, Error> {
    if material.expose_secret().is_empty() {
        return Err(Error::Configuration("cannot derive keys from empty material".to_string()));
    }

    let hkdf = Hkdf::<Sha256>::new(None, material.expose_secret());
    let mut key = Zeroizing::new([0u8; SUBKEY_SIZE]);
    hkdf.expand(purpose.label(), key.as_mut_slice())
        .map_err(|_| Error::Configuration("HKDF expansion failed".to_string()))?;

    Ok(key)
}

/// Generates fresh random data key material.
///
/// # Example
///
/// ```
/// use fieldcrypt::kdf::generate_key_material;
/// use secrecy::ExposeSecret;
///
/// let material = generate_key_material();
/// assert_eq!(material.expose_secret().len(), 96);
/// ```
#[must_use]
pub fn generate_key_material() -> SecretVec<u8> {
    let mut material = vec![0u8; DATA_KEY_SIZE];
    OsRng.fill_bytes(&mut material);
    SecretVec::new(material)
}
