//! Local KMS provider backed by a static master key.

use async_trait::async_trait;
use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use secrecy::{ExposeSecret, SecretVec};
use zeroize::Zeroizing;

use super::{KmsProvider, MasterKey, LOCAL_PROVIDER};
use crate::cipher::NONCE_SIZE;
use crate::error::{Error, KmsError, KmsErrorKind};
use crate::kdf::{derive_subkey, KeyPurpose, DATA_KEY_SIZE, SUBKEY_SIZE};

/// KMS provider that wraps key material with a master key held in memory.
///
/// Wrapped material is `nonce || ChaCha20-Poly1305(material)`, encrypted under
/// a key derived from the master key with HKDF.
///
/// # Example
///
/// ```
/// use fieldcrypt::kdf::generate_key_material;
/// use fieldcrypt::kms::{KmsProvider, LocalKmsProvider, MasterKey};
/// use secrecy::ExposeSecret;
///
/// # tokio_test_block(async {
/// let provider = LocalKmsProvider::new(generate_key_material()).unwrap();
/// let material = generate_key_material();
///
/// let wrapped = provider.encrypt_key_material(&MasterKey::Local, &material).await.unwrap();
/// let unwrapped = provider.decrypt_key_material(&MasterKey::Local, &wrapped).await.unwrap();
/// assert_eq!(unwrapped.expose_secret(), material.expose_secret());
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
pub struct LocalKmsProvider {
    wrap_key: Zeroizing<[u8; SUBKEY_SIZE]>,
}

impl LocalKmsProvider {
    /// Creates a provider from a 96-byte master key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the master key is not 96 bytes long.
    pub fn new(master_key: SecretVec<u8>) -> Result<Self, Error> {
        let len = master_key.expose_secret().len();
        if len != DATA_KEY_SIZE {
            return Err(Error::Configuration(format!(
                "local master key must be {DATA_KEY_SIZE} bytes, got {len}"
            )));
        }

        Ok(Self { wrap_key: derive_subkey(&master_key, KeyPurpose::LocalWrap)? })
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, KmsError> {
        ChaCha20Poly1305::new_from_slice(self.wrap_key.as_slice()).map_err(|e| {
            KmsError::new(LOCAL_PROVIDER, KmsErrorKind::Rejected, format!("invalid wrap key: {e}"))
        })
    }
}

fn check_descriptor(master_key: &MasterKey) -> Result<(), KmsError> {
    match master_key {
        MasterKey::Local => Ok(()),
        other => Err(KmsError::new(
            LOCAL_PROVIDER,
            KmsErrorKind::MalformedDescriptor,
            format!("master key belongs to provider '{}'", other.provider()),
        )),
    }
}

#[async_trait]
impl KmsProvider for LocalKmsProvider {
    fn name(&self) -> &str {
        LOCAL_PROVIDER
    }

    fn default_master_key(&self) -> Result<MasterKey, Error> {
        Ok(MasterKey::Local)
    }

    async fn encrypt_key_material(
        &self,
        master_key: &MasterKey,
        material: &SecretVec<u8>,
    ) -> Result<Vec<u8>, KmsError> {
        check_descriptor(master_key)?;

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let sealed = self
            .cipher()?
            .encrypt(&Nonce::from(nonce), material.expose_secret().as_slice())
            .map_err(|e| {
                KmsError::new(LOCAL_PROVIDER, KmsErrorKind::Rejected, format!("wrap failed: {e}"))
            })?;

        let mut wrapped = Vec::with_capacity(NONCE_SIZE + sealed.len());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&sealed);
        Ok(wrapped)
    }

    async fn decrypt_key_material(
        &self,
        master_key: &MasterKey,
        wrapped: &[u8],
    ) -> Result<SecretVec<u8>, KmsError> {
        check_descriptor(master_key)?;

        if wrapped.len() < NONCE_SIZE {
            return Err(KmsError::new(
                LOCAL_PROVIDER,
                KmsErrorKind::Rejected,
                "wrapped key material is truncated",
            ));
        }
        let (nonce, sealed) = wrapped.split_at(NONCE_SIZE);

        let material = self.cipher()?.decrypt(Nonce::from_slice(nonce), sealed).map_err(|_| {
            KmsError::new(
                LOCAL_PROVIDER,
                KmsErrorKind::Rejected,
                "key material was not wrapped by this master key",
            )
        })?;

        Ok(SecretVec::new(material))
    }
}

impl std::fmt::Debug for LocalKmsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKmsProvider").field("wrap_key", &"[REDACTED]").finish()
    }
}
