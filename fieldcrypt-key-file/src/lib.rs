//! Directory-backed key vault for `fieldcrypt`.
//!
//! Each data key is stored as one BSON document in its own file, suitable
//! for development, testing and command line use:
//!
//! ```text
//! keys/
//! ├── 0f6e4b1c9a2d4e8f8a1b2c3d4e5f6a7b.key   (0600 permissions)
//! └── 5a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d.key
//! ```
//!
//! The stored key material is wrapped by its KMS master key, exactly as in a
//! key vault collection.

#![warn(clippy::pedantic, clippy::nursery)]

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bson::{Bson, Document, Uuid};
use fieldcrypt::filter;
use fieldcrypt::key_vault::{uuid_from_binary, KeyVaultBackend};
use fieldcrypt::Error;

/// File extension of stored keys.
const KEY_EXTENSION: &str = "key";

/// Key vault storing one file per data key.
#[derive(Debug, Clone)]
pub struct FileKeyVault {
    key_dir: PathBuf,
}

impl FileKeyVault {
    /// Opens an existing key directory.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the directory does not exist.
    pub fn new(key_dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let key_dir = key_dir.into();
        if !key_dir.is_dir() {
            return Err(Error::Configuration(format!(
                "key directory does not exist: {}",
                key_dir.display()
            )));
        }
        Ok(Self { key_dir })
    }

    /// Creates the key directory if needed and opens it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the directory cannot be created.
    pub fn init(key_dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let key_dir = key_dir.into();
        std::fs::create_dir_all(&key_dir).map_err(|e| io_error(&key_dir, &e))?;
        Self::new(key_dir)
    }

    /// Returns the key directory.
    #[must_use]
    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    /// Returns the file holding key `id`.
    #[must_use]
    pub fn key_path(&self, id: Uuid) -> PathBuf {
        self.key_dir.join(format!("{}.{KEY_EXTENSION}", hex::encode(id.bytes())))
    }

    async fn load_all(&self) -> Result<Vec<Document>, Error> {
        let mut entries = tokio::fs::read_dir(&self.key_dir).await.map_err(|e| io_error(&self.key_dir, &e))?;

        let mut documents = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&self.key_dir, &e))? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(KEY_EXTENSION) {
                continue;
            }
            let bytes = tokio::fs::read(&path).await.map_err(|e| io_error(&path, &e))?;
            let document = Document::from_reader(bytes.as_slice())
                .map_err(|e| Error::Encoding(format!("{} is not a key document: {e}", path.display())))?;
            documents.push(document);
        }
        Ok(documents)
    }

    async fn write(&self, path: &Path, document: &Document) -> Result<(), Error> {
        let mut bytes = Vec::new();
        document.to_writer(&mut bytes)?;
        tokio::fs::write(path, bytes).await.map_err(|e| io_error(path, &e))?;
        restrict_permissions(path).await
    }
}

fn io_error(path: &Path, err: &std::io::Error) -> Error {
    Error::Configuration(format!("{}: {err}", path.display()))
}

fn document_id(document: &Document) -> Result<Uuid, Error> {
    match document.get("_id") {
        Some(Bson::Binary(binary)) => {
            uuid_from_binary(binary).ok_or_else(|| Error::Encoding("key _id is not a UUID".to_string()))
        }
        _ => Err(Error::Encoding("key document has no _id".to_string())),
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| io_error(path, &e))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), Error> {
    Ok(())
}

#[async_trait]
impl KeyVaultBackend for FileKeyVault {
    async fn find(&self, filter: Document) -> Result<Vec<Document>, Error> {
        let documents = self.load_all().await?;
        Ok(documents.into_iter().filter(|document| filter::matches(document, &filter)).collect())
    }

    async fn insert(&self, document: Document) -> Result<(), Error> {
        let id = document_id(&document)?;
        let path = self.key_path(id);
        match tokio::fs::metadata(&path).await {
            Ok(_) => return Err(Error::Configuration(format!("key {id} already exists"))),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&path, &e)),
        }

        self.write(&path, &document).await?;
        tracing::debug!(key_id = %id, path = %path.display(), "stored data key");
        Ok(())
    }

    async fn replace(&self, id: Uuid, document: Document) -> Result<(), Error> {
        let path = self.key_path(id);
        if !path.is_file() {
            return Err(Error::KeyNotFound(format!("id {id}")));
        }
        self.write(&path, &document).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use fieldcrypt::prelude::*;
    use secrecy::SecretVec;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn vault() -> (TempDir, FileKeyVault) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let vault = FileKeyVault::init(temp_dir.path().join("keys")).expect("Failed to init vault");
        (temp_dir, vault)
    }

    #[test]
    fn test_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let result = FileKeyVault::new(temp_dir.path().join("absent"));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_insert_find_replace() {
        let (_temp_dir, vault) = vault();
        let key = DataKey::new(MasterKey::Local, vec![1; 32], vec!["n".to_string()]);

        vault.insert(key.to_document()).await.unwrap();
        assert!(vault.key_path(key.id()).is_file());

        let found = vault.find(doc! { "keyAltNames": "n" }).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(DataKey::from_document(&found[0]).unwrap().id(), key.id());
        assert!(vault.find(doc! { "keyAltNames": "m" }).await.unwrap().is_empty());

        let mut replacement = key.to_document();
        replacement.insert("keyAltNames", vec!["n", "m"]);
        vault.replace(key.id(), replacement).await.unwrap();
        assert_eq!(vault.find(doc! { "keyAltNames": "m" }).await.unwrap().len(), 1);

        assert!(matches!(
            vault.replace(Uuid::new(), doc! {}).await,
            Err(Error::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_key_path_is_hex_id() {
        let (_temp_dir, vault) = vault();
        let id = Uuid::parse_str("0f6e4b1c-9a2d-4e8f-8a1b-2c3d4e5f6a7b").unwrap();

        let path = vault.key_path(id);
        assert_eq!(path.parent(), Some(vault.key_dir()));
        assert_eq!(path.file_name().and_then(|name| name.to_str()), Some("0f6e4b1c9a2d4e8f8a1b2c3d4e5f6a7b.key"));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (_temp_dir, vault) = vault();
        let key = DataKey::new(MasterKey::Local, vec![1; 32], vec![]);

        vault.insert(key.to_document()).await.unwrap();
        assert!(vault.insert(key.to_document()).await.is_err());
    }

    #[tokio::test]
    async fn test_other_files_are_ignored() {
        let (_temp_dir, vault) = vault();
        std::fs::write(vault.key_dir().join("README"), "not a key").unwrap();

        assert!(vault.find(doc! {}).await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_key_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp_dir, vault) = vault();
        let key = DataKey::new(MasterKey::Local, vec![1; 32], vec![]);
        vault.insert(key.to_document()).await.unwrap();

        let mode = std::fs::metadata(vault.key_path(key.id())).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_explicit_encryption_over_files() {
        let (temp_dir, vault) = vault();
        let kms = KmsProviders::new().with_local(SecretVec::new(vec![5; 96])).unwrap();
        let encryption = ClientEncryption::with_backend(Arc::new(vault), kms.clone());

        let id = encryption.create_data_key("local", None, vec!["n".to_string()]).await.unwrap();
        let encrypted = encryption
            .encrypt(Bson::String("000".into()), Algorithm::Deterministic, EncryptKey::AltName("n".into()))
            .await
            .unwrap();

        // A second process opening the same directory
        let reopened = FileKeyVault::new(temp_dir.path().join("keys")).unwrap();
        let encryption = ClientEncryption::with_backend(Arc::new(reopened), kms);
        assert_eq!(encryption.decrypt(&Bson::Binary(encrypted)).await.unwrap(), Bson::String("000".into()));
        assert_eq!(encryption.key_vault().find_keys(doc! {}).await.unwrap()[0].id(), id);
    }
}
