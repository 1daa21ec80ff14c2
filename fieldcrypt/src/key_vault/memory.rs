use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bson::{Bson, Document, Uuid};
use parking_lot::Mutex;

use super::KeyVaultBackend;
use crate::error::Error;
use crate::filter;

/// Key vault held in process memory.
///
/// Useful for tests and for short-lived tools; keys are lost when it is dropped.
#[derive(Debug, Default)]
pub struct MemoryKeyVault {
    documents: Mutex<Vec<Document>>,
    finds: AtomicUsize,
}

impl MemoryKeyVault {
    /// Creates an empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.lock().len()
    }

    /// Whether the vault holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.lock().is_empty()
    }

    /// Number of `find` calls served so far.
    #[must_use]
    pub fn find_count(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyVaultBackend for MemoryKeyVault {
    async fn find(&self, filter: Document) -> Result<Vec<Document>, Error> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        Ok(self.documents.lock().iter().filter(|doc| filter::matches(doc, &filter)).cloned().collect())
    }

    async fn insert(&self, document: Document) -> Result<(), Error> {
        self.documents.lock().push(document);
        Ok(())
    }

    async fn replace(&self, id: Uuid, document: Document) -> Result<(), Error> {
        let key = Bson::from(id);
        let mut documents = self.documents.lock();
        match documents.iter_mut().find(|doc| doc.get("_id") == Some(&key)) {
            Some(existing) => {
                *existing = document;
                Ok(())
            }
            None => Err(Error::KeyNotFound(format!("id {id}"))),
        }
    }
}
