//! Shared helpers: an in-memory database speaking the command protocol.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use fieldcrypt::filter;
use fieldcrypt::interceptor::CommandTransport;
use fieldcrypt::kms::KmsProviders;
use fieldcrypt::Error;
use parking_lot::Mutex;
use secrecy::SecretVec;

/// Error code of an authentication failure.
pub const AUTH_FAILED: i32 = 18;

/// In-memory database.
///
/// Supports `insert`, `update`, `find`, `findAndModify` (`$set` or
/// replacement), `getMore`, `aggregate` (`$match` stages), `distinct` and
/// `listCollections`. Every received command is logged.
#[derive(Default)]
pub struct MemoryDatabase {
    collections: Mutex<HashMap<String, Vec<Document>>>,
    validators: Mutex<HashMap<String, Document>>,
    cursors: Mutex<HashMap<i64, (String, VecDeque<Document>)>>,
    next_cursor: AtomicI64,
    rejects_auth: AtomicBool,
    log: Mutex<Vec<Document>>,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { next_cursor: AtomicI64::new(1), ..Self::default() })
    }

    /// A database rejecting every command with an authentication failure.
    pub fn rejecting_auth() -> Arc<Self> {
        let db = Self::new();
        db.rejects_auth.store(true, Ordering::SeqCst);
        db
    }

    /// Installs a `$jsonSchema` validator on `namespace`.
    pub fn set_validator(&self, namespace: &str, schema: Document) {
        self.validators.lock().insert(namespace.to_string(), schema);
    }

    /// Stored documents of `namespace`, as the server sees them.
    pub fn stored(&self, namespace: &str) -> Vec<Document> {
        self.collections.lock().get(namespace).cloned().unwrap_or_default()
    }

    /// Names of the commands received so far.
    pub fn command_names(&self) -> Vec<String> {
        self.log.lock().iter().filter_map(|c| c.keys().next().cloned()).collect()
    }

    /// The commands received so far.
    pub fn commands(&self) -> Vec<Document> {
        self.log.lock().clone()
    }

    fn open_cursor(&self, namespace: String, mut documents: VecDeque<Document>, batch_size: Option<usize>) -> Document {
        let size = batch_size.unwrap_or(usize::MAX).min(documents.len());
        let first: Vec<Document> = documents.drain(..size).collect();

        let id = if documents.is_empty() {
            0
        } else {
            let id = self.next_cursor.fetch_add(1, Ordering::SeqCst);
            self.cursors.lock().insert(id, (namespace.clone(), documents));
            id
        };
        doc! { "ok": 1, "cursor": { "id": id, "ns": namespace, "firstBatch": first } }
    }

    fn insert(&self, namespace: String, command: &Document) -> Document {
        let documents: Vec<Document> = command
            .get_array("documents")
            .map(|docs| docs.iter().filter_map(Bson::as_document).cloned().collect())
            .unwrap_or_default();
        let n = i32::try_from(documents.len()).unwrap();
        self.collections.lock().entry(namespace).or_default().extend(documents);

        let unacknowledged = command
            .get_document("writeConcern")
            .is_ok_and(|wc| matches!(wc.get("w"), Some(Bson::Int32(0))));
        if unacknowledged {
            doc! { "ok": 1 }
        } else {
            doc! { "ok": 1, "n": n }
        }
    }

    fn update(&self, namespace: &str, command: &Document) -> Document {
        let mut n = 0;
        let mut collections = self.collections.lock();
        let stored = collections.entry(namespace.to_string()).or_default();
        for update in command.get_array("updates").unwrap().iter().filter_map(Bson::as_document) {
            let query = update.get_document("q").unwrap();
            let replacement = update.get_document("u").unwrap();
            if let Some(existing) = stored.iter_mut().find(|d| filter::matches(d, query)) {
                *existing = replacement.clone();
                n += 1;
            }
        }
        doc! { "ok": 1, "n": n }
    }

    fn find_and_modify(&self, namespace: &str, command: &Document) -> Document {
        let query = command.get_document("query").cloned().unwrap_or_default();
        let update = command.get_document("update").cloned().unwrap_or_default();

        let mut collections = self.collections.lock();
        let stored = collections.entry(namespace.to_string()).or_default();
        let Some(existing) = stored.iter_mut().find(|d| filter::matches(d, &query)) else {
            return doc! { "ok": 1, "value": Bson::Null };
        };
        let before = existing.clone();
        match update.get_document("$set") {
            Ok(fields) => existing.extend(fields.clone()),
            Err(_) => {
                let mut replacement = update;
                if let Some(id) = before.get("_id") {
                    replacement.insert("_id", id.clone());
                }
                *existing = replacement;
            }
        }
        doc! { "ok": 1, "value": before }
    }

    fn find(&self, namespace: String, command: &Document) -> Document {
        let filter = command.get_document("filter").cloned().unwrap_or_default();
        let batch_size = command.get_i32("batchSize").ok().map(|n| usize::try_from(n).unwrap());
        let documents = self.matching(&namespace, &filter);
        self.open_cursor(namespace, documents, batch_size)
    }

    fn aggregate(&self, namespace: String, command: &Document) -> Document {
        let mut documents = self.matching(&namespace, &doc! {});
        for stage in command.get_array("pipeline").unwrap().iter().filter_map(Bson::as_document) {
            if let Ok(filter) = stage.get_document("$match") {
                documents.retain(|d| filter::matches(d, filter));
            }
        }
        let batch_size = command
            .get_document("cursor")
            .ok()
            .and_then(|c| c.get_i32("batchSize").ok())
            .map(|n| usize::try_from(n).unwrap());
        self.open_cursor(namespace, documents, batch_size)
    }

    fn distinct(&self, namespace: &str, command: &Document) -> Document {
        let key = command.get_str("key").unwrap();
        let query = command.get_document("query").cloned().unwrap_or_default();
        let mut values: Vec<Bson> = Vec::new();
        for document in self.matching(namespace, &query) {
            if let Some(value) = document.get(key) {
                if !values.contains(value) {
                    values.push(value.clone());
                }
            }
        }
        doc! { "ok": 1, "values": values }
    }

    fn get_more(&self, command: &Document) -> Document {
        let id = command.get_i64("getMore").unwrap();
        let batch_size = command.get_i32("batchSize").ok().map(|n| usize::try_from(n).unwrap());

        let mut cursors = self.cursors.lock();
        let Some((namespace, documents)) = cursors.get_mut(&id) else {
            return doc! { "ok": 0, "code": 43, "errmsg": "cursor not found" };
        };
        let size = batch_size.unwrap_or(usize::MAX).min(documents.len());
        let next: Vec<Document> = documents.drain(..size).collect();
        let namespace = namespace.clone();
        let id = if documents.is_empty() {
            cursors.remove(&id);
            0
        } else {
            id
        };
        doc! { "ok": 1, "cursor": { "id": id, "ns": namespace, "nextBatch": next } }
    }

    fn list_collections(&self, db: &str, command: &Document) -> Document {
        let name = command.get_document("filter").ok().and_then(|f| f.get_str("name").ok());
        let namespace = format!("{db}.{}", name.unwrap_or_default());

        let batch = match self.validators.lock().get(&namespace) {
            Some(schema) => vec![doc! {
                "name": name,
                "options": { "validator": { "$jsonSchema": schema.clone() } },
            }],
            None if self.collections.lock().contains_key(&namespace) => {
                vec![doc! { "name": name, "options": {} }]
            }
            None => vec![],
        };
        doc! { "ok": 1, "cursor": { "id": 0_i64, "firstBatch": batch } }
    }

    fn matching(&self, namespace: &str, filter: &Document) -> VecDeque<Document> {
        self.collections
            .lock()
            .get(namespace)
            .map(|docs| docs.iter().filter(|d| filter::matches(d, filter)).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommandTransport for MemoryDatabase {
    async fn run_command(&self, db: &str, command: Document) -> Result<Document, Error> {
        self.log.lock().push(command.clone());
        if self.rejects_auth.load(Ordering::SeqCst) {
            return Ok(doc! { "ok": 0, "code": AUTH_FAILED, "errmsg": "Authentication failed." });
        }

        let (name, target) = command.iter().next().map(|(k, v)| (k.clone(), v.clone())).unwrap();
        let namespace = format!("{db}.{}", target.as_str().unwrap_or_default());
        let reply = match name.as_str() {
            "insert" => self.insert(namespace, &command),
            "update" => self.update(&namespace, &command),
            "find" => self.find(namespace, &command),
            "findAndModify" | "findandmodify" => self.find_and_modify(&namespace, &command),
            "aggregate" => self.aggregate(namespace, &command),
            "distinct" => self.distinct(&namespace, &command),
            "getMore" => self.get_more(&command),
            "listCollections" => self.list_collections(db, &command),
            other => doc! { "ok": 0, "code": 59, "errmsg": format!("no such command: '{other}'") },
        };
        Ok(reply)
    }
}

/// A fixed 96-byte local master key.
pub fn local_master_key() -> SecretVec<u8> {
    SecretVec::new((0..96).collect())
}

/// KMS providers holding only the local provider.
pub fn local_kms() -> KmsProviders {
    KmsProviders::new().with_local(local_master_key()).unwrap()
}

/// Schema encrypting `ssn` deterministically with key `key_id`.
pub fn ssn_schema(key_id: bson::Uuid) -> Document {
    doc! {
        "bsonType": "object",
        "properties": {
            "ssn": { "encrypt": {
                "keyId": [key_id],
                "bsonType": "string",
                "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic",
            } },
        },
    }
}
