use std::sync::Arc;

use async_trait::async_trait;
use bson::{doc, Bson, Document, Uuid};

use super::KeyVaultBackend;
use crate::error::Error;
use crate::interceptor::{check_reply, CommandTransport};
use crate::options::Namespace;

/// Key vault stored in a database collection.
///
/// Commands go through the given transport as-is; it must be a plain
/// connection, never an auto-encrypting one.
pub struct CollectionKeyVault {
    transport: Arc<dyn CommandTransport>,
    namespace: Namespace,
}

impl CollectionKeyVault {
    /// Creates a key vault over `namespace` reached through `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn CommandTransport>, namespace: Namespace) -> Self {
        Self { transport, namespace }
    }

    /// Returns the key vault namespace.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn run(&self, command: Document) -> Result<Document, Error> {
        check_reply(self.transport.run_command(self.namespace.db(), command).await?)
    }
}

fn batch(cursor: &Document, field: &str) -> Result<Vec<Document>, Error> {
    let documents = cursor
        .get_array(field)
        .map_err(|_| Error::Bson(format!("cursor reply has no {field}")))?;
    Ok(documents.iter().filter_map(Bson::as_document).cloned().collect())
}

fn cursor_id(cursor: &Document) -> i64 {
    match cursor.get("id") {
        Some(Bson::Int64(id)) => *id,
        Some(Bson::Int32(id)) => i64::from(*id),
        _ => 0,
    }
}

#[async_trait]
impl KeyVaultBackend for CollectionKeyVault {
    async fn find(&self, filter: Document) -> Result<Vec<Document>, Error> {
        let reply = self.run(doc! { "find": self.namespace.coll(), "filter": filter }).await?;
        let mut cursor = reply
            .get_document("cursor")
            .map_err(|_| Error::Bson("find reply has no cursor".to_string()))?
            .clone();

        let mut documents = batch(&cursor, "firstBatch")?;
        while cursor_id(&cursor) != 0 {
            let reply = self
                .run(doc! { "getMore": cursor_id(&cursor), "collection": self.namespace.coll() })
                .await?;
            cursor = reply
                .get_document("cursor")
                .map_err(|_| Error::Bson("getMore reply has no cursor".to_string()))?
                .clone();
            documents.extend(batch(&cursor, "nextBatch")?);
        }

        Ok(documents)
    }

    async fn insert(&self, document: Document) -> Result<(), Error> {
        self.run(doc! {
            "insert": self.namespace.coll(),
            "documents": [document],
            "writeConcern": { "w": "majority" },
        })
        .await
        .map(|_| ())
    }

    async fn replace(&self, id: Uuid, document: Document) -> Result<(), Error> {
        let reply = self
            .run(doc! {
                "update": self.namespace.coll(),
                "updates": [ { "q": { "_id": id }, "u": document } ],
                "writeConcern": { "w": "majority" },
            })
            .await?;

        match reply.get("n") {
            Some(Bson::Int32(0) | Bson::Int64(0)) => {
                Err(Error::KeyNotFound(format!("id {id}")))
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for CollectionKeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionKeyVault").field("namespace", &self.namespace).finish()
    }
}
