use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Bson, Document};

use super::EncryptionSchema;
use crate::cache::SingleFlightCache;
use crate::error::Error;
use crate::interceptor::{check_reply, CommandTransport};
use crate::options::Namespace;

/// Source of encryption schemas.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Returns the schema of `namespace`, or `None` if this source has none.
    ///
    /// # Errors
    ///
    /// Returns error if the source cannot be read or holds an invalid schema.
    async fn schema_for(&self, namespace: &Namespace) -> Result<Option<Arc<EncryptionSchema>>, Error>;
}

/// Schemas supplied by the application, keyed by `db.collection`.
#[derive(Debug, Default)]
pub struct LocalSchemaMap {
    schemas: HashMap<String, Arc<EncryptionSchema>>,
}

impl LocalSchemaMap {
    /// Parses every schema of the map.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if a key is not a namespace or a schema is invalid.
    pub fn new(schema_map: &HashMap<String, Document>) -> Result<Self, Error> {
        let mut schemas = HashMap::with_capacity(schema_map.len());
        for (namespace, schema) in schema_map {
            let namespace = Namespace::parse(namespace)?;
            schemas.insert(namespace.to_string(), Arc::new(EncryptionSchema::parse(schema)?));
        }
        Ok(Self { schemas })
    }
}

#[async_trait]
impl SchemaProvider for LocalSchemaMap {
    fn name(&self) -> &str {
        "schema_map"
    }

    async fn schema_for(&self, namespace: &Namespace) -> Result<Option<Arc<EncryptionSchema>>, Error> {
        Ok(self.schemas.get(&namespace.to_string()).cloned())
    }
}

/// Reads the `$jsonSchema` validator the server holds for a collection.
pub struct RemoteSchemaProvider {
    transport: Arc<dyn CommandTransport>,
}

impl RemoteSchemaProvider {
    /// Creates a provider querying through `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn CommandTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl SchemaProvider for RemoteSchemaProvider {
    fn name(&self) -> &str {
        "listCollections"
    }

    async fn schema_for(&self, namespace: &Namespace) -> Result<Option<Arc<EncryptionSchema>>, Error> {
        let command = doc! { "listCollections": 1, "filter": { "name": namespace.coll() } };
        let reply = check_reply(self.transport.run_command(namespace.db(), command).await?)?;

        let collection = reply
            .get_document("cursor")
            .ok()
            .and_then(|cursor| cursor.get_array("firstBatch").ok())
            .and_then(|batch| batch.first())
            .and_then(Bson::as_document);

        let Some(schema) = collection
            .and_then(|c| c.get_document("options").ok())
            .and_then(|options| options.get_document("validator").ok())
            .and_then(|validator| validator.get_document("$jsonSchema").ok())
        else {
            return Ok(None);
        };

        EncryptionSchema::parse(schema).map(|schema| Some(Arc::new(schema))).map_err(|err| {
            tracing::warn!(%namespace, error = %err, "server side schema is not usable for encryption");
            err
        })
    }
}

impl std::fmt::Debug for RemoteSchemaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSchemaProvider").finish_non_exhaustive()
    }
}

/// Ordered list of schema sources with a TTL cache of resolved schemas.
///
/// The first source returning a schema wins; a namespace no source knows has
/// no encrypted fields.
pub struct SchemaRegistry {
    providers: Vec<Arc<dyn SchemaProvider>>,
    cache: SingleFlightCache<Namespace, Option<Arc<EncryptionSchema>>>,
}

impl SchemaRegistry {
    /// Creates a registry consulting `providers` in order.
    #[must_use]
    pub fn new(providers: Vec<Arc<dyn SchemaProvider>>, ttl: Duration) -> Self {
        Self { providers, cache: SingleFlightCache::with_ttl(ttl) }
    }

    /// Resolves the schema of `namespace`.
    ///
    /// # Errors
    ///
    /// Returns `Error::SchemaResolutionFailed` if a source fails before one
    /// returned a schema.
    pub async fn resolve(&self, namespace: &Namespace) -> Result<Option<Arc<EncryptionSchema>>, Error> {
        self.cache
            .get_or_try_fetch(namespace.clone(), || async {
                for provider in &self.providers {
                    let found = provider.schema_for(namespace).await.map_err(|err| {
                        Error::SchemaResolutionFailed {
                            namespace: namespace.to_string(),
                            reason: format!("{}: {err}", provider.name()),
                        }
                    })?;
                    if let Some(schema) = found {
                        tracing::debug!(%namespace, source = provider.name(), "resolved encryption schema");
                        return Ok(Some(schema));
                    }
                }
                tracing::debug!(%namespace, "no encryption schema");
                Ok::<_, Error>(None)
            })
            .await
    }

    /// Drops every cached schema.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.providers.iter().map(|p| p.name()).collect();
        f.debug_struct("SchemaRegistry").field("providers", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::Uuid;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ssn_schema() -> Document {
        doc! {
            "bsonType": "object",
            "properties": {
                "ssn": { "encrypt": {
                    "keyId": [Uuid::from_bytes([1; 16])],
                    "bsonType": "string",
                    "algorithm": "Deterministic",
                } },
            },
        }
    }

    struct ListCollections {
        reply: Mutex<Result<Document, Error>>,
        calls: AtomicUsize,
    }

    impl ListCollections {
        fn replying(reply: Result<Document, Error>) -> Arc<Self> {
            Arc::new(Self { reply: Mutex::new(reply), calls: AtomicUsize::new(0) })
        }

        fn with_validator(validator: Document) -> Arc<Self> {
            Self::replying(Ok(doc! {
                "ok": 1,
                "cursor": { "id": 0_i64, "firstBatch": [ { "name": "coll", "options": { "validator": validator } } ] },
            }))
        }
    }

    #[async_trait]
    impl CommandTransport for ListCollections {
        async fn run_command(&self, _db: &str, command: Document) -> Result<Document, Error> {
            assert!(command.contains_key("listCollections"));
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &*self.reply.lock() {
                Ok(reply) => Ok(reply.clone()),
                Err(err) => Err(Error::Configuration(err.to_string())),
            }
        }
    }

    fn remote_provider(transport: &Arc<ListCollections>) -> Arc<dyn SchemaProvider> {
        Arc::new(RemoteSchemaProvider::new(Arc::clone(transport) as Arc<dyn CommandTransport>))
    }

    fn ns() -> Namespace {
        Namespace::parse("db.coll").unwrap()
    }

    #[tokio::test]
    async fn test_local_schema_takes_precedence() {
        let local = Arc::new(
            LocalSchemaMap::new(&HashMap::from([("db.coll".to_string(), ssn_schema())])).unwrap(),
        );
        let remote = ListCollections::with_validator(doc! { "$jsonSchema": { "bsonType": "object" } });
        let registry = SchemaRegistry::new(
            vec![local as Arc<dyn SchemaProvider>, remote_provider(&remote)],
            Duration::from_secs(60),
        );

        let schema = registry.resolve(&ns()).await.unwrap().unwrap();
        assert!(schema.has_encrypted_fields());
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_schema_is_cached() {
        let remote = ListCollections::with_validator(doc! { "$jsonSchema": ssn_schema() });
        let registry = SchemaRegistry::new(
            vec![remote_provider(&remote)],
            Duration::from_secs(60),
        );

        assert!(registry.resolve(&ns()).await.unwrap().is_some());
        assert!(registry.resolve(&ns()).await.unwrap().is_some());
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);

        registry.clear_cache();
        assert!(registry.resolve(&ns()).await.unwrap().is_some());
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_collection_without_validator_has_no_schema() {
        let remote = ListCollections::replying(Ok(doc! {
            "ok": 1,
            "cursor": { "id": 0_i64, "firstBatch": [] },
        }));
        let registry = SchemaRegistry::new(
            vec![remote_provider(&remote)],
            Duration::from_secs(60),
        );

        assert!(registry.resolve(&ns()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unusable_remote_schema_fails_resolution() {
        let remote = ListCollections::with_validator(doc! {
            "$jsonSchema": { "properties": { "ssn": { "encrypt": { "algorithm": "Random" } } } },
        });
        let registry = SchemaRegistry::new(
            vec![remote_provider(&remote)],
            Duration::from_secs(60),
        );

        let err = registry.resolve(&ns()).await.unwrap_err();
        assert!(matches!(err, Error::SchemaResolutionFailed { ref namespace, .. } if namespace == "db.coll"));
    }

    #[tokio::test]
    async fn test_failing_source_fails_resolution() {
        let remote = ListCollections::replying(Err(Error::Configuration("unreachable".into())));
        let registry = SchemaRegistry::new(
            vec![remote_provider(&remote)],
            Duration::from_secs(60),
        );

        assert!(matches!(
            registry.resolve(&ns()).await,
            Err(Error::SchemaResolutionFailed { .. })
        ));
    }

    #[test]
    fn test_local_map_rejects_bad_namespace() {
        let result = LocalSchemaMap::new(&HashMap::from([("nodot".to_string(), ssn_schema())]));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
