//! Encryption schemas: which fields of a namespace are encrypted, and how.
//!
//! Schemas use the JSON schema dialect understood by document databases:
//!
//! ```json
//! {
//!   "bsonType": "object",
//!   "encryptMetadata": { "keyId": [<UUID>] },
//!   "properties": {
//!     "ssn": { "encrypt": { "bsonType": "string", "algorithm": "Deterministic" } },
//!     "contact": {
//!       "bsonType": "object",
//!       "properties": { "phone": { "encrypt": { "keyId": "/owner", "algorithm": "Random" } } }
//!     }
//!   }
//! }
//! ```
//!
//! `encryptMetadata` supplies defaults for `keyId` and `algorithm` to every
//! encrypted field below it. A `keyId` is either an array holding one UUID or
//! a `/pointer` naming a top-level string field whose value is a key alt name.

mod registry;

pub use registry::{LocalSchemaMap, RemoteSchemaProvider, SchemaProvider, SchemaRegistry};

use std::collections::BTreeMap;

use bson::{Bson, Document, Uuid};

use crate::error::Error;
use crate::key_vault::uuid_from_binary;
use crate::value::Algorithm;

/// Where the data key of an encrypted field comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyIdSource {
    /// A fixed key id
    Id(Uuid),
    /// A key alt name read from the named top-level field of the document
    Pointer(String),
}

/// Encryption settings of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedField {
    key: KeyIdSource,
    algorithm: Algorithm,
    bson_types: Vec<String>,
}

impl EncryptedField {
    /// Returns the key source.
    #[must_use]
    pub const fn key(&self) -> &KeyIdSource {
        &self.key
    }

    /// Returns the algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Returns the allowed value types; empty means any.
    #[must_use]
    pub fn bson_types(&self) -> &[String] {
        &self.bson_types
    }

    /// Whether a value of `type_name` may be stored in this field.
    #[must_use]
    pub fn allows(&self, type_name: &str) -> bool {
        self.bson_types.is_empty() || self.bson_types.iter().any(|t| t == type_name)
    }
}

/// A property of an object schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaNode {
    /// The field is encrypted
    Encrypted(EncryptedField),
    /// The field is an embedded document with encrypted fields inside
    Object(ObjectSchema),
}

/// Object level schema: its properties holding encrypted fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectSchema {
    properties: BTreeMap<String, SchemaNode>,
}

impl ObjectSchema {
    /// Returns the node for a direct property.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&SchemaNode> {
        self.properties.get(name)
    }

    /// Whether no property holds encrypted data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// Parsed encryption schema of a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionSchema {
    root: ObjectSchema,
}

#[derive(Clone, Default)]
struct Inherited {
    key: Option<KeyIdSource>,
    algorithm: Option<Algorithm>,
}

impl EncryptionSchema {
    /// Parses a `$jsonSchema` document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if an encrypted field lacks a key id or
    /// algorithm, uses an unknown algorithm, or is deterministic without
    /// exactly one `bsonType`.
    pub fn parse(schema: &Document) -> Result<Self, Error> {
        Ok(Self { root: parse_object(schema, "", &Inherited::default())? })
    }

    /// Returns the top-level object schema.
    #[must_use]
    pub const fn root(&self) -> &ObjectSchema {
        &self.root
    }

    /// Looks up a dotted field path.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&SchemaNode> {
        let mut parts = path.split('.');
        let mut node = self.root.property(parts.next()?)?;
        for part in parts {
            match node {
                SchemaNode::Object(object) => node = object.property(part)?,
                SchemaNode::Encrypted(_) => return None,
            }
        }
        Some(node)
    }

    /// Whether any field is encrypted.
    #[must_use]
    pub fn has_encrypted_fields(&self) -> bool {
        !self.root.is_empty()
    }
}

fn parse_object(schema: &Document, path: &str, inherited: &Inherited) -> Result<ObjectSchema, Error> {
    let inherited = match schema.get("encryptMetadata") {
        Some(Bson::Document(metadata)) => merge(inherited, metadata, path)?,
        Some(_) => return Err(invalid(path, "encryptMetadata must be a document")),
        None => inherited.clone(),
    };

    let mut properties = BTreeMap::new();
    let Some(declared) = schema.get("properties") else {
        return Ok(ObjectSchema { properties });
    };
    let declared = declared
        .as_document()
        .ok_or_else(|| invalid(path, "properties must be a document"))?;

    for (name, property) in declared {
        let field_path = if path.is_empty() { name.clone() } else { format!("{path}.{name}") };
        let property = property
            .as_document()
            .ok_or_else(|| invalid(&field_path, "property schema must be a document"))?;

        if let Some(encrypt) = property.get("encrypt") {
            let encrypt =
                encrypt.as_document().ok_or_else(|| invalid(&field_path, "encrypt must be a document"))?;
            let field = parse_encrypted(encrypt, &field_path, &inherited)?;
            properties.insert(name.clone(), SchemaNode::Encrypted(field));
        } else if property.contains_key("properties") {
            let object = parse_object(property, &field_path, &inherited)?;
            if !object.is_empty() {
                properties.insert(name.clone(), SchemaNode::Object(object));
            }
        }
    }

    Ok(ObjectSchema { properties })
}

fn parse_encrypted(encrypt: &Document, path: &str, inherited: &Inherited) -> Result<EncryptedField, Error> {
    let settings = merge(inherited, encrypt, path)?;
    let key = settings.key.ok_or_else(|| invalid(path, "no keyId given"))?;
    let algorithm = settings.algorithm.ok_or_else(|| invalid(path, "no algorithm given"))?;

    let bson_types = match encrypt.get("bsonType") {
        None => Vec::new(),
        Some(Bson::String(name)) => vec![name.clone()],
        Some(Bson::Array(names)) => names
            .iter()
            .map(|name| name.as_str().map(str::to_string).ok_or_else(|| invalid(path, "bsonType must be a string")))
            .collect::<Result<_, _>>()?,
        Some(_) => return Err(invalid(path, "bsonType must be a string or an array")),
    };

    if algorithm == Algorithm::Deterministic && bson_types.len() != 1 {
        return Err(invalid(path, "deterministic encryption requires exactly one bsonType"));
    }

    Ok(EncryptedField { key, algorithm, bson_types })
}

fn merge(inherited: &Inherited, metadata: &Document, path: &str) -> Result<Inherited, Error> {
    let mut merged = inherited.clone();

    match metadata.get("keyId") {
        None => {}
        Some(Bson::String(pointer)) => {
            let name = pointer
                .strip_prefix('/')
                .filter(|name| !name.is_empty())
                .ok_or_else(|| invalid(path, "keyId pointer must start with '/'"))?;
            merged.key = Some(KeyIdSource::Pointer(name.to_string()));
        }
        Some(Bson::Array(ids)) => match ids.as_slice() {
            [Bson::Binary(binary)] => {
                let id = uuid_from_binary(binary)
                    .ok_or_else(|| invalid(path, "keyId must hold a UUID"))?;
                merged.key = Some(KeyIdSource::Id(id));
            }
            _ => return Err(invalid(path, "keyId must be an array of one UUID")),
        },
        Some(_) => return Err(invalid(path, "keyId must be an array of one UUID or a pointer")),
    }

    match metadata.get("algorithm") {
        None => {}
        Some(Bson::String(name)) => merged.algorithm = Some(name.parse()?),
        Some(_) => return Err(invalid(path, "algorithm must be a string")),
    }

    Ok(merged)
}

fn invalid(path: &str, reason: &str) -> Error {
    if path.is_empty() {
        Error::Configuration(format!("invalid encryption schema: {reason}"))
    } else {
        Error::Configuration(format!("invalid encryption schema at '{path}': {reason}"))
    }
}
