//! Schema marking: replaces values that must be encrypted with placeholders.
//!
//! A placeholder is a subtype 6 binary whose payload is a zero byte followed
//! by the BSON document `{a: <algorithm id>, ki: <key id> | ka: <alt name>, v: <value>}`.
//! Marking only decides *what* gets encrypted and under which key; the
//! placeholders are turned into encrypted values once the keys are known.

use bson::spec::BinarySubtype;
use std::convert::Infallible;

use bson::{doc, Binary, Bson, Document};

use crate::error::Error;
use crate::key_vault::{uuid_from_binary, KeyRef};
use crate::schema::{EncryptedField, EncryptionSchema, KeyIdSource, ObjectSchema, SchemaNode};
use crate::value::{bson_type_name, check_encryptable, is_encrypted_binary, is_placeholder_binary, Algorithm, PLACEHOLDER_MARKER};

/// Intent to encrypt one value.
#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    /// Data key to encrypt with
    pub key: KeyRef,
    /// Algorithm to encrypt with
    pub algorithm: Algorithm,
    /// The plaintext value
    pub value: Bson,
}

impl Placeholder {
    /// Encodes the placeholder as a subtype 6 binary.
    ///
    /// # Errors
    ///
    /// Returns `Error::Bson` if the value cannot be serialized.
    pub fn to_binary(&self) -> Result<Binary, Error> {
        let mut body = doc! { "a": i32::from(self.algorithm.id()) };
        match &self.key {
            KeyRef::Id(id) => body.insert("ki", *id),
            KeyRef::AltName(name) => body.insert("ka", name.clone()),
        };
        body.insert("v", self.value.clone());

        let mut bytes = vec![PLACEHOLDER_MARKER];
        body.to_writer(&mut bytes)?;
        Ok(Binary { subtype: BinarySubtype::Encrypted, bytes })
    }

    /// Decodes a placeholder binary.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encoding` if the binary is not a well formed placeholder.
    pub fn from_binary(binary: &Binary) -> Result<Self, Error> {
        if !is_placeholder_binary(binary) {
            return Err(Error::Encoding("binary is not an encryption placeholder".to_string()));
        }
        let body = Document::from_reader(&binary.bytes[1..])?;

        let algorithm = body
            .get_i32("a")
            .ok()
            .and_then(|id| u8::try_from(id).ok())
            .ok_or_else(|| Error::Encoding("placeholder has no algorithm".to_string()))
            .and_then(Algorithm::from_id)?;

        let key = match (body.get("ki"), body.get("ka")) {
            (Some(Bson::Binary(id)), None) => KeyRef::Id(
                uuid_from_binary(id).ok_or_else(|| Error::Encoding("placeholder key id is not a UUID".to_string()))?,
            ),
            (None, Some(Bson::String(name))) => KeyRef::AltName(name.clone()),
            _ => return Err(Error::Encoding("placeholder must name exactly one key".to_string())),
        };

        let value = body
            .get("v")
            .cloned()
            .ok_or_else(|| Error::Encoding("placeholder has no value".to_string()))?;

        Ok(Self { key, algorithm, value })
    }
}

/// Commands whose payload may hold fields to encrypt.
pub const MARKED_COMMANDS: &[&str] =
    &["insert", "update", "delete", "find", "aggregate", "distinct", "count", "findAndModify", "findandmodify"];

/// Whether [`mark_command`] inspects commands named `name`.
#[must_use]
pub fn is_marked_command(name: &str) -> bool {
    MARKED_COMMANDS.contains(&name)
}

/// Marks every encrypted field an outgoing command touches.
///
/// Commands not listed in [`MARKED_COMMANDS`] are returned unchanged.
///
/// # Errors
///
/// Returns `Error::SchemaViolation` when the command conflicts with the schema
/// and `Error::Encoding` when a value cannot be encrypted.
pub fn mark_command(command: &Document, schema: &EncryptionSchema) -> Result<Document, Error> {
    let Some(name) = command.keys().next() else {
        return Ok(command.clone());
    };

    let mut marked = command.clone();
    match name.as_str() {
        "insert" => map_array(&mut marked, "documents", |doc| mark_document(doc, schema))?,
        "update" => map_array(&mut marked, "updates", |statement| {
            let mut statement = statement.clone();
            map_field(&mut statement, "q", |q| mark_filter(q, schema))?;
            if let Some(update) = statement.get("u").cloned() {
                statement.insert("u", mark_update(&update, schema)?);
            }
            Ok(statement)
        })?,
        "delete" => map_array(&mut marked, "deletes", |statement| {
            let mut statement = statement.clone();
            map_field(&mut statement, "q", |q| mark_filter(q, schema))?;
            Ok(statement)
        })?,
        "find" => map_field(&mut marked, "filter", |filter| mark_filter(filter, schema))?,
        "distinct" | "count" => map_field(&mut marked, "query", |query| mark_filter(query, schema))?,
        "findAndModify" | "findandmodify" => {
            map_field(&mut marked, "query", |query| mark_filter(query, schema))?;
            if let Some(update) = marked.get("update").cloned() {
                marked.insert("update", mark_update(&update, schema)?);
            }
        }
        "aggregate" => map_array(&mut marked, "pipeline", |stage| match stage.get("$match") {
            Some(Bson::Document(filter)) => Ok(doc! { "$match": mark_filter(filter, schema)? }),
            _ => Ok(stage.clone()),
        })?,
        _ => {}
    }

    Ok(marked)
}

fn map_field<F>(command: &mut Document, field: &str, mark: F) -> Result<(), Error>
where
    F: FnOnce(&Document) -> Result<Document, Error>,
{
    if let Some(Bson::Document(value)) = command.get(field) {
        let marked = mark(value)?;
        command.insert(field, marked);
    }
    Ok(())
}

fn map_array<F>(command: &mut Document, field: &str, mut mark: F) -> Result<(), Error>
where
    F: FnMut(&Document) -> Result<Document, Error>,
{
    let Some(Bson::Array(items)) = command.get(field) else {
        return Ok(());
    };

    let marked = items
        .iter()
        .map(|item| match item {
            Bson::Document(doc) => mark(doc).map(Bson::Document),
            other => Ok(other.clone()),
        })
        .collect::<Result<Vec<_>, _>>()?;
    command.insert(field, marked);
    Ok(())
}

/// Marks the encrypted fields of a document to be stored.
///
/// # Errors
///
/// See [`mark_command`].
pub fn mark_document(doc: &Document, schema: &EncryptionSchema) -> Result<Document, Error> {
    mark_object(doc, schema.root(), "", doc)
}

fn mark_object(doc: &Document, object: &ObjectSchema, path: &str, root: &Document) -> Result<Document, Error> {
    let mut marked = Document::new();
    for (name, value) in doc {
        let field_path = join(path, name);
        let value = match object.property(name) {
            None => value.clone(),
            Some(SchemaNode::Encrypted(field)) => placeholder(field, value, &field_path, Some(root))?,
            Some(SchemaNode::Object(inner)) => match value {
                Bson::Document(embedded) => Bson::Document(mark_object(embedded, inner, &field_path, root)?),
                Bson::Array(_) => {
                    return Err(Error::SchemaViolation(format!(
                        "cannot encrypt fields below '{field_path}' because it is an array"
                    )))
                }
                other => other.clone(),
            },
        };
        marked.insert(name.clone(), value);
    }
    Ok(marked)
}

fn mark_update(update: &Bson, schema: &EncryptionSchema) -> Result<Bson, Error> {
    let update = match update {
        Bson::Document(update) => update,
        Bson::Array(_) => {
            return Err(Error::SchemaViolation(
                "pipeline updates are not supported on collections with encrypted fields".to_string(),
            ))
        }
        other => return Ok(other.clone()),
    };

    let is_operator_update = update.keys().next().is_some_and(|key| key.starts_with('$'));
    if !is_operator_update {
        return Ok(Bson::Document(mark_document(update, schema)?));
    }

    let mut marked = Document::new();
    for (operator, fields) in update {
        let Bson::Document(fields) = fields else {
            marked.insert(operator.clone(), fields.clone());
            continue;
        };

        let value = match operator.as_str() {
            "$set" | "$setOnInsert" => Bson::Document(mark_set(fields, schema)?),
            "$unset" => Bson::Document(fields.clone()),
            _ => {
                if let Some(path) = fields
                    .keys()
                    .find(|path| schema.lookup(path).is_some() || inside_encrypted(schema, path))
                {
                    return Err(Error::SchemaViolation(format!(
                        "update operator {operator} is not supported on encrypted field '{path}'"
                    )));
                }
                Bson::Document(fields.clone())
            }
        };
        marked.insert(operator.clone(), value);
    }
    Ok(Bson::Document(marked))
}

fn mark_set(fields: &Document, schema: &EncryptionSchema) -> Result<Document, Error> {
    let mut marked = Document::new();
    for (path, value) in fields {
        let value = match schema.lookup(path) {
            Some(SchemaNode::Encrypted(field)) => placeholder(field, value, path, Some(fields))?,
            Some(SchemaNode::Object(inner)) => match value {
                Bson::Document(embedded) => Bson::Document(mark_object(embedded, inner, path, fields)?),
                Bson::Array(_) => {
                    return Err(Error::SchemaViolation(format!(
                        "cannot encrypt fields below '{path}' because it is an array"
                    )))
                }
                other => other.clone(),
            },
            None if inside_encrypted(schema, path) => {
                return Err(Error::SchemaViolation(format!(
                    "cannot update a path inside encrypted field '{path}'"
                )))
            }
            None => value.clone(),
        };
        marked.insert(path.clone(), value);
    }
    Ok(marked)
}

/// Whether a proper prefix of `path` is an encrypted field.
fn inside_encrypted(schema: &EncryptionSchema, path: &str) -> bool {
    path.match_indices('.')
        .any(|(index, _)| matches!(schema.lookup(&path[..index]), Some(SchemaNode::Encrypted(_))))
}

/// Marks the encrypted fields a query filter compares against.
///
/// Only equality comparisons (`field: value`, `$eq`, `$ne`, `$in`, `$nin`)
/// on deterministically encrypted fields can be expressed over ciphertext.
///
/// # Errors
///
/// Returns `Error::SchemaViolation` for queries on randomly encrypted fields
/// and for unsupported operators on encrypted fields.
pub fn mark_filter(filter: &Document, schema: &EncryptionSchema) -> Result<Document, Error> {
    let mut marked = Document::new();
    for (key, condition) in filter {
        let value = match key.as_str() {
            "$and" | "$or" | "$nor" => match condition {
                Bson::Array(clauses) => Bson::Array(
                    clauses
                        .iter()
                        .map(|clause| match clause {
                            Bson::Document(clause) => mark_filter(clause, schema).map(Bson::Document),
                            other => Ok(other.clone()),
                        })
                        .collect::<Result<_, _>>()?,
                ),
                other => other.clone(),
            },
            _ if key.starts_with('$') => condition.clone(),
            path => mark_condition(path, condition, schema)?,
        };
        marked.insert(key.clone(), value);
    }
    Ok(marked)
}

fn mark_condition(path: &str, condition: &Bson, schema: &EncryptionSchema) -> Result<Bson, Error> {
    let operators = match condition {
        Bson::Document(ops) if ops.keys().next().is_some_and(|k| k.starts_with('$')) => Some(ops),
        _ => None,
    };

    match schema.lookup(path) {
        None if inside_encrypted(schema, path) => Err(Error::SchemaViolation(format!(
            "cannot query a path inside encrypted field '{path}'"
        ))),
        None => Ok(condition.clone()),
        Some(SchemaNode::Object(_)) => match operators {
            Some(ops) if ops.keys().all(|op| op == "$exists") => Ok(condition.clone()),
            _ => Err(Error::SchemaViolation(format!(
                "cannot compare against '{path}' because it holds encrypted fields"
            ))),
        },
        Some(SchemaNode::Encrypted(field)) => {
            if field.algorithm() == Algorithm::Random {
                return Err(Error::SchemaViolation(format!(
                    "cannot query on field '{path}' encrypted with the random algorithm"
                )));
            }

            let Some(ops) = operators else {
                return placeholder(field, condition, path, None);
            };

            let mut marked = Document::new();
            for (op, operand) in ops {
                let value = match op.as_str() {
                    "$eq" | "$ne" => placeholder(field, operand, path, None)?,
                    "$in" | "$nin" => match operand {
                        Bson::Array(values) => Bson::Array(
                            values
                                .iter()
                                .map(|value| placeholder(field, value, path, None))
                                .collect::<Result<_, _>>()?,
                        ),
                        _ => {
                            return Err(Error::SchemaViolation(format!("{op} needs an array")))
                        }
                    },
                    "$exists" => operand.clone(),
                    _ => {
                        return Err(Error::SchemaViolation(format!(
                            "operator {op} is not supported on encrypted field '{path}'"
                        )))
                    }
                };
                marked.insert(op.clone(), value);
            }
            Ok(Bson::Document(marked))
        }
    }
}

fn placeholder(
    field: &EncryptedField,
    value: &Bson,
    path: &str,
    root: Option<&Document>,
) -> Result<Bson, Error> {
    let type_name = bson_type_name(value);
    if !field.allows(type_name) {
        return Err(Error::SchemaViolation(format!(
            "Cannot encrypt element of type {type_name} because schema requires that type is one of: [ {} ]",
            field.bson_types().join(", ")
        )));
    }
    check_encryptable(value, field.algorithm())?;

    let key = match field.key() {
        KeyIdSource::Id(id) => KeyRef::Id(*id),
        KeyIdSource::Pointer(name) => {
            let Some(root) = root else {
                return Err(Error::SchemaViolation(format!(
                    "cannot query field '{path}' whose key is chosen by a keyId pointer"
                )));
            };
            match root.get(name) {
                Some(Bson::String(alt_name)) => KeyRef::AltName(alt_name.clone()),
                _ => {
                    return Err(Error::SchemaViolation(format!(
                        "keyId pointer '/{name}' of field '{path}' must name a string field"
                    )))
                }
            }
        }
    };

    let placeholder = Placeholder { key, algorithm: field.algorithm(), value: value.clone() };
    Ok(Bson::Binary(placeholder.to_binary()?))
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

/// Calls `visit` on every subtype 6 binary of a document, at any depth.
pub fn visit_encrypted_binaries<F, E>(doc: &Document, visit: &mut F) -> Result<(), E>
where
    F: FnMut(&Binary) -> Result<(), E>,
{
    doc.values().try_for_each(|value| visit_value(value, visit))
}

fn visit_value<F, E>(value: &Bson, visit: &mut F) -> Result<(), E>
where
    F: FnMut(&Binary) -> Result<(), E>,
{
    match value {
        Bson::Binary(binary) if binary.subtype == BinarySubtype::Encrypted => visit(binary),
        Bson::Document(doc) => visit_encrypted_binaries(doc, visit),
        Bson::Array(items) => items.iter().try_for_each(|item| visit_value(item, visit)),
        _ => Ok(()),
    }
}

/// Rebuilds a document, replacing every subtype 6 binary with what `rewrite` returns.
pub fn rewrite_encrypted_binaries<F>(doc: &Document, rewrite: &mut F) -> Result<Document, Error>
where
    F: FnMut(&Binary) -> Result<Bson, Error>,
{
    let mut rewritten = Document::new();
    for (name, value) in doc {
        rewritten.insert(name.clone(), rewrite_value(value, rewrite)?);
    }
    Ok(rewritten)
}

fn rewrite_value<F>(value: &Bson, rewrite: &mut F) -> Result<Bson, Error>
where
    F: FnMut(&Binary) -> Result<Bson, Error>,
{
    Ok(match value {
        Bson::Binary(binary) if binary.subtype == BinarySubtype::Encrypted => rewrite(binary)?,
        Bson::Document(doc) => Bson::Document(rewrite_encrypted_binaries(doc, rewrite)?),
        Bson::Array(items) => {
            Bson::Array(items.iter().map(|item| rewrite_value(item, rewrite)).collect::<Result<_, _>>()?)
        }
        other => other.clone(),
    })
}

/// Returns the distinct keys referenced by the placeholders of a document.
///
/// # Errors
///
/// Returns `Error::Encoding` if a placeholder is malformed.
pub fn placeholder_keys(doc: &Document) -> Result<Vec<KeyRef>, Error> {
    let mut keys = Vec::new();
    visit_encrypted_binaries(doc, &mut |binary| -> Result<(), Error> {
        if is_placeholder_binary(binary) {
            let key = Placeholder::from_binary(binary)?.key;
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(())
    })?;
    Ok(keys)
}

/// Returns the distinct key ids of the encrypted values of a document.
///
/// Binaries that fail to parse are skipped here and reported by the decrypt pass.
#[must_use]
pub fn encrypted_value_keys(doc: &Document) -> Vec<KeyRef> {
    let mut keys = Vec::new();
    visit_encrypted_binaries(doc, &mut |binary| -> Result<(), Infallible> {
        if is_encrypted_binary(binary) {
            if let Ok(value) = crate::value::EncryptedValue::from_bytes(&binary.bytes) {
                let key = KeyRef::Id(value.key_id());
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        Ok(())
    })
    .unwrap_or_else(|never| match never {});
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::Uuid;

    fn key_id() -> Uuid {
        Uuid::from_bytes([8; 16])
    }

    fn schema() -> EncryptionSchema {
        EncryptionSchema::parse(&doc! {
            "bsonType": "object",
            "properties": {
                "ssn": { "encrypt": { "keyId": [key_id()], "bsonType": "string", "algorithm": "Deterministic" } },
                "notes": { "encrypt": { "keyId": "/owner", "algorithm": "Random" } },
                "contact": {
                    "bsonType": "object",
                    "properties": {
                        "phone": { "encrypt": { "keyId": [key_id()], "bsonType": "string", "algorithm": "Deterministic" } },
                    },
                },
            },
        })
        .unwrap()
    }

    fn unwrap_placeholder(value: &Bson) -> Placeholder {
        match value {
            Bson::Binary(binary) => Placeholder::from_binary(binary).unwrap(),
            other => panic!("expected placeholder, got {other:?}"),
        }
    }

    #[test]
    fn test_placeholder_round_trip() {
        let placeholder = Placeholder {
            key: KeyRef::AltName("n".to_string()),
            algorithm: Algorithm::Random,
            value: Bson::Int64(5),
        };
        let binary = placeholder.to_binary().unwrap();

        assert_eq!(binary.bytes[0], PLACEHOLDER_MARKER);
        assert_eq!(Placeholder::from_binary(&binary).unwrap(), placeholder);
    }

    #[test]
    fn test_insert_marks_schema_fields_only() {
        let command = doc! {
            "insert": "people",
            "documents": [
                { "_id": 0, "ssn": "000", "name": "Ann", "owner": "n", "notes": { "a": 1 }, "contact": { "phone": "555", "city": "X" } },
            ],
        };

        let marked = mark_command(&command, &schema()).unwrap();
        let doc = marked.get_array("documents").unwrap()[0].as_document().unwrap();

        assert_eq!(doc.get_i32("_id").unwrap(), 0);
        assert_eq!(doc.get_str("name").unwrap(), "Ann");
        let ssn = unwrap_placeholder(doc.get("ssn").unwrap());
        assert_eq!(ssn.key, KeyRef::Id(key_id()));
        assert_eq!(ssn.algorithm, Algorithm::Deterministic);
        assert_eq!(ssn.value, Bson::String("000".into()));

        let notes = unwrap_placeholder(doc.get("notes").unwrap());
        assert_eq!(notes.key, KeyRef::AltName("n".into()));
        assert_eq!(notes.algorithm, Algorithm::Random);

        let contact = doc.get_document("contact").unwrap();
        assert_eq!(contact.get_str("city").unwrap(), "X");
        unwrap_placeholder(contact.get("phone").unwrap());

        assert_eq!(
            placeholder_keys(&marked).unwrap(),
            vec![KeyRef::Id(key_id()), KeyRef::AltName("n".into())]
        );
    }

    #[test]
    fn test_wrong_type_is_schema_violation() {
        let command = doc! { "insert": "people", "documents": [ { "ssn": 1 } ] };
        let err = mark_command(&command, &schema()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "schema violation: Cannot encrypt element of type int because schema requires that type is one of: [ string ]"
        );
    }

    #[test]
    fn test_already_encrypted_value_is_rejected() {
        let encrypted = crate::value::EncryptedValue::new(key_id(), Algorithm::Deterministic, vec![1; 32]);
        let command = doc! { "insert": "people", "documents": [ { "ssn": Bson::from(encrypted.clone()) } ] };

        let err = mark_command(&command, &schema()).unwrap_err();
        assert!(matches!(err, Error::SchemaViolation(ref m) if m.starts_with(
            "Cannot encrypt element of type binData because schema requires that type is one of: [ string ]"
        )));

        let command = doc! { "insert": "people", "documents": [ { "owner": "n", "notes": Bson::from(encrypted) } ] };
        assert!(matches!(mark_command(&command, &schema()), Err(Error::SchemaViolation(_))));
    }

    #[test]
    fn test_missing_pointer_target() {
        let command = doc! { "insert": "people", "documents": [ { "notes": "x" } ] };
        assert!(matches!(mark_command(&command, &schema()), Err(Error::SchemaViolation(_))));
    }

    #[test]
    fn test_array_where_object_expected() {
        let command = doc! { "insert": "people", "documents": [ { "contact": [ { "phone": "1" } ] } ] };
        assert!(matches!(mark_command(&command, &schema()), Err(Error::SchemaViolation(_))));
    }

    #[test]
    fn test_find_filter_operators() {
        let command = doc! {
            "find": "people",
            "filter": {
                "$or": [
                    { "ssn": "000" },
                    { "ssn": { "$in": ["111", "222"] } },
                    { "contact.phone": { "$ne": "555" } },
                ],
                "name": "Ann",
            },
        };

        let marked = mark_command(&command, &schema()).unwrap();
        let filter = marked.get_document("filter").unwrap();
        let clauses = filter.get_array("$or").unwrap();

        unwrap_placeholder(clauses[0].as_document().unwrap().get("ssn").unwrap());
        let in_values = clauses[1].as_document().unwrap().get_document("ssn").unwrap().get_array("$in").unwrap();
        assert_eq!(in_values.len(), 2);
        unwrap_placeholder(&in_values[1]);
        let ne = clauses[2].as_document().unwrap().get_document("contact.phone").unwrap();
        unwrap_placeholder(ne.get("$ne").unwrap());
        assert_eq!(filter.get_str("name").unwrap(), "Ann");
        assert_eq!(placeholder_keys(&marked).unwrap(), vec![KeyRef::Id(key_id())]);
    }

    #[test]
    fn test_query_restrictions() {
        let schema = schema();
        let random = doc! { "find": "people", "filter": { "notes": "x" } };
        assert!(matches!(mark_command(&random, &schema), Err(Error::SchemaViolation(_))));

        let range = doc! { "find": "people", "filter": { "ssn": { "$gt": "000" } } };
        assert!(matches!(mark_command(&range, &schema), Err(Error::SchemaViolation(_))));

        let nested = doc! { "find": "people", "filter": { "ssn.x": 1 } };
        assert!(matches!(mark_command(&nested, &schema), Err(Error::SchemaViolation(_))));

        let exists = doc! { "find": "people", "filter": { "ssn": { "$exists": true } } };
        assert!(mark_command(&exists, &schema).is_ok());
    }

    #[test]
    fn test_update_forms() {
        let schema = schema();
        let command = doc! {
            "update": "people",
            "updates": [
                { "q": { "ssn": "000" }, "u": { "$set": { "ssn": "111", "contact.phone": "555" }, "$inc": { "visits": 1 } } },
                { "q": { "_id": 1 }, "u": { "ssn": "222", "name": "Bob" } },
            ],
        };

        let marked = mark_command(&command, &schema).unwrap();
        let updates = marked.get_array("updates").unwrap();
        let first = updates[0].as_document().unwrap();
        unwrap_placeholder(first.get_document("q").unwrap().get("ssn").unwrap());
        let set = first.get_document("u").unwrap().get_document("$set").unwrap();
        unwrap_placeholder(set.get("ssn").unwrap());
        unwrap_placeholder(set.get("contact.phone").unwrap());

        let replacement = updates[1].as_document().unwrap().get_document("u").unwrap();
        unwrap_placeholder(replacement.get("ssn").unwrap());
        assert_eq!(replacement.get_str("name").unwrap(), "Bob");

        let inc = doc! { "update": "people", "updates": [ { "q": {}, "u": { "$inc": { "ssn": 1 } } } ] };
        assert!(matches!(mark_command(&inc, &schema), Err(Error::SchemaViolation(_))));
    }

    #[test]
    fn test_aggregate_match_and_other_commands() {
        let schema = schema();
        let command = doc! {
            "aggregate": "people",
            "pipeline": [ { "$match": { "ssn": "000" } }, { "$project": { "ssn": 1 } } ],
            "cursor": {},
        };
        let marked = mark_command(&command, &schema).unwrap();
        let pipeline = marked.get_array("pipeline").unwrap();
        unwrap_placeholder(pipeline[0].as_document().unwrap().get_document("$match").unwrap().get("ssn").unwrap());
        assert_eq!(pipeline[1], Bson::Document(doc! { "$project": { "ssn": 1 } }));

        let ping = doc! { "ping": 1 };
        assert_eq!(mark_command(&ping, &schema).unwrap(), ping);
    }

    #[test]
    fn test_unencryptable_value() {
        let schema = EncryptionSchema::parse(&doc! {
            "properties": { "any": { "encrypt": { "keyId": [key_id()], "algorithm": "Random" } } },
        })
        .unwrap();
        let command = doc! { "insert": "c", "documents": [ { "any": Bson::MinKey } ] };
        assert!(matches!(mark_command(&command, &schema), Err(Error::Encoding(_))));
    }

    #[test]
    fn test_encrypted_value_keys() {
        let value = crate::value::EncryptedValue::new(key_id(), Algorithm::Random, vec![0; 16]);
        let doc = doc! {
            "a": Bson::from(value.clone()),
            "nested": { "list": [ Bson::from(value) ] },
            "plain": "x",
        };
        assert_eq!(encrypted_value_keys(&doc), vec![KeyRef::Id(key_id())]);
        assert!(encrypted_value_keys(&doc! { "plain": 1 }).is_empty());
    }

    #[test]
    fn test_encrypted_value_keys_skips_malformed_values() {
        let value = crate::value::EncryptedValue::new(key_id(), Algorithm::Random, vec![0; 16]);
        let truncated = Binary { subtype: BinarySubtype::Encrypted, bytes: vec![1, 2, 3] };
        let doc = doc! { "bad": Bson::Binary(truncated), "good": Bson::from(value) };

        assert_eq!(encrypted_value_keys(&doc), vec![KeyRef::Id(key_id())]);
    }

    #[test]
    fn test_marked_commands_cover_both_find_and_modify_spellings() {
        let schema = schema();
        for name in ["findAndModify", "findandmodify"] {
            assert!(is_marked_command(name));
            let mut command = Document::new();
            command.insert(name, "people");
            command.insert("query", doc! { "ssn": "000" });
            command.insert("update", doc! { "$set": { "ssn": "111" } });

            let marked = mark_command(&command, &schema).unwrap();
            unwrap_placeholder(marked.get_document("query").unwrap().get("ssn").unwrap());
            unwrap_placeholder(marked.get_document("update").unwrap().get_document("$set").unwrap().get("ssn").unwrap());
        }
        assert!(!is_marked_command("listCollections"));
    }
}
