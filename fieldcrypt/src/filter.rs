//! Minimal query filter evaluation for key vault lookups.
//!
//! Supports the subset of the query language the key vault store emits:
//! field equality (with array containment), `$eq`, `$in`, `$and` and `$or`.
//! Dotted paths descend into embedded documents.

use bson::{Bson, Document};

/// Returns whether `doc` matches `filter`.
///
/// Unknown operators never match.
#[must_use]
pub fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, condition)| match key.as_str() {
        "$and" => clauses(condition).is_some_and(|mut c| c.all(|f| matches(doc, f))),
        "$or" => clauses(condition).is_some_and(|mut c| c.any(|f| matches(doc, f))),
        _ => field_matches(lookup(doc, key), condition),
    })
}

fn clauses(condition: &Bson) -> Option<impl Iterator<Item = &Document>> {
    match condition {
        Bson::Array(items) => Some(items.iter().filter_map(Bson::as_document)),
        _ => None,
    }
}

fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_document()?.get(part)?;
    }
    Some(current)
}

fn field_matches(value: Option<&Bson>, condition: &Bson) -> bool {
    match condition {
        Bson::Document(operators) if is_operator_document(operators) => {
            operators.iter().all(|(op, operand)| match op.as_str() {
                "$eq" => equals(value, operand),
                "$in" => match operand {
                    Bson::Array(candidates) => candidates.iter().any(|c| equals(value, c)),
                    _ => false,
                },
                _ => false,
            })
        }
        _ => equals(value, condition),
    }
}

fn is_operator_document(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|key| key.starts_with('$'))
}

fn equals(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        None => matches!(expected, Bson::Null),
        Some(Bson::Array(items)) if !matches!(expected, Bson::Array(_)) => {
            items.iter().any(|item| item == expected)
        }
        Some(actual) => actual == expected,
    }
}
