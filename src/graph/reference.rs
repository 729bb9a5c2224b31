//! Attribute references between resources.
//!
//! A string attribute may mention another resource as `${id}` (its provider
//! identifier) or `${id.field}` (a field of its outputs, dotted for nesting).
//! A string that is exactly one reference is replaced by the referenced value
//! as-is; references embedded in longer strings are interpolated as text.

use serde_json::Value;
use std::collections::BTreeSet;

use crate::config::Attributes;
use crate::error::{ProviderError, ProviderResult};
use crate::state::EnvironmentState;

/// A parsed `${...}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Referenced resource id.
    pub id: String,
    /// Field path inside the referenced resource, empty for the provider id.
    pub path: Vec<String>,
}

impl Reference {
    fn parse(token: &str) -> Option<Self> {
        let mut parts = token.trim().split('.');
        let id = parts.next().filter(|s| !s.is_empty())?;
        let path: Vec<String> = parts.map(str::to_string).collect();
        if path.iter().any(String::is_empty) {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            path,
        })
    }
}

/// Splits a string into literal text and references.
fn segments(s: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        let token = &rest[start + 2..start + 2 + len];
        if let Some(reference) = Reference::parse(token) {
            if start > 0 {
                out.push(Segment::Text(&rest[..start]));
            }
            out.push(Segment::Ref(reference));
        } else {
            out.push(Segment::Text(&rest[..start + 3 + len]));
        }
        rest = &rest[start + 3 + len..];
    }

    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }
    out
}

enum Segment<'a> {
    Text(&'a str),
    Ref(Reference),
}

/// Collects every reference in an attribute map.
#[must_use]
pub fn references_in(attributes: &Attributes) -> Vec<Reference> {
    let mut found = Vec::new();
    for value in attributes.values() {
        collect(value, &mut found);
    }
    found
}

/// Collects the ids referenced by an attribute map.
#[must_use]
pub fn referenced_ids(attributes: &Attributes) -> BTreeSet<String> {
    references_in(attributes).into_iter().map(|r| r.id).collect()
}

fn collect(value: &Value, found: &mut Vec<Reference>) {
    match value {
        Value::String(s) => {
            for segment in segments(s) {
                if let Segment::Ref(reference) = segment {
                    found.push(reference);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect(v, found)),
        _ => {}
    }
}

/// Replaces references in `attributes` with values from the recorded state.
///
/// # Errors
///
/// Returns [`ProviderError::InvalidSpec`] if a referenced resource has no
/// provider id yet or lacks the referenced field.
pub fn resolve_references(attributes: &Attributes, state: &EnvironmentState) -> ProviderResult<Attributes> {
    attributes
        .iter()
        .map(|(key, value)| Ok::<_, ProviderError>((key.clone(), resolve_value(value, state)?)))
        .collect()
}

fn resolve_value(value: &Value, state: &EnvironmentState) -> ProviderResult<Value> {
    match value {
        Value::String(s) => {
            let parts = segments(s);
            if let [Segment::Ref(reference)] = parts.as_slice() {
                return lookup(reference, state);
            }
            if !parts.iter().any(|p| matches!(p, Segment::Ref(_))) {
                return Ok(value.clone());
            }

            let mut out = String::new();
            for part in parts {
                match part {
                    Segment::Text(text) => out.push_str(text),
                    Segment::Ref(reference) => match lookup(&reference, state)? {
                        Value::String(s) => out.push_str(&s),
                        other => out.push_str(&other.to_string()),
                    },
                }
            }
            Ok(Value::String(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, state))
            .collect::<ProviderResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok::<_, ProviderError>((k.clone(), resolve_value(v, state)?)))
            .collect::<ProviderResult<serde_json::Map<_, _>>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn lookup(reference: &Reference, state: &EnvironmentState) -> ProviderResult<Value> {
    let record = state.record(&reference.id).ok_or_else(|| {
        ProviderError::invalid_spec(format!("reference to unknown resource '{}'", reference.id))
    })?;

    let Some((first, rest)) = reference.path.split_first() else {
        return record
            .provider_id
            .clone()
            .map(Value::String)
            .ok_or_else(|| {
                ProviderError::invalid_spec(format!("resource '{}' has no provider id yet", reference.id))
            });
    };

    let root = record
        .outputs
        .get(first)
        .or_else(|| record.attributes.get(first))
        .ok_or_else(|| missing_field(reference))?;

    rest.iter()
        .try_fold(root, |value, key| value.get(key.as_str()))
        .cloned()
        .ok_or_else(|| missing_field(reference))
}

fn missing_field(reference: &Reference) -> ProviderError {
    ProviderError::invalid_spec(format!(
        "resource '{}' has no field '{}'",
        reference.id,
        reference.path.join(".")
    ))
}
