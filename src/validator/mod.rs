//! JSON-Schema validator (C2).
//!
//! Schemas are registered eagerly (by `$id`, e.g. `urn:BootNotification.req`)
//! but compiled lazily on first [`SchemaSet::validate`] call, matching the
//! teacher's "lazy compile, shared by `$id`" pattern seen in
//! `license::LicenseInfo` caching and `plugins::manager::PluginManager`'s
//! deferred load. A process-wide registry (`SCHEMA_REGISTRY`) deduplicates
//! compiled sets by subprotocol so multiple servers share one compiled set,
//! mirroring `once_cell`-backed global caches used across the corpus.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use jsonschema::Validator;
use serde_json::Value;

use crate::error::{RpcError, RpcErrorKind};

/// Maps a first-failing JSON-Schema keyword to the OCPP error it represents
/// (spec §4.1, authoritative table). A plain closed lookup table — not
/// runtime reflection (spec §9 design note).
fn keyword_to_ocpp_error(keyword: &str) -> RpcErrorKind {
    match keyword {
        "type" => RpcErrorKind::TypeConstraintViolation,
        "required" | "minItems" | "maxItems" | "minProperties" | "maxProperties"
        | "additionalProperties" | "additionalItems" | "exclusiveMinimum"
        | "exclusiveMaximum" | "multipleOf" => RpcErrorKind::OccurrenceConstraintViolation,
        "enum" | "const" => RpcErrorKind::PropertyConstraintViolation,
        "minLength" | "maxLength" | "minimum" | "maximum" | "pattern" | "format" | "anyOf"
        | "oneOf" | "not" | "if" => RpcErrorKind::FormatViolation,
        _ => RpcErrorKind::FormatViolation,
    }
}

/// A lazily compiled schema, keyed by its `$id`.
enum SchemaEntry {
    Raw(Value),
    Compiled(Arc<Validator>),
}

/// A subprotocol-tagged set of schemas, indexed by `$id`.
pub struct SchemaSet {
    schemas: RwLock<HashMap<String, SchemaEntry>>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
        }
    }

    /// Register a schema under `schema_id` (e.g. `urn:Heartbeat.req`).
    /// Registration is eager (stored immediately); compilation happens on
    /// first `validate()` call for that id.
    pub fn register(&self, schema_id: impl Into<String>, schema: Value) {
        self.schemas
            .write()
            .expect("schema set lock poisoned")
            .insert(schema_id.into(), SchemaEntry::Raw(schema));
    }

    pub fn has_schema(&self, schema_id: &str) -> bool {
        self.schemas
            .read()
            .expect("schema set lock poisoned")
            .contains_key(schema_id)
    }

    /// Validate `payload` against the schema registered under `schema_id`.
    ///
    /// Returns `Ok(())` when the schema is missing (not all actions are
    /// validated) or the payload is valid. Returns the first keyword
    /// failure mapped to its OCPP error kind otherwise.
    pub fn validate(&self, schema_id: &str, payload: &Value) -> Result<(), RpcError> {
        let compiled = match self.compiled_for(schema_id) {
            Some(c) => c,
            None => return Ok(()), // missing schema -> skip
        };

        if let Some(err) = compiled.iter_errors(payload).next() {
            let keyword = keyword_name(&err);
            let kind = keyword_to_ocpp_error(keyword);
            return Err(RpcError::new(kind, err.to_string()));
        }
        Ok(())
    }

    /// Get (compiling on first access) the [`Validator`] for `schema_id`.
    fn compiled_for(&self, schema_id: &str) -> Option<Arc<Validator>> {
        {
            let schemas = self.schemas.read().expect("schema set lock poisoned");
            match schemas.get(schema_id)? {
                SchemaEntry::Compiled(v) => return Some(v.clone()),
                SchemaEntry::Raw(_) => {}
            }
        }

        let mut schemas = self.schemas.write().expect("schema set lock poisoned");
        // Re-check: another task may have compiled it while we waited for the write lock.
        match schemas.get(schema_id)? {
            SchemaEntry::Compiled(v) => return Some(v.clone()),
            SchemaEntry::Raw(raw) => {
                let compiled = jsonschema::validator_for(raw)
                    .unwrap_or_else(|e| panic!("invalid schema `{schema_id}`: {e}"));
                let compiled = Arc::new(compiled);
                schemas.insert(schema_id.to_string(), SchemaEntry::Compiled(compiled.clone()));
                Some(compiled)
            }
        }
    }
}

impl Default for SchemaSet {
    fn default() -> Self {
        Self::new()
    }
}

fn keyword_name(err: &jsonschema::ValidationError<'_>) -> &'static str {
    // jsonschema's ValidationError carries a `kind` enum; we map its Debug
    // discriminant name back to a JSON-Schema keyword string for the table
    // above. This indirection keeps `keyword_to_ocpp_error` a pure string
    // lookup table independent of the validator crate's internal types.
    use jsonschema::error::ValidationErrorKind::*;
    match &err.kind {
        Type { .. } => "type",
        Required { .. } => "required",
        MinItems { .. } => "minItems",
        MaxItems { .. } => "maxItems",
        MinProperties { .. } => "minProperties",
        MaxProperties { .. } => "maxProperties",
        AdditionalProperties { .. } => "additionalProperties",
        AdditionalItems { .. } => "additionalItems",
        Minimum { .. } => "minimum",
        Maximum { .. } => "maximum",
        ExclusiveMinimum { .. } => "exclusiveMinimum",
        ExclusiveMaximum { .. } => "exclusiveMaximum",
        MultipleOf { .. } => "multipleOf",
        Enum { .. } => "enum",
        Constant { .. } => "const",
        MinLength { .. } => "minLength",
        MaxLength { .. } => "maxLength",
        Pattern { .. } => "pattern",
        Format { .. } => "format",
        AnyOf { .. } => "anyOf",
        OneOfMultipleValid { .. } | OneOfNotValid { .. } => "oneOf",
        Not { .. } => "not",
        _ => "unknown",
    }
}

/// Process-wide registry deduplicating compiled [`SchemaSet`]s by
/// subprotocol, so multiple `Server`/`Connection` instances in the same
/// process share one compiled set rather than recompiling per connection.
static SCHEMA_REGISTRY: Lazy<RwLock<HashMap<String, Arc<SchemaSet>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub fn shared_schema_set(subprotocol: &str) -> Arc<SchemaSet> {
    {
        let read = SCHEMA_REGISTRY.read().expect("schema registry lock poisoned");
        if let Some(set) = read.get(subprotocol) {
            return set.clone();
        }
    }
    let mut write = SCHEMA_REGISTRY.write().expect("schema registry lock poisoned");
    write
        .entry(subprotocol.to_string())
        .or_insert_with(|| Arc::new(SchemaSet::new()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_schema_skips_validation() {
        let set = SchemaSet::new();
        assert!(set.validate("urn:Unknown.req", &json!({})).is_ok());
    }

    #[test]
    fn type_violation_maps_correctly() {
        let set = SchemaSet::new();
        set.register(
            "urn:Heartbeat.req",
            json!({"type": "object", "properties": {"x": {"type": "integer"}}}),
        );
        let err = set
            .validate("urn:Heartbeat.req", &json!({"x": "not an int"}))
            .unwrap_err();
        assert!(matches!(err.kind, RpcErrorKind::TypeConstraintViolation));
    }

    #[test]
    fn required_violation_maps_to_occurrence() {
        let set = SchemaSet::new();
        set.register(
            "urn:BootNotification.req",
            json!({"type": "object", "required": ["chargePointVendor"]}),
        );
        let err = set
            .validate("urn:BootNotification.req", &json!({}))
            .unwrap_err();
        assert!(matches!(
            err.kind,
            RpcErrorKind::OccurrenceConstraintViolation
        ));
    }

    #[test]
    fn enum_violation_maps_to_property_constraint() {
        let set = SchemaSet::new();
        set.register(
            "urn:Reset.req",
            json!({"type": "object", "properties": {"type": {"enum": ["Hard", "Soft"]}}}),
        );
        let err = set
            .validate("urn:Reset.req", &json!({"type": "Medium"}))
            .unwrap_err();
        assert!(matches!(
            err.kind,
            RpcErrorKind::PropertyConstraintViolation
        ));
    }

    #[test]
    fn pattern_violation_maps_to_format() {
        let set = SchemaSet::new();
        set.register(
            "urn:X.req",
            json!({"type": "object", "properties": {"id": {"pattern": "^[A-Z]+$"}}}),
        );
        let err = set
            .validate("urn:X.req", &json!({"id": "lowercase"}))
            .unwrap_err();
        assert!(matches!(err.kind, RpcErrorKind::FormatViolation));
    }
}
