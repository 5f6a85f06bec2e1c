//! # Schemas
//!
//! A schema decides whether a JSON value has the shape a subject promises.
//! Payload schemas are registered per subject; the two envelope schemas check
//! the machine-generated header every message must carry.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// A validator for one JSON shape.
pub trait Schema: Send + Sync {
    /// Check `value`, returning every violation found.
    fn validate(&self, value: &Value) -> Result<(), Vec<String>>;
}

/// Shared handle to a schema, as stored in registries.
pub type SchemaRef = Arc<dyn Schema>;

/// Schema satisfied by any value that deserializes into `T`.
pub struct TypedSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedSchema<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TypedSchema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypedSchema<{}>", std::any::type_name::<T>())
    }
}

impl<T: DeserializeOwned> Schema for TypedSchema<T> {
    fn validate(&self, value: &Value) -> Result<(), Vec<String>> {
        T::deserialize(value).map(|_| ()).map_err(|e| vec![e.to_string()])
    }
}

/// Schema backed by a closure.
pub struct FnSchema<F> {
    check: F,
}

impl<F> FnSchema<F>
where
    F: Fn(&Value) -> Result<(), String> + Send + Sync,
{
    pub fn new(check: F) -> Self {
        Self { check }
    }
}

impl<F> Schema for FnSchema<F>
where
    F: Fn(&Value) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, value: &Value) -> Result<(), Vec<String>> {
        (self.check)(value).map_err(|violation| vec![violation])
    }
}

/// Schema that accepts every value.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnySchema;

impl Schema for AnySchema {
    fn validate(&self, _value: &Value) -> Result<(), Vec<String>> {
        Ok(())
    }
}

/// Shared schema for payloads that must deserialize into `T`.
pub fn typed<T: DeserializeOwned + 'static>() -> SchemaRef {
    Arc::new(TypedSchema::<T>::new())
}

/// Shared schema from a closure.
pub fn from_fn<F>(check: F) -> SchemaRef
where
    F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
{
    Arc::new(FnSchema::new(check))
}

/// Shared schema that accepts everything.
pub fn any() -> SchemaRef {
    Arc::new(AnySchema)
}

/// Base shape of a data envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeSchema;

impl Schema for EnvelopeSchema {
    fn validate(&self, value: &Value) -> Result<(), Vec<String>> {
        let Some(object) = value.as_object() else {
            return Err(vec!["envelope must be an object".to_string()]);
        };

        let mut violations = header_violations(object);
        if !object.contains_key("data") {
            violations.push("missing field 'data'".to_string());
        }

        finish(violations)
    }
}

/// Base shape of a reply envelope: header plus a consistent `type`/body pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyEnvelopeSchema;

impl Schema for ReplyEnvelopeSchema {
    fn validate(&self, value: &Value) -> Result<(), Vec<String>> {
        let Some(object) = value.as_object() else {
            return Err(vec!["reply envelope must be an object".to_string()]);
        };

        let mut violations = header_violations(object);
        match object.get("type").and_then(Value::as_str) {
            Some("success") => {
                if !object.contains_key("data") {
                    violations.push("success reply is missing 'data'".to_string());
                }
                if object.contains_key("error") {
                    violations.push("success reply must not carry 'error'".to_string());
                }
            }
            Some("error") => {
                if object.contains_key("data") {
                    violations.push("error reply must not carry 'data'".to_string());
                }
                match object.get("error").and_then(Value::as_object) {
                    Some(error) => match error.get("code") {
                        Some(Value::String(code)) if !code.is_empty() => {}
                        Some(Value::Number(code)) if code.is_i64() => {}
                        _ => violations.push(
                            "'error.code' must be a non-empty string or an integer".to_string(),
                        ),
                    },
                    None => violations.push("error reply is missing 'error' object".to_string()),
                }
            }
            Some(other) => violations.push(format!("unknown reply type '{other}'")),
            None => violations.push("missing field 'type'".to_string()),
        }

        finish(violations)
    }
}

fn header_violations(object: &Map<String, Value>) -> Vec<String> {
    let mut violations = Vec::new();

    for field in ["id", "subject", "service"] {
        match object.get(field) {
            Some(Value::String(s)) if !s.is_empty() => {}
            Some(Value::String(_)) => violations.push(format!("'{field}' must not be empty")),
            Some(_) => violations.push(format!("'{field}' must be a string")),
            None => violations.push(format!("missing field '{field}'")),
        }
    }

    match object.get("date") {
        Some(Value::Number(n)) if n.is_u64() => {}
        Some(_) => violations.push("'date' must be a millisecond timestamp".to_string()),
        None => violations.push("missing field 'date'".to_string()),
    }

    match object.get("instance") {
        Some(Value::String(s)) if !s.is_empty() => {}
        Some(Value::Number(n)) if n.is_u64() => {}
        Some(_) => violations.push("'instance' must be a non-empty string or a number".to_string()),
        None => violations.push("missing field 'instance'".to_string()),
    }

    match object.get("traceContext") {
        None | Some(Value::Null) => {}
        Some(Value::Object(ctx)) => {
            for field in ["traceId", "spanId"] {
                if !ctx.get(field).is_some_and(Value::is_string) {
                    violations.push(format!("'traceContext.{field}' must be a string"));
                }
            }
        }
        Some(_) => violations.push("'traceContext' must be an object".to_string()),
    }

    violations
}

fn finish(violations: Vec<String>) -> Result<(), Vec<String>> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct Order {
        id: u32,
        sku: String,
    }

    fn header() -> Value {
        json!({
            "id": "a", "subject": "orders.created", "date": 1_700_000_000_000u64,
            "service": "svc", "instance": "i-1"
        })
    }

    fn with(mut value: Value, key: &str, field: Value) -> Value {
        value[key] = field;
        value
    }

    #[test]
    fn test_typed_schema() {
        let schema = TypedSchema::<Order>::new();
        assert!(schema.validate(&json!({"id": 1, "sku": "x"})).is_ok());
        assert!(schema.validate(&json!({"id": "one"})).is_err());
    }

    #[test]
    fn test_fn_schema() {
        let schema = from_fn(|v| {
            v.as_i64()
                .filter(|n| *n >= 0)
                .map(|_| ())
                .ok_or_else(|| "expected a non-negative integer".to_string())
        });
        assert!(schema.validate(&json!(3)).is_ok());
        assert_eq!(
            schema.validate(&json!(-3)),
            Err(vec!["expected a non-negative integer".to_string()])
        );
    }

    #[test]
    fn test_envelope_schema_accepts_valid() {
        let value = with(header(), "data", json!({"any": "thing"}));
        assert!(EnvelopeSchema.validate(&value).is_ok());
    }

    #[test]
    fn test_envelope_schema_collects_violations() {
        let value = json!({"id": "", "subject": 3, "date": "today", "data": null});
        let violations = EnvelopeSchema.validate(&value).unwrap_err();
        assert!(violations.contains(&"'id' must not be empty".to_string()));
        assert!(violations.contains(&"'subject' must be a string".to_string()));
        assert!(violations.contains(&"missing field 'service'".to_string()));
        assert!(violations.contains(&"missing field 'instance'".to_string()));
        assert!(violations.contains(&"'date' must be a millisecond timestamp".to_string()));
    }

    #[test]
    fn test_envelope_schema_requires_data_key() {
        let violations = EnvelopeSchema.validate(&header()).unwrap_err();
        assert_eq!(violations, vec!["missing field 'data'".to_string()]);
    }

    #[test]
    fn test_envelope_schema_rejects_malformed_trace_context() {
        let value = with(with(header(), "data", json!(1)), "traceContext", json!({"traceId": 1}));
        assert!(EnvelopeSchema.validate(&value).is_err());
    }

    #[test]
    fn test_reply_schema() {
        let ok = with(with(header(), "type", json!("success")), "data", json!(20));
        assert!(ReplyEnvelopeSchema.validate(&ok).is_ok());

        let err = with(
            with(header(), "type", json!("error")),
            "error",
            json!({"code": "YO", "data": "error"}),
        );
        assert!(ReplyEnvelopeSchema.validate(&err).is_ok());

        let both = with(err.clone(), "data", json!(1));
        assert!(ReplyEnvelopeSchema.validate(&both).is_err());

        let unknown = with(header(), "type", json!("maybe"));
        assert!(ReplyEnvelopeSchema.validate(&unknown).is_err());
    }
}
