//! Two-stage envelope validation.
//!
//! The base envelope schema runs first and short-circuits: a payload check is
//! meaningless when the header is malformed. With enforcement switched off
//! both stages still run and failures are only logged.

use serde_json::Value;
use tracing::warn;

use crate::errors::{SchemaError, ValidationStage};
use crate::schema::Schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validator {
    enforce: bool,
}

impl Validator {
    pub fn new(enforce: bool) -> Self {
        Self { enforce }
    }

    pub fn enforcing() -> Self {
        Self::new(true)
    }

    /// Validate-but-ignore mode.
    pub fn lax() -> Self {
        Self::new(false)
    }

    pub fn is_enforcing(&self) -> bool {
        self.enforce
    }

    /// Validate `envelope` against `base`, then its `data` against `payload`.
    pub fn validate(
        &self,
        envelope: &Value,
        base: &dyn Schema,
        payload: Option<&dyn Schema>,
    ) -> Result<(), SchemaError> {
        match check(envelope, base, payload) {
            Ok(()) => Ok(()),
            Err(err) if self.enforce => Err(err),
            Err(err) => {
                warn!(
                    subject = %err.subject,
                    stage = %err.stage,
                    violations = ?err.violations,
                    "Schema validation failed; enforcement disabled, continuing"
                );
                Ok(())
            }
        }
    }

    /// Validate a bare value (no envelope) against a single schema.
    pub fn validate_value(
        &self,
        subject: &str,
        value: &Value,
        schema: &dyn Schema,
    ) -> Result<(), SchemaError> {
        match schema.validate(value) {
            Ok(()) => Ok(()),
            Err(violations) => {
                let err = SchemaError::new(subject, ValidationStage::Payload, violations);
                if self.enforce {
                    Err(err)
                } else {
                    warn!(
                        subject,
                        violations = ?err.violations,
                        "Schema validation failed; enforcement disabled, continuing"
                    );
                    Ok(())
                }
            }
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::enforcing()
    }
}

fn check(
    envelope: &Value,
    base: &dyn Schema,
    payload: Option<&dyn Schema>,
) -> Result<(), SchemaError> {
    let subject = envelope
        .get("subject")
        .and_then(Value::as_str)
        .unwrap_or("<unknown>");

    base.validate(envelope)
        .map_err(|violations| SchemaError::new(subject, ValidationStage::Envelope, violations))?;

    if let Some(payload) = payload {
        let data = envelope.get("data").unwrap_or(&Value::Null);
        payload
            .validate(data)
            .map_err(|violations| SchemaError::new(subject, ValidationStage::Payload, violations))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{self, EnvelopeSchema};
    use serde_json::json;

    fn envelope(data: Value) -> Value {
        json!({
            "id": "1", "subject": "foo.bar", "date": 1, "service": "svc",
            "instance": "i", "data": data
        })
    }

    #[test]
    fn test_valid_envelope_and_payload() {
        let payload = schema::typed::<u32>();
        let result = Validator::enforcing().validate(
            &envelope(json!(3)),
            &EnvelopeSchema,
            Some(payload.as_ref()),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_base_failure_short_circuits() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = calls.clone();
        let payload = schema::from_fn(move |_| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });

        let err = Validator::enforcing()
            .validate(&json!({"subject": "foo.bar"}), &EnvelopeSchema, Some(payload.as_ref()))
            .unwrap_err();

        assert_eq!(err.stage, ValidationStage::Envelope);
        assert_eq!(err.subject, "foo.bar");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_payload_failure() {
        let payload = schema::typed::<u32>();
        let err = Validator::enforcing()
            .validate(&envelope(json!("three")), &EnvelopeSchema, Some(payload.as_ref()))
            .unwrap_err();
        assert_eq!(err.stage, ValidationStage::Payload);
    }

    #[test]
    fn test_lax_mode_ignores_failures() {
        let payload = schema::typed::<u32>();
        let validator = Validator::lax();
        assert!(validator
            .validate(&envelope(json!("three")), &EnvelopeSchema, Some(payload.as_ref()))
            .is_ok());
        assert!(validator.validate(&json!(null), &EnvelopeSchema, None).is_ok());
    }

    #[test]
    fn test_validate_value() {
        let schema = schema::typed::<String>();
        let validator = Validator::enforcing();
        assert!(validator.validate_value("x", &json!("ok"), schema.as_ref()).is_ok());
        assert!(validator.validate_value("x", &json!(1), schema.as_ref()).is_err());
    }
}
