//! # Shared Types Crate
//!
//! This crate contains the envelope that wraps every message on the bus, the
//! typed success/error reply envelope, the schemas payloads are checked
//! against, and the validation engine that enforces them.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: All wire types are defined here.
//! - **Envelope Integrity**: `Envelope<T>` and `ReplyEnvelope<T>` are the only
//!   shapes exchanged on the bus.
//! - **Registries Are Configuration**: schema registries are built once per
//!   manager and never mutated afterwards. There is no global registry.
//!
//! ## Validation Chain
//!
//! ```text
//! raw value ──→ base envelope schema ──✗──→ SchemaError(Envelope)
//!                      │
//!                      ✓
//!                      ▼
//!               payload schema(data) ──✗──→ SchemaError(Payload)
//!                      │
//!                      ✓
//!                      ▼
//!                    Ok(())
//! ```

pub mod envelope;
pub mod errors;
pub mod registry;
pub mod schema;
pub mod trace_context;
pub mod validation;

pub use envelope::{
    BaseEnvelope, Draft, Envelope, EnvelopeFactory, ErrorCode, InstanceId, ReplyBody,
    ReplyEnvelope, ReplyError, ReplyKind, INTERNAL_ERROR, PAYLOAD_VALIDATION,
};
pub use errors::{SchemaError, ValidationStage};
pub use registry::{RegistryError, RequestReplyDefinition, RequestReplyRegistry, SchemaRegistry};
pub use schema::{
    AnySchema, EnvelopeSchema, FnSchema, ReplyEnvelopeSchema, Schema, SchemaRef, TypedSchema,
};
pub use trace_context::PropagatedContext;
pub use validation::Validator;

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
