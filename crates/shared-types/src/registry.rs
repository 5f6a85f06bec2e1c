//! # Schema Registries
//!
//! Per-manager subject tables. A registry is assembled with its builder when
//! a manager is constructed and is read-only afterwards.
//!
//! - `SchemaRegistry`: subject → payload schema (publish/subscribe, durable consumer)
//! - `RequestReplyRegistry`: subject → request schema, reply schema and
//!   per-error-code schemas

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::envelope::ErrorCode;
use crate::schema::{Schema, SchemaRef};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no schema registered for subject '{0}'")]
    UnknownSubject(String),
}

/// Immutable subject → payload schema table.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    subjects: Arc<HashMap<String, SchemaRef>>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::default()
    }

    /// Look up the payload schema of `subject`.
    pub fn get(&self, subject: &str) -> Result<&SchemaRef, RegistryError> {
        self.subjects
            .get(subject)
            .ok_or_else(|| RegistryError::UnknownSubject(subject.to_string()))
    }

    pub fn contains(&self, subject: &str) -> bool {
        self.subjects.contains_key(subject)
    }

    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.subjects.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.subjects.keys()).finish()
    }
}

#[derive(Default)]
pub struct SchemaRegistryBuilder {
    subjects: HashMap<String, SchemaRef>,
}

impl SchemaRegistryBuilder {
    /// Register `schema` for `subject`. A later registration replaces an earlier one.
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>, schema: SchemaRef) -> Self {
        self.subjects.insert(subject.into(), schema);
        self
    }

    /// Register any concrete schema value.
    #[must_use]
    pub fn schema<S: Schema + 'static>(self, subject: impl Into<String>, schema: S) -> Self {
        self.subject(subject, Arc::new(schema))
    }

    pub fn build(self) -> SchemaRegistry {
        SchemaRegistry {
            subjects: Arc::new(self.subjects),
        }
    }
}

/// Contract of one request/reply subject.
#[derive(Clone)]
pub struct RequestReplyDefinition {
    pub request: SchemaRef,
    pub reply: SchemaRef,
    pub errors: HashMap<ErrorCode, SchemaRef>,
}

impl RequestReplyDefinition {
    pub fn new(request: SchemaRef, reply: SchemaRef) -> Self {
        Self {
            request,
            reply,
            errors: HashMap::new(),
        }
    }

    /// Declare the shape of `error.data` for one error code.
    #[must_use]
    pub fn error(mut self, code: impl Into<ErrorCode>, schema: SchemaRef) -> Self {
        self.errors.insert(code.into(), schema);
        self
    }

    /// Schema for an error code, if one was declared.
    pub fn error_schema(&self, code: &ErrorCode) -> Option<&SchemaRef> {
        self.errors.get(code)
    }
}

impl std::fmt::Debug for RequestReplyDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestReplyDefinition")
            .field("errors", &self.errors.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Immutable subject → request/reply contract table.
#[derive(Clone, Default)]
pub struct RequestReplyRegistry {
    subjects: Arc<HashMap<String, RequestReplyDefinition>>,
}

impl RequestReplyRegistry {
    #[must_use]
    pub fn builder() -> RequestReplyRegistryBuilder {
        RequestReplyRegistryBuilder::default()
    }

    pub fn get(&self, subject: &str) -> Result<&RequestReplyDefinition, RegistryError> {
        self.subjects
            .get(subject)
            .ok_or_else(|| RegistryError::UnknownSubject(subject.to_string()))
    }

    pub fn contains(&self, subject: &str) -> bool {
        self.subjects.contains_key(subject)
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

impl std::fmt::Debug for RequestReplyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.subjects.iter()).finish()
    }
}

#[derive(Default)]
pub struct RequestReplyRegistryBuilder {
    subjects: HashMap<String, RequestReplyDefinition>,
}

impl RequestReplyRegistryBuilder {
    #[must_use]
    pub fn subject(
        mut self,
        subject: impl Into<String>,
        definition: RequestReplyDefinition,
    ) -> Self {
        self.subjects.insert(subject.into(), definition);
        self
    }

    pub fn build(self) -> RequestReplyRegistry {
        RequestReplyRegistry {
            subjects: Arc::new(self.subjects),
        }
    }
}
