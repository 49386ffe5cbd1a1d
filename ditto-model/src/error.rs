//! Typed error taxonomy returned to callers
//!
//! Every rejection produced by the enforcement core is a [`DittoRuntimeError`].
//! The error keeps its [`ErrorKind`] through every async stage so callers can
//! match on it, and it echoes the request headers (correlation id, channel)
//! so gateways can correlate the answer with the request.

use crate::entity::EntityId;
use crate::headers::DittoHeaders;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// Kind of a [`DittoRuntimeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ThingNotAccessible,
    ThingNotModifiable,
    ThingNotCreatable,
    ThingUnavailable,
    ThingConflict,
    PolicyNotAccessible,
    PolicyNotModifiable,
    PolicyUnavailable,
    PolicyConflict,
    CommandTimeout,
    TooManyRequests,
    SignalUnsupported,
    NamespaceBlocked,
    ConditionFailed,
    ConditionInvalid,
    InvalidResponse,
    InvalidEntityId,
    InvalidPolicy,
    InvalidCommand,
    Internal,
}

impl ErrorKind {
    /// Ditto error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            ErrorKind::ThingNotAccessible => "things:thing.notfound",
            ErrorKind::ThingNotModifiable => "things:thing.notmodifiable",
            ErrorKind::ThingNotCreatable => "things:thing.notcreatable",
            ErrorKind::ThingUnavailable => "things:thing.unavailable",
            ErrorKind::ThingConflict => "things:thing.conflict",
            ErrorKind::PolicyNotAccessible => "policies:policy.notfound",
            ErrorKind::PolicyNotModifiable => "policies:policy.notmodifiable",
            ErrorKind::PolicyUnavailable => "policies:policy.unavailable",
            ErrorKind::PolicyConflict => "policies:policy.conflict",
            ErrorKind::CommandTimeout => "things:command.timeout",
            ErrorKind::TooManyRequests => "too.many.requests",
            ErrorKind::SignalUnsupported => "signal.type.unsupported",
            ErrorKind::NamespaceBlocked => "namespace.blocked",
            ErrorKind::ConditionFailed => "things:precondition.failed",
            ErrorKind::ConditionInvalid => "rql.expression.invalid",
            ErrorKind::InvalidResponse => "things:response.invalid",
            ErrorKind::InvalidEntityId => "entity.id.invalid",
            ErrorKind::InvalidPolicy => "policies:policy.invalid",
            ErrorKind::InvalidCommand => "things:command.invalid",
            ErrorKind::Internal => "internalerror",
        }
    }

    /// HTTP-like status code
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::ThingNotAccessible | ErrorKind::PolicyNotAccessible => 404,
            ErrorKind::ThingNotModifiable | ErrorKind::PolicyNotModifiable => 403,
            ErrorKind::ThingNotCreatable => 400,
            ErrorKind::ThingUnavailable
            | ErrorKind::PolicyUnavailable
            | ErrorKind::NamespaceBlocked => 503,
            ErrorKind::ThingConflict | ErrorKind::PolicyConflict => 409,
            ErrorKind::CommandTimeout => 408,
            ErrorKind::TooManyRequests => 429,
            ErrorKind::ConditionFailed => 412,
            ErrorKind::SignalUnsupported
            | ErrorKind::ConditionInvalid
            | ErrorKind::InvalidEntityId
            | ErrorKind::InvalidPolicy
            | ErrorKind::InvalidCommand => 400,
            ErrorKind::InvalidResponse | ErrorKind::Internal => 500,
        }
    }

    /// Whether the kind signals a temporarily unreachable entity
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ThingUnavailable | ErrorKind::PolicyUnavailable | ErrorKind::NamespaceBlocked
        )
    }
}

/// Error returned to the sender of a signal
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct DittoRuntimeError {
    kind: ErrorKind,
    message: String,
    description: Option<String>,
    headers: DittoHeaders,
}

impl DittoRuntimeError {
    /// Create an error of the given kind with a message
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            description: None,
            headers: DittoHeaders::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach the headers of the request this error answers
    pub fn with_headers(mut self, headers: DittoHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn headers(&self) -> &DittoHeaders {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut DittoHeaders {
        &mut self.headers
    }

    pub fn status(&self) -> u16 {
        self.kind.status()
    }

    pub fn error_code(&self) -> &'static str {
        self.kind.error_code()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.correlation_id()
    }

    /// Ditto's error JSON shape
    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "status": self.status(),
            "error": self.error_code(),
            "message": self.message,
        });
        if let (Some(description), Some(obj)) = (&self.description, body.as_object_mut()) {
            obj.insert("description".to_string(), Value::String(description.clone()));
        }
        body
    }

    pub fn thing_not_accessible(thing_id: &EntityId) -> Self {
        Self::new(
            ErrorKind::ThingNotAccessible,
            format!(
                "The Thing with ID '{}' could not be found or requester had insufficient \
                permissions to access it.",
                thing_id
            ),
        )
        .with_description(
            "Check if the ID of your requested Thing was correct and you have sufficient \
            permissions.",
        )
    }

    pub fn thing_not_modifiable(thing_id: &EntityId) -> Self {
        Self::new(
            ErrorKind::ThingNotModifiable,
            format!(
                "The Thing with ID '{}' could not be modified as the requester had insufficient \
                permissions to modify it.",
                thing_id
            ),
        )
        .with_description(
            "Check if the ID of the Thing was correct and you have sufficient permissions to \
            modify it.",
        )
    }

    pub fn thing_not_creatable_policy_missing(thing_id: &EntityId, policy_id: &EntityId) -> Self {
        Self::new(
            ErrorKind::ThingNotCreatable,
            format!(
                "The Thing with ID '{}' could not be created as the Policy with ID '{}' is not \
                existing.",
                thing_id, policy_id
            ),
        )
        .with_description(
            "Check if the ID of the Policy you created the Thing with is correct and that the \
            Policy is existing.",
        )
    }

    pub fn thing_not_creatable_implicit_policy(thing_id: &EntityId, policy_id: &EntityId) -> Self {
        Self::new(
            ErrorKind::ThingNotCreatable,
            format!(
                "The Thing with ID '{}' could not be created because creation of its implicit \
                Policy ID '{}' failed.",
                thing_id, policy_id
            ),
        )
        .with_description(
            "If you want to use an existing Policy, specify it as 'policyId' in the Thing JSON \
            you create.",
        )
    }

    pub fn thing_unavailable(thing_id: &EntityId) -> Self {
        Self::new(
            ErrorKind::ThingUnavailable,
            format!(
                "The Thing with the given ID '{}' is not available, please try again later.",
                thing_id
            ),
        )
        .with_description("The requested Thing is temporarily not available.")
    }

    pub fn thing_conflict(thing_id: &EntityId) -> Self {
        Self::new(
            ErrorKind::ThingConflict,
            format!("The Thing with ID '{}' already exists.", thing_id),
        )
        .with_description("Choose another Thing ID.")
    }

    pub fn policy_not_accessible(policy_id: &EntityId) -> Self {
        Self::new(
            ErrorKind::PolicyNotAccessible,
            format!(
                "The Policy with ID '{}' could not be found or requester had insufficient \
                permissions to access it.",
                policy_id
            ),
        )
        .with_description(
            "Check if the ID of your requested Policy was correct and you have sufficient \
            permissions.",
        )
    }

    pub fn policy_not_modifiable(policy_id: &EntityId) -> Self {
        Self::new(
            ErrorKind::PolicyNotModifiable,
            format!(
                "The Policy with ID '{}' could not be modified as the requester had \
                insufficient permissions to modify it.",
                policy_id
            ),
        )
        .with_description(
            "Check if the ID of the Policy was correct and you have sufficient permissions to \
            modify it.",
        )
    }

    pub fn policy_unavailable(policy_id: &EntityId) -> Self {
        Self::new(
            ErrorKind::PolicyUnavailable,
            format!(
                "The Policy with the given ID '{}' is not available, please try again later.",
                policy_id
            ),
        )
        .with_description("The requested Policy is temporarily not available.")
    }

    pub fn policy_conflict(policy_id: &EntityId) -> Self {
        Self::new(
            ErrorKind::PolicyConflict,
            format!("The Policy with ID '{}' already exists.", policy_id),
        )
        .with_description("Choose another Policy ID.")
    }

    pub fn command_timeout(timeout: Duration) -> Self {
        Self::new(
            ErrorKind::CommandTimeout,
            format!(
                "The Command reached the specified timeout of {}ms.",
                timeout.as_millis()
            ),
        )
        .with_description("Try increasing the command timeout.")
    }

    pub fn too_many_requests(entity_id: &EntityId) -> Self {
        Self::new(
            ErrorKind::TooManyRequests,
            format!(
                "Too many modifying requests are already outstanding to the entity with ID '{}'.",
                entity_id
            ),
        )
        .with_description("Throttle your modifying requests to the entity or bundle them.")
    }

    pub fn signal_unsupported(signal_name: &str) -> Self {
        Self::new(
            ErrorKind::SignalUnsupported,
            format!("The provided signal '{}' is not supported.", signal_name),
        )
    }

    pub fn namespace_blocked(namespace: &str) -> Self {
        Self::new(
            ErrorKind::NamespaceBlocked,
            format!(
                "Namespace '{}' is not available due to an ongoing operation.",
                namespace
            ),
        )
        .with_description("Please try again later.")
    }

    pub fn condition_failed(condition: &str) -> Self {
        Self::new(
            ErrorKind::ConditionFailed,
            format!(
                "The specified condition '{}' does not match the state of the requested Thing.",
                condition
            ),
        )
    }

    pub fn condition_invalid(condition: &str, reason: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ConditionInvalid,
            format!("The specified condition '{}' is invalid.", condition),
        )
        .with_description(reason)
    }

    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::InvalidResponse,
            "The received live response did not match the command it answers.",
        )
        .with_description(reason)
    }

    pub fn invalid_entity_id(raw: &str) -> Self {
        Self::new(
            ErrorKind::InvalidEntityId,
            format!("Entity ID '{}' is not valid!", raw),
        )
        .with_description(
            "It must conform to the namespaced entity ID notation (namespace:name).",
        )
    }

    pub fn invalid_policy(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPolicy, "The Policy is invalid.").with_description(reason)
    }

    pub fn invalid_command(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidCommand, "The command is invalid.").with_description(reason)
    }

    /// Generic internal error. The cause is never part of the message.
    pub fn internal() -> Self {
        Self::new(
            ErrorKind::Internal,
            "There was a rare case of an unexpected internal error.",
        )
        .with_description("Please contact the service team or your administrator.")
    }
}
