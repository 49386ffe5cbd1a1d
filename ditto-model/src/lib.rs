//! Shared types for the Ditto enforcement core
//!
//! This crate provides the types every other crate in the workspace speaks:
//! entity ids and references, typed headers, JSON pointers, signals, policy
//! documents, RQL conditions and the error taxonomy returned to callers.

pub mod condition;
pub mod duration;
pub mod entity;
pub mod error;
pub mod headers;
pub mod pointer;
pub mod policy;
pub mod signal;
pub mod thing;

pub use condition::{Condition, ConditionError};
pub use entity::{EntityId, EntityReference, EntityType, InvalidEntityId};
pub use error::{DittoRuntimeError, ErrorKind};
pub use headers::{
    AcknowledgementLabel, AuthorizationContext, AuthorizationSubject, Channel, DittoHeaders,
    LiveChannelTimeoutStrategy, MAX_TIMEOUT,
};
pub use pointer::JsonPointer;
pub use policy::{
    EffectedPermissions, Permission, Policy, PolicyEntry, ResourceKey, ResourceType, Subject,
};
pub use signal::{
    Acknowledgement, CommandCategory, CommandResponse, MessageCommand, PolicyAction,
    PolicyCommand, Signal, ThingAction, ThingCommand,
};
