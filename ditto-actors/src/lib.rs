//! Actor runtime for the Ditto enforcement core
//!
//! Actors are tokio tasks with bounded mailboxes. This crate provides:
//! - Actor identity and the [`Actor`] trait
//! - Tell, try-tell and ask-with-timeout through [`ActorRef`]
//! - Receive timeouts and termination watching
//! - A local topic pub/sub for live signals

pub mod actor;
pub mod error;
pub mod pubsub;
pub mod types;

pub use actor::{spawn, Actor, ActorContext, ActorRef, ExitReason, Termination};
pub use error::{ActorError, ActorResult};
pub use pubsub::{
    wrap_for_publication_with_acks, LocalPubSub, Publication, StreamingType, SubscriberFilter,
};
pub use types::{ActorId, SubscriptionId};
