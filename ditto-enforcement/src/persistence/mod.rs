//! In-memory persistence actors
//!
//! One actor per entity holds the current state and revision. Commands are
//! answered with a [`CommandResponse`] or a typed error; sudo retrievals
//! return the raw state for cache loaders and skip every check.

pub mod policy;
pub mod thing;

use crate::errors::from_actor_error;
use ditto_actors::{ActorRef, ActorResult};
use ditto_model::{
    CommandResponse, DittoRuntimeError, EntityReference, PolicyCommand, ThingCommand,
};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;

pub use policy::PolicyPersistenceActor;
pub use thing::ThingPersistenceActor;

pub type CommandReply = oneshot::Sender<Result<CommandResponse, DittoRuntimeError>>;

/// Raw entity state as stored
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub json: Value,
    pub revision: u64,
}

pub enum PersistenceMessage<C> {
    Command { command: C, reply: CommandReply },
    SudoRetrieve { reply: oneshot::Sender<Option<Snapshot>> },
}

pub type ThingPersistenceRef = ActorRef<PersistenceMessage<ThingCommand>>;
pub type PolicyPersistenceRef = ActorRef<PersistenceMessage<PolicyCommand>>;

/// Persistence child of a supervisor
#[derive(Debug, Clone)]
pub enum PersistenceTarget {
    Thing(ThingPersistenceRef),
    Policy(PolicyPersistenceRef),
}

impl PersistenceTarget {
    pub fn is_closed(&self) -> bool {
        match self {
            PersistenceTarget::Thing(actor) => actor.is_closed(),
            PersistenceTarget::Policy(actor) => actor.is_closed(),
        }
    }

    pub async fn sudo_retrieve(&self, timeout: Duration) -> ActorResult<Option<Snapshot>> {
        match self {
            PersistenceTarget::Thing(actor) => sudo_retrieve(actor, timeout).await,
            PersistenceTarget::Policy(actor) => sudo_retrieve(actor, timeout).await,
        }
    }
}

async fn sudo_retrieve<C: Send + 'static>(
    actor: &ActorRef<PersistenceMessage<C>>,
    timeout: Duration,
) -> ActorResult<Option<Snapshot>> {
    actor
        .ask(|reply| PersistenceMessage::SudoRetrieve { reply }, timeout)
        .await
}

/// Send a command without waiting for mailbox capacity and await the answer
pub async fn ask_persistence<C: Send + 'static>(
    actor: &ActorRef<PersistenceMessage<C>>,
    entity: &EntityReference,
    command: C,
    timeout: Duration,
) -> Result<CommandResponse, DittoRuntimeError> {
    actor
        .try_ask(|reply| PersistenceMessage::Command { command, reply }, timeout)
        .await
        .map_err(|err| from_actor_error(&err, entity))?
}
