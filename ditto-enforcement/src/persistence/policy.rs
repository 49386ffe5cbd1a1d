use super::{PersistenceMessage, Snapshot};
use crate::errors::rejection;
use async_trait::async_trait;
use ditto_actors::{Actor, ActorContext};
use ditto_model::{
    CommandResponse, DittoRuntimeError, EntityId, EntityReference, Policy, PolicyAction,
    PolicyCommand, PolicyEntry,
};
use serde_json::Value;
use tracing::debug;

/// Current state of one Policy
pub struct PolicyPersistenceActor {
    policy_id: EntityId,
    policy: Option<Policy>,
    revision: u64,
}

impl PolicyPersistenceActor {
    pub fn new(policy_id: EntityId) -> Self {
        Self {
            policy_id,
            policy: None,
            revision: 0,
        }
    }

    fn apply(&mut self, command: &PolicyCommand) -> Result<CommandResponse, DittoRuntimeError> {
        let not_found = || DittoRuntimeError::policy_not_accessible(&command.policy_id);
        let respond = |status: u16, payload: Option<Value>| {
            CommandResponse::for_policy(command, status, payload)
        };
        let mut state = self.policy.clone();

        let (response, change) = match (&command.action, state.as_mut()) {
            (PolicyAction::CreatePolicy { .. }, Some(_)) => {
                return Err(DittoRuntimeError::policy_conflict(&command.policy_id));
            }
            (PolicyAction::CreatePolicy { policy }, None)
            | (PolicyAction::ModifyPolicy { policy }, None) => {
                let stored = stamp(&command.policy_id, policy.clone());
                let payload = stored.to_json();
                (respond(201, Some(payload)), Change::Replace(Some(stored)))
            }
            (PolicyAction::ModifyPolicy { policy }, Some(current)) => {
                *current = stamp(&command.policy_id, policy.clone());
                (respond(204, None), Change::InPlace)
            }
            (PolicyAction::DeletePolicy, Some(_)) => (respond(204, None), Change::Replace(None)),
            (PolicyAction::RetrievePolicy, Some(current)) => {
                (respond(200, Some(current.to_json())), Change::Keep)
            }
            (PolicyAction::ModifyPolicyEntry { label, entry }, Some(current)) => {
                let created = current.entries.insert(label.clone(), entry.clone()).is_none();
                if created {
                    (respond(201, Some(entry_json(entry)?)), Change::InPlace)
                } else {
                    (respond(204, None), Change::InPlace)
                }
            }
            (PolicyAction::RetrievePolicyEntry { label }, Some(current)) => {
                let entry = current.entries.get(label).ok_or_else(not_found)?;
                (respond(200, Some(entry_json(entry)?)), Change::Keep)
            }
            (PolicyAction::DeletePolicyEntry { label }, Some(current)) => {
                current.entries.remove(label).ok_or_else(not_found)?;
                (respond(204, None), Change::InPlace)
            }
            (_, None) => {
                let entity = EntityReference::policy(command.policy_id.clone());
                return Err(rejection(&entity, command.category()));
            }
        };

        let stored = match change {
            Change::Keep => return Ok(response),
            Change::InPlace => state,
            Change::Replace(policy) => policy,
        };
        self.policy = stored;
        self.revision += 1;
        debug!(policy_id = %self.policy_id, revision = self.revision, "policy persisted");
        Ok(response)
    }
}

enum Change {
    Keep,
    InPlace,
    Replace(Option<Policy>),
}

fn stamp(policy_id: &EntityId, mut policy: Policy) -> Policy {
    policy.policy_id = Some(policy_id.clone());
    policy
}

fn entry_json(entry: &PolicyEntry) -> Result<Value, DittoRuntimeError> {
    serde_json::to_value(entry)
        .map_err(|err| crate::errors::internal("serializing policy entry", &err))
}

#[async_trait]
impl Actor for PolicyPersistenceActor {
    type Message = PersistenceMessage<PolicyCommand>;

    async fn handle(&mut self, message: Self::Message, _ctx: &mut ActorContext<Self::Message>) {
        match message {
            PersistenceMessage::Command { command, reply } => {
                let result = self
                    .apply(&command)
                    .map_err(|err| err.with_headers(command.headers.response_headers()));
                let _ = reply.send(result);
            }
            PersistenceMessage::SudoRetrieve { reply } => {
                let snapshot = self.policy.as_ref().map(|policy| Snapshot {
                    json: policy.to_json(),
                    revision: self.revision,
                });
                let _ = reply.send(snapshot);
            }
        }
    }
}
