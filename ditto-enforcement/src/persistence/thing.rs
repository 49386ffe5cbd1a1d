use super::{PersistenceMessage, Snapshot};
use crate::errors::rejection;
use async_trait::async_trait;
use ditto_actors::{Actor, ActorContext};
use ditto_model::thing::{select_fields, with_ids};
use ditto_model::{
    pointer::merge_patch, CommandResponse, Condition, DittoHeaders, DittoRuntimeError, EntityId,
    EntityReference, JsonPointer, ThingAction, ThingCommand,
};
use serde_json::{json, Value};
use tracing::debug;

/// Current state of one Thing
pub struct ThingPersistenceActor {
    thing_id: EntityId,
    thing: Option<Value>,
    revision: u64,
}

impl ThingPersistenceActor {
    pub fn new(thing_id: EntityId) -> Self {
        Self {
            thing_id,
            thing: None,
            revision: 0,
        }
    }

    fn handle_command(
        &mut self,
        command: ThingCommand,
    ) -> Result<CommandResponse, DittoRuntimeError> {
        if let (Some(condition), Some(state)) = (command.headers.condition(), self.thing.as_ref()) {
            if !evaluate(condition, state)? {
                return Err(DittoRuntimeError::condition_failed(condition));
            }
        }
        let live_condition_matched = match command.headers.live_channel_condition() {
            Some(condition) => {
                let state = self.thing.as_ref().unwrap_or(&Value::Null);
                Some(evaluate(condition, state)?)
            }
            None => None,
        };

        let (status, payload) = self.apply(&command)?;
        let mut response = CommandResponse::for_thing(&command, status, payload);
        if let Some(matched) = live_condition_matched {
            response.headers = response.headers.with_live_channel_condition_matched(matched);
        }
        Ok(response)
    }

    fn apply(&mut self, command: &ThingCommand) -> Result<(u16, Option<Value>), DittoRuntimeError> {
        let thing_id = self.thing_id.clone();
        let not_found = || DittoRuntimeError::thing_not_accessible(&thing_id);
        let mut state = self.thing.clone();

        let (status, payload, change) = match (&command.action, state.as_mut()) {
            (ThingAction::CreateThing { .. }, Some(_)) => {
                return Err(DittoRuntimeError::thing_conflict(&thing_id));
            }
            (ThingAction::CreateThing { thing, .. }, None)
            | (ThingAction::ModifyThing { thing, .. }, None) => {
                let stored = stamp(&thing_id, thing.clone(), None)?;
                (201, Some(stored.clone()), Change::Replace(Some(stored)))
            }
            (ThingAction::ModifyThing { thing, .. }, Some(current)) => {
                let previous_policy = ditto_model::thing::policy_id(current).ok().flatten();
                let stored = stamp(&thing_id, thing.clone(), previous_policy)?;
                (204, None, Change::Replace(Some(stored)))
            }
            (ThingAction::MergeThing { path, value }, Some(current)) => {
                let previous_policy = ditto_model::thing::policy_id(current).ok().flatten();
                let mut target = path.get(current).cloned().unwrap_or(Value::Null);
                merge_patch(&mut target, value);
                let merged = if path.is_root() {
                    target
                } else {
                    let mut merged = current.clone();
                    path.set(&mut merged, target);
                    merged
                };
                let stored = stamp(&thing_id, merged, previous_policy)?;
                (204, None, Change::Replace(Some(stored)))
            }
            (ThingAction::DeleteThing, Some(_)) => (204, None, Change::Replace(None)),
            (ThingAction::RetrieveThing { selected_fields }, Some(current)) => {
                let payload = match selected_fields {
                    Some(fields) => select_fields(current, fields),
                    None => current.clone(),
                };
                (200, Some(payload), Change::Keep)
            }
            (ThingAction::ModifyAttribute { value, .. }, Some(current))
            | (ThingAction::ModifyFeatureProperty { value, .. }, Some(current)) => {
                let path = command.action.resource_path();
                let created = path.get(current).is_none();
                path.set(current, value.clone());
                if created {
                    (201, Some(value.clone()), Change::InPlace)
                } else {
                    (204, None, Change::InPlace)
                }
            }
            (ThingAction::RetrieveAttribute { .. }, Some(current))
            | (ThingAction::RetrieveFeatureProperty { .. }, Some(current)) => {
                let path = command.action.resource_path();
                let value = path.get(current).cloned().ok_or_else(not_found)?;
                (200, Some(value), Change::Keep)
            }
            (ThingAction::DeleteAttribute { .. }, Some(current)) => {
                let path = command.action.resource_path();
                path.remove(current).ok_or_else(not_found)?;
                (204, None, Change::InPlace)
            }
            (ThingAction::ModifyPolicyId { policy_id }, Some(current)) => {
                JsonPointer::parse("/policyId").set(current, json!(policy_id.as_str()));
                (204, None, Change::InPlace)
            }
            (ThingAction::RetrievePolicyId, Some(current)) => {
                let policy_id = current.get("policyId").cloned().ok_or_else(not_found)?;
                (200, Some(policy_id), Change::Keep)
            }
            // a missing Thing is worded for the command's direction
            (_, None) => {
                let entity = EntityReference::thing(self.thing_id.clone());
                return Err(rejection(&entity, command.category()));
            }
        };

        match change {
            Change::Keep => {}
            Change::InPlace => self.write(state),
            Change::Replace(thing) => self.write(thing),
        }
        Ok((status, payload))
    }

    fn write(&mut self, thing: Option<Value>) {
        self.thing = thing;
        self.revision += 1;
        debug!(thing_id = %self.thing_id, revision = self.revision, "thing persisted");
    }
}

enum Change {
    Keep,
    InPlace,
    Replace(Option<Value>),
}

/// Stored form of `thing`: ids set, policy id taken from the document,
/// else `fallback`, else the thing id
fn stamp(
    thing_id: &EntityId,
    thing: Value,
    fallback: Option<EntityId>,
) -> Result<Value, DittoRuntimeError> {
    if !thing.is_object() {
        return Err(DittoRuntimeError::invalid_command("a Thing must be a JSON object"));
    }
    let policy_id = match ditto_model::thing::policy_id(&thing) {
        Ok(Some(id)) => id,
        Ok(None) => fallback.unwrap_or_else(|| thing_id.clone()),
        Err(err) => return Err(DittoRuntimeError::invalid_entity_id(&err.0)),
    };
    Ok(with_ids(thing, thing_id, &policy_id))
}

/// Evaluate an RQL condition against `state`
pub(crate) fn evaluate(condition: &str, state: &Value) -> Result<bool, DittoRuntimeError> {
    Condition::parse(condition)
        .map(|parsed| parsed.matches(state))
        .map_err(|err| DittoRuntimeError::condition_invalid(condition, err.to_string()))
}

#[async_trait]
impl Actor for ThingPersistenceActor {
    type Message = PersistenceMessage<ThingCommand>;

    async fn handle(&mut self, message: Self::Message, _ctx: &mut ActorContext<Self::Message>) {
        match message {
            PersistenceMessage::Command { command, reply } => {
                let headers: DittoHeaders = command.headers.clone();
                let result = self
                    .handle_command(command)
                    .map_err(|err| err.with_headers(headers.response_headers()));
                let _ = reply.send(result);
            }
            PersistenceMessage::SudoRetrieve { reply } => {
                let snapshot = self.thing.clone().map(|json| Snapshot {
                    json,
                    revision: self.revision,
                });
                let _ = reply.send(snapshot);
            }
        }
    }
}
