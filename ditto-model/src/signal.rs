//! Signals handled by the enforcement core
//!
//! Signals are closed sum types: [`ThingCommand`], [`PolicyCommand`] and
//! [`MessageCommand`] travel towards an entity, [`CommandResponse`] and
//! [`Acknowledgement`] travel back to the requester.

use crate::entity::{EntityId, EntityReference, EntityType};
use crate::headers::{AcknowledgementLabel, Channel, DittoHeaders};
use crate::pointer::JsonPointer;
use crate::policy::{Policy, PolicyEntry, ResourceKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broad class of a command, used for authorization and error selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCategory {
    Query,
    Modify,
    Create,
    Delete,
    Message,
}

impl CommandCategory {
    /// Whether the command needs WRITE rather than READ
    pub fn is_write(&self) -> bool {
        !matches!(self, CommandCategory::Query)
    }
}

/// Operation of a [`ThingCommand`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ThingAction {
    CreateThing {
        thing: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_policy: Option<Policy>,
    },
    ModifyThing {
        thing: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_policy: Option<Policy>,
    },
    MergeThing {
        #[serde(default)]
        path: JsonPointer,
        value: Value,
    },
    DeleteThing,
    RetrieveThing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selected_fields: Option<Vec<JsonPointer>>,
    },
    ModifyAttribute {
        pointer: JsonPointer,
        value: Value,
    },
    RetrieveAttribute {
        pointer: JsonPointer,
    },
    DeleteAttribute {
        pointer: JsonPointer,
    },
    ModifyFeatureProperty {
        feature_id: String,
        pointer: JsonPointer,
        value: Value,
    },
    RetrieveFeatureProperty {
        feature_id: String,
        pointer: JsonPointer,
    },
    ModifyPolicyId {
        policy_id: EntityId,
    },
    RetrievePolicyId,
}

impl ThingAction {
    pub fn name(&self) -> &'static str {
        match self {
            ThingAction::CreateThing { .. } => "createThing",
            ThingAction::ModifyThing { .. } => "modifyThing",
            ThingAction::MergeThing { .. } => "mergeThing",
            ThingAction::DeleteThing => "deleteThing",
            ThingAction::RetrieveThing { .. } => "retrieveThing",
            ThingAction::ModifyAttribute { .. } => "modifyAttribute",
            ThingAction::RetrieveAttribute { .. } => "retrieveAttribute",
            ThingAction::DeleteAttribute { .. } => "deleteAttribute",
            ThingAction::ModifyFeatureProperty { .. } => "modifyFeatureProperty",
            ThingAction::RetrieveFeatureProperty { .. } => "retrieveFeatureProperty",
            ThingAction::ModifyPolicyId { .. } => "modifyPolicyId",
            ThingAction::RetrievePolicyId => "retrievePolicyId",
        }
    }

    pub fn category(&self) -> CommandCategory {
        match self {
            ThingAction::CreateThing { .. } => CommandCategory::Create,
            ThingAction::DeleteThing | ThingAction::DeleteAttribute { .. } => {
                CommandCategory::Delete
            }
            ThingAction::RetrieveThing { .. }
            | ThingAction::RetrieveAttribute { .. }
            | ThingAction::RetrieveFeatureProperty { .. }
            | ThingAction::RetrievePolicyId => CommandCategory::Query,
            ThingAction::ModifyThing { .. }
            | ThingAction::MergeThing { .. }
            | ThingAction::ModifyAttribute { .. }
            | ThingAction::ModifyFeatureProperty { .. }
            | ThingAction::ModifyPolicyId { .. } => CommandCategory::Modify,
        }
    }

    /// Path inside the Thing JSON the action touches
    pub fn resource_path(&self) -> JsonPointer {
        match self {
            ThingAction::CreateThing { .. }
            | ThingAction::ModifyThing { .. }
            | ThingAction::DeleteThing
            | ThingAction::RetrieveThing { .. } => JsonPointer::root(),
            ThingAction::MergeThing { path, .. } => path.clone(),
            ThingAction::ModifyAttribute { pointer, .. }
            | ThingAction::RetrieveAttribute { pointer }
            | ThingAction::DeleteAttribute { pointer } => {
                JsonPointer::parse("/attributes").join(pointer)
            }
            ThingAction::ModifyFeatureProperty {
                feature_id,
                pointer,
                ..
            }
            | ThingAction::RetrieveFeatureProperty {
                feature_id,
                pointer,
            } => JsonPointer::from_segments(["features", feature_id.as_str(), "properties"])
                .join(pointer),
            ThingAction::ModifyPolicyId { .. } | ThingAction::RetrievePolicyId => {
                JsonPointer::parse("/policyId")
            }
        }
    }
}

/// Command addressed to a Thing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThingCommand {
    pub thing_id: EntityId,
    #[serde(flatten)]
    pub action: ThingAction,
    #[serde(default)]
    pub headers: DittoHeaders,
}

impl ThingCommand {
    pub fn new(thing_id: EntityId, action: ThingAction, headers: DittoHeaders) -> Self {
        Self {
            thing_id,
            action,
            headers,
        }
    }

    pub fn name(&self) -> &'static str {
        self.action.name()
    }

    pub fn category(&self) -> CommandCategory {
        self.action.category()
    }

    pub fn entity_reference(&self) -> EntityReference {
        EntityReference::thing(self.thing_id.clone())
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::thing(self.action.resource_path())
    }

    /// Same command on another channel
    pub fn with_channel(&self, channel: Channel) -> Self {
        let mut copy = self.clone();
        copy.headers = copy.headers.with_channel(channel);
        copy
    }
}

/// Operation of a [`PolicyCommand`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PolicyAction {
    CreatePolicy { policy: Policy },
    ModifyPolicy { policy: Policy },
    DeletePolicy,
    RetrievePolicy,
    ModifyPolicyEntry { label: String, entry: PolicyEntry },
    RetrievePolicyEntry { label: String },
    DeletePolicyEntry { label: String },
}

impl PolicyAction {
    pub fn name(&self) -> &'static str {
        match self {
            PolicyAction::CreatePolicy { .. } => "createPolicy",
            PolicyAction::ModifyPolicy { .. } => "modifyPolicy",
            PolicyAction::DeletePolicy => "deletePolicy",
            PolicyAction::RetrievePolicy => "retrievePolicy",
            PolicyAction::ModifyPolicyEntry { .. } => "modifyPolicyEntry",
            PolicyAction::RetrievePolicyEntry { .. } => "retrievePolicyEntry",
            PolicyAction::DeletePolicyEntry { .. } => "deletePolicyEntry",
        }
    }

    pub fn category(&self) -> CommandCategory {
        match self {
            PolicyAction::CreatePolicy { .. } => CommandCategory::Create,
            PolicyAction::ModifyPolicy { .. } | PolicyAction::ModifyPolicyEntry { .. } => {
                CommandCategory::Modify
            }
            PolicyAction::DeletePolicy | PolicyAction::DeletePolicyEntry { .. } => {
                CommandCategory::Delete
            }
            PolicyAction::RetrievePolicy | PolicyAction::RetrievePolicyEntry { .. } => {
                CommandCategory::Query
            }
        }
    }

    pub fn resource_path(&self) -> JsonPointer {
        match self {
            PolicyAction::CreatePolicy { .. }
            | PolicyAction::ModifyPolicy { .. }
            | PolicyAction::DeletePolicy
            | PolicyAction::RetrievePolicy => JsonPointer::root(),
            PolicyAction::ModifyPolicyEntry { label, .. }
            | PolicyAction::RetrievePolicyEntry { label }
            | PolicyAction::DeletePolicyEntry { label } => {
                JsonPointer::from_segments(["entries", label.as_str()])
            }
        }
    }
}

/// Command addressed to a Policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyCommand {
    pub policy_id: EntityId,
    #[serde(flatten)]
    pub action: PolicyAction,
    #[serde(default)]
    pub headers: DittoHeaders,
}

impl PolicyCommand {
    pub fn new(policy_id: EntityId, action: PolicyAction, headers: DittoHeaders) -> Self {
        Self {
            policy_id,
            action,
            headers,
        }
    }

    pub fn name(&self) -> &'static str {
        self.action.name()
    }

    pub fn category(&self) -> CommandCategory {
        self.action.category()
    }

    pub fn entity_reference(&self) -> EntityReference {
        EntityReference::policy(self.policy_id.clone())
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::policy(self.action.resource_path())
    }
}

/// Live message sent to a Thing or one of its features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCommand {
    pub thing_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_id: Option<String>,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default)]
    pub headers: DittoHeaders,
}

impl MessageCommand {
    pub fn name(&self) -> &'static str {
        match self.feature_id {
            Some(_) => "sendFeatureMessage",
            None => "sendThingMessage",
        }
    }

    pub fn entity_reference(&self) -> EntityReference {
        EntityReference::thing(self.thing_id.clone())
    }

    /// `message:/inbox/messages/<subject>` or its feature variant
    pub fn resource_key(&self) -> ResourceKey {
        let mut path = match &self.feature_id {
            Some(feature) => JsonPointer::from_segments(["features", feature.as_str()]),
            None => JsonPointer::root(),
        };
        path = path.append("inbox").append("messages");
        ResourceKey::message(path.join(&JsonPointer::parse(&self.subject)))
    }
}

/// Answer to a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    /// Name of the command this response answers
    pub command: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default)]
    pub headers: DittoHeaders,
}

impl CommandResponse {
    pub fn new(
        entity: &EntityReference,
        command: impl Into<String>,
        status: u16,
        payload: Option<Value>,
        headers: DittoHeaders,
    ) -> Self {
        Self {
            entity_type: entity.entity_type,
            entity_id: entity.id.clone(),
            command: command.into(),
            status,
            payload,
            headers,
        }
    }

    /// Response to `command` carrying the command's correlation headers
    pub fn for_thing(command: &ThingCommand, status: u16, payload: Option<Value>) -> Self {
        Self::new(
            &command.entity_reference(),
            command.name(),
            status,
            payload,
            command.headers.response_headers(),
        )
    }

    pub fn for_policy(command: &PolicyCommand, status: u16, payload: Option<Value>) -> Self {
        Self::new(
            &command.entity_reference(),
            command.name(),
            status,
            payload,
            command.headers.response_headers(),
        )
    }

    pub fn for_message(command: &MessageCommand, status: u16, payload: Option<Value>) -> Self {
        Self::new(
            &command.entity_reference(),
            command.name(),
            status,
            payload,
            command.headers.response_headers(),
        )
    }

    pub fn entity_reference(&self) -> EntityReference {
        EntityReference::new(self.entity_type, self.entity_id.clone())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Acknowledgement of a requested label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    pub label: AcknowledgementLabel,
    pub entity_id: EntityId,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default)]
    pub headers: DittoHeaders,
}

/// Any signal the core accepts or produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Signal {
    Thing(ThingCommand),
    Policy(PolicyCommand),
    Message(MessageCommand),
    Response(CommandResponse),
    Acknowledgement(Acknowledgement),
}

impl Signal {
    pub fn headers(&self) -> &DittoHeaders {
        match self {
            Signal::Thing(c) => &c.headers,
            Signal::Policy(c) => &c.headers,
            Signal::Message(c) => &c.headers,
            Signal::Response(r) => &r.headers,
            Signal::Acknowledgement(a) => &a.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut DittoHeaders {
        match self {
            Signal::Thing(c) => &mut c.headers,
            Signal::Policy(c) => &mut c.headers,
            Signal::Message(c) => &mut c.headers,
            Signal::Response(r) => &mut r.headers,
            Signal::Acknowledgement(a) => &mut a.headers,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers().correlation_id()
    }

    pub fn entity_reference(&self) -> EntityReference {
        match self {
            Signal::Thing(c) => c.entity_reference(),
            Signal::Policy(c) => c.entity_reference(),
            Signal::Message(c) => c.entity_reference(),
            Signal::Response(r) => r.entity_reference(),
            Signal::Acknowledgement(a) => EntityReference::thing(a.entity_id.clone()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Signal::Thing(c) => c.name(),
            Signal::Policy(c) => c.name(),
            Signal::Message(c) => c.name(),
            Signal::Response(r) => &r.command,
            Signal::Acknowledgement(_) => "acknowledgement",
        }
    }

    /// Live thing commands and all messages
    pub fn is_live(&self) -> bool {
        match self {
            Signal::Message(_) => true,
            other => other.headers().is_live(),
        }
    }
}
