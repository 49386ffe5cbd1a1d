//! Live commands and messages
//!
//! Live signals are authorized like twin commands, stamped with the subjects
//! allowed to read them and handed to the [`ChannelDispatcher`] for
//! publication. Query answers coming back from devices are filtered by the
//! same read view as twin answers.
//!
//! [`ChannelDispatcher`]: crate::dispatcher::ChannelDispatcher

use super::thing::{authorize_thing_command, filter_query_response};
use super::{check_condition_readable, EnforcementServices};
use crate::contextual::{Contextual, EnforcementStage};
use crate::errors::rejection;
use crate::persistence::ThingPersistenceRef;
use ditto_model::{
    CommandCategory, CommandResponse, DittoRuntimeError, MessageCommand, Permission, Signal,
    ThingCommand,
};
use ditto_policies::PolicyEnforcer;
use std::mem;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveSignalEnforcement;

impl LiveSignalEnforcement {
    pub async fn enforce(
        &self,
        services: &EnforcementServices,
        persistence: &ThingPersistenceRef,
        ctx: &mut Contextual<Signal>,
    ) -> Result<CommandResponse, DittoRuntimeError> {
        let signal = ctx.message().clone();
        let entity = signal.entity_reference();
        let category = match &signal {
            Signal::Thing(command) => command.category(),
            Signal::Message(_) => CommandCategory::Message,
            other => return Err(DittoRuntimeError::signal_unsupported(other.name())),
        };

        ctx.advance(EnforcementStage::ResolvingEntityId);
        let (_, enforcer_entry) = services
            .retriever
            .retrieve(&entity, |id, enforcer| async move {
                Ok::<_, DittoRuntimeError>((id, enforcer))
            })
            .await?;
        ctx.advance(EnforcementStage::ResolvingEnforcer);
        let Some(enforcer) = enforcer_entry.into_value() else {
            debug!(parent: ctx.span(), "no enforcer for live signal");
            return Err(rejection(&entity, category));
        };

        ctx.advance(EnforcementStage::Authorizing);
        let authorized = match signal {
            Signal::Thing(command) => Signal::Thing(authorize_live_command(&enforcer, command)?),
            Signal::Message(message) => Signal::Message(authorize_message(&enforcer, message)?),
            other => return Err(DittoRuntimeError::signal_unsupported(other.name())),
        };

        ctx.advance(EnforcementStage::Forwarding);
        let response = services
            .dispatcher
            .dispatch(authorized.clone(), persistence, ctx.sender(), ctx.ask_timeout())
            .await?;
        match &authorized {
            Signal::Thing(command) => filter_query_response(&enforcer, command, response),
            _ => Ok(response),
        }
    }
}

fn authorize_live_command(
    enforcer: &PolicyEnforcer,
    mut command: ThingCommand,
) -> Result<ThingCommand, DittoRuntimeError> {
    authorize_thing_command(enforcer, &command)?;
    let subjects = &command.headers.authorization_context().subjects;
    if let Some(condition) = command.headers.live_channel_condition() {
        check_condition_readable(enforcer, condition, subjects, || {
            DittoRuntimeError::thing_not_accessible(&command.thing_id)
        })?;
    }
    let readers =
        enforcer.subjects_with_partial_permission(&command.resource_key(), Permission::Read);
    command.headers = mem::take(&mut command.headers)
        .with_read_granted_subjects(readers.into_iter().collect());
    Ok(command)
}

/// Sending a message needs WRITE on its inbox resource; whoever may READ it
/// receives it
fn authorize_message(
    enforcer: &PolicyEnforcer,
    mut message: MessageCommand,
) -> Result<MessageCommand, DittoRuntimeError> {
    let resource = message.resource_key();
    let subjects = &message.headers.authorization_context().subjects;
    if !enforcer.has_unrestricted_permissions(&resource, subjects, &[Permission::Write]) {
        return Err(rejection(&message.entity_reference(), CommandCategory::Message));
    }
    let readers = enforcer.subjects_with_partial_permission(&resource, Permission::Read);
    message.headers = mem::take(&mut message.headers)
        .with_read_granted_subjects(readers.into_iter().collect());
    Ok(message)
}
