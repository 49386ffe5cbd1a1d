//! Conversions into the error taxonomy
//!
//! Runtime failures (actor errors, unexpected states) become
//! [`DittoRuntimeError`]s here; typed errors coming back from other stages
//! are passed on untouched.

use ditto_actors::ActorError;
use ditto_model::{CommandCategory, DittoRuntimeError, EntityReference, EntityType};
use tracing::{debug, error};

/// Entity not found or not visible, worded for the command's direction
pub fn rejection(entity: &EntityReference, category: CommandCategory) -> DittoRuntimeError {
    match (entity.entity_type, category.is_write()) {
        (EntityType::Thing, false) => DittoRuntimeError::thing_not_accessible(&entity.id),
        (EntityType::Thing, true) => DittoRuntimeError::thing_not_modifiable(&entity.id),
        (EntityType::Policy, false) => DittoRuntimeError::policy_not_accessible(&entity.id),
        (EntityType::Policy, true) => DittoRuntimeError::policy_not_modifiable(&entity.id),
    }
}

pub fn unavailable(entity: &EntityReference) -> DittoRuntimeError {
    match entity.entity_type {
        EntityType::Thing => DittoRuntimeError::thing_unavailable(&entity.id),
        EntityType::Policy => DittoRuntimeError::policy_unavailable(&entity.id),
    }
}

/// A full mailbox is backpressure; everything else means the entity cannot
/// be reached right now
pub fn from_actor_error(err: &ActorError, entity: &EntityReference) -> DittoRuntimeError {
    debug!(%entity, error = %err, "actor failure");
    match err {
        ActorError::MailboxFull(_) => DittoRuntimeError::too_many_requests(&entity.id),
        ActorError::AskTimeout { .. }
        | ActorError::MailboxClosed(_)
        | ActorError::ReplyDropped(_) => unavailable(entity),
    }
}

/// Log an unexpected failure and hide it behind the generic internal error
pub fn internal(context: &str, cause: &dyn std::fmt::Display) -> DittoRuntimeError {
    error!(%cause, "{}", context);
    DittoRuntimeError::internal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ditto_actors::ActorId;
    use ditto_model::ErrorKind;
    use std::time::Duration;

    fn thing() -> EntityReference {
        EntityReference::thing("org.example:lamp".parse().unwrap())
    }

    #[test]
    fn test_rejection_depends_on_direction() {
        assert_eq!(
            rejection(&thing(), CommandCategory::Query).kind(),
            ErrorKind::ThingNotAccessible
        );
        assert_eq!(
            rejection(&thing(), CommandCategory::Modify).kind(),
            ErrorKind::ThingNotModifiable
        );
        let policy = EntityReference::policy("org.example:lamp".parse().unwrap());
        assert_eq!(
            rejection(&policy, CommandCategory::Delete).kind(),
            ErrorKind::PolicyNotModifiable
        );
    }

    #[test]
    fn test_actor_errors() {
        let actor = ActorId::new("persistence");
        assert_eq!(
            from_actor_error(&ActorError::MailboxFull(actor.clone()), &thing()).kind(),
            ErrorKind::TooManyRequests
        );
        let timeout = ActorError::AskTimeout {
            actor: actor.clone(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(from_actor_error(&timeout, &thing()).kind(), ErrorKind::ThingUnavailable);
        assert_eq!(
            from_actor_error(&ActorError::ReplyDropped(actor), &thing()).kind(),
            ErrorKind::ThingUnavailable
        );
    }
}
