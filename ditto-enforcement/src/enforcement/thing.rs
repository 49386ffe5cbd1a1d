//! Twin-channel Thing commands
//!
//! A Thing is authorized against the Policy it references. Creating a Thing
//! that has no enforcer yet goes through one of three paths: an inline
//! initial policy, a referenced existing policy, or an implicit policy built
//! from the creator's subjects. A policy created on the way is deleted again
//! when the persistence rejects the Thing itself.

use super::{check_condition_readable, EnforcementServices};
use crate::contextual::{Contextual, EnforcementStage};
use crate::errors::rejection;
use crate::persistence::{ask_persistence, ThingPersistenceRef};
use ditto_model::{
    thing, AuthorizationSubject, CommandCategory, CommandResponse, DittoRuntimeError, EntityId,
    EntityReference, ErrorKind, JsonPointer, Permission, Policy, PolicyAction, PolicyCommand,
    ResourceKey, ResourceType, Signal, ThingAction, ThingCommand,
};
use ditto_policies::{default_policy_for, PolicyEnforcer};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThingCommandEnforcement;

impl ThingCommandEnforcement {
    pub async fn enforce(
        &self,
        services: &EnforcementServices,
        persistence: &ThingPersistenceRef,
        ctx: &mut Contextual<Signal>,
    ) -> Result<CommandResponse, DittoRuntimeError> {
        let Signal::Thing(command) = ctx.message().clone() else {
            return Err(DittoRuntimeError::signal_unsupported(ctx.message().name()));
        };
        let entity = command.entity_reference();

        ctx.advance(EnforcementStage::ResolvingEntityId);
        let (id_entry, enforcer_entry) = services
            .retriever
            .retrieve(&entity, |id, enforcer| async move {
                Ok::<_, DittoRuntimeError>((id, enforcer))
            })
            .await?;
        ctx.advance(EnforcementStage::ResolvingEnforcer);

        let enforcer = match (id_entry.is_present(), enforcer_entry.into_value()) {
            (false, _) if is_creation(&command.action) => {
                return create_thing(services, persistence, ctx, command).await;
            }
            (true, _) if matches!(command.action, ThingAction::CreateThing { .. }) => {
                // the persistence answers with a conflict
                ctx.advance(EnforcementStage::Forwarding);
                return ask_persistence(persistence, &entity, command, ctx.ask_timeout()).await;
            }
            (true, Some(enforcer)) => enforcer,
            (present, _) => {
                debug!(parent: ctx.span(), thing_known = present, "no enforcer for thing");
                return Err(rejection(&entity, command.category()));
            }
        };

        ctx.advance(EnforcementStage::Authorizing);
        authorize_thing_command(&enforcer, &command)?;

        ctx.advance(EnforcementStage::Forwarding);
        let result =
            ask_persistence(persistence, &entity, command.clone(), ctx.ask_timeout()).await;
        match &result {
            Ok(_) if changes_policy_reference(&command.action) => {
                services.retriever.invalidate_id(&entity);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::ThingNotAccessible | ErrorKind::ThingNotModifiable
                ) =>
            {
                debug!(parent: ctx.span(), "cached thing is gone, invalidating");
                services.retriever.invalidate_id(&entity);
            }
            _ => {}
        }
        filter_query_response(&enforcer, &command, result?)
    }
}

fn is_creation(action: &ThingAction) -> bool {
    matches!(action, ThingAction::CreateThing { .. } | ThingAction::ModifyThing { .. })
}

/// Commands after which the Thing may point at another Policy, or at none
fn changes_policy_reference(action: &ThingAction) -> bool {
    matches!(
        action,
        ThingAction::ModifyThing { .. }
            | ThingAction::MergeThing { .. }
            | ThingAction::DeleteThing
            | ThingAction::ModifyPolicyId { .. }
    )
}

fn subjects_of(command: &ThingCommand) -> &[AuthorizationSubject] {
    &command.headers.authorization_context().subjects
}

/// Check `command` against the enforcer of an existing Thing
///
/// Queries need READ somewhere at or below the addressed resource, merges
/// need WRITE on every leaf the patch touches, other writes need
/// unrestricted WRITE. A `condition` header additionally needs READ on the
/// fields it references.
pub(crate) fn authorize_thing_command(
    enforcer: &PolicyEnforcer,
    command: &ThingCommand,
) -> Result<(), DittoRuntimeError> {
    let subjects = subjects_of(command);
    if let Some(condition) = command.headers.condition() {
        check_condition_readable(enforcer, condition, subjects, || {
            DittoRuntimeError::thing_not_accessible(&command.thing_id)
        })?;
    }
    let resource = command.resource_key();
    let allowed = match &command.action {
        ThingAction::MergeThing { path, value } => {
            enforcer.has_merge_permission(path, value, subjects)
        }
        action if action.category() == CommandCategory::Query => {
            enforcer.has_partial_permissions(&resource, subjects, &[Permission::Read])
        }
        _ => enforcer.has_unrestricted_permissions(&resource, subjects, &[Permission::Write]),
    };
    if allowed {
        Ok(())
    } else {
        Err(rejection(&command.entity_reference(), command.category()))
    }
}

/// Restrict a query response to what the requester may read
pub(crate) fn filter_query_response(
    enforcer: &PolicyEnforcer,
    command: &ThingCommand,
    mut response: CommandResponse,
) -> Result<CommandResponse, DittoRuntimeError> {
    if command.category() != CommandCategory::Query {
        return Ok(response);
    }
    let Some(payload) = response.payload.take() else {
        return Ok(response);
    };
    let subjects = subjects_of(command);
    let view = match &command.action {
        ThingAction::RetrieveThing { .. } => Some(enforcer.build_json_view(
            ResourceType::Thing,
            &payload,
            subjects,
            Permission::Read,
            &[JsonPointer::parse("/thingId")],
        )),
        _ => enforcer.build_json_view_at(
            &command.resource_key(),
            &payload,
            subjects,
            Permission::Read,
        ),
    };
    match view {
        Some(view) => {
            response.payload = Some(view);
            Ok(response)
        }
        None => Err(DittoRuntimeError::thing_not_accessible(&command.thing_id)
            .with_headers(response.headers)),
    }
}

async fn create_thing(
    services: &EnforcementServices,
    persistence: &ThingPersistenceRef,
    ctx: &mut Contextual<Signal>,
    command: ThingCommand,
) -> Result<CommandResponse, DittoRuntimeError> {
    let entity = command.entity_reference();
    let (thing_json, initial_policy) = match &command.action {
        ThingAction::CreateThing {
            thing,
            initial_policy,
        }
        | ThingAction::ModifyThing {
            thing,
            initial_policy,
        } => (thing, initial_policy.clone()),
        _ => return Err(rejection(&entity, command.category())),
    };
    let referenced = thing::policy_id(thing_json)
        .map_err(|err| DittoRuntimeError::invalid_entity_id(&err.0))?;

    ctx.advance(EnforcementStage::Authorizing);
    let created_policy = match (initial_policy, referenced) {
        (Some(policy), referenced) => {
            let policy_id = referenced.unwrap_or_else(|| command.thing_id.clone());
            let policy = prepare_inline_policy(&command, policy, &policy_id)?;
            create_policy(services, ctx, &command, policy, &policy_id).await?;
            Some(policy_id)
        }
        (None, Some(policy_id)) => {
            authorize_with_existing_policy(services, &command, &policy_id).await?;
            None
        }
        (None, None) => {
            let subjects = subjects_of(&command);
            if subjects.is_empty() {
                return Err(DittoRuntimeError::invalid_command(
                    "Creating a Thing without a policy requires an authorized subject.",
                ));
            }
            let policy_id = command.thing_id.clone();
            let policy = default_policy_for(&policy_id, subjects);
            create_policy(services, ctx, &command, policy, &policy_id).await?;
            Some(policy_id)
        }
    };

    ctx.advance(EnforcementStage::Forwarding);
    let result = ask_persistence(persistence, &entity, command.clone(), ctx.ask_timeout()).await;
    services.retriever.invalidate_id(&entity);
    if let (Err(err), Some(policy_id)) = (&result, &created_policy) {
        if creation_definitely_failed(err) {
            debug!(
                parent: ctx.span(),
                error = %err,
                "thing creation failed after its policy was created"
            );
            delete_policy(services, ctx, &command, policy_id).await;
        } else {
            warn!(
                parent: ctx.span(),
                %policy_id,
                error = %err,
                "thing creation outcome unknown, keeping its policy"
            );
        }
    }
    result
}

/// An unavailable persistence may still process the queued creation, so only
/// a definite rejection allows removing the policy made for it
fn creation_definitely_failed(err: &DittoRuntimeError) -> bool {
    !err.kind().is_unavailable()
}

/// Validate an inline policy sent along with a new Thing. Its id must be
/// absent or equal to the policy id the Thing ends up with, and it must let
/// the issuer write the Thing.
fn prepare_inline_policy(
    command: &ThingCommand,
    mut policy: Policy,
    policy_id: &EntityId,
) -> Result<Policy, DittoRuntimeError> {
    if let Some(own) = policy.policy_id.as_ref().filter(|own| *own != policy_id) {
        return Err(
            DittoRuntimeError::thing_not_modifiable(&command.thing_id).with_description(format!(
                "The inline Policy ID '{}' does not match the Policy ID '{}' of the Thing.",
                own, policy_id
            )),
        );
    }
    policy.policy_id = Some(policy_id.clone());
    super::policy::validate_policy(&policy)?;
    let enforcer = PolicyEnforcer::new(policy);
    let root = ResourceKey::thing("/");
    if !enforcer.has_unrestricted_permissions(&root, subjects_of(command), &[Permission::Write]) {
        return Err(DittoRuntimeError::thing_not_modifiable(&command.thing_id)
            .with_description("The inline Policy does not grant you WRITE on the Thing."));
    }
    Ok(enforcer.policy().clone())
}

async fn authorize_with_existing_policy(
    services: &EnforcementServices,
    command: &ThingCommand,
    policy_id: &EntityId,
) -> Result<(), DittoRuntimeError> {
    let key = EntityReference::policy(policy_id.clone());
    let entry = services
        .retriever
        .retrieve_by_enforcer_key(&key, |entry| async move { Ok::<_, DittoRuntimeError>(entry) })
        .await?;
    let Some(enforcer) = entry.into_value() else {
        return Err(DittoRuntimeError::thing_not_creatable_policy_missing(
            &command.thing_id,
            policy_id,
        ));
    };
    let root = ResourceKey::thing("/");
    if enforcer.has_unrestricted_permissions(&root, subjects_of(command), &[Permission::Write]) {
        Ok(())
    } else {
        Err(DittoRuntimeError::thing_not_modifiable(&command.thing_id))
    }
}

async fn create_policy(
    services: &EnforcementServices,
    ctx: &Contextual<Signal>,
    command: &ThingCommand,
    policy: Policy,
    policy_id: &EntityId,
) -> Result<(), DittoRuntimeError> {
    let create = PolicyCommand::new(
        policy_id.clone(),
        PolicyAction::CreatePolicy { policy },
        command.headers.clone(),
    );
    let result = services
        .policies
        .sudo_command(Signal::Policy(create), ctx.ask_timeout())
        .await;
    services.retriever.invalidate_enforcer(&EntityReference::policy(policy_id.clone()));
    match result {
        Ok(_) => {
            info!(parent: ctx.span(), %policy_id, "created policy for new thing");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::PolicyConflict => {
            debug!(parent: ctx.span(), %policy_id, "policy for new thing already exists");
            Err(DittoRuntimeError::thing_not_creatable_implicit_policy(
                &command.thing_id,
                policy_id,
            ))
        }
        Err(err) => Err(err),
    }
}

async fn delete_policy(
    services: &EnforcementServices,
    ctx: &Contextual<Signal>,
    command: &ThingCommand,
    policy_id: &EntityId,
) {
    let delete = PolicyCommand::new(
        policy_id.clone(),
        PolicyAction::DeletePolicy,
        command.headers.clone(),
    );
    match services
        .policies
        .sudo_command(Signal::Policy(delete), ctx.ask_timeout())
        .await
    {
        Ok(_) => debug!(
            parent: ctx.span(),
            %policy_id,
            "rolled back policy of failed thing creation"
        ),
        Err(err) => {
            warn!(parent: ctx.span(), %policy_id, error = %err, "could not roll back policy")
        }
    }
    services.retriever.invalidate_enforcer(&EntityReference::policy(policy_id.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::test_services;
    use crate::persistence::ThingPersistenceActor;
    use ditto_actors::{spawn, ActorId};
    use ditto_cache::Entry;
    use ditto_model::{AuthorizationContext, DittoHeaders, PolicyEntry};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn thing_id() -> EntityId {
        "org.example:lamp".parse().unwrap()
    }

    fn enforcer() -> PolicyEnforcer {
        PolicyEnforcer::new(
            Policy::new("org.example:policy".parse().unwrap())
                .with_entry(
                    "owner",
                    PolicyEntry::new()
                        .with_subject("user:owner")
                        .grant(ResourceKey::thing("/"), &[Permission::Read, Permission::Write]),
                )
                .with_entry(
                    "viewer",
                    PolicyEntry::new()
                        .with_subject("user:viewer")
                        .grant(ResourceKey::thing("/attributes"), &[Permission::Read])
                        .revoke(ResourceKey::thing("/attributes/serial"), &[Permission::Read]),
                ),
        )
    }

    fn command(subject: &str, action: ThingAction) -> ThingCommand {
        let headers = DittoHeaders::new()
            .with_correlation_id("c-1")
            .with_authorization_context(AuthorizationContext::new([subject]));
        ThingCommand::new(thing_id(), action, headers)
    }

    #[test]
    fn test_reads_and_writes_are_rejected_differently() {
        let enforcer = enforcer();
        let retrieve = command("user:viewer", ThingAction::RetrieveThing { selected_fields: None });
        assert!(authorize_thing_command(&enforcer, &retrieve).is_ok());

        let delete = command("user:viewer", ThingAction::DeleteThing);
        let err = authorize_thing_command(&enforcer, &delete).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ThingNotModifiable);

        let stranger = command(
            "user:stranger",
            ThingAction::RetrieveThing {
                selected_fields: None,
            },
        );
        let err = authorize_thing_command(&enforcer, &stranger).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ThingNotAccessible);
    }

    #[test]
    fn test_condition_on_hidden_field_is_not_accessible() {
        let enforcer = enforcer();
        let mut retrieve = command(
            "user:viewer",
            ThingAction::RetrieveThing {
                selected_fields: None,
            },
        );
        retrieve.headers = retrieve.headers.with_condition("eq(attributes/serial,\"x-1\")");
        let err = authorize_thing_command(&enforcer, &retrieve).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ThingNotAccessible);
    }

    #[test]
    fn test_query_response_is_filtered() {
        let enforcer = enforcer();
        let retrieve = command("user:viewer", ThingAction::RetrieveThing { selected_fields: None });
        let response = CommandResponse::for_thing(
            &retrieve,
            200,
            Some(json!({
                "thingId": "org.example:lamp",
                "policyId": "org.example:policy",
                "attributes": {"color": "red", "serial": "x-1"},
                "features": {"lamp": {"properties": {"on": true}}}
            })),
        );
        let filtered = filter_query_response(&enforcer, &retrieve, response).unwrap();
        assert_eq!(
            filtered.payload,
            Some(json!({
                "thingId": "org.example:lamp",
                "attributes": {"color": "red"}
            }))
        );
    }

    #[test]
    fn test_hidden_sub_resource_is_not_accessible() {
        let enforcer = enforcer();
        let retrieve = command(
            "user:viewer",
            ThingAction::RetrieveAttribute {
                pointer: JsonPointer::parse("/serial"),
            },
        );
        let response = CommandResponse::for_thing(&retrieve, 200, Some(json!("x-1")));
        let err = filter_query_response(&enforcer, &retrieve, response).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ThingNotAccessible);
        assert_eq!(err.correlation_id(), Some("c-1"));
    }

    #[test]
    fn test_inline_policy_must_grant_issuer() {
        let create = command(
            "user:owner",
            ThingAction::CreateThing {
                thing: json!({}),
                initial_policy: None,
            },
        );
        let policy_id = thing_id();
        let granting = Policy::default().with_entry(
            "owner",
            PolicyEntry::new()
                .with_subject("user:owner")
                .grant(ResourceKey::thing("/"), &[Permission::Read, Permission::Write])
                .grant(ResourceKey::policy("/"), &[Permission::Read, Permission::Write]),
        );
        let prepared = prepare_inline_policy(&create, granting.clone(), &policy_id).unwrap();
        assert_eq!(prepared.policy_id, Some(policy_id.clone()));

        let foreign = command(
            "user:other",
            ThingAction::CreateThing {
                thing: json!({}),
                initial_policy: None,
            },
        );
        let err = prepare_inline_policy(&foreign, granting.clone(), &policy_id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ThingNotModifiable);

        let mut mismatched = granting;
        mismatched.policy_id = Some("org.example:elsewhere".parse().unwrap());
        let err = prepare_inline_policy(&create, mismatched, &policy_id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ThingNotModifiable);
    }

    #[tokio::test]
    async fn test_write_to_vanished_thing_is_not_modifiable() {
        let services = test_services();
        let thing = EntityReference::thing(thing_id());
        let policy = EntityReference::policy("org.example:policy".parse().unwrap());
        services.retriever.id_cache().put(thing.clone(), Entry::exists(1, policy.clone()));
        services
            .retriever
            .enforcer_cache()
            .put(policy, Entry::exists(1, Arc::new(enforcer())));
        // the caches still know a Thing its persistence no longer has
        let (persistence, _) =
            spawn(ActorId::unique("thing"), ThingPersistenceActor::new(thing_id()), 8);

        let modify = command(
            "user:owner",
            ThingAction::ModifyAttribute {
                pointer: JsonPointer::parse("/on"),
                value: json!(true),
            },
        );
        let (sink, _replies) = mpsc::channel(1);
        let mut ctx = Contextual::for_signal(Signal::Thing(modify), sink, Duration::from_secs(1));
        let err = ThingCommandEnforcement
            .enforce(&services, &persistence, &mut ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ThingNotModifiable);
        assert_eq!(err.correlation_id(), Some("c-1"));
        assert!(services.retriever.id_cache().get_if_present(&thing).is_none());
    }

    #[test]
    fn test_policy_is_kept_when_creation_outcome_is_unknown() {
        let id = thing_id();
        assert!(creation_definitely_failed(&DittoRuntimeError::thing_conflict(&id)));
        assert!(creation_definitely_failed(&DittoRuntimeError::too_many_requests(&id)));
        assert!(!creation_definitely_failed(&DittoRuntimeError::thing_unavailable(&id)));
    }
}
