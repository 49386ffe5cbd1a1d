//! Policy commands
//!
//! A Policy is its own enforcer. A write is only accepted when the Policy
//! that results from it still has a subject allowed to write it, and a
//! newly created Policy must let its creator write it.

use super::EnforcementServices;
use crate::contextual::{Contextual, EnforcementStage};
use crate::errors::rejection;
use crate::persistence::{ask_persistence, PolicyPersistenceRef};
use ditto_model::{
    AuthorizationSubject, CommandCategory, CommandResponse, DittoRuntimeError, EntityId, ErrorKind,
    JsonPointer, Permission, Policy, PolicyAction, PolicyCommand, ResourceKey, ResourceType, Signal,
};
use ditto_policies::PolicyEnforcer;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyCommandEnforcement;

impl PolicyCommandEnforcement {
    pub async fn enforce(
        &self,
        services: &EnforcementServices,
        persistence: &PolicyPersistenceRef,
        ctx: &mut Contextual<Signal>,
    ) -> Result<CommandResponse, DittoRuntimeError> {
        let Signal::Policy(command) = ctx.message().clone() else {
            return Err(DittoRuntimeError::signal_unsupported(ctx.message().name()));
        };
        let entity = command.entity_reference();

        ctx.advance(EnforcementStage::ResolvingEnforcer);
        let entry = services
            .retriever
            .retrieve_by_enforcer_key(&entity, |entry| async move {
                Ok::<_, DittoRuntimeError>(entry)
            })
            .await?;

        ctx.advance(EnforcementStage::Authorizing);
        let enforcer: Option<Arc<PolicyEnforcer>> = match (entry.into_value(), &command.action) {
            (None, PolicyAction::CreatePolicy { policy })
            | (None, PolicyAction::ModifyPolicy { policy }) => {
                validate_new_policy(&command.policy_id, policy, subjects_of(&command))?;
                None
            }
            // the persistence answers with a conflict
            (Some(_), PolicyAction::CreatePolicy { .. }) => None,
            (Some(enforcer), _) => {
                authorize_policy_command(&enforcer, &command)?;
                Some(enforcer)
            }
            (None, _) => {
                debug!(parent: ctx.span(), "policy does not exist");
                return Err(rejection(&entity, command.category()));
            }
        };

        ctx.advance(EnforcementStage::Forwarding);
        let result =
            ask_persistence(persistence, &entity, command.clone(), ctx.ask_timeout()).await;
        match &result {
            Ok(_) if command.category().is_write() => {
                services.retriever.invalidate_enforcer(&entity);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::PolicyNotAccessible | ErrorKind::PolicyNotModifiable
                ) =>
            {
                services.retriever.invalidate_enforcer(&entity);
            }
            _ => {}
        }
        let response = result?;
        match enforcer {
            Some(enforcer) => filter_policy_response(&enforcer, &command, response),
            None => Ok(response),
        }
    }
}

fn subjects_of(command: &PolicyCommand) -> &[AuthorizationSubject] {
    &command.headers.authorization_context().subjects
}

/// A Policy nobody can write any more cannot be repaired
pub(crate) fn validate_policy(policy: &Policy) -> Result<(), DittoRuntimeError> {
    let enforcer = PolicyEnforcer::new(policy.clone());
    let root = ResourceKey::policy("/");
    let writers = enforcer.subjects_with_unrestricted_permission(&root, Permission::Write);
    if writers.is_empty() {
        Err(DittoRuntimeError::invalid_policy(
            "The Policy must contain at least one subject with WRITE permission on 'policy:/'.",
        ))
    } else {
        Ok(())
    }
}

fn validate_new_policy(
    policy_id: &EntityId,
    policy: &Policy,
    subjects: &[AuthorizationSubject],
) -> Result<(), DittoRuntimeError> {
    validate_policy(policy)?;
    let enforcer = PolicyEnforcer::new(policy.clone());
    let root = ResourceKey::policy("/");
    if enforcer.has_unrestricted_permissions(&root, subjects, &[Permission::Write]) {
        Ok(())
    } else {
        Err(DittoRuntimeError::policy_not_modifiable(policy_id).with_description(
            "The Policy you create must grant you WRITE permission on 'policy:/'.",
        ))
    }
}

/// The Policy after applying `action` to `current`, for writes that keep it
fn resulting_policy(current: &Policy, action: &PolicyAction) -> Option<Policy> {
    match action {
        PolicyAction::ModifyPolicy { policy } => Some(policy.clone()),
        PolicyAction::ModifyPolicyEntry { label, entry } => {
            let mut next = current.clone();
            next.entries.insert(label.clone(), entry.clone());
            Some(next)
        }
        PolicyAction::DeletePolicyEntry { label } => {
            let mut next = current.clone();
            next.entries.remove(label);
            Some(next)
        }
        PolicyAction::CreatePolicy { .. }
        | PolicyAction::DeletePolicy
        | PolicyAction::RetrievePolicy => None,
        PolicyAction::RetrievePolicyEntry { .. } => None,
    }
}

pub(crate) fn authorize_policy_command(
    enforcer: &PolicyEnforcer,
    command: &PolicyCommand,
) -> Result<(), DittoRuntimeError> {
    let subjects = subjects_of(command);
    let resource = command.resource_key();
    let allowed = if command.category() == CommandCategory::Query {
        enforcer.has_partial_permissions(&resource, subjects, &[Permission::Read])
    } else {
        enforcer.has_unrestricted_permissions(&resource, subjects, &[Permission::Write])
    };
    if !allowed {
        return Err(rejection(&command.entity_reference(), command.category()));
    }
    match resulting_policy(enforcer.policy(), &command.action) {
        Some(next) => validate_policy(&next),
        None => Ok(()),
    }
}

/// Restrict a policy query response to what the requester may read; the
/// policy id always stays visible
pub(crate) fn filter_policy_response(
    enforcer: &PolicyEnforcer,
    command: &PolicyCommand,
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
        PolicyAction::RetrievePolicy => Some(enforcer.build_json_view(
            ResourceType::Policy,
            &payload,
            subjects,
            Permission::Read,
            &[JsonPointer::parse("/policyId")],
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
        None => Err(DittoRuntimeError::policy_not_accessible(&command.policy_id)
            .with_headers(response.headers)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ditto_model::{AuthorizationContext, DittoHeaders, PolicyEntry};
    use serde_json::json;

    fn policy_id() -> EntityId {
        "org.example:policy".parse().unwrap()
    }

    fn admin_entry() -> PolicyEntry {
        PolicyEntry::new()
            .with_subject("user:admin")
            .grant(ResourceKey::policy("/"), &[Permission::Read, Permission::Write])
    }

    fn command(subject: &str, action: PolicyAction) -> PolicyCommand {
        let headers = DittoHeaders::new()
            .with_correlation_id("c-1")
            .with_authorization_context(AuthorizationContext::new([subject]));
        PolicyCommand::new(policy_id(), action, headers)
    }

    #[test]
    fn test_new_policy_must_grant_creator() {
        let policy = Policy::new(policy_id()).with_entry("admin", admin_entry());
        let admin = [AuthorizationSubject::new("user:admin")];
        assert!(validate_new_policy(&policy_id(), &policy, &admin).is_ok());

        let other = [AuthorizationSubject::new("user:other")];
        let err = validate_new_policy(&policy_id(), &policy, &other).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyNotModifiable);

        let unmanageable = Policy::new(policy_id()).with_entry(
            "reader",
            PolicyEntry::new()
                .with_subject("user:admin")
                .grant(ResourceKey::policy("/"), &[Permission::Read]),
        );
        let err = validate_new_policy(&policy_id(), &unmanageable, &admin).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPolicy);
    }

    #[test]
    fn test_deleting_last_writer_entry_is_invalid() {
        let enforcer =
            PolicyEnforcer::new(Policy::new(policy_id()).with_entry("admin", admin_entry()));
        let delete = command(
            "user:admin",
            PolicyAction::DeletePolicyEntry {
                label: "admin".to_string(),
            },
        );
        let err = authorize_policy_command(&enforcer, &delete).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPolicy);
    }

    #[test]
    fn test_revoked_entries_are_hidden() {
        let enforcer = PolicyEnforcer::new(
            Policy::new(policy_id()).with_entry("admin", admin_entry()).with_entry(
                "auditor",
                PolicyEntry::new()
                    .with_subject("user:auditor")
                    .grant(ResourceKey::policy("/"), &[Permission::Read])
                    .revoke(ResourceKey::policy("/entries"), &[Permission::Read]),
            ),
        );
        let retrieve = command("user:auditor", PolicyAction::RetrievePolicy);
        assert!(authorize_policy_command(&enforcer, &retrieve).is_ok());
        let response =
            CommandResponse::for_policy(&retrieve, 200, Some(enforcer.policy().to_json()));
        let filtered = filter_policy_response(&enforcer, &retrieve, response).unwrap();
        assert_eq!(filtered.payload, Some(json!({"policyId": "org.example:policy"})));
    }

    #[test]
    fn test_read_on_entries_only_shows_entries_and_id() {
        let enforcer = PolicyEnforcer::new(
            Policy::new(policy_id()).with_entry("admin", admin_entry()).with_entry(
                "auditor",
                PolicyEntry::new()
                    .with_subject("user:auditor")
                    .grant(ResourceKey::policy("/entries"), &[Permission::Read]),
            ),
        );
        let retrieve = command("user:auditor", PolicyAction::RetrievePolicy);
        assert!(authorize_policy_command(&enforcer, &retrieve).is_ok());
        let full = enforcer.policy().to_json();
        let response = CommandResponse::for_policy(&retrieve, 200, Some(full.clone()));
        let view = filter_policy_response(&enforcer, &retrieve, response)
            .unwrap()
            .payload
            .unwrap();

        let keys: Vec<&str> = view.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, ["entries", "policyId"]);
        assert_eq!(view["entries"], full["entries"]);
        assert_eq!(view["policyId"], json!("org.example:policy"));
    }

    #[test]
    fn test_unauthorized_write_is_not_modifiable() {
        let enforcer =
            PolicyEnforcer::new(Policy::new(policy_id()).with_entry("admin", admin_entry()));
        let delete = command("user:other", PolicyAction::DeletePolicy);
        let err = authorize_policy_command(&enforcer, &delete).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyNotModifiable);
    }
}
