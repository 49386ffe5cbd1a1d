//! Policy created implicitly for a thing that brings none

use ditto_model::{AuthorizationSubject, EntityId, Permission, Policy, PolicyEntry, ResourceKey};

/// Label of the single entry of an implicit policy
pub const DEFAULT_ENTRY_LABEL: &str = "DEFAULT";

/// Policy granting the creating subjects READ and WRITE on the thing, the
/// policy itself and messages
pub fn default_policy_for(policy_id: &EntityId, subjects: &[AuthorizationSubject]) -> Policy {
    let all = [Permission::Read, Permission::Write];
    let entry = subjects
        .iter()
        .fold(PolicyEntry::new(), |entry, subject| entry.with_subject(subject.as_str()))
        .grant(ResourceKey::thing("/"), &all)
        .grant(ResourceKey::policy("/"), &all)
        .grant(ResourceKey::message("/"), &all);
    Policy::new(policy_id.clone()).with_entry(DEFAULT_ENTRY_LABEL, entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PolicyEnforcer;

    #[test]
    fn test_default_policy_grants_creator_everything() {
        let creator = vec![AuthorizationSubject::new("user:creator")];
        let policy = default_policy_for(&"org.example:lamp".parse().unwrap(), &creator);
        assert_eq!(policy.entries.len(), 1);
        assert!(policy.entries.contains_key(DEFAULT_ENTRY_LABEL));

        let enforcer = PolicyEnforcer::new(policy);
        for resource in [
            ResourceKey::thing("/"),
            ResourceKey::policy("/"),
            ResourceKey::message("/"),
        ] {
            assert!(enforcer.has_unrestricted_permissions(
                &resource,
                &creator,
                &[Permission::Read, Permission::Write]
            ));
        }
        assert!(!enforcer.has_partial_permissions(
            &ResourceKey::thing("/"),
            &[AuthorizationSubject::new("user:other")],
            &[Permission::Read]
        ));
    }
}
