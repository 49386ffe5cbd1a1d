//! Authorization decisions for one policy revision
//!
//! A [`PolicyEnforcer`] is built once from a [`Policy`] and never mutated;
//! a changed policy gets a new enforcer.

use crate::merge::merge_leaves;
use crate::trie::{Decision, PermissionTrie};
use ditto_model::{AuthorizationSubject, JsonPointer, Permission, Policy, ResourceKey, ResourceType};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use tracing::trace;

#[derive(Debug, Clone)]
pub struct PolicyEnforcer {
    policy: Policy,
    tries: HashMap<ResourceType, PermissionTrie>,
}

impl PolicyEnforcer {
    pub fn new(policy: Policy) -> Self {
        let mut tries: HashMap<ResourceType, PermissionTrie> = HashMap::new();
        for entry in policy.entries.values() {
            for subject_id in entry.subjects.keys() {
                let subject = AuthorizationSubject::new(subject_id.clone());
                for (resource, perms) in &entry.resources {
                    let trie = tries.entry(resource.resource_type).or_default();
                    trie.grant(&resource.path, &subject, &perms.grant);
                    trie.revoke(&resource.path, &subject, &perms.revoke);
                }
            }
        }
        Self { policy, tries }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Every permission granted on `resource` and nothing of it revoked
    /// anywhere beneath
    pub fn has_unrestricted_permissions(
        &self,
        resource: &ResourceKey,
        subjects: &[AuthorizationSubject],
        perms: &[Permission],
    ) -> bool {
        let allowed = self.tries.get(&resource.resource_type).is_some_and(|trie| {
            perms
                .iter()
                .all(|p| trie.has_unrestricted(&resource.path, subjects, *p))
        });
        trace!(%resource, ?perms, allowed, "unrestricted permission check");
        allowed
    }

    /// Every permission granted on `resource` or somewhere beneath it
    pub fn has_partial_permissions(
        &self,
        resource: &ResourceKey,
        subjects: &[AuthorizationSubject],
        perms: &[Permission],
    ) -> bool {
        let allowed = self.tries.get(&resource.resource_type).is_some_and(|trie| {
            perms
                .iter()
                .all(|p| trie.has_partial(&resource.path, subjects, *p))
        });
        trace!(%resource, ?perms, allowed, "partial permission check");
        allowed
    }

    pub fn has_unrestricted_permissions_all(
        &self,
        resources: &[ResourceKey],
        subjects: &[AuthorizationSubject],
        perms: &[Permission],
    ) -> bool {
        resources
            .iter()
            .all(|resource| self.has_unrestricted_permissions(resource, subjects, perms))
    }

    /// WRITE on every leaf a merge patch at `path` touches, decided at the
    /// leaf itself; revokes deeper than a leaf do not deny it
    pub fn has_merge_permission(
        &self,
        path: &JsonPointer,
        patch: &Value,
        subjects: &[AuthorizationSubject],
    ) -> bool {
        merge_leaves(path, patch).into_iter().all(|leaf| {
            let resource = ResourceKey::thing(leaf);
            self.decision(&resource, subjects, Permission::Write) == Decision::Granted
        })
    }

    /// Decision at exactly `resource`
    pub fn decision(
        &self,
        resource: &ResourceKey,
        subjects: &[AuthorizationSubject],
        permission: Permission,
    ) -> Decision {
        self.tries
            .get(&resource.resource_type)
            .map_or(Decision::Undefined, |trie| {
                trie.decision(&resource.path, subjects, permission)
            })
    }

    /// View of a whole entity document: the readable parts plus the
    /// whitelisted fields
    pub fn build_json_view(
        &self,
        resource_type: ResourceType,
        value: &Value,
        subjects: &[AuthorizationSubject],
        permission: Permission,
        whitelist: &[JsonPointer],
    ) -> Value {
        let mut view = self
            .tries
            .get(&resource_type)
            .and_then(|trie| trie.view(value, subjects, permission))
            .unwrap_or_else(|| Value::Object(Map::new()));
        for pointer in whitelist {
            if let Some(field) = pointer.get(value) {
                pointer.set(&mut view, field.clone());
            }
        }
        view
    }

    /// View of a value that sits at `resource` inside its entity. `None` if
    /// nothing of it is visible.
    pub fn build_json_view_at(
        &self,
        resource: &ResourceKey,
        value: &Value,
        subjects: &[AuthorizationSubject],
        permission: Permission,
    ) -> Option<Value> {
        let wrapped = resource.path.wrap(value.clone());
        let view = self
            .tries
            .get(&resource.resource_type)?
            .view(&wrapped, subjects, permission)?;
        resource.path.get(&view).cloned()
    }

    /// Subjects that have `permission` on `resource` or beneath it
    pub fn subjects_with_partial_permission(
        &self,
        resource: &ResourceKey,
        permission: Permission,
    ) -> BTreeSet<AuthorizationSubject> {
        self.subjects_matching(resource, |trie, subject| {
            trie.has_partial(&resource.path, std::slice::from_ref(subject), permission)
        })
    }

    /// Subjects that have `permission` on `resource` and everything beneath
    pub fn subjects_with_unrestricted_permission(
        &self,
        resource: &ResourceKey,
        permission: Permission,
    ) -> BTreeSet<AuthorizationSubject> {
        self.subjects_matching(resource, |trie, subject| {
            trie.has_unrestricted(&resource.path, std::slice::from_ref(subject), permission)
        })
    }

    fn subjects_matching<F>(
        &self,
        resource: &ResourceKey,
        check: F,
    ) -> BTreeSet<AuthorizationSubject>
    where
        F: Fn(&PermissionTrie, &AuthorizationSubject) -> bool,
    {
        let Some(trie) = self.tries.get(&resource.resource_type) else {
            return BTreeSet::new();
        };
        trie.subjects()
            .into_iter()
            .filter(|subject| check(trie, subject))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ditto_model::PolicyEntry;
    use serde_json::json;

    fn subjects(id: &str) -> Vec<AuthorizationSubject> {
        vec![AuthorizationSubject::new(id)]
    }

    fn policy() -> Policy {
        Policy::new("org.example:policy".parse().unwrap())
            .with_entry(
                "owner",
                PolicyEntry::new()
                    .with_subject("user:owner")
                    .grant(ResourceKey::thing("/"), &[Permission::Read, Permission::Write])
                    .grant(ResourceKey::policy("/"), &[Permission::Read, Permission::Write]),
            )
            .with_entry(
                "reader",
                PolicyEntry::new()
                    .with_subject("user:reader")
                    .grant(ResourceKey::thing("/"), &[Permission::Read])
                    .revoke(ResourceKey::thing("/attributes/secret"), &[Permission::Read]),
            )
    }

    #[test]
    fn test_unrestricted_and_partial() {
        let enforcer = PolicyEnforcer::new(policy());
        let root = ResourceKey::thing("/");
        assert!(enforcer.has_unrestricted_permissions(
            &root,
            &subjects("user:owner"),
            &[Permission::Read, Permission::Write]
        ));
        let reader = subjects("user:reader");
        assert!(!enforcer.has_unrestricted_permissions(&root, &reader, &[Permission::Read]));
        assert!(enforcer.has_partial_permissions(&root, &reader, &[Permission::Read]));
        assert!(!enforcer.has_partial_permissions(&root, &reader, &[Permission::Write]));
        assert!(!enforcer.has_partial_permissions(
            &ResourceKey::message("/"),
            &subjects("user:owner"),
            &[Permission::Write]
        ));
    }

    #[test]
    fn test_build_json_view_with_whitelist() {
        let enforcer = PolicyEnforcer::new(policy());
        let thing = json!({
            "thingId": "org.example:lamp",
            "policyId": "org.example:policy",
            "attributes": {"secret": "xyz", "color": "red"}
        });
        let view = enforcer.build_json_view(
            ResourceType::Thing,
            &thing,
            &subjects("user:reader"),
            Permission::Read,
            &[JsonPointer::parse("/thingId")],
        );
        assert_eq!(
            view,
            json!({
                "thingId": "org.example:lamp",
                "policyId": "org.example:policy",
                "attributes": {"color": "red"}
            })
        );

        let stranger = enforcer.build_json_view(
            ResourceType::Thing,
            &thing,
            &subjects("user:nobody"),
            Permission::Read,
            &[JsonPointer::parse("/thingId")],
        );
        assert_eq!(stranger, json!({"thingId": "org.example:lamp"}));
    }

    #[test]
    fn test_view_at_sub_resource() {
        let enforcer = PolicyEnforcer::new(policy());
        let attributes = json!({"secret": "xyz", "color": "red"});
        let view = enforcer.build_json_view_at(
            &ResourceKey::thing("/attributes"),
            &attributes,
            &subjects("user:reader"),
            Permission::Read,
        );
        assert_eq!(view, Some(json!({"color": "red"})));
        assert_eq!(
            enforcer.build_json_view_at(
                &ResourceKey::thing("/attributes/secret"),
                &json!("xyz"),
                &subjects("user:reader"),
                Permission::Read,
            ),
            None
        );
    }

    #[test]
    fn test_subjects_with_permission() {
        let enforcer = PolicyEnforcer::new(policy());
        let readers =
            enforcer.subjects_with_partial_permission(&ResourceKey::thing("/"), Permission::Read);
        assert_eq!(readers.len(), 2);
        let root = ResourceKey::policy("/");
        let writers = enforcer.subjects_with_unrestricted_permission(&root, Permission::Write);
        assert_eq!(writers, BTreeSet::from([AuthorizationSubject::new("user:owner")]));
    }

    #[test]
    fn test_decision() {
        let enforcer = PolicyEnforcer::new(policy());
        assert_eq!(
            enforcer.decision(
                &ResourceKey::thing("/attributes/secret"),
                &subjects("user:reader"),
                Permission::Read
            ),
            Decision::Revoked
        );
    }
}
