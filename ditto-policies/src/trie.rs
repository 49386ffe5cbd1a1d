//! Permission trie over resource paths
//!
//! Every node holds the grants and revokes that policy entries declare for
//! exactly that path. The decision for a path is the one of the deepest node
//! on the way from the root that says anything for the permission in
//! question; at one node a revoke beats a grant.

use ditto_model::{AuthorizationSubject, JsonPointer, Permission};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Decision for one permission at one path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Granted,
    Revoked,
    Undefined,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct PermissionNode {
    grants: BTreeMap<AuthorizationSubject, BTreeSet<Permission>>,
    revokes: BTreeMap<AuthorizationSubject, BTreeSet<Permission>>,
    children: BTreeMap<String, PermissionNode>,
}

impl PermissionNode {
    /// Explicit decision at this node, if any
    fn decision_here(
        &self,
        subjects: &[AuthorizationSubject],
        permission: Permission,
    ) -> Option<Decision> {
        let mentions = |map: &BTreeMap<AuthorizationSubject, BTreeSet<Permission>>| {
            subjects
                .iter()
                .any(|s| map.get(s).is_some_and(|perms| perms.contains(&permission)))
        };
        if mentions(&self.revokes) {
            Some(Decision::Revoked)
        } else if mentions(&self.grants) {
            Some(Decision::Granted)
        } else {
            None
        }
    }

    fn any_revoke_beneath(
        &self,
        subjects: &[AuthorizationSubject],
        permission: Permission,
    ) -> bool {
        self.children.values().any(|child| {
            child.decision_here(subjects, permission) == Some(Decision::Revoked)
                || child.any_revoke_beneath(subjects, permission)
        })
    }

    fn granted_somewhere(
        &self,
        inherited: Decision,
        subjects: &[AuthorizationSubject],
        permission: Permission,
    ) -> bool {
        let here = self.decision_here(subjects, permission).unwrap_or(inherited);
        here == Decision::Granted
            || self
                .children
                .values()
                .any(|child| child.granted_somewhere(here, subjects, permission))
    }

    fn node_mut(&mut self, path: &JsonPointer) -> &mut PermissionNode {
        path.segments()
            .iter()
            .fold(self, |node, segment| node.children.entry(segment.clone()).or_default())
    }

    fn collect_subjects(&self, out: &mut BTreeSet<AuthorizationSubject>) {
        out.extend(self.grants.keys().cloned());
        out.extend(self.revokes.keys().cloned());
        for child in self.children.values() {
            child.collect_subjects(out);
        }
    }
}

/// Trie of one resource type (`thing`, `policy` or `message`)
#[derive(Debug, Clone, Default)]
pub struct PermissionTrie {
    root: PermissionNode,
}

impl PermissionTrie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(
        &mut self,
        path: &JsonPointer,
        subject: &AuthorizationSubject,
        perms: &BTreeSet<Permission>,
    ) {
        if perms.is_empty() {
            return;
        }
        self.root
            .node_mut(path)
            .grants
            .entry(subject.clone())
            .or_default()
            .extend(perms.iter().copied());
    }

    pub fn revoke(
        &mut self,
        path: &JsonPointer,
        subject: &AuthorizationSubject,
        perms: &BTreeSet<Permission>,
    ) {
        if perms.is_empty() {
            return;
        }
        self.root
            .node_mut(path)
            .revokes
            .entry(subject.clone())
            .or_default()
            .extend(perms.iter().copied());
    }

    /// Effective decision at `path` and the trie node there, if one exists
    fn resolve(
        &self,
        path: &JsonPointer,
        subjects: &[AuthorizationSubject],
        permission: Permission,
    ) -> (Decision, Option<&PermissionNode>) {
        let mut decision = self
            .root
            .decision_here(subjects, permission)
            .unwrap_or(Decision::Undefined);
        let mut node = Some(&self.root);
        for segment in path.segments() {
            node = node.and_then(|n| n.children.get(segment));
            match node {
                Some(n) => {
                    if let Some(here) = n.decision_here(subjects, permission) {
                        decision = here;
                    }
                }
                None => break,
            }
        }
        (decision, node)
    }

    pub fn decision(
        &self,
        path: &JsonPointer,
        subjects: &[AuthorizationSubject],
        permission: Permission,
    ) -> Decision {
        self.resolve(path, subjects, permission).0
    }

    /// Granted at `path` and not revoked anywhere beneath it
    pub fn has_unrestricted(
        &self,
        path: &JsonPointer,
        subjects: &[AuthorizationSubject],
        permission: Permission,
    ) -> bool {
        let (decision, node) = self.resolve(path, subjects, permission);
        decision == Decision::Granted
            && node.map_or(true, |n| !n.any_revoke_beneath(subjects, permission))
    }

    /// Granted at `path` or somewhere beneath it
    pub fn has_partial(
        &self,
        path: &JsonPointer,
        subjects: &[AuthorizationSubject],
        permission: Permission,
    ) -> bool {
        let (decision, node) = self.resolve(path, subjects, permission);
        decision == Decision::Granted
            || node.is_some_and(|n| {
                n.children
                    .values()
                    .any(|child| child.granted_somewhere(decision, subjects, permission))
            })
    }

    /// Every subject mentioned in the trie
    pub fn subjects(&self) -> BTreeSet<AuthorizationSubject> {
        let mut out = BTreeSet::new();
        self.root.collect_subjects(&mut out);
        out
    }

    /// Copy of `value` (rooted at the trie root) without the parts the
    /// subjects may not access with `permission`
    pub fn view(
        &self,
        value: &Value,
        subjects: &[AuthorizationSubject],
        permission: Permission,
    ) -> Option<Value> {
        view_of(Some(&self.root), Decision::Undefined, value, subjects, permission)
    }
}

fn view_of(
    node: Option<&PermissionNode>,
    inherited: Decision,
    value: &Value,
    subjects: &[AuthorizationSubject],
    permission: Permission,
) -> Option<Value> {
    let here = node
        .and_then(|n| n.decision_here(subjects, permission))
        .unwrap_or(inherited);
    let Some(node) = node else {
        return (here == Decision::Granted).then(|| value.clone());
    };
    match value {
        Value::Object(map) => {
            if here == Decision::Granted && !node.any_revoke_beneath(subjects, permission) {
                return Some(value.clone());
            }
            let mut out = Map::new();
            for (key, child_value) in map {
                let child = node.children.get(key);
                if let Some(filtered) = view_of(child, here, child_value, subjects, permission) {
                    out.insert(key.clone(), filtered);
                }
            }
            if here == Decision::Granted || !out.is_empty() {
                Some(Value::Object(out))
            } else {
                None
            }
        }
        _ => (here == Decision::Granted).then(|| value.clone()),
    }
}
