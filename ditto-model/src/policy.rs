//! Policy documents in Ditto's JSON shape

use crate::entity::EntityId;
use crate::pointer::JsonPointer;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Permission that may be granted or revoked on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Permission {
    Read,
    Write,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Read => f.write_str("READ"),
            Permission::Write => f.write_str("WRITE"),
        }
    }
}

/// Kind of resource a policy entry talks about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Thing,
    Policy,
    Message,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Thing => "thing",
            ResourceType::Policy => "policy",
            ResourceType::Message => "message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("resource key '{0}' is not valid, expected '<thing|policy|message>:/path'")]
pub struct InvalidResourceKey(pub String);

/// Resource key such as `thing:/features/lamp`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    pub path: JsonPointer,
}

impl ResourceKey {
    pub fn new(resource_type: ResourceType, path: impl Into<JsonPointer>) -> Self {
        Self {
            resource_type,
            path: path.into(),
        }
    }

    pub fn thing(path: impl Into<JsonPointer>) -> Self {
        Self::new(ResourceType::Thing, path)
    }

    pub fn policy(path: impl Into<JsonPointer>) -> Self {
        Self::new(ResourceType::Policy, path)
    }

    pub fn message(path: impl Into<JsonPointer>) -> Self {
        Self::new(ResourceType::Message, path)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type.as_str(), self.path)
    }
}

impl FromStr for ResourceKey {
    type Err = InvalidResourceKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, path) = s
            .split_once(':')
            .ok_or_else(|| InvalidResourceKey(s.to_string()))?;
        let resource_type = match kind {
            "thing" => ResourceType::Thing,
            "policy" => ResourceType::Policy,
            "message" => ResourceType::Message,
            _ => return Err(InvalidResourceKey(s.to_string())),
        };
        if !path.starts_with('/') {
            return Err(InvalidResourceKey(s.to_string()));
        }
        Ok(Self::new(resource_type, JsonPointer::parse(path)))
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = InvalidResourceKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.to_string()
    }
}

/// Granted and revoked permissions on one resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectedPermissions {
    #[serde(default)]
    pub grant: BTreeSet<Permission>,
    #[serde(default)]
    pub revoke: BTreeSet<Permission>,
}

impl EffectedPermissions {
    pub fn granting<I: IntoIterator<Item = Permission>>(perms: I) -> Self {
        Self {
            grant: perms.into_iter().collect(),
            revoke: BTreeSet::new(),
        }
    }

    pub fn revoking<I: IntoIterator<Item = Permission>>(perms: I) -> Self {
        Self {
            grant: BTreeSet::new(),
            revoke: perms.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    #[serde(rename = "type")]
    pub subject_type: String,
}

impl Default for Subject {
    fn default() -> Self {
        Self {
            subject_type: "generated".to_string(),
        }
    }
}

/// Policy entry: who (subjects) may do what (resources)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    #[serde(default)]
    pub subjects: BTreeMap<String, Subject>,
    #[serde(default)]
    pub resources: BTreeMap<ResourceKey, EffectedPermissions>,
}

impl PolicyEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subjects.insert(subject.into(), Subject::default());
        self
    }

    pub fn grant(mut self, resource: ResourceKey, perms: &[Permission]) -> Self {
        self.resources
            .entry(resource)
            .or_default()
            .grant
            .extend(perms.iter().copied());
        self
    }

    pub fn revoke(mut self, resource: ResourceKey, perms: &[Permission]) -> Self {
        self.resources
            .entry(resource)
            .or_default()
            .revoke
            .extend(perms.iter().copied());
        self
    }
}

/// Policy document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<EntityId>,
    #[serde(default)]
    pub entries: BTreeMap<String, PolicyEntry>,
}

impl Policy {
    pub fn new(policy_id: EntityId) -> Self {
        Self {
            policy_id: Some(policy_id),
            entries: BTreeMap::new(),
        }
    }

    pub fn with_entry(mut self, label: impl Into<String>, entry: PolicyEntry) -> Self {
        self.entries.insert(label.into(), entry);
        self
    }

    /// Parse a policy from its JSON representation
    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_key_parse() {
        let key: ResourceKey = "thing:/features/lamp".parse().unwrap();
        assert_eq!(key.resource_type, ResourceType::Thing);
        assert_eq!(key.path, JsonPointer::parse("/features/lamp"));
        assert_eq!(key.to_string(), "thing:/features/lamp");
        assert!("device:/x".parse::<ResourceKey>().is_err());
        assert!("thing:x".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn test_policy_json_shape() {
        let raw = json!({
            "policyId": "org.example:policy",
            "entries": {
                "owner": {
                    "subjects": {"user:alice": {"type": "generated"}},
                    "resources": {
                        "thing:/": {"grant": ["READ", "WRITE"], "revoke": []},
                        "policy:/entries": {"grant": [], "revoke": ["WRITE"]}
                    }
                }
            }
        });
        let policy = Policy::from_json(&raw).unwrap();
        let owner = &policy.entries["owner"];
        assert!(owner.subjects.contains_key("user:alice"));
        let thing_root = &owner.resources[&ResourceKey::thing("/")];
        assert!(thing_root.grant.contains(&Permission::Write));
        assert_eq!(policy.to_json(), raw);
    }

    #[test]
    fn test_entry_builder() {
        let entry = PolicyEntry::new()
            .with_subject("user:a")
            .grant(ResourceKey::thing("/"), &[Permission::Read])
            .revoke(ResourceKey::thing("/attributes"), &[Permission::Read]);
        assert_eq!(entry.resources.len(), 2);
    }
}
