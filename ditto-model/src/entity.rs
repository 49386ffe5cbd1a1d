//! Entity identifiers and references

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

static ENTITY_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<ns>(?:[a-zA-Z]\w*(?:\.[a-zA-Z]\w*)*)?):(?P<name>[^\x00-\x1F\x7F/]+)$")
        .expect("entity id pattern is valid")
});

/// Error returned for ids not in `namespace:name` notation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("entity id '{0}' is not valid, expected 'namespace:name'")]
pub struct InvalidEntityId(pub String);

/// Namespaced entity identifier (`org.example:lamp-1`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    raw: String,
    separator: usize,
}

impl EntityId {
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidEntityId> {
        let raw = raw.into();
        let separator = match ENTITY_ID_PATTERN.captures(&raw) {
            Some(caps) => caps.name("ns").map(|m| m.end()).unwrap_or(0),
            None => return Err(InvalidEntityId(raw)),
        };
        Ok(Self { raw, separator })
    }

    pub fn namespace(&self) -> &str {
        &self.raw[..self.separator]
    }

    pub fn name(&self) -> &str {
        &self.raw[self.separator + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for EntityId {
    type Err = InvalidEntityId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EntityId {
    type Error = InvalidEntityId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.raw
    }
}

/// Type of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Thing,
    Policy,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityType::Thing => f.write_str("thing"),
            EntityType::Policy => f.write_str("policy"),
        }
    }
}

/// Typed pair of entity type and id, used as cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityReference {
    pub entity_type: EntityType,
    pub id: EntityId,
}

impl EntityReference {
    pub fn new(entity_type: EntityType, id: EntityId) -> Self {
        Self { entity_type, id }
    }

    pub fn thing(id: EntityId) -> Self {
        Self::new(EntityType::Thing, id)
    }

    pub fn policy(id: EntityId) -> Self {
        Self::new(EntityType::Policy, id)
    }
}

impl fmt::Display for EntityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}
