//! Cache loaders backed by the shard regions
//!
//! Both loaders read raw state with a sudo retrieval, so they see entities
//! regardless of who asks, and retry transient unavailability as configured.

use crate::config::AskWithRetryConfig;
use crate::errors::internal;
use crate::region::ShardRegion;
use crate::retriever::EnforcerRetriever;
use crate::retry::ask_with_retry;
use async_trait::async_trait;
use ditto_cache::{CacheLoader, Entry};
use ditto_model::{thing, DittoRuntimeError, EntityReference, EntityType, Policy};
use ditto_policies::PolicyEnforcer;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Retriever wired to the shard regions of a node
pub type RegionRetriever = EnforcerRetriever<ThingPolicyIdLoader, PolicyEnforcerLoader>;

/// Resolves a Thing to the Policy it references
pub struct ThingPolicyIdLoader {
    things: ShardRegion,
    ask_timeout: Duration,
    retry: AskWithRetryConfig,
}

impl ThingPolicyIdLoader {
    pub fn new(things: ShardRegion, ask_timeout: Duration, retry: AskWithRetryConfig) -> Self {
        Self {
            things,
            ask_timeout,
            retry,
        }
    }
}

#[async_trait]
impl CacheLoader<EntityReference, EntityReference> for ThingPolicyIdLoader {
    type Error = DittoRuntimeError;

    async fn load(
        &self,
        key: &EntityReference,
    ) -> Result<Entry<EntityReference>, DittoRuntimeError> {
        if key.entity_type == EntityType::Policy {
            return Ok(Entry::permanent(key.clone()));
        }
        let snapshot = ask_with_retry(&self.retry, || {
            self.things.sudo_retrieve(&key.id, self.ask_timeout)
        })
        .await?;
        let Some(snapshot) = snapshot else {
            debug!(entity = %key, "thing does not exist");
            return Ok(Entry::nonexistent());
        };
        match thing::policy_id(&snapshot.json) {
            Ok(Some(policy_id)) => Ok(Entry::exists(
                snapshot.revision,
                EntityReference::policy(policy_id),
            )),
            Ok(None) => Ok(Entry::nonexistent()),
            Err(err) => Err(internal("stored thing has an invalid policy id", &err.0)),
        }
    }
}

/// Builds the enforcer of a Policy
pub struct PolicyEnforcerLoader {
    policies: ShardRegion,
    ask_timeout: Duration,
    retry: AskWithRetryConfig,
}

impl PolicyEnforcerLoader {
    pub fn new(policies: ShardRegion, ask_timeout: Duration, retry: AskWithRetryConfig) -> Self {
        Self {
            policies,
            ask_timeout,
            retry,
        }
    }
}

#[async_trait]
impl CacheLoader<EntityReference, Arc<PolicyEnforcer>> for PolicyEnforcerLoader {
    type Error = DittoRuntimeError;

    async fn load(
        &self,
        key: &EntityReference,
    ) -> Result<Entry<Arc<PolicyEnforcer>>, DittoRuntimeError> {
        let snapshot = ask_with_retry(&self.retry, || {
            self.policies.sudo_retrieve(&key.id, self.ask_timeout)
        })
        .await?;
        let Some(snapshot) = snapshot else {
            debug!(entity = %key, "policy does not exist");
            return Ok(Entry::nonexistent());
        };
        let policy = Policy::from_json(&snapshot.json)
            .map_err(|err| internal("stored policy does not parse", &err))?;
        Ok(Entry::exists(snapshot.revision, Arc::new(PolicyEnforcer::new(policy))))
    }
}
