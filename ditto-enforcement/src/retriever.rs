//! Two-stage enforcer lookup
//!
//! A Thing does not carry its own access rules; it points at a Policy. The
//! id cache resolves an entity to the entity holding its rules, the
//! enforcer cache resolves that entity to a [`PolicyEnforcer`].

use ditto_cache::{CacheLoader, EntityCache, Entry};
use ditto_model::EntityReference;
use ditto_policies::PolicyEnforcer;
use std::future::Future;
use std::sync::Arc;
use tracing::trace;

pub type IdCache<L> = EntityCache<EntityReference, EntityReference, L>;
pub type EnforcerCache<L> = EntityCache<EntityReference, Arc<PolicyEnforcer>, L>;

pub struct EnforcerRetriever<IL, EL>
where
    IL: CacheLoader<EntityReference, EntityReference>,
    EL: CacheLoader<EntityReference, Arc<PolicyEnforcer>>,
{
    id_cache: Arc<IdCache<IL>>,
    enforcer_cache: Arc<EnforcerCache<EL>>,
}

impl<IL, EL> EnforcerRetriever<IL, EL>
where
    IL: CacheLoader<EntityReference, EntityReference>,
    EL: CacheLoader<EntityReference, Arc<PolicyEnforcer>>,
{
    pub fn new(id_cache: Arc<IdCache<IL>>, enforcer_cache: Arc<EnforcerCache<EL>>) -> Self {
        Self {
            id_cache,
            enforcer_cache,
        }
    }

    /// Resolve `entity` and hand both entries to `handler`
    ///
    /// - unknown entity: `handler(nonexistent, nonexistent)`
    /// - entity pointing elsewhere: the enforcer of the target is looked up
    /// - entity pointing at itself: `handler(id, nonexistent)`
    ///
    /// Cache failures convert into `E`; whatever `handler` returns is passed
    /// through untouched.
    pub async fn retrieve<T, E, F, Fut>(&self, entity: &EntityReference, handler: F) -> Result<T, E>
    where
        E: From<IL::Error> + From<EL::Error>,
        F: FnOnce(Entry<EntityReference>, Entry<Arc<PolicyEnforcer>>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let id_entry = self.id_cache.get(entity).await.map_err(E::from)?;
        let target = match id_entry.value() {
            Some(target) if target != entity => target.clone(),
            Some(_) => {
                trace!(%entity, "entity carries its own enforcer");
                return handler(id_entry, Entry::nonexistent()).await;
            }
            None => {
                trace!(%entity, "entity id not resolvable");
                return handler(Entry::nonexistent(), Entry::nonexistent()).await;
            }
        };
        let enforcer_entry = self.enforcer_cache.get(&target).await.map_err(E::from)?;
        trace!(%entity, %target, found = enforcer_entry.is_present(), "enforcer resolved");
        handler(id_entry, enforcer_entry).await
    }

    /// Look up the enforcer stored under `key` directly
    pub async fn retrieve_by_enforcer_key<T, E, F, Fut>(
        &self,
        key: &EntityReference,
        handler: F,
    ) -> Result<T, E>
    where
        E: From<EL::Error>,
        F: FnOnce(Entry<Arc<PolicyEnforcer>>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let enforcer_entry = self.enforcer_cache.get(key).await.map_err(E::from)?;
        handler(enforcer_entry).await
    }

    pub fn invalidate_id(&self, entity: &EntityReference) -> bool {
        self.id_cache.invalidate(entity)
    }

    pub fn invalidate_enforcer(&self, key: &EntityReference) -> bool {
        self.enforcer_cache.invalidate(key)
    }

    pub fn id_cache(&self) -> &IdCache<IL> {
        &self.id_cache
    }

    pub fn enforcer_cache(&self) -> &EnforcerCache<EL> {
        &self.enforcer_cache
    }
}
