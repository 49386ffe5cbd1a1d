//! Enforcement strategies per signal type
//!
//! The set of supported signals is closed, so the strategy is picked with a
//! `match` on the signal rather than looked up in a registry. Each strategy
//! resolves the enforcer through the [`RegionRetriever`], authorizes the
//! command, forwards it and filters what comes back.

pub mod live;
pub mod policy;
pub mod thing;

use crate::config::DittoConfig;
use crate::contextual::Contextual;
use crate::dispatcher::ChannelDispatcher;
use crate::loaders::RegionRetriever;
use crate::persistence::PersistenceTarget;
use crate::region::ShardRegion;
use ditto_model::{
    AuthorizationSubject, CommandCategory, CommandResponse, Condition, DittoRuntimeError,
    Permission, ResourceKey, Signal,
};
use ditto_policies::PolicyEnforcer;
use std::sync::Arc;

pub use live::LiveSignalEnforcement;
pub use policy::PolicyCommandEnforcement;
pub use thing::ThingCommandEnforcement;

/// Collaborators every enforcement needs
pub struct EnforcementServices {
    pub config: Arc<DittoConfig>,
    pub retriever: Arc<RegionRetriever>,
    pub policies: ShardRegion,
    pub dispatcher: ChannelDispatcher,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementProvider {
    Thing(ThingCommandEnforcement),
    Policy(PolicyCommandEnforcement),
    Live(LiveSignalEnforcement),
}

impl EnforcementProvider {
    /// Strategy for `signal`. Responses and acknowledgements are not
    /// enforced; they are routed by correlation id instead.
    pub fn select(signal: &Signal) -> Result<Self, DittoRuntimeError> {
        match signal {
            Signal::Thing(command) if command.headers.is_live() => {
                Ok(Self::Live(LiveSignalEnforcement))
            }
            Signal::Thing(command)
                if command.category() == CommandCategory::Query
                    && command.headers.live_channel_condition().is_some() =>
            {
                Ok(Self::Live(LiveSignalEnforcement))
            }
            Signal::Thing(_) => Ok(Self::Thing(ThingCommandEnforcement)),
            Signal::Policy(_) => Ok(Self::Policy(PolicyCommandEnforcement)),
            Signal::Message(_) => Ok(Self::Live(LiveSignalEnforcement)),
            other => Err(DittoRuntimeError::signal_unsupported(other.name())
                .with_headers(other.headers().response_headers())),
        }
    }

    pub async fn enforce(
        &self,
        services: &EnforcementServices,
        persistence: &PersistenceTarget,
        ctx: &mut Contextual<Signal>,
    ) -> Result<CommandResponse, DittoRuntimeError> {
        let unsupported = |ctx: &Contextual<Signal>| {
            DittoRuntimeError::signal_unsupported(ctx.message().name())
                .with_headers(ctx.message().headers().response_headers())
        };
        match (self, persistence) {
            (Self::Thing(strategy), PersistenceTarget::Thing(actor)) => {
                strategy.enforce(services, actor, ctx).await
            }
            (Self::Policy(strategy), PersistenceTarget::Policy(actor)) => {
                strategy.enforce(services, actor, ctx).await
            }
            (Self::Live(strategy), PersistenceTarget::Thing(actor)) => {
                strategy.enforce(services, actor, ctx).await
            }
            _ => Err(unsupported(ctx)),
        }
    }
}

/// Require READ on everything an RQL condition looks at, so a condition
/// cannot be used to test for fields the requester may not see
pub(crate) fn check_condition_readable(
    enforcer: &PolicyEnforcer,
    condition: &str,
    subjects: &[AuthorizationSubject],
    denied: impl FnOnce() -> DittoRuntimeError,
) -> Result<(), DittoRuntimeError> {
    let parsed = Condition::parse(condition)
        .map_err(|err| DittoRuntimeError::condition_invalid(condition, err.to_string()))?;
    let resources: Vec<ResourceKey> = parsed
        .referenced_pointers()
        .into_iter()
        .map(ResourceKey::thing)
        .collect();
    if enforcer.has_unrestricted_permissions_all(&resources, subjects, &[Permission::Read]) {
        Ok(())
    } else {
        Err(denied())
    }
}

/// Services over regions without children; tests fill the caches directly
#[cfg(test)]
pub(crate) fn test_services() -> Arc<EnforcementServices> {
    use crate::loaders::{PolicyEnforcerLoader, ThingPolicyIdLoader};
    use crate::retriever::EnforcerRetriever;
    use ditto_actors::LocalPubSub;
    use ditto_cache::EntityCache;
    use ditto_model::EntityType;

    let config = Arc::new(DittoConfig::default());
    let ask_timeout = config.enforcement.ask_timeout;
    let retry = config.enforcement.ask_with_retry.clone();
    let things = ShardRegion::new(EntityType::Thing, config.supervisor.clone(), ask_timeout);
    let policies = ShardRegion::new(EntityType::Policy, config.supervisor.clone(), ask_timeout);
    let retriever = EnforcerRetriever::new(
        Arc::new(EntityCache::new(
            "id",
            config.caches.id.clone(),
            ThingPolicyIdLoader::new(things, ask_timeout, retry.clone()),
        )),
        Arc::new(EntityCache::new(
            "enforcer",
            config.caches.enforcer.clone(),
            PolicyEnforcerLoader::new(policies.clone(), ask_timeout, retry),
        )),
    );
    Arc::new(EnforcementServices {
        dispatcher: ChannelDispatcher::new(LocalPubSub::new(), config.live.clone()),
        config,
        retriever: Arc::new(retriever),
        policies,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ditto_model::{
        Acknowledgement, AcknowledgementLabel, Channel, DittoHeaders, ErrorKind, MessageCommand,
        Policy, PolicyAction, PolicyCommand, PolicyEntry, ThingAction, ThingCommand,
    };

    fn thing(action: ThingAction, headers: DittoHeaders) -> Signal {
        Signal::Thing(ThingCommand::new("org.example:lamp".parse().unwrap(), action, headers))
    }

    #[test]
    fn test_select_routes_by_signal() {
        let retrieve = ThingAction::RetrieveThing { selected_fields: None };
        assert!(matches!(
            EnforcementProvider::select(&thing(retrieve.clone(), DittoHeaders::new())),
            Ok(EnforcementProvider::Thing(_))
        ));
        assert!(matches!(
            EnforcementProvider::select(&thing(
                retrieve.clone(),
                DittoHeaders::new().with_channel(Channel::Live)
            )),
            Ok(EnforcementProvider::Live(_))
        ));
        assert!(matches!(
            EnforcementProvider::select(&thing(
                retrieve,
                DittoHeaders::new().with_live_channel_condition("exists(attributes/online)")
            )),
            Ok(EnforcementProvider::Live(_))
        ));
        let policy = Signal::Policy(PolicyCommand::new(
            "org.example:policy".parse().unwrap(),
            PolicyAction::RetrievePolicy,
            DittoHeaders::new(),
        ));
        assert!(matches!(
            EnforcementProvider::select(&policy),
            Ok(EnforcementProvider::Policy(_))
        ));
        let message = Signal::Message(MessageCommand {
            thing_id: "org.example:lamp".parse().unwrap(),
            feature_id: None,
            subject: "blink".to_string(),
            payload: None,
            headers: DittoHeaders::new(),
        });
        assert!(matches!(
            EnforcementProvider::select(&message),
            Ok(EnforcementProvider::Live(_))
        ));
    }

    #[test]
    fn test_select_rejects_acknowledgements() {
        let ack = Signal::Acknowledgement(Acknowledgement {
            label: AcknowledgementLabel::new("custom"),
            entity_id: "org.example:lamp".parse().unwrap(),
            status: 200,
            payload: None,
            headers: DittoHeaders::new().with_correlation_id("c-9"),
        });
        let err = EnforcementProvider::select(&ack).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignalUnsupported);
        assert_eq!(err.correlation_id(), Some("c-9"));
    }

    #[test]
    fn test_condition_needs_read_on_referenced_fields() {
        let enforcer = PolicyEnforcer::new(
            Policy::new("org.example:policy".parse().unwrap()).with_entry(
                "reader",
                PolicyEntry::new()
                    .with_subject("user:reader")
                    .grant(ResourceKey::thing("/attributes"), &[Permission::Read])
                    .revoke(ResourceKey::thing("/attributes/secret"), &[Permission::Read]),
            ),
        );
        let subjects = [AuthorizationSubject::new("user:reader")];
        let denied =
            || DittoRuntimeError::thing_not_accessible(&"org.example:lamp".parse().unwrap());
        let check =
            |condition: &str| check_condition_readable(&enforcer, condition, &subjects, denied);

        assert!(check("eq(attributes/color,\"red\")").is_ok());
        let err = check("eq(attributes/secret,1)").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ThingNotAccessible);
        let err = check("eq(attributes/color").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConditionInvalid);
    }
}
