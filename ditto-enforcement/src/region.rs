//! Local shard region
//!
//! Routes signals for one entity type to the supervisor of their entity.
//! Supervisors are spawned on first use and replaced once they stopped
//! (passivation, shutdown).

use crate::config::SupervisorConfig;
use crate::contextual::{is_terminal, ResponseSink};
use crate::errors::{from_actor_error, unavailable};
use crate::persistence::Snapshot;
use crate::supervisor::{
    ChildFactory, EntitySupervisor, SudoRequest, SupervisorMessage, SupervisorRef,
};
use dashmap::DashMap;
use ditto_actors::{spawn, ActorError, ActorId};
use ditto_model::{
    CommandResponse, DittoRuntimeError, EntityId, EntityReference, EntityType, Signal,
};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

struct RegionInner {
    entity_type: EntityType,
    supervisors: DashMap<EntityId, SupervisorRef>,
    factory: OnceCell<Arc<dyn ChildFactory>>,
    config: SupervisorConfig,
    ask_timeout: Duration,
}

#[derive(Clone)]
pub struct ShardRegion {
    inner: Arc<RegionInner>,
}

impl ShardRegion {
    pub fn new(entity_type: EntityType, config: SupervisorConfig, ask_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RegionInner {
                entity_type,
                supervisors: DashMap::new(),
                factory: OnceCell::new(),
                config,
                ask_timeout,
            }),
        }
    }

    /// Install the factory for supervisor children; only the first call
    /// has an effect
    pub fn start(&self, factory: Arc<dyn ChildFactory>) -> bool {
        self.inner.factory.set(factory).is_ok()
    }

    pub fn entity_type(&self) -> EntityType {
        self.inner.entity_type
    }

    /// Number of live supervisors
    pub fn len(&self) -> usize {
        self.inner
            .supervisors
            .iter()
            .filter(|supervisor| !supervisor.is_closed())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entity(&self, id: &EntityId) -> EntityReference {
        EntityReference::new(self.inner.entity_type, id.clone())
    }

    fn supervisor(&self, id: &EntityId) -> Result<SupervisorRef, DittoRuntimeError> {
        if let Some(existing) = self.inner.supervisors.get(id) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }
        let Some(factory) = self.inner.factory.get() else {
            error!(entity_type = %self.inner.entity_type, "shard region used before start");
            return Err(unavailable(&self.entity(id)));
        };
        let mut slot = self.inner.supervisors.entry(id.clone()).or_insert_with(|| {
            spawn_supervisor(&self.inner, factory, self.entity(id))
        });
        if slot.is_closed() {
            *slot = spawn_supervisor(&self.inner, factory, self.entity(id));
        }
        Ok(slot.clone())
    }

    /// Send the message made by `make`, returning what `make` handed back
    /// alongside the message that was delivered
    async fn tell<R>(
        &self,
        id: &EntityId,
        mut make: impl FnMut() -> (SupervisorMessage, R),
    ) -> Result<R, DittoRuntimeError> {
        // A supervisor may passivate between lookup and delivery; one retry
        // reaches its replacement.
        for _ in 0..2 {
            let supervisor = self.supervisor(id)?;
            let (message, handle) = make();
            match supervisor.tell(message).await {
                Ok(()) => return Ok(handle),
                Err(ActorError::MailboxClosed(_)) => {
                    debug!(entity = %id, "supervisor stopped, respawning");
                    self.inner.supervisors.remove_if(id, |_, current| current.is_closed());
                }
                Err(err) => return Err(from_actor_error(&err, &self.entity(id))),
            }
        }
        Err(unavailable(&self.entity(id)))
    }

    /// Hand `signal` to its supervisor; replies arrive on `sink`
    pub async fn deliver(
        &self,
        signal: Signal,
        sink: ResponseSink,
    ) -> Result<(), DittoRuntimeError> {
        let entity = signal.entity_reference();
        if entity.entity_type != self.inner.entity_type {
            return Err(DittoRuntimeError::signal_unsupported(signal.name())
                .with_headers(signal.headers().response_headers()));
        }
        self.tell(&entity.id, || {
            let message = SupervisorMessage::Signal {
                signal: signal.clone(),
                sink: sink.clone(),
            };
            (message, ())
        })
        .await
    }

    /// Deliver `signal` and wait for its command response, skipping
    /// acknowledgements
    pub async fn ask(
        &self,
        signal: Signal,
        timeout: Duration,
    ) -> Result<CommandResponse, DittoRuntimeError> {
        let (sink, mut replies) = mpsc::channel(16);
        let headers = signal.headers().response_headers();
        self.deliver(signal, sink).await?;
        let exchange = async {
            while let Some(reply) = replies.recv().await {
                if !is_terminal(&reply) {
                    continue;
                }
                return match reply {
                    Ok(Signal::Response(response)) => Ok(response),
                    Ok(other) => Err(DittoRuntimeError::invalid_response(format!(
                        "unexpected '{}' instead of a command response",
                        other.name()
                    ))),
                    Err(err) => Err(err),
                };
            }
            Err(DittoRuntimeError::internal())
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .unwrap_or_else(|_| {
                Err(DittoRuntimeError::command_timeout(timeout).with_headers(headers))
            })
    }

    /// Raw state of an entity, skipping enforcement
    pub async fn sudo_retrieve(
        &self,
        id: &EntityId,
        timeout: Duration,
    ) -> Result<Option<Snapshot>, DittoRuntimeError> {
        let rx = self
            .tell(id, || {
                let (reply, rx) = oneshot::channel();
                (SupervisorMessage::Sudo(SudoRequest::Retrieve { reply }), rx)
            })
            .await?;
        await_sudo(rx, &self.entity(id), timeout).await
    }

    /// Command applied to persistence directly, skipping enforcement
    pub async fn sudo_command(
        &self,
        signal: Signal,
        timeout: Duration,
    ) -> Result<CommandResponse, DittoRuntimeError> {
        let entity = signal.entity_reference();
        let rx = self
            .tell(&entity.id, || {
                let (reply, rx) = oneshot::channel();
                let request = SudoRequest::Command {
                    signal: signal.clone(),
                    reply,
                };
                (SupervisorMessage::Sudo(request), rx)
            })
            .await?;
        await_sudo(rx, &entity, timeout).await
    }

    /// Stop every supervisor once its outstanding operations are done
    pub async fn shutdown(&self) {
        let supervisors: Vec<SupervisorRef> = self
            .inner
            .supervisors
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.supervisors.clear();
        for supervisor in supervisors {
            let _ = supervisor
                .ask(|reply| SupervisorMessage::Shutdown { reply }, self.inner.ask_timeout)
                .await;
        }
    }
}

fn spawn_supervisor(
    inner: &RegionInner,
    factory: &Arc<dyn ChildFactory>,
    entity: EntityReference,
) -> SupervisorRef {
    let id = ActorId::new(format!("supervisor-{}", entity));
    let supervisor = EntitySupervisor::new(
        entity,
        Arc::clone(factory),
        inner.config.clone(),
        inner.ask_timeout,
    );
    spawn(id, supervisor, inner.config.mailbox_capacity).0
}

async fn await_sudo<T>(
    rx: oneshot::Receiver<Result<T, DittoRuntimeError>>,
    entity: &EntityReference,
    timeout: Duration,
) -> Result<T, DittoRuntimeError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(unavailable(entity)),
        Err(_) => Err(from_actor_error(
            &ActorError::AskTimeout {
                actor: ActorId::new(format!("supervisor-{}", entity)),
                timeout,
            },
            entity,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contextual::Contextual;
    use crate::persistence::{ask_persistence, PersistenceTarget, ThingPersistenceActor};
    use crate::supervisor::StartedChildren;
    use ditto_model::{DittoHeaders, ErrorKind, ThingAction, ThingCommand};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Children whose enforcement forwards everything unchecked
    #[derive(Default)]
    struct Unchecked {
        started: AtomicUsize,
    }

    impl ChildFactory for Unchecked {
        fn start_children(
            &self,
            entity: &EntityReference,
        ) -> Result<StartedChildren, DittoRuntimeError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let (persistence, termination) = spawn(
                ActorId::unique("thing"),
                ThingPersistenceActor::new(entity.id.clone()),
                8,
            );
            let (enforcer, mut contexts) = mpsc::channel::<Contextual<Signal>>(8);
            let target = persistence.clone();
            let entity = entity.clone();
            tokio::spawn(async move {
                while let Some(ctx) = contexts.recv().await {
                    if let Signal::Thing(command) = ctx.message().clone() {
                        let result =
                            ask_persistence(&target, &entity, command, ctx.ask_timeout()).await;
                        ctx.reply(result.map(Signal::Response)).await;
                    }
                }
            });
            Ok(StartedChildren {
                persistence: PersistenceTarget::Thing(persistence),
                termination,
                enforcer,
            })
        }
    }

    fn start_region(factory: Arc<Unchecked>, passivation: Duration) -> ShardRegion {
        let config = SupervisorConfig {
            passivation_timeout: passivation,
            ..SupervisorConfig::default()
        };
        let region = ShardRegion::new(EntityType::Thing, config, Duration::from_secs(1));
        assert!(region.start(factory));
        region
    }

    fn command(name: &str, action: ThingAction) -> Signal {
        Signal::Thing(ThingCommand::new(
            format!("org.example:{}", name).parse().unwrap(),
            action,
            DittoHeaders::new().with_correlation_id(name),
        ))
    }

    fn create(name: &str) -> Signal {
        command(
            name,
            ThingAction::CreateThing {
                thing: json!({}),
                initial_policy: None,
            },
        )
    }

    #[tokio::test]
    async fn test_one_supervisor_per_entity() {
        let factory = Arc::new(Unchecked::default());
        let region = start_region(Arc::clone(&factory), Duration::from_secs(60));
        let timeout = Duration::from_secs(1);
        region.ask(create("a"), timeout).await.unwrap();
        region.ask(create("b"), timeout).await.unwrap();
        let conflict = region.ask(create("a"), timeout).await.unwrap_err();
        assert_eq!(conflict.kind(), ErrorKind::ThingConflict);
        assert_eq!(region.len(), 2);
        assert_eq!(factory.started.load(Ordering::SeqCst), 2);

        let snapshot = region
            .sudo_retrieve(&"org.example:a".parse().unwrap(), timeout)
            .await
            .unwrap();
        assert!(snapshot.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_passivated_supervisor_is_replaced() {
        let factory = Arc::new(Unchecked::default());
        let region = start_region(Arc::clone(&factory), Duration::from_secs(5));
        let timeout = Duration::from_secs(1);
        region.ask(create("a"), timeout).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(region.len(), 0);

        let retrieve = command("a", ThingAction::RetrieveThing { selected_fields: None });
        let err = region.ask(retrieve, timeout).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ThingNotAccessible);
        assert_eq!(factory.started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_wrong_entity_type_is_unsupported() {
        let region = start_region(Arc::default(), Duration::from_secs(60));
        let signal = Signal::Policy(ditto_model::PolicyCommand::new(
            "org.example:p".parse().unwrap(),
            ditto_model::PolicyAction::RetrievePolicy,
            DittoHeaders::new(),
        ));
        let err = region.ask(signal, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignalUnsupported);
    }
}
