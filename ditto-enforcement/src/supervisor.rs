//! Per-entity supervisor
//!
//! The supervisor owns the persistence child and the enforcement flow of one
//! entity. When the persistence child terminates unexpectedly it is not
//! restarted right away: for a backoff window every request is answered
//! with an "unavailable" error, and the next request after the window
//! starts a fresh child. Entities in a blocked namespace never get a child.

use crate::config::SupervisorConfig;
use crate::contextual::{Contextual, Reply, ResponseSink};
use crate::errors::{from_actor_error, unavailable};
use crate::persistence::{ask_persistence, PersistenceTarget, Snapshot};
use async_trait::async_trait;
use ditto_actors::{Actor, ActorContext, ActorRef, ExitReason, Termination};
use ditto_model::{CommandResponse, DittoRuntimeError, EntityReference, Signal};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub type SudoReply<T> = oneshot::Sender<Result<T, DittoRuntimeError>>;

/// Requests that skip enforcement, used by cache loaders and by the
/// enforcement of other entities
pub enum SudoRequest {
    Retrieve { reply: SudoReply<Option<Snapshot>> },
    Command { signal: Signal, reply: SudoReply<CommandResponse> },
}

pub enum SupervisorMessage {
    Signal { signal: Signal, sink: ResponseSink },
    Sudo(SudoRequest),
    ChildTerminated { incarnation: u64, reason: ExitReason },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Children of one supervisor incarnation
pub struct StartedChildren {
    pub persistence: PersistenceTarget,
    pub termination: Termination,
    pub enforcer: mpsc::Sender<Contextual<Signal>>,
}

/// Starts the children of a supervisor
pub trait ChildFactory: Send + Sync + 'static {
    fn start_children(
        &self,
        entity: &EntityReference,
    ) -> Result<StartedChildren, DittoRuntimeError>;
}

/// Counts operations that are still running
#[derive(Clone)]
pub struct Outstanding {
    count: Arc<watch::Sender<usize>>,
}

impl Default for Outstanding {
    fn default() -> Self {
        Self {
            count: Arc::new(watch::channel(0).0),
        }
    }
}

impl Outstanding {
    pub fn begin(&self) -> OperationGuard {
        self.count.send_modify(|count| *count += 1);
        OperationGuard {
            count: Arc::clone(&self.count),
        }
    }

    pub fn current(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolves once no operation is running
    pub async fn idle(&self) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

/// Decrements the outstanding count when dropped
pub struct OperationGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.count.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Exponential restart backoff
#[derive(Debug, Clone)]
struct Backoff {
    min: Duration,
    max: Duration,
    reset_after: Duration,
    next: Duration,
    until: Option<Instant>,
}

impl Backoff {
    fn new(config: &SupervisorConfig) -> Self {
        Self {
            min: config.min_backoff,
            max: config.max_backoff,
            reset_after: config.reset_after,
            next: config.min_backoff,
            until: None,
        }
    }

    /// Enter a backoff window after a child that lived for `lifetime`
    fn start(&mut self, now: Instant, lifetime: Duration) -> Duration {
        if lifetime >= self.reset_after {
            self.next = self.min;
        }
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        self.until = Some(now + delay);
        delay
    }

    fn is_active(&self, now: Instant) -> bool {
        self.until.is_some_and(|until| now < until)
    }
}

struct Child {
    persistence: PersistenceTarget,
    enforcer: mpsc::Sender<Contextual<Signal>>,
    started_at: Instant,
}

pub struct EntitySupervisor {
    entity: EntityReference,
    factory: Arc<dyn ChildFactory>,
    config: SupervisorConfig,
    ask_timeout: Duration,
    child: Option<Child>,
    incarnation: u64,
    backoff: Backoff,
    outstanding: Outstanding,
}

impl EntitySupervisor {
    pub fn new(
        entity: EntityReference,
        factory: Arc<dyn ChildFactory>,
        config: SupervisorConfig,
        ask_timeout: Duration,
    ) -> Self {
        let backoff = Backoff::new(&config);
        Self {
            entity,
            factory,
            config,
            ask_timeout,
            child: None,
            incarnation: 0,
            backoff,
            outstanding: Outstanding::default(),
        }
    }

    fn is_blocked(&self) -> bool {
        self.config
            .blocked_namespaces
            .contains(self.entity.id.namespace())
    }

    /// Current child, starting one if needed and allowed
    fn ensure_child(
        &mut self,
        ctx: &ActorContext<SupervisorMessage>,
    ) -> Result<&Child, DittoRuntimeError> {
        if self.is_blocked() {
            return Err(DittoRuntimeError::namespace_blocked(self.entity.id.namespace()));
        }
        if self.backoff.is_active(Instant::now()) {
            debug!(entity = %self.entity, "in backoff, rejecting");
            return Err(unavailable(&self.entity));
        }
        if self.child.as_ref().is_some_and(|child| child.persistence.is_closed()) {
            return Err(unavailable(&self.entity));
        }
        if self.child.is_none() {
            let started = self.factory.start_children(&self.entity)?;
            self.incarnation += 1;
            self.watch(ctx, started.termination);
            debug!(entity = %self.entity, incarnation = self.incarnation, "child started");
            self.child = Some(Child {
                persistence: started.persistence,
                enforcer: started.enforcer,
                started_at: Instant::now(),
            });
        }
        self.child
            .as_ref()
            .ok_or_else(|| unavailable(&self.entity))
    }

    fn watch(&self, ctx: &ActorContext<SupervisorMessage>, termination: Termination) {
        let Some(myself) = ctx.myself() else {
            return;
        };
        let incarnation = self.incarnation;
        tokio::spawn(async move {
            let reason = termination.wait().await;
            let _ = myself
                .tell(SupervisorMessage::ChildTerminated {
                    incarnation,
                    reason,
                })
                .await;
        });
    }

    fn on_signal(
        &mut self,
        signal: Signal,
        sink: ResponseSink,
        ctx: &ActorContext<SupervisorMessage>,
    ) {
        let ask_timeout = signal.headers().timeout().unwrap_or(self.ask_timeout);
        let response_headers = signal.headers().response_headers();
        let enforcer = match self.ensure_child(ctx) {
            Ok(child) => child.enforcer.clone(),
            Err(err) => {
                reply_now(&sink, Err(err.with_headers(response_headers)));
                return;
            }
        };
        let contextual = Contextual::for_signal(signal, sink.clone(), ask_timeout)
            .with_guard(self.outstanding.begin());
        if let Err(err) = enforcer.try_send(contextual) {
            let rejection = match err {
                mpsc::error::TrySendError::Full(_) => {
                    DittoRuntimeError::too_many_requests(&self.entity.id)
                }
                mpsc::error::TrySendError::Closed(_) => unavailable(&self.entity),
            };
            reply_now(&sink, Err(rejection.with_headers(response_headers)));
        }
    }

    fn on_sudo(&mut self, request: SudoRequest, ctx: &ActorContext<SupervisorMessage>) {
        let persistence = match self.ensure_child(ctx) {
            Ok(child) => child.persistence.clone(),
            Err(err) => {
                match request {
                    SudoRequest::Retrieve { reply } => {
                        let _ = reply.send(Err(err));
                    }
                    SudoRequest::Command { reply, .. } => {
                        let _ = reply.send(Err(err));
                    }
                }
                return;
            }
        };
        let entity = self.entity.clone();
        let timeout = self.ask_timeout;
        let guard = self.outstanding.begin();
        tokio::spawn(async move {
            match request {
                SudoRequest::Retrieve { reply } => {
                    let result = persistence
                        .sudo_retrieve(timeout)
                        .await
                        .map_err(|err| from_actor_error(&err, &entity));
                    let _ = reply.send(result);
                }
                SudoRequest::Command { signal, reply } => {
                    let result = match (signal, &persistence) {
                        (Signal::Thing(command), PersistenceTarget::Thing(actor)) => {
                            ask_persistence(actor, &entity, command, timeout).await
                        }
                        (Signal::Policy(command), PersistenceTarget::Policy(actor)) => {
                            ask_persistence(actor, &entity, command, timeout).await
                        }
                        (other, _) => Err(DittoRuntimeError::signal_unsupported(other.name())),
                    };
                    let _ = reply.send(result);
                }
            }
            drop(guard);
        });
    }

    fn on_child_terminated(&mut self, incarnation: u64, reason: ExitReason) {
        if incarnation != self.incarnation {
            return;
        }
        let Some(child) = self.child.take() else {
            return;
        };
        let now = Instant::now();
        let delay = self.backoff.start(now, now.duration_since(child.started_at));
        warn!(
            entity = %self.entity,
            incarnation,
            ?reason,
            backoff = ?delay,
            "child terminated, backing off"
        );
    }
}

fn reply_now(sink: &ResponseSink, reply: Reply) {
    if sink.try_send(reply).is_err() {
        debug!("requester is gone or not reading, dropping reply");
    }
}

#[async_trait]
impl Actor for EntitySupervisor {
    type Message = SupervisorMessage;

    async fn started(&mut self, ctx: &mut ActorContext<SupervisorMessage>) {
        ctx.set_receive_timeout(Some(self.config.passivation_timeout));
    }

    async fn handle(
        &mut self,
        message: SupervisorMessage,
        ctx: &mut ActorContext<SupervisorMessage>,
    ) {
        match message {
            SupervisorMessage::Signal { signal, sink } => self.on_signal(signal, sink, ctx),
            SupervisorMessage::Sudo(request) => self.on_sudo(request, ctx),
            SupervisorMessage::ChildTerminated {
                incarnation,
                reason,
            } => self.on_child_terminated(incarnation, reason),
            SupervisorMessage::Shutdown { reply } => {
                self.outstanding.idle().await;
                self.child = None;
                info!(entity = %self.entity, "supervisor shut down");
                let _ = reply.send(());
                ctx.stop();
            }
        }
    }

    async fn on_receive_timeout(&mut self, ctx: &mut ActorContext<SupervisorMessage>) {
        if self.outstanding.current() > 0 {
            return;
        }
        debug!(entity = %self.entity, "passivating");
        self.child = None;
        ctx.stop();
    }
}

/// Reference to a running supervisor
pub type SupervisorRef = ActorRef<SupervisorMessage>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{PersistenceMessage, ThingPersistenceActor};
    use ditto_actors::{spawn, ActorId};
    use ditto_model::{DittoHeaders, EntityId, ErrorKind, ThingAction, ThingCommand};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Persistence stand-in that panics on its first command
    struct Crashing;

    #[async_trait]
    impl Actor for Crashing {
        type Message = PersistenceMessage<ThingCommand>;

        async fn handle(
            &mut self,
            _message: Self::Message,
            _ctx: &mut ActorContext<Self::Message>,
        ) {
            panic!("persistence crashed");
        }
    }

    /// First incarnation crashes, later ones work
    #[derive(Default)]
    struct TestFactory {
        started: AtomicUsize,
        enforcer_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    }

    impl ChildFactory for TestFactory {
        fn start_children(
            &self,
            entity: &EntityReference,
        ) -> Result<StartedChildren, DittoRuntimeError> {
            let incarnation = self.started.fetch_add(1, Ordering::SeqCst);
            let (persistence, termination) = if incarnation == 0 {
                spawn(ActorId::unique("crashing"), Crashing, 8)
            } else {
                spawn(
                    ActorId::unique("thing"),
                    ThingPersistenceActor::new(entity.id.clone()),
                    8,
                )
            };
            let (enforcer, mut contexts) = mpsc::channel::<Contextual<Signal>>(8);
            let target = persistence.clone();
            let entity = entity.clone();
            let task = tokio::spawn(async move {
                while let Some(ctx) = contexts.recv().await {
                    let Signal::Thing(command) = ctx.message().clone() else {
                        continue;
                    };
                    let result =
                        ask_persistence(&target, &entity, command, ctx.ask_timeout()).await;
                    ctx.reply(result.map(Signal::Response)).await;
                }
            });
            self.enforcer_tasks.lock().push(task);
            Ok(StartedChildren {
                persistence: PersistenceTarget::Thing(persistence),
                termination,
                enforcer,
            })
        }
    }

    fn config(blocked: &[&str]) -> SupervisorConfig {
        SupervisorConfig {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
            reset_after: Duration::from_secs(30),
            passivation_timeout: Duration::from_secs(3600),
            mailbox_capacity: 16,
            blocked_namespaces: blocked.iter().map(|ns| ns.to_string()).collect::<BTreeSet<_>>(),
        }
    }

    fn thing_id() -> EntityId {
        "org.example:lamp".parse().unwrap()
    }

    fn start(factory: Arc<TestFactory>, blocked: &[&str]) -> SupervisorRef {
        let supervisor = EntitySupervisor::new(
            EntityReference::thing(thing_id()),
            factory,
            config(blocked),
            Duration::from_secs(1),
        );
        spawn(ActorId::new("supervisor"), supervisor, 16).0
    }

    async fn send(supervisor: &SupervisorRef, action: ThingAction) -> Reply {
        let (sink, mut replies) = mpsc::channel(4);
        let signal = Signal::Thing(ThingCommand::new(
            thing_id(),
            action,
            DittoHeaders::new().with_correlation_id("c"),
        ));
        supervisor
            .tell(SupervisorMessage::Signal { signal, sink })
            .await
            .unwrap();
        replies.recv().await.unwrap()
    }

    fn create() -> ThingAction {
        ThingAction::CreateThing {
            thing: json!({"attributes": {}}),
            initial_policy: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_after_child_crash() {
        let factory = Arc::new(TestFactory::default());
        let supervisor = start(Arc::clone(&factory), &[]);

        let crashed = send(&supervisor, create()).await.unwrap_err();
        assert_eq!(crashed.kind(), ErrorKind::ThingUnavailable);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let during_backoff = send(&supervisor, create()).await.unwrap_err();
        assert_eq!(during_backoff.kind(), ErrorKind::ThingUnavailable);
        assert_eq!(during_backoff.correlation_id(), Some("c"));
        assert_eq!(factory.started.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(1100)).await;
        let Ok(Signal::Response(created)) = send(&supervisor, create()).await else {
            panic!("expected a response after the backoff");
        };
        assert_eq!(created.status, 201);
        assert_eq!(factory.started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_blocked_namespace_never_starts_child() {
        let factory = Arc::new(TestFactory::default());
        let supervisor = start(Arc::clone(&factory), &["org.example"]);
        let err = send(&supervisor, create()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NamespaceBlocked);
        assert_eq!(factory.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sudo_retrieve_bypasses_enforcement() {
        let factory = Arc::new(TestFactory::default());
        factory.started.store(1, Ordering::SeqCst);
        let supervisor = start(Arc::clone(&factory), &[]);
        send(&supervisor, create()).await.unwrap();

        let snapshot = supervisor
            .ask(
                |reply| SupervisorMessage::Sudo(SudoRequest::Retrieve { reply }),
                Duration::from_secs(1),
            )
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.json["thingId"], "org.example:lamp");
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_outstanding_operations() {
        let outstanding = Outstanding::default();
        let guard = outstanding.begin();
        assert_eq!(outstanding.current(), 1);
        let waiter = tokio::spawn({
            let outstanding = outstanding.clone();
            async move { outstanding.idle().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
        assert_eq!(outstanding.current(), 0);
    }

    #[test]
    fn test_backoff_doubles_and_resets() {
        let mut backoff = Backoff::new(&config(&[]));
        let now = Instant::now();
        assert_eq!(backoff.start(now, Duration::ZERO), Duration::from_secs(1));
        assert_eq!(backoff.start(now, Duration::ZERO), Duration::from_secs(2));
        assert_eq!(backoff.start(now, Duration::ZERO), Duration::from_secs(4));
        assert_eq!(backoff.start(now, Duration::ZERO), Duration::from_secs(4));
        assert_eq!(backoff.start(now, Duration::from_secs(60)), Duration::from_secs(1));
        assert!(backoff.is_active(now));
        assert!(!backoff.is_active(now + Duration::from_secs(2)));
    }
}
