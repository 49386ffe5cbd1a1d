//! Actors on top of tokio tasks
//!
//! Each actor is a spawned task draining a bounded `mpsc` mailbox, so an
//! actor handles one message at a time and never shares its state. Requests
//! that expect an answer carry a `oneshot` sender ([`ActorRef::ask`]).
//!
//! An actor stops when it calls [`ActorContext::stop`], when every
//! [`ActorRef`] to it has been dropped, or when it panics. The outcome is
//! observable through the [`Termination`] handle returned by [`spawn`].

use crate::error::{ActorError, ActorResult};
use crate::types::ActorId;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Handle for sending messages to an actor
pub struct ActorRef<M> {
    id: ActorId,
    sender: mpsc::Sender<M>,
}

impl<M> Clone for ActorRef<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<M> std::fmt::Debug for ActorRef<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRef").field("id", &self.id).finish()
    }
}

impl<M: Send + 'static> ActorRef<M> {
    pub fn id(&self) -> &ActorId {
        &self.id
    }

    /// Whether the actor has stopped
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Send, waiting for mailbox capacity
    pub async fn tell(&self, message: M) -> ActorResult<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ActorError::MailboxClosed(self.id.clone()))
    }

    /// Send without waiting; a full mailbox is an error
    pub fn try_tell(&self, message: M) -> ActorResult<()> {
        self.sender.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull(self.id.clone()),
            mpsc::error::TrySendError::Closed(_) => ActorError::MailboxClosed(self.id.clone()),
        })
    }

    /// Request/response with a timeout covering delivery and reply
    pub async fn ask<R, F>(&self, make: F, timeout: Duration) -> ActorResult<R>
    where
        F: FnOnce(oneshot::Sender<R>) -> M,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            self.tell(make(reply_tx)).await?;
            reply_rx
                .await
                .map_err(|_| ActorError::ReplyDropped(self.id.clone()))
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ActorError::AskTimeout {
                actor: self.id.clone(),
                timeout,
            }),
        }
    }

    /// Like [`ask`](Self::ask) but fails with `MailboxFull` instead of
    /// waiting for capacity
    pub async fn try_ask<R, F>(&self, make: F, timeout: Duration) -> ActorResult<R>
    where
        F: FnOnce(oneshot::Sender<R>) -> M,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.try_tell(make(reply_tx))?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ActorError::ReplyDropped(self.id.clone())),
            Err(_) => Err(ActorError::AskTimeout {
                actor: self.id.clone(),
                timeout,
            }),
        }
    }
}

/// Why an actor stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Stopped,
    Failed(String),
    Panicked,
}

/// Observes the termination of one actor
#[derive(Debug, Clone)]
pub struct Termination {
    rx: watch::Receiver<Option<ExitReason>>,
}

impl Termination {
    /// Wait until the actor has stopped
    pub async fn wait(mut self) -> ExitReason {
        match self.rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(ExitReason::Stopped),
            Err(_) => ExitReason::Stopped,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

/// Per-actor runtime state handed to every callback
pub struct ActorContext<M> {
    id: ActorId,
    myself: mpsc::WeakSender<M>,
    receive_timeout: Option<Duration>,
    exit: Option<ExitReason>,
}

impl<M: Send + 'static> ActorContext<M> {
    pub fn id(&self) -> &ActorId {
        &self.id
    }

    /// Reference to this actor, if anyone else still holds one
    pub fn myself(&self) -> Option<ActorRef<M>> {
        self.myself.upgrade().map(|sender| ActorRef {
            id: self.id.clone(),
            sender,
        })
    }

    /// Stop after the current message
    pub fn stop(&mut self) {
        self.exit.get_or_insert(ExitReason::Stopped);
    }

    /// Stop after the current message, reporting a failure
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.exit = Some(ExitReason::Failed(reason.into()));
    }

    pub fn is_stopping(&self) -> bool {
        self.exit.is_some()
    }

    /// Call [`Actor::on_receive_timeout`] when no message arrives for `timeout`
    pub fn set_receive_timeout(&mut self, timeout: Option<Duration>) {
        self.receive_timeout = timeout;
    }
}

/// Behavior of an actor
#[async_trait]
pub trait Actor: Send + 'static {
    type Message: Send + 'static;

    async fn started(&mut self, _ctx: &mut ActorContext<Self::Message>) {}

    async fn handle(&mut self, message: Self::Message, ctx: &mut ActorContext<Self::Message>);

    /// Default: stop
    async fn on_receive_timeout(&mut self, ctx: &mut ActorContext<Self::Message>) {
        ctx.stop();
    }

    async fn stopped(&mut self) {}
}

/// Spawn `actor` with a mailbox of `capacity` messages
pub fn spawn<A: Actor>(
    id: ActorId,
    actor: A,
    capacity: usize,
) -> (ActorRef<A::Message>, Termination) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let (exit_tx, exit_rx) = watch::channel(None);
    let ctx = ActorContext {
        id: id.clone(),
        myself: sender.downgrade(),
        receive_timeout: None,
        exit: None,
    };

    let task = tokio::spawn(run(actor, receiver, ctx));
    let watched = id.clone();
    tokio::spawn(async move {
        let reason = match task.await {
            Ok(reason) => reason,
            Err(err) if err.is_panic() => {
                warn!(actor = %watched, "actor panicked");
                ExitReason::Panicked
            }
            Err(_) => ExitReason::Stopped,
        };
        let _ = exit_tx.send(Some(reason));
    });

    (ActorRef { id, sender }, Termination { rx: exit_rx })
}

async fn run<A: Actor>(
    mut actor: A,
    mut mailbox: mpsc::Receiver<A::Message>,
    mut ctx: ActorContext<A::Message>,
) -> ExitReason {
    actor.started(&mut ctx).await;

    while !ctx.is_stopping() {
        let next = match ctx.receive_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, mailbox.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    actor.on_receive_timeout(&mut ctx).await;
                    continue;
                }
            },
            None => mailbox.recv().await,
        };
        match next {
            Some(message) => actor.handle(message, &mut ctx).await,
            None => break,
        }
    }

    mailbox.close();
    actor.stopped().await;
    let reason = ctx.exit.take().unwrap_or(ExitReason::Stopped);
    debug!(actor = %ctx.id, ?reason, "actor stopped");
    reason
}
