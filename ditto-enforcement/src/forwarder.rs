//! Collects the acknowledgements and the response of one live command
//!
//! The forwarder is spawned per live command that requests acknowledgements
//! (or always, when global dispatching is on) and registered as the response
//! receiver for the command's correlation id. Acknowledgements go straight to
//! the requester; the single command response goes to the dispatcher waiting
//! for it. The forwarder stops once the response arrived and no requested
//! acknowledgement is pending, or when nothing arrives for its receive
//! timeout.

use crate::contextual::ResponseSink;
use crate::dispatcher::ResponseReceiver;
use async_trait::async_trait;
use ditto_actors::{Actor, ActorContext};
use ditto_cache::ResponseReceiverCache;
use ditto_model::{Acknowledgement, AcknowledgementLabel, CommandResponse, Signal};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub enum ForwarderMessage {
    /// The command was published and expects these acknowledgements
    Command { labels: BTreeSet<AcknowledgementLabel> },
    Response(CommandResponse),
    Acknowledgement(Acknowledgement),
}

pub struct AckForwarder {
    correlation_id: String,
    sink: ResponseSink,
    inbox: mpsc::Sender<Signal>,
    receivers: ResponseReceiverCache<ResponseReceiver>,
    receive_timeout: Duration,
    pending: Option<BTreeSet<AcknowledgementLabel>>,
    responded: bool,
}

impl AckForwarder {
    pub fn new(
        correlation_id: impl Into<String>,
        sink: ResponseSink,
        inbox: mpsc::Sender<Signal>,
        receivers: ResponseReceiverCache<ResponseReceiver>,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            sink,
            inbox,
            receivers,
            receive_timeout,
            pending: None,
            responded: false,
        }
    }

    fn is_done(&self) -> bool {
        self.responded && self.pending.as_ref().is_some_and(BTreeSet::is_empty)
    }
}

#[async_trait]
impl Actor for AckForwarder {
    type Message = ForwarderMessage;

    async fn started(&mut self, ctx: &mut ActorContext<ForwarderMessage>) {
        ctx.set_receive_timeout(Some(self.receive_timeout));
    }

    async fn handle(
        &mut self,
        message: ForwarderMessage,
        ctx: &mut ActorContext<ForwarderMessage>,
    ) {
        match message {
            ForwarderMessage::Command { labels } => {
                debug!(correlation_id = %self.correlation_id, ?labels, "awaiting acknowledgements");
                self.pending = Some(labels);
            }
            ForwarderMessage::Acknowledgement(ack) => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.remove(&ack.label);
                }
                if self.sink.send(Ok(Signal::Acknowledgement(ack))).await.is_err() {
                    debug!(correlation_id = %self.correlation_id, "requester is gone");
                }
            }
            ForwarderMessage::Response(response) => {
                if self.pending.is_none() {
                    warn!(
                        correlation_id = %self.correlation_id,
                        "response arrived before its command, stopping"
                    );
                    ctx.stop();
                    return;
                }
                if self.responded {
                    debug!(correlation_id = %self.correlation_id, "dropping duplicate response");
                    return;
                }
                self.responded = true;
                let _ = self.inbox.send(Signal::Response(response)).await;
            }
        }
        if self.is_done() {
            ctx.stop();
        }
    }

    async fn on_receive_timeout(&mut self, ctx: &mut ActorContext<ForwarderMessage>) {
        debug!(
            correlation_id = %self.correlation_id,
            pending = ?self.pending,
            responded = self.responded,
            "forwarder timed out"
        );
        ctx.stop();
    }

    async fn stopped(&mut self) {
        self.receivers.invalidate(&self.correlation_id);
    }
}
