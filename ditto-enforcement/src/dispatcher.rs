//! Live channel dispatch
//!
//! An authorized live signal is published to the device-facing subscribers
//! and its response awaited under the signal's correlation id. Queries that
//! carry a `live-channel-condition` or an explicit timeout strategy first
//! ask the twin: an unmatched condition is answered from the twin, and with
//! `use-twin` a live timeout falls back to the twin answer.

use crate::config::LiveConfig;
use crate::contextual::ResponseSink;
use crate::errors::internal;
use crate::forwarder::{AckForwarder, ForwarderMessage};
use crate::persistence::{ask_persistence, ThingPersistenceRef};
use ditto_actors::{
    spawn, wrap_for_publication_with_acks, ActorId, ActorRef, LocalPubSub, StreamingType,
};
use ditto_cache::ResponseReceiverCache;
use ditto_model::{
    Channel, CommandCategory, CommandResponse, DittoRuntimeError, LiveChannelTimeoutStrategy,
    Signal, ThingCommand,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Where the response of a published live signal goes
#[derive(Debug, Clone)]
pub enum ResponseReceiver {
    /// Straight to the waiting dispatch
    Direct(mpsc::Sender<Signal>),
    /// Through a forwarder that also relays acknowledgements
    Forwarder(ActorRef<ForwarderMessage>),
}

struct DispatcherInner {
    pubsub: LocalPubSub,
    receivers: ResponseReceiverCache<ResponseReceiver>,
    config: LiveConfig,
}

#[derive(Clone)]
pub struct ChannelDispatcher {
    inner: Arc<DispatcherInner>,
}

impl ChannelDispatcher {
    pub fn new(pubsub: LocalPubSub, config: LiveConfig) -> Self {
        let receivers = ResponseReceiverCache::new(config.response_receiver_fallback_expiry);
        Self {
            inner: Arc::new(DispatcherInner {
                pubsub,
                receivers,
                config,
            }),
        }
    }

    pub fn pubsub(&self) -> &LocalPubSub {
        &self.inner.pubsub
    }

    pub fn receivers(&self) -> &ResponseReceiverCache<ResponseReceiver> {
        &self.inner.receivers
    }

    /// Publish `signal` on the live channel and wait for its response
    ///
    /// `twin` answers the twin ask of conditional queries; acknowledgements
    /// requested by the signal are relayed to `sink` as they arrive.
    pub async fn dispatch(
        &self,
        signal: Signal,
        twin: &ThingPersistenceRef,
        sink: &ResponseSink,
        ask_timeout: Duration,
    ) -> Result<CommandResponse, DittoRuntimeError> {
        let entity = signal.entity_reference();
        let mut response_headers = signal.headers().response_headers().with_channel(Channel::Live);

        let twin_response = match &signal {
            Signal::Thing(command) if asks_twin_first(command) => {
                let twin_query = command.with_channel(Channel::Twin);
                let response = ask_persistence(twin, &entity, twin_query, ask_timeout).await?;
                if command.headers.live_channel_condition().is_some() {
                    let matched = response.headers.live_channel_condition_matched() == Some(true);
                    if !matched {
                        debug!(%entity, "live channel condition not matched, answering from twin");
                        return Ok(response);
                    }
                    response_headers = response_headers.with_live_channel_condition_matched(true);
                }
                Some(response)
            }
            _ => None,
        };
        let live = to_live(signal, twin_response.is_some());

        if !live.headers().is_response_required() {
            let name = live.name().to_string();
            self.publish(live)?;
            return Ok(CommandResponse::new(&entity, name, 202, None, response_headers));
        }

        let original_correlation_id = live.correlation_id().map(str::to_owned);
        let timeout = live.headers().timeout().unwrap_or(self.inner.config.default_timeout);
        let (inbox_tx, mut inbox) = mpsc::channel(1);
        let use_forwarder =
            !live.headers().requested_acks().is_empty() || self.inner.config.global_dispatching;
        let (published, receiver) = self
            .inner
            .receivers
            .insert_response_receiver_conflict_free(
                live,
                |signal| {
                    if use_forwarder {
                        let inbox = inbox_tx.clone();
                        let forwarder = self.spawn_forwarder(signal, sink, inbox, timeout);
                        ResponseReceiver::Forwarder(forwarder)
                    } else {
                        ResponseReceiver::Direct(inbox_tx.clone())
                    }
                },
                |signal, receiver| (signal, receiver),
            )
            .map_err(|err| internal("live signal could not be registered", &err))?;
        drop(inbox_tx);
        let correlation_id = published.correlation_id().unwrap_or_default().to_string();

        if let ResponseReceiver::Forwarder(forwarder) = &receiver {
            let labels = published.headers().requested_acks().clone();
            if let Err(err) = forwarder.try_tell(ForwarderMessage::Command { labels }) {
                debug!(%correlation_id, error = %err, "forwarder did not take the command");
            }
        }
        if let Err(err) = self.publish(published.clone()) {
            self.inner.receivers.invalidate(&correlation_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, inbox.recv()).await {
            Ok(Some(Signal::Response(response))) => {
                let mut response = validate_live_response(&published, response)
                    .map_err(|err| err.with_headers(response_headers))?;
                if let Some(original) = original_correlation_id {
                    response.headers.set_correlation_id(original);
                }
                Ok(response)
            }
            Ok(Some(other)) => Err(DittoRuntimeError::invalid_response(format!(
                "expected a command response, got '{}'",
                other.name()
            ))
            .with_headers(response_headers)),
            Ok(None) | Err(_) => {
                self.inner.receivers.invalidate(&correlation_id);
                let strategy = published
                    .headers()
                    .live_channel_timeout_strategy()
                    .unwrap_or_default();
                match (strategy, twin_response) {
                    (LiveChannelTimeoutStrategy::UseTwin, Some(twin_response)) => {
                        info!(
                            %entity,
                            %correlation_id,
                            "live response timed out, answering from twin"
                        );
                        Ok(twin_response)
                    }
                    _ => {
                        info!(%entity, %correlation_id, ?timeout, "live response timed out");
                        let err = DittoRuntimeError::command_timeout(timeout);
                        Err(err.with_headers(response_headers))
                    }
                }
            }
        }
    }

    /// The forwarder idles at least as long as the command may take
    fn spawn_forwarder(
        &self,
        signal: &Signal,
        sink: &ResponseSink,
        inbox: mpsc::Sender<Signal>,
        command_timeout: Duration,
    ) -> ActorRef<ForwarderMessage> {
        let forwarder = AckForwarder::new(
            signal.correlation_id().unwrap_or_default(),
            sink.clone(),
            inbox,
            self.inner.receivers.clone(),
            self.inner.config.forwarder_receive_timeout.max(command_timeout),
        );
        spawn(ActorId::unique("ack-forwarder"), forwarder, 16).0
    }

    fn publish(&self, signal: Signal) -> Result<usize, DittoRuntimeError> {
        let streaming_type = StreamingType::from_signal(&signal)?;
        let entity_id = signal.entity_reference().id;
        let publication = wrap_for_publication_with_acks(signal, entity_id, |signal| {
            signal.headers().requested_acks().clone()
        });
        Ok(self.inner.pubsub.publish(streaming_type, publication))
    }
}

/// Conditional queries and queries with an explicit timeout strategy need
/// the twin state before going live
fn asks_twin_first(command: &ThingCommand) -> bool {
    command.category() == CommandCategory::Query
        && (command.headers.live_channel_condition().is_some()
            || command.headers.live_channel_timeout_strategy().is_some())
}

fn to_live(signal: Signal, condition_matched: bool) -> Signal {
    match signal {
        Signal::Thing(command) => {
            let mut live = command.with_channel(Channel::Live);
            if condition_matched && live.headers.live_channel_condition().is_some() {
                live.headers =
                    std::mem::take(&mut live.headers).with_live_channel_condition_matched(true);
            }
            Signal::Thing(live)
        }
        other => other,
    }
}

/// A live response must answer the command it is registered for
fn validate_live_response(
    published: &Signal,
    response: CommandResponse,
) -> Result<CommandResponse, DittoRuntimeError> {
    let expected = published.entity_reference();
    if response.entity_reference() != expected {
        return Err(DittoRuntimeError::invalid_response(format!(
            "response for '{}' cannot answer a command for '{}'",
            response.entity_reference(),
            expected
        )));
    }
    if response.headers.correlation_id() != published.correlation_id() {
        return Err(DittoRuntimeError::invalid_response(
            "correlation id differs from the command's",
        ));
    }
    if response.command != published.name() {
        return Err(DittoRuntimeError::invalid_response(format!(
            "'{}' response cannot answer '{}'",
            response.command,
            published.name()
        )));
    }
    Ok(response)
}
