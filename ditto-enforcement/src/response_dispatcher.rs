//! Routes live responses and acknowledgements coming back from devices
//!
//! Correlation is by correlation id only. A response whose receiver is gone
//! (answered, timed out or expired) is dropped with a debug log.

use crate::dispatcher::ResponseReceiver;
use crate::forwarder::ForwarderMessage;
use ditto_cache::ResponseReceiverCache;
use ditto_model::{DittoRuntimeError, Signal};
use tracing::debug;

#[derive(Clone)]
pub struct ResponseDispatcher {
    receivers: ResponseReceiverCache<ResponseReceiver>,
}

impl ResponseDispatcher {
    pub fn new(receivers: ResponseReceiverCache<ResponseReceiver>) -> Self {
        Self { receivers }
    }

    pub async fn dispatch(&self, signal: Signal) -> Result<(), DittoRuntimeError> {
        let Some(correlation_id) = signal.correlation_id().map(str::to_owned) else {
            return Err(DittoRuntimeError::invalid_response(format!(
                "'{}' carries no correlation id",
                signal.name()
            )));
        };

        match signal {
            Signal::Response(response) => match self.receivers.get(&correlation_id) {
                Some(entry) => match entry.receiver {
                    ResponseReceiver::Direct(_) => {
                        // taking the entry makes a second response for the id a no-op
                        if let Some(entry) = self.receivers.take(&correlation_id) {
                            if let ResponseReceiver::Direct(inbox) = entry.receiver {
                                if inbox.try_send(Signal::Response(response)).is_err() {
                                    debug!(
                                        %correlation_id,
                                        "live command no longer waits for its response"
                                    );
                                }
                            }
                        }
                        Ok(())
                    }
                    ResponseReceiver::Forwarder(forwarder) => {
                        if forwarder.tell(ForwarderMessage::Response(response)).await.is_err() {
                            debug!(%correlation_id, "forwarder already stopped");
                        }
                        Ok(())
                    }
                },
                None => {
                    debug!(%correlation_id, "no receiver for live response, dropping it");
                    Ok(())
                }
            },
            Signal::Acknowledgement(ack) => match self
                .receivers
                .get(&correlation_id)
                .map(|e| e.receiver)
            {
                Some(ResponseReceiver::Forwarder(forwarder)) => {
                    if forwarder.tell(ForwarderMessage::Acknowledgement(ack)).await.is_err() {
                        debug!(%correlation_id, "forwarder already stopped");
                    }
                    Ok(())
                }
                _ => {
                    debug!(
                        %correlation_id,
                        label = %ack.label,
                        "no forwarder for acknowledgement, dropping it"
                    );
                    Ok(())
                }
            },
            other => Err(DittoRuntimeError::signal_unsupported(other.name())
                .with_headers(other.headers().response_headers())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ditto_model::{
        Acknowledgement, AcknowledgementLabel, CommandResponse, DittoHeaders, EntityReference,
        ErrorKind, ThingAction, ThingCommand,
    };
    use tokio::sync::mpsc;

    fn command(correlation_id: &str) -> Signal {
        Signal::Thing(ThingCommand::new(
            "org.example:lamp".parse().unwrap(),
            ThingAction::RetrieveThing { selected_fields: None },
            DittoHeaders::new().with_correlation_id(correlation_id),
        ))
    }

    fn response(headers: DittoHeaders) -> Signal {
        Signal::Response(CommandResponse::new(
            &EntityReference::thing("org.example:lamp".parse().unwrap()),
            "retrieveThing",
            200,
            None,
            headers,
        ))
    }

    #[tokio::test]
    async fn test_response_reaches_waiting_command_once() {
        let receivers = ResponseReceiverCache::default();
        let (inbox_tx, mut inbox) = mpsc::channel(1);
        receivers
            .cache_signal_response_receiver(&command("c-1"), ResponseReceiver::Direct(inbox_tx))
            .unwrap();
        let dispatcher = ResponseDispatcher::new(receivers.clone());

        let answer = response(DittoHeaders::new().with_correlation_id("c-1"));
        dispatcher.dispatch(answer.clone()).await.unwrap();
        dispatcher.dispatch(answer).await.unwrap();

        assert!(matches!(inbox.recv().await, Some(Signal::Response(_))));
        assert!(inbox.try_recv().is_err());
        assert!(receivers.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_correlation_id_is_dropped() {
        let dispatcher = ResponseDispatcher::new(ResponseReceiverCache::default());
        let ack = Signal::Acknowledgement(Acknowledgement {
            label: AcknowledgementLabel::new("custom"),
            entity_id: "org.example:lamp".parse().unwrap(),
            status: 200,
            payload: None,
            headers: DittoHeaders::new().with_correlation_id("unknown"),
        });
        assert!(dispatcher.dispatch(ack).await.is_ok());
        assert!(dispatcher
            .dispatch(response(DittoHeaders::new().with_correlation_id("unknown")))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_missing_correlation_id_is_invalid() {
        let dispatcher = ResponseDispatcher::new(ResponseReceiverCache::default());
        let err = dispatcher.dispatch(response(DittoHeaders::new())).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidResponse);
    }

    #[tokio::test]
    async fn test_commands_are_not_responses() {
        let dispatcher = ResponseDispatcher::new(ResponseReceiverCache::default());
        let err = dispatcher.dispatch(command("c-1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignalUnsupported);
    }
}
