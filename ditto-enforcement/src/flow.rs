//! Enforcement flow of one entity
//!
//! Signals accepted by a supervisor are queued here and enforced with
//! bounded parallelism. Every signal gets exactly one terminal reply: the
//! filtered command response, or the error that stopped it.

use crate::contextual::{Contextual, EnforcementStage};
use crate::enforcement::{EnforcementProvider, EnforcementServices};
use crate::persistence::PersistenceTarget;
use ditto_model::{DittoRuntimeError, Signal};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, Instrument};

/// Start the flow; it runs until every sender is dropped
pub fn spawn_enforcement_flow(
    services: Arc<EnforcementServices>,
    persistence: PersistenceTarget,
    capacity: usize,
) -> mpsc::Sender<Contextual<Signal>> {
    let (tx, rx) = mpsc::channel::<Contextual<Signal>>(capacity.max(1));
    let parallelism = services.config.enforcement.parallelism.max(1);
    tokio::spawn(async move {
        ReceiverStream::new(rx)
            .for_each_concurrent(parallelism, |ctx| {
                let services = Arc::clone(&services);
                let persistence = persistence.clone();
                async move {
                    let span = ctx.span().clone();
                    enforce_contextual(&services, &persistence, ctx).instrument(span).await
                }
            })
            .await;
        debug!("enforcement flow finished");
    });
    tx
}

async fn enforce_contextual(
    services: &EnforcementServices,
    persistence: &PersistenceTarget,
    mut ctx: Contextual<Signal>,
) {
    let result = match EnforcementProvider::select(ctx.message()) {
        Ok(provider) => provider.enforce(services, persistence, &mut ctx).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(response) => {
            debug!(status = response.status, "enforced");
            ctx.reply(Ok(Signal::Response(response))).await;
        }
        Err(err) => {
            if ctx.stage() != EnforcementStage::Forwarding {
                ctx.advance(EnforcementStage::Rejected);
            }
            debug!(error = %err, kind = ?err.kind(), stage = %ctx.stage(), "not enforced");
            ctx.reply(Err(with_request_headers(err, ctx.message()))).await;
        }
    }
}

/// Errors raised before any answer existed carry no correlation id yet
fn with_request_headers(err: DittoRuntimeError, signal: &Signal) -> DittoRuntimeError {
    if err.correlation_id().is_some() {
        err
    } else {
        err.with_headers(signal.headers().response_headers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contextual::Reply;
    use crate::enforcement::test_services;
    use crate::persistence::ThingPersistenceActor;
    use ditto_actors::{spawn, ActorId};
    use ditto_model::{Acknowledgement, AcknowledgementLabel, DittoHeaders, ErrorKind};
    use std::time::Duration;

    #[tokio::test]
    async fn test_unsupported_signal_gets_rejected_reply() {
        let thing_id = "org.example:lamp".parse().unwrap();
        let (persistence, _) =
            spawn(ActorId::unique("thing"), ThingPersistenceActor::new(thing_id), 8);
        let flow =
            spawn_enforcement_flow(test_services(), PersistenceTarget::Thing(persistence), 8);

        let (sink, mut replies) = mpsc::channel::<Reply>(4);
        let ack = Signal::Acknowledgement(Acknowledgement {
            label: AcknowledgementLabel::new("custom"),
            entity_id: "org.example:lamp".parse().unwrap(),
            status: 200,
            payload: None,
            headers: DittoHeaders::new().with_correlation_id("c-1"),
        });
        flow.send(Contextual::for_signal(ack, sink, Duration::from_secs(1)))
            .await
            .unwrap();

        let err = replies.recv().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignalUnsupported);
        assert_eq!(err.correlation_id(), Some("c-1"));
    }

    #[test]
    fn test_request_headers_fill_missing_correlation_id() {
        let signal = Signal::Acknowledgement(Acknowledgement {
            label: AcknowledgementLabel::new("custom"),
            entity_id: "org.example:lamp".parse().unwrap(),
            status: 200,
            payload: None,
            headers: DittoHeaders::new().with_correlation_id("c-2"),
        });
        let err = with_request_headers(DittoRuntimeError::internal(), &signal);
        assert_eq!(err.correlation_id(), Some("c-2"));

        let err = DittoRuntimeError::internal()
            .with_headers(DittoHeaders::new().with_correlation_id("c-3"));
        assert_eq!(with_request_headers(err, &signal).correlation_id(), Some("c-3"));
    }
}
