//! Per-request context of the enforcement pipeline
//!
//! A [`Contextual`] is created when a supervisor accepts a signal and is
//! dropped once the pipeline has produced its terminal reply. It carries the
//! reply sink, the ask timeout for downstream asks, the tracing span every
//! stage logs in, and the enforcement stage.

use crate::supervisor::OperationGuard;
use ditto_model::{DittoRuntimeError, Signal};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn, Span};

/// Anything sent back to a requester. Acknowledgements are intermediate,
/// a command response or an error ends the exchange.
pub type Reply = Result<Signal, DittoRuntimeError>;

pub type ResponseSink = mpsc::Sender<Reply>;

/// Whether `reply` ends the exchange
pub fn is_terminal(reply: &Reply) -> bool {
    !matches!(reply, Ok(Signal::Acknowledgement(_)))
}

/// Stage of one command's enforcement; stages only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnforcementStage {
    Received,
    ResolvingEntityId,
    ResolvingEnforcer,
    Authorizing,
    Forwarding,
    Rejected,
}

impl EnforcementStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnforcementStage::Forwarding | EnforcementStage::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnforcementStage::Received => "received",
            EnforcementStage::ResolvingEntityId => "resolving-entity-id",
            EnforcementStage::ResolvingEnforcer => "resolving-enforcer",
            EnforcementStage::Authorizing => "authorizing",
            EnforcementStage::Forwarding => "forwarding",
            EnforcementStage::Rejected => "rejected",
        }
    }
}

impl fmt::Display for EnforcementStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Contextual<T> {
    message: T,
    sender: ResponseSink,
    ask_timeout: Duration,
    span: Span,
    stage: EnforcementStage,
    guard: Option<OperationGuard>,
}

impl<T> Contextual<T> {
    pub fn new(message: T, sender: ResponseSink, ask_timeout: Duration, span: Span) -> Self {
        Self {
            message,
            sender,
            ask_timeout,
            span,
            stage: EnforcementStage::Received,
            guard: None,
        }
    }

    /// Keep the supervisor's outstanding-operation count up while this
    /// context is alive
    pub fn with_guard(mut self, guard: OperationGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn sender(&self) -> &ResponseSink {
        &self.sender
    }

    pub fn ask_timeout(&self) -> Duration {
        self.ask_timeout
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn stage(&self) -> EnforcementStage {
        self.stage
    }

    /// Move to `next`. Going backwards or leaving a terminal stage is
    /// refused and reported as `false`.
    pub fn advance(&mut self, next: EnforcementStage) -> bool {
        if self.stage.is_terminal() || next <= self.stage {
            warn!(parent: &self.span, from = %self.stage, to = %next, "refused stage transition");
            return false;
        }
        debug!(parent: &self.span, from = %self.stage, to = %next, "enforcement stage");
        self.stage = next;
        true
    }

    /// Same context around another message
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Contextual<U> {
        Contextual {
            message: f(self.message),
            sender: self.sender,
            ask_timeout: self.ask_timeout,
            span: self.span,
            stage: self.stage,
            guard: self.guard,
        }
    }

    /// Send `reply` to the requester; a requester that went away is only
    /// logged
    pub async fn reply(&self, reply: Reply) {
        if self.sender.send(reply).await.is_err() {
            debug!(parent: &self.span, "requester is gone, dropping reply");
        }
    }
}

impl Contextual<Signal> {
    /// Context for an incoming signal with its own span
    pub fn for_signal(signal: Signal, sender: ResponseSink, ask_timeout: Duration) -> Self {
        let span = tracing::debug_span!(
            "enforcement",
            correlation_id = signal.correlation_id().unwrap_or("-"),
            entity = %signal.entity_reference(),
            signal = signal.name(),
        );
        Self::new(signal, sender, ask_timeout, span)
    }
}

impl<T: fmt::Debug> fmt::Debug for Contextual<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contextual")
            .field("message", &self.message)
            .field("ask_timeout", &self.ask_timeout)
            .field("stage", &self.stage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ditto_model::{Acknowledgement, AcknowledgementLabel, DittoHeaders};

    fn contextual() -> (Contextual<u32>, mpsc::Receiver<Reply>) {
        let (tx, rx) = mpsc::channel(4);
        (Contextual::new(7, tx, Duration::from_secs(5), Span::none()), rx)
    }

    #[test]
    fn test_stages_only_move_forward() {
        let (mut ctx, _rx) = contextual();
        assert_eq!(ctx.stage(), EnforcementStage::Received);
        assert!(ctx.advance(EnforcementStage::ResolvingEntityId));
        assert!(ctx.advance(EnforcementStage::Authorizing));
        assert!(!ctx.advance(EnforcementStage::ResolvingEnforcer));
        assert!(ctx.advance(EnforcementStage::Forwarding));
        assert!(!ctx.advance(EnforcementStage::Rejected));
        assert_eq!(ctx.stage(), EnforcementStage::Forwarding);
    }

    #[test]
    fn test_map_keeps_stage() {
        let (mut ctx, _rx) = contextual();
        ctx.advance(EnforcementStage::Authorizing);
        let mapped = ctx.map(|n| n.to_string());
        assert_eq!(mapped.message(), "7");
        assert_eq!(mapped.stage(), EnforcementStage::Authorizing);
    }

    #[tokio::test]
    async fn test_reply_to_gone_requester_is_ignored() {
        let (ctx, rx) = contextual();
        drop(rx);
        ctx.reply(Err(DittoRuntimeError::internal())).await;
    }

    #[test]
    fn test_acknowledgements_are_not_terminal() {
        let ack = Signal::Acknowledgement(Acknowledgement {
            label: AcknowledgementLabel::new("custom"),
            entity_id: "org.example:lamp".parse().unwrap(),
            status: 200,
            payload: None,
            headers: DittoHeaders::new(),
        });
        assert!(!is_terminal(&Ok(ack)));
        assert!(is_terminal(&Err(DittoRuntimeError::internal())));
    }
}
