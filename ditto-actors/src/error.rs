//! Error types for the actor runtime

use crate::types::ActorId;
use std::time::Duration;
use thiserror::Error;

/// Failure to deliver a message or to receive its reply
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActorError {
    /// Bounded mailbox is at capacity
    #[error("mailbox of actor {0} is full")]
    MailboxFull(ActorId),

    /// Actor has stopped
    #[error("actor {0} is not running")]
    MailboxClosed(ActorId),

    /// No reply within the ask timeout
    #[error("ask to actor {actor} timed out after {timeout:?}")]
    AskTimeout { actor: ActorId, timeout: Duration },

    /// Actor dropped the reply channel without answering
    #[error("actor {0} dropped the reply")]
    ReplyDropped(ActorId),
}

impl ActorError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ActorError::AskTimeout { .. })
    }
}

/// Result type using ActorError
pub type ActorResult<T> = std::result::Result<T, ActorError>;
