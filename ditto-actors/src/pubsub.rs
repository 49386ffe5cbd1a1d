//! Local topic pub/sub for live signals
//!
//! Publications are routed by [`StreamingType`]. A subscriber only receives
//! a publication when its namespace filter accepts the entity and at least
//! one of its subjects is among the publication's `read-granted-subjects`.

use crate::types::SubscriptionId;
use ditto_model::{
    AcknowledgementLabel, AuthorizationSubject, DittoRuntimeError, EntityId, Signal,
};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Topic a live signal is published on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamingType {
    LiveCommands,
    Messages,
}

impl StreamingType {
    /// Topic for `signal`; only live thing commands and messages map to one
    pub fn from_signal(signal: &Signal) -> Result<Self, DittoRuntimeError> {
        match signal {
            Signal::Thing(command) if command.headers.is_live() => Ok(StreamingType::LiveCommands),
            Signal::Message(_) => Ok(StreamingType::Messages),
            other => Err(DittoRuntimeError::signal_unsupported(other.name())
                .with_headers(other.headers().clone())),
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            StreamingType::LiveCommands => "things.live.commands",
            StreamingType::Messages => "things.live.messages",
        }
    }
}

/// Signal ready for publication, with the acknowledgement labels a
/// subscriber is expected to answer
#[derive(Debug, Clone)]
pub struct Publication {
    pub signal: Signal,
    pub entity_id: EntityId,
    pub ack_labels: BTreeSet<AcknowledgementLabel>,
}

/// Wrap a signal for publication, extracting the acks subscribers must send
pub fn wrap_for_publication_with_acks<F>(
    signal: Signal,
    entity_id: EntityId,
    ack_extractor: F,
) -> Publication
where
    F: Fn(&Signal) -> BTreeSet<AcknowledgementLabel>,
{
    let ack_labels = ack_extractor(&signal);
    Publication {
        signal,
        entity_id,
        ack_labels,
    }
}

/// Which publications a subscriber wants
#[derive(Debug, Clone, Default)]
pub struct SubscriberFilter {
    /// `None` accepts every namespace
    pub namespaces: Option<BTreeSet<String>>,
    pub subjects: BTreeSet<AuthorizationSubject>,
}

impl SubscriberFilter {
    pub fn for_subjects<I, S>(subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AuthorizationSubject>,
    {
        Self {
            namespaces: None,
            subjects: subjects.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespaces
            .get_or_insert_with(BTreeSet::new)
            .insert(namespace.into());
        self
    }

    fn accepts(&self, publication: &Publication) -> bool {
        let namespace_ok = self
            .namespaces
            .as_ref()
            .map_or(true, |ns| ns.contains(publication.entity_id.namespace()));
        namespace_ok
            && publication
                .signal
                .headers()
                .read_granted_subjects()
                .iter()
                .any(|s| self.subjects.contains(s))
    }
}

struct Subscriber {
    streaming_type: StreamingType,
    filter: SubscriberFilter,
    sender: mpsc::Sender<Publication>,
}

/// In-process pub/sub shared by reference
#[derive(Clone, Default)]
pub struct LocalPubSub {
    subscribers: Arc<RwLock<HashMap<SubscriptionId, Subscriber>>>,
}

impl LocalPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic; publications arrive on the returned receiver
    pub fn subscribe(
        &self,
        streaming_type: StreamingType,
        filter: SubscriberFilter,
        buffer: usize,
    ) -> (SubscriptionId, mpsc::Receiver<Publication>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let id = SubscriptionId::next();
        self.subscribers.write().insert(
            id,
            Subscriber {
                streaming_type,
                filter,
                sender,
            },
        );
        debug!(subscription = %id, topic = streaming_type.topic(), "subscribed");
        (id, receiver)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.write().remove(&id).is_some()
    }

    /// Deliver to every matching subscriber; returns the number reached
    pub fn publish(&self, streaming_type: StreamingType, publication: Publication) -> usize {
        let mut delivered = 0;
        let mut gone = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (id, subscriber) in subscribers.iter() {
                if subscriber.streaming_type != streaming_type
                    || !subscriber.filter.accepts(&publication)
                {
                    continue;
                }
                match subscriber.sender.try_send(publication.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(subscription = %id, "subscriber buffer full, dropping publication")
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*id),
                }
            }
        }
        if !gone.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in gone {
                subscribers.remove(&id);
            }
        }
        debug!(
            topic = streaming_type.topic(),
            entity = %publication.entity_id,
            delivered,
            "published"
        );
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
