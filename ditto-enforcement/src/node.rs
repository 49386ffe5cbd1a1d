//! In-process node
//!
//! Wires the shard regions, caches, pub/sub and dispatchers together and is
//! the entry point for signals. Commands go to the supervisor of their
//! entity; live responses and acknowledgements go to the response
//! dispatcher.

use crate::config::DittoConfig;
use crate::contextual::{is_terminal, Reply};
use crate::dispatcher::ChannelDispatcher;
use crate::enforcement::EnforcementServices;
use crate::flow::spawn_enforcement_flow;
use crate::loaders::{PolicyEnforcerLoader, RegionRetriever, ThingPolicyIdLoader};
use crate::persistence::{PersistenceTarget, PolicyPersistenceActor, ThingPersistenceActor};
use crate::region::ShardRegion;
use crate::response_dispatcher::ResponseDispatcher;
use crate::retriever::EnforcerRetriever;
use crate::supervisor::{ChildFactory, StartedChildren};
use ditto_actors::{
    spawn, ActorId, LocalPubSub, Publication, StreamingType, SubscriberFilter, SubscriptionId,
};
use ditto_cache::EntityCache;
use ditto_model::{CommandResponse, DittoRuntimeError, EntityReference, EntityType, Signal};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Replies buffered per request before the flow waits for the requester
const REPLY_BUFFER: usize = 16;

struct NodeChildFactory {
    services: Arc<EnforcementServices>,
}

impl ChildFactory for NodeChildFactory {
    fn start_children(
        &self,
        entity: &EntityReference,
    ) -> Result<StartedChildren, DittoRuntimeError> {
        let config = &self.services.config;
        let mailbox = config.persistence.mailbox_capacity;
        let (persistence, termination) = match entity.entity_type {
            EntityType::Thing => {
                let (actor, termination) = spawn(
                    ActorId::new(format!("thing-persistence-{}", entity.id)),
                    ThingPersistenceActor::new(entity.id.clone()),
                    mailbox,
                );
                (PersistenceTarget::Thing(actor), termination)
            }
            EntityType::Policy => {
                let (actor, termination) = spawn(
                    ActorId::new(format!("policy-persistence-{}", entity.id)),
                    PolicyPersistenceActor::new(entity.id.clone()),
                    mailbox,
                );
                (PersistenceTarget::Policy(actor), termination)
            }
        };
        let enforcer = spawn_enforcement_flow(
            Arc::clone(&self.services),
            persistence.clone(),
            config.supervisor.mailbox_capacity,
        );
        Ok(StartedChildren {
            persistence,
            termination,
            enforcer,
        })
    }
}

pub struct DittoNode {
    config: Arc<DittoConfig>,
    things: ShardRegion,
    policies: ShardRegion,
    retriever: Arc<RegionRetriever>,
    dispatcher: ChannelDispatcher,
    responses: ResponseDispatcher,
}

impl DittoNode {
    /// Build and start a node; must be called inside a tokio runtime
    pub fn new(config: DittoConfig) -> Self {
        let config = Arc::new(config);
        let ask_timeout = config.enforcement.ask_timeout;
        let retry = config.enforcement.ask_with_retry.clone();
        let things = ShardRegion::new(EntityType::Thing, config.supervisor.clone(), ask_timeout);
        let policies = ShardRegion::new(EntityType::Policy, config.supervisor.clone(), ask_timeout);

        let id_cache = EntityCache::new(
            "thing-policy-id",
            config.caches.id.clone(),
            ThingPolicyIdLoader::new(things.clone(), ask_timeout, retry.clone()),
        );
        let enforcer_cache = EntityCache::new(
            "policy-enforcer",
            config.caches.enforcer.clone(),
            PolicyEnforcerLoader::new(policies.clone(), ask_timeout, retry),
        );
        let retriever =
            Arc::new(EnforcerRetriever::new(Arc::new(id_cache), Arc::new(enforcer_cache)));

        let dispatcher = ChannelDispatcher::new(LocalPubSub::new(), config.live.clone());
        let responses = ResponseDispatcher::new(dispatcher.receivers().clone());
        let services = Arc::new(EnforcementServices {
            config: Arc::clone(&config),
            retriever: Arc::clone(&retriever),
            policies: policies.clone(),
            dispatcher: dispatcher.clone(),
        });
        let factory: Arc<dyn ChildFactory> = Arc::new(NodeChildFactory { services });
        things.start(Arc::clone(&factory));
        policies.start(factory);
        info!(
            parallelism = config.enforcement.parallelism,
            ask_timeout = ?ask_timeout,
            "node started"
        );

        Self {
            config,
            things,
            policies,
            retriever,
            dispatcher,
            responses,
        }
    }

    pub fn config(&self) -> &DittoConfig {
        &self.config
    }

    pub fn retriever(&self) -> &RegionRetriever {
        &self.retriever
    }

    pub fn pubsub(&self) -> &LocalPubSub {
        self.dispatcher.pubsub()
    }

    /// Receive live commands or messages published for `filter`
    pub fn subscribe(
        &self,
        streaming_type: StreamingType,
        filter: SubscriberFilter,
        buffer: usize,
    ) -> (SubscriptionId, mpsc::Receiver<Publication>) {
        self.pubsub().subscribe(streaming_type, filter, buffer)
    }

    /// Submit a signal; its replies arrive on the returned receiver
    ///
    /// A command yields any number of acknowledgements followed by one
    /// terminal reply. A live response or acknowledgement yields nothing
    /// unless it is rejected. Signals without a correlation id get one.
    pub async fn submit(&self, mut signal: Signal) -> mpsc::Receiver<Reply> {
        if signal.correlation_id().is_none() {
            signal.headers_mut().set_correlation_id(Uuid::new_v4().to_string());
        }
        let (sink, replies) = mpsc::channel(REPLY_BUFFER);
        let headers = signal.headers().response_headers();
        let delivered = match signal {
            command @ (Signal::Thing(_) | Signal::Message(_)) => {
                self.things.deliver(command, sink.clone()).await
            }
            command @ Signal::Policy(_) => self.policies.deliver(command, sink.clone()).await,
            answer @ (Signal::Response(_) | Signal::Acknowledgement(_)) => {
                self.responses.dispatch(answer).await
            }
        };
        if let Err(err) = delivered {
            let err = if err.correlation_id().is_some() {
                err
            } else {
                err.with_headers(headers)
            };
            let _ = sink.try_send(Err(err));
        }
        replies
    }

    /// Submit a command and wait for its terminal reply, skipping
    /// acknowledgements
    pub async fn handle(&self, signal: Signal) -> Result<CommandResponse, DittoRuntimeError> {
        let headers = signal.headers().response_headers();
        let mut replies = self.submit(signal).await;
        while let Some(reply) = replies.recv().await {
            if !is_terminal(&reply) {
                continue;
            }
            return match reply {
                Ok(Signal::Response(response)) => Ok(response),
                Ok(other) => Err(DittoRuntimeError::invalid_response(format!(
                    "unexpected '{}' instead of a command response",
                    other.name()
                ))
                .with_headers(headers)),
                Err(err) => Err(err),
            };
        }
        debug!("request finished without a terminal reply");
        Err(DittoRuntimeError::internal().with_headers(headers))
    }

    /// Route a live response or acknowledgement coming from a device
    pub async fn dispatch_live_response(&self, signal: Signal) -> Result<(), DittoRuntimeError> {
        self.responses.dispatch(signal).await
    }

    /// Stop all supervisors after their outstanding operations
    pub async fn shutdown(&self) {
        self.things.shutdown().await;
        self.policies.shutdown().await;
        info!("node shut down");
    }
}
