//! Policy enforcement and response correlation
//!
//! Every signal for a Thing or Policy passes its entity's supervisor and
//! enforcement flow: the applicable enforcer is resolved through two cache
//! stages, the signal is authorized, forwarded to persistence or published
//! on the live channel, and the answer is filtered by what the requester
//! may read. [`DittoNode`] wires the pieces into a running node.

pub mod config;
pub mod contextual;
pub mod dispatcher;
pub mod enforcement;
pub mod errors;
pub mod flow;
pub mod forwarder;
pub mod loaders;
pub mod node;
pub mod persistence;
pub mod region;
pub mod response_dispatcher;
pub mod retriever;
pub mod retry;
pub mod supervisor;

pub use config::{ConfigError, DittoConfig};
pub use contextual::{Contextual, EnforcementStage, Reply, ResponseSink};
pub use dispatcher::{ChannelDispatcher, ResponseReceiver};
pub use enforcement::{EnforcementProvider, EnforcementServices};
pub use node::DittoNode;
pub use region::ShardRegion;
pub use response_dispatcher::ResponseDispatcher;
pub use retriever::EnforcerRetriever;
