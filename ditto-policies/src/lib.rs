//! Policy evaluation
//!
//! A policy is compiled into one [`PermissionTrie`] per resource type. The
//! [`PolicyEnforcer`] answers permission questions against those tries and
//! builds filtered views of entity documents.

pub mod enforcer;
pub mod merge;
pub mod template;
pub mod trie;

pub use enforcer::PolicyEnforcer;
pub use merge::merge_leaves;
pub use template::{default_policy_for, DEFAULT_ENTRY_LABEL};
pub use trie::{Decision, PermissionTrie};
