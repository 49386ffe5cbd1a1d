//! Typed Ditto headers
//!
//! Header names follow Ditto's kebab-case wire names (`correlation-id`,
//! `live-channel-timeout-strategy`, ...). Unknown headers are kept in
//! [`DittoHeaders::extra`] so they survive a round trip through the engine.

use crate::duration::serde_opt_duration;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Channel a signal travels on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Twin,
    Live,
}

/// What to do when a live query runs into its timeout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LiveChannelTimeoutStrategy {
    #[default]
    Fail,
    UseTwin,
}

/// Authenticated subject, e.g. `integration:device-manager`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorizationSubject(pub String);

impl AuthorizationSubject {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuthorizationSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AuthorizationSubject {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Subjects a signal was issued for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationContext {
    #[serde(default)]
    pub subjects: Vec<AuthorizationSubject>,
}

impl AuthorizationContext {
    pub fn new<I, S>(subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AuthorizationSubject>,
    {
        Self {
            subjects: subjects.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

/// Label of a requested acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AcknowledgementLabel(pub String);

impl AcknowledgementLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AcknowledgementLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Largest `timeout` header a signal may carry
pub const MAX_TIMEOUT: Duration = Duration::from_secs(60 * 60);

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_opt_duration::deserialize(deserializer)? {
        Some(timeout) if timeout > MAX_TIMEOUT => Err(serde::de::Error::custom(format!(
            "timeout '{}' exceeds the maximum of '{}'",
            humantime::format_duration(timeout),
            humantime::format_duration(MAX_TIMEOUT)
        ))),
        timeout => Ok(timeout),
    }
}

fn default_response_required() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

/// Headers carried by every signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DittoHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,

    #[serde(
        default,
        serialize_with = "serde_opt_duration::serialize",
        deserialize_with = "deserialize_timeout",
        skip_serializing_if = "Option::is_none"
    )]
    timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel: Option<Channel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    live_channel_condition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    live_channel_timeout_strategy: Option<LiveChannelTimeoutStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    live_channel_condition_matched: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    condition: Option<String>,

    #[serde(default = "default_response_required", skip_serializing_if = "is_true")]
    response_required: bool,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    requested_acks: BTreeSet<AcknowledgementLabel>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    read_granted_subjects: Vec<AuthorizationSubject>,

    #[serde(default, skip_serializing_if = "AuthorizationContext::is_empty")]
    authorization_context: AuthorizationContext,

    #[serde(flatten)]
    extra: BTreeMap<String, String>,
}

impl Default for DittoHeaders {
    fn default() -> Self {
        Self {
            correlation_id: None,
            timeout: None,
            channel: None,
            live_channel_condition: None,
            live_channel_timeout_strategy: None,
            live_channel_condition_matched: None,
            condition: None,
            response_required: true,
            requested_acks: BTreeSet::new(),
            read_granted_subjects: Vec::new(),
            authorization_context: AuthorizationContext::default(),
            extra: BTreeMap::new(),
        }
    }
}

impl DittoHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn set_correlation_id(&mut self, id: impl Into<String>) {
        self.correlation_id = Some(id.into());
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Set the timeout, capped at [`MAX_TIMEOUT`]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.min(MAX_TIMEOUT));
        self
    }

    /// Channel of the signal; `twin` if absent
    pub fn channel(&self) -> Channel {
        self.channel.unwrap_or_default()
    }

    pub fn is_live(&self) -> bool {
        self.channel() == Channel::Live
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn live_channel_condition(&self) -> Option<&str> {
        self.live_channel_condition.as_deref()
    }

    pub fn with_live_channel_condition(mut self, condition: impl Into<String>) -> Self {
        self.live_channel_condition = Some(condition.into());
        self
    }

    /// Explicitly set strategy, if any
    pub fn live_channel_timeout_strategy(&self) -> Option<LiveChannelTimeoutStrategy> {
        self.live_channel_timeout_strategy
    }

    pub fn with_live_channel_timeout_strategy(
        mut self,
        strategy: LiveChannelTimeoutStrategy,
    ) -> Self {
        self.live_channel_timeout_strategy = Some(strategy);
        self
    }

    pub fn live_channel_condition_matched(&self) -> Option<bool> {
        self.live_channel_condition_matched
    }

    pub fn with_live_channel_condition_matched(mut self, matched: bool) -> Self {
        self.live_channel_condition_matched = Some(matched);
        self
    }

    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn is_response_required(&self) -> bool {
        self.response_required
    }

    pub fn with_response_required(mut self, required: bool) -> Self {
        self.response_required = required;
        self
    }

    pub fn requested_acks(&self) -> &BTreeSet<AcknowledgementLabel> {
        &self.requested_acks
    }

    pub fn with_requested_acks<I>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = AcknowledgementLabel>,
    {
        self.requested_acks = labels.into_iter().collect();
        self
    }

    pub fn read_granted_subjects(&self) -> &[AuthorizationSubject] {
        &self.read_granted_subjects
    }

    pub fn with_read_granted_subjects(mut self, subjects: Vec<AuthorizationSubject>) -> Self {
        self.read_granted_subjects = subjects;
        self
    }

    pub fn authorization_context(&self) -> &AuthorizationContext {
        &self.authorization_context
    }

    pub fn with_authorization_context(mut self, context: AuthorizationContext) -> Self {
        self.authorization_context = context;
        self
    }

    pub fn extra(&self) -> &BTreeMap<String, String> {
        &self.extra
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Headers that identify a request for its answer: correlation id,
    /// channel and live-channel annotations. Authorization data is dropped.
    pub fn response_headers(&self) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            channel: self.channel,
            live_channel_condition_matched: self.live_channel_condition_matched,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kebab_case_names() {
        let headers = DittoHeaders::new()
            .with_correlation_id("c-1")
            .with_timeout(Duration::from_secs(5))
            .with_channel(Channel::Live)
            .with_live_channel_timeout_strategy(LiveChannelTimeoutStrategy::UseTwin);
        let json = serde_json::to_value(&headers).unwrap();
        assert_eq!(json["correlation-id"], "c-1");
        assert_eq!(json["timeout"], "5s");
        assert_eq!(json["channel"], "live");
        assert_eq!(json["live-channel-timeout-strategy"], "use-twin");
        assert!(json.get("response-required").is_none());
    }

    #[test]
    fn test_oversized_timeout_is_rejected() {
        let err = serde_json::from_str::<DittoHeaders>(r#"{"timeout":"18446744073709551615s"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("exceeds the maximum"), "{}", err);
        let err = serde_json::from_str::<DittoHeaders>(r#"{"timeout":"99999999999999999999m"}"#)
            .unwrap_err();
        assert!(!err.to_string().is_empty());

        let headers: DittoHeaders = serde_json::from_str(r#"{"timeout":"1h"}"#).unwrap();
        assert_eq!(headers.timeout(), Some(MAX_TIMEOUT));
        let headers = DittoHeaders::new().with_timeout(Duration::MAX);
        assert_eq!(headers.timeout(), Some(MAX_TIMEOUT));
    }

    #[test]
    fn test_defaults_when_absent() {
        let headers: DittoHeaders = serde_json::from_str("{}").unwrap();
        assert!(headers.is_response_required());
        assert_eq!(headers.channel(), Channel::Twin);
        assert_eq!(headers.live_channel_timeout_strategy(), None);
    }

    #[test]
    fn test_extra_headers_survive() {
        let raw = r#"{"correlation-id":"x","x-custom":"v","response-required":false}"#;
        let headers: DittoHeaders = serde_json::from_str(raw).unwrap();
        assert_eq!(headers.extra().get("x-custom").map(String::as_str), Some("v"));
        assert!(!headers.is_response_required());
    }

    #[test]
    fn test_response_headers_keep_correlation() {
        let headers = DittoHeaders::new()
            .with_correlation_id("c-2")
            .with_channel(Channel::Live)
            .with_authorization_context(AuthorizationContext::new(["user:a"]));
        let response = headers.response_headers();
        assert_eq!(response.correlation_id(), Some("c-2"));
        assert!(response.is_live());
        assert!(response.authorization_context().is_empty());
    }
}
