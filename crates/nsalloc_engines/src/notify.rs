#![forbid(unsafe_code)]

use std::time::Duration;

use nsalloc_contracts::request::RequestIdentity;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    NoCapacity,
    PriorityAdvisory,
    PoolExhausted,
    StuckInQueue,
}

impl NotificationCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationCategory::NoCapacity => "no_capacity",
            NotificationCategory::PriorityAdvisory => "priority_advisory",
            NotificationCategory::PoolExhausted => "pool_exhausted",
            NotificationCategory::StuckInQueue => "stuck_in_queue",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("notification endpoint answered http {0}")]
    HttpStatus(u16),
    #[error("notification transport error: {0}")]
    Transport(String),
}

/// Fire-and-forget outbound notifications. Callers log failures and carry on.
pub trait NotificationSink {
    fn notify(
        &self,
        category: NotificationCategory,
        identity: &RequestIdentity,
        message: &str,
    ) -> Result<(), NotifyError>;
}

impl<T: NotificationSink + ?Sized> NotificationSink for &T {
    fn notify(
        &self,
        category: NotificationCategory,
        identity: &RequestIdentity,
        message: &str,
    ) -> Result<(), NotifyError> {
        (**self).notify(category, identity, message)
    }
}

impl<T: NotificationSink + ?Sized> NotificationSink for Box<T> {
    fn notify(
        &self,
        category: NotificationCategory,
        identity: &RequestIdentity,
        message: &str,
    ) -> Result<(), NotifyError> {
        (**self).notify(category, identity, message)
    }
}

/// Builds the human-readable text for a category.
pub fn compose_message(
    category: NotificationCategory,
    identity: &RequestIdentity,
    detail: &str,
) -> String {
    let release = if identity.ancillary_release_tag.is_empty() {
        identity.release_tag.clone()
    } else {
        format!(
            "{} (ancillary {})",
            identity.release_tag, identity.ancillary_release_tag
        )
    };
    let headline = match category {
        NotificationCategory::NoCapacity => format!(
            "No cluster capacity for {} {release}; the pipeline is queued.",
            identity.workload_kind
        ),
        NotificationCategory::PriorityAdvisory => format!(
            "Cluster is busy; {} {release} is waiting behind more urgent work. Contact the operators to prioritise it.",
            identity.workload_kind
        ),
        NotificationCategory::PoolExhausted => format!(
            "No free {} namespace for {release}; waiting for one to be released.",
            identity.workload_kind
        ),
        NotificationCategory::StuckInQueue => format!(
            "{} {release} has been waiting for a namespace for a long time.",
            identity.workload_kind
        ),
    };
    let mut text = headline;
    if !detail.is_empty() {
        text.push(' ');
        text.push_str(detail);
    }
    if identity.custom_message != "NULL" && !identity.custom_message.is_empty() {
        text.push('\n');
        text.push_str(&identity.custom_message);
    }
    text
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn notify(
        &self,
        category: NotificationCategory,
        identity: &RequestIdentity,
        message: &str,
    ) -> Result<(), NotifyError> {
        info!(
            category = category.as_str(),
            release_tag = %identity.release_tag,
            official_build = identity.official_build,
            "{message}"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    pub timeout_ms: u64,
}

impl NotificationConfig {
    pub fn mvp_v1() -> Self {
        Self {
            webhook_url: None,
            timeout_ms: 10_000,
        }
    }

    pub fn from_env() -> Self {
        let mut cfg = Self::mvp_v1();
        cfg.webhook_url = std::env::var("NSALLOC_WEBHOOK_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        cfg
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub category: NotificationCategory,
    pub release_tag: &'a str,
    pub ancillary_release_tag: &'a str,
    pub official_build: bool,
    pub text: &'a str,
}

impl<'a> WebhookPayload<'a> {
    pub fn v1(
        category: NotificationCategory,
        identity: &'a RequestIdentity,
        text: &'a str,
    ) -> Self {
        Self {
            category,
            release_tag: &identity.release_tag,
            ancillary_release_tag: &identity.ancillary_release_tag,
            official_build: identity.official_build,
            text,
        }
    }
}

#[derive(Debug)]
pub struct WebhookNotificationSink {
    agent: ureq::Agent,
    url: String,
}

impl WebhookNotificationSink {
    pub fn new(url: impl Into<String>, timeout_ms: u64) -> Self {
        let timeout = Duration::from_millis(timeout_ms.max(100));
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self {
            agent,
            url: url.into(),
        }
    }
}

impl NotificationSink for WebhookNotificationSink {
    fn notify(
        &self,
        category: NotificationCategory,
        identity: &RequestIdentity,
        message: &str,
    ) -> Result<(), NotifyError> {
        let payload = WebhookPayload::v1(category, identity, message);
        match self
            .agent
            .post(&self.url)
            .set("content-type", "application/json")
            .send_json(&payload)
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => Err(NotifyError::HttpStatus(code)),
            Err(ureq::Error::Transport(err)) => Err(NotifyError::Transport(err.to_string())),
        }
    }
}

/// Webhook when configured, log otherwise.
pub fn sink_from_config(config: &NotificationConfig) -> Box<dyn NotificationSink + Send + Sync> {
    match config.webhook_url.as_deref() {
        Some(url) => Box::new(WebhookNotificationSink::new(url, config.timeout_ms)),
        None => Box::new(LogNotificationSink),
    }
}
