//! Session activity notifications sent to an external collector.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Session activity reported to the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Activity {
    SessionStarted,
    SessionEnded,
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activity::SessionStarted => write!(f, "session-started"),
            Activity::SessionEnded => write!(f, "session-ended"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("activity request failed")]
    Request(#[from] reqwest::Error),

    #[error("activity collector answered {0}")]
    Rejected(u16),
}

/// Delivers activity notifications.
#[async_trait]
pub trait ActivityNotifier: Send + Sync + fmt::Debug {
    async fn notify(&self, activity: Activity) -> Result<(), ActivityError>;
}

#[derive(Serialize)]
struct ActivityNotice<'a> {
    activity: Activity,
    service: &'a str,
}

/// Posts notifications as JSON to a collector URL.
#[derive(Debug, Clone)]
pub struct HttpActivityNotifier {
    client: reqwest::Client,
    url: String,
    service: String,
}

impl HttpActivityNotifier {
    /// Fails when the HTTP client cannot be built (no TLS backend).
    pub fn new(
        url: impl Into<String>,
        service: impl Into<String>,
    ) -> Result<Self, ActivityError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            service: service.into(),
        })
    }
}

#[async_trait]
impl ActivityNotifier for HttpActivityNotifier {
    async fn notify(&self, activity: Activity) -> Result<(), ActivityError> {
        let response = self
            .client
            .post(&self.url)
            .json(&ActivityNotice {
                activity,
                service: &self.service,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ActivityError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Logs notifications when no collector is configured.
#[derive(Debug, Clone)]
pub struct LogActivityNotifier {
    service: String,
}

impl LogActivityNotifier {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

#[async_trait]
impl ActivityNotifier for LogActivityNotifier {
    async fn notify(&self, activity: Activity) -> Result<(), ActivityError> {
        info!("Session activity for '{}': {}", self.service, activity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_wire_format() {
        let notice = ActivityNotice {
            activity: Activity::SessionStarted,
            service: "orders",
        };
        assert_eq!(
            serde_json::to_value(&notice).unwrap(),
            serde_json::json!({"activity": "session-started", "service": "orders"})
        );
        assert_eq!(Activity::SessionEnded.to_string(), "session-ended");
    }

    #[tokio::test]
    async fn test_unreachable_collector_is_an_error() {
        let notifier =
            HttpActivityNotifier::new("http://127.0.0.1:1/activity", "orders").unwrap();
        assert!(notifier.notify(Activity::SessionEnded).await.is_err());
        assert!(LogActivityNotifier::new("orders")
            .notify(Activity::SessionEnded)
            .await
            .is_ok());
    }
}
