//! Reviewer notification for staged pushes

use anyhow::{Context, Result};
use serde_json::json;
use std::time::Duration;

use super::approval::ApprovalRequest;

pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

pub trait Notifier {
    fn notify(&self, request: &ApprovalRequest) -> Result<()>;
}

/// Posts `{ "text": ..., "approval_request": ... }` to a webhook URL
pub struct WebhookNotifier {
    url: String,
    client: reqwest::blocking::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Body sent for one request
pub fn payload(request: &ApprovalRequest) -> serde_json::Value {
    json!({
        "text": request.summary(),
        "approval_request": request,
    })
}

impl Notifier for WebhookNotifier {
    fn notify(&self, request: &ApprovalRequest) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&payload(request))
            .send()
            .with_context(|| format!("Webhook request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Webhook {} returned {}", self.url, status);
        }
        tracing::debug!("Notified {} about {}", self.url, request.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::protocol::Refspec;
    use chrono::Utc;

    #[test]
    fn test_payload_shape() {
        let refspec = Refspec::parse("feature:main").unwrap();
        let request = ApprovalRequest::pending("dana", &refspec, "abc..def (2 commits)", "git@host:r.git", Utc::now());
        let body = payload(&request);

        assert!(body["text"].as_str().unwrap().contains("dana requests review"));
        assert_eq!(body["approval_request"]["target_branch"], "main");
        assert_eq!(body["approval_request"]["status"], "pending");
    }

    #[test]
    fn test_unreachable_webhook_is_an_error() {
        let notifier =
            WebhookNotifier::new("http://127.0.0.1:9/hook", Duration::from_millis(200)).unwrap();
        let refspec = Refspec::parse("a:b").unwrap();
        let request = ApprovalRequest::pending("dana", &refspec, "a", "u", Utc::now());
        assert!(notifier.notify(&request).is_err());
    }
}
