use crate::config::NotifyChannel;
use crate::error::{EtlError, Result};
use async_trait::async_trait;
use aws_sdk_sns::error::DisplayErrorContext;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Longest subject the pub/sub channel accepts
pub const MAX_SUBJECT_LEN: usize = 100;

/// Publishes (subject, message) pairs to the deployment's notification channel
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, message: &str) -> Result<()>;
}

/// Make a subject acceptable to the channel: ASCII only, no line breaks or
/// control characters, at most [`MAX_SUBJECT_LEN`] characters.
pub fn sanitize_subject(subject: &str) -> String {
    let cleaned: String = subject
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .filter(|c| c.is_ascii())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let mut subject: String = cleaned.chars().take(MAX_SUBJECT_LEN).collect();
    if subject.is_empty() {
        subject.push_str("Notification");
    }
    subject
}

/// Pub/sub topic notifier
pub struct SnsNotifier {
    client: aws_sdk_sns::Client,
    topic_arn: String,
}

impl SnsNotifier {
    pub fn new(sdk_config: &aws_config::SdkConfig, topic_arn: &str) -> Self {
        Self {
            client: aws_sdk_sns::Client::new(sdk_config),
            topic_arn: topic_arn.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for SnsNotifier {
    async fn notify(&self, subject: &str, message: &str) -> Result<()> {
        let subject = sanitize_subject(subject);
        let output = self
            .client
            .publish()
            .topic_arn(&self.topic_arn)
            .subject(&subject)
            .message(message)
            .send()
            .await
            .map_err(|e| {
                EtlError::Notify(format!(
                    "Publish to {} failed: {}",
                    self.topic_arn,
                    DisplayErrorContext(e)
                ))
            })?;

        debug!(
            "Published '{}' to {} (message id {:?})",
            subject,
            self.topic_arn,
            output.message_id()
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    message: &'a str,
}

/// HTTP webhook notifier posting `{"subject", "message"}` JSON
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("trade-etl-pipeline/0.1.0")
            .build()?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, subject: &str, message: &str) -> Result<()> {
        let subject = sanitize_subject(subject);
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload {
                subject: &subject,
                message,
            })
            .send()
            .await
            .map_err(|e| EtlError::Notify(format!("Webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EtlError::Notify(format!("HTTP {}: {}", status, error_text)));
        }

        debug!("Posted '{}' to webhook", subject);
        Ok(())
    }
}

/// Build the notifier for a configured channel
pub async fn notifier_for(channel: &NotifyChannel) -> Result<Arc<dyn Notifier>> {
    match channel {
        NotifyChannel::Topic(arn) => {
            info!("Notifications go to topic {}", arn);
            let sdk_config = crate::config::load_aws_config().await;
            Ok(Arc::new(SnsNotifier::new(&sdk_config, arn)))
        }
        NotifyChannel::Webhook(url) => {
            info!("Notifications go to webhook {}", url);
            Ok(Arc::new(WebhookNotifier::new(url)?))
        }
    }
}
