use crate::error::Result;
use crate::jobs::RunState;
use crate::lease::RunLease;
use crate::notify::Notifier;
use crate::types::{HandlerResponse, InvocationContext, LifecycleDetail, LifecycleEvent};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Subject and body for a lifecycle notification.
///
/// Only the exact states `SUCCEEDED` and `FAILED` get their own subject;
/// everything else, `TIMEOUT` and `ERROR` included, is a generic update.
pub fn format_status(detail: &LifecycleDetail) -> (String, String) {
    let job_name = detail.job_name();
    let subject = match detail.state() {
        "SUCCEEDED" => format!("Job Succeeded: {}", job_name),
        "FAILED" => format!("Job Failed: {}", job_name),
        _ => format!("Job Update: {}", job_name),
    };

    let message = format!(
        "Job update:\n\nJob Name: {}\nRun ID: {}\nStatus: {}\n",
        job_name,
        detail.job_run_id(),
        detail.state()
    );
    (subject, message)
}

/// Forwards job lifecycle events to the notification channel
pub struct StatusRelay {
    notifier: Arc<dyn Notifier>,
    lease: Option<Arc<dyn RunLease>>,
}

impl StatusRelay {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier, lease: None }
    }

    /// Release the dispatcher's run claim when a run reaches a terminal state
    pub fn with_lease(mut self, lease: Option<Arc<dyn RunLease>>) -> Self {
        self.lease = lease;
        self
    }

    pub async fn handle(
        &self,
        event: &LifecycleEvent,
        ctx: &InvocationContext,
    ) -> Result<HandlerResponse> {
        if let Ok(pretty) = serde_json::to_string_pretty(event) {
            debug!(
                "{} received lifecycle event ({}):\n{}",
                ctx.function_name, ctx.request_id, pretty
            );
        }

        let detail = &event.detail;
        let (subject, message) = format_status(detail);
        info!(
            "Job '{}' run {} is {}",
            detail.job_name(),
            detail.job_run_id(),
            detail.state()
        );

        self.notifier.notify(&subject, &message).await?;

        if let Some(lease) = &self.lease {
            if RunState::parse(detail.state()).is_terminal() {
                if let Err(e) = lease.release(detail.job_name(), Some(detail.job_run_id())).await {
                    warn!("Could not release claim for '{}': {}", detail.job_name(), e);
                }
            }
        }

        Ok(HandlerResponse::ok("Notification sent!"))
    }
}
