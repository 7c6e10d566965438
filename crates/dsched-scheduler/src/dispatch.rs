//! Notification dispatch: sends notifications to their targets.
//! Supports: HTTP webhook (JSON POST) and the server log.

use std::time::Duration;

use super::notify::Notification;

/// Where a notification goes. Parsed from `webhook:<url>` or `log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyTarget {
    /// Generic HTTP webhook, POSTed a JSON body.
    Webhook { url: String },
    /// Written to the server log only.
    Log,
}

impl NotifyTarget {
    pub fn parse(spec: &str) -> Result<Self, String> {
        let spec = spec.trim();
        if spec.eq_ignore_ascii_case("log") {
            return Ok(NotifyTarget::Log);
        }
        match spec.split_once(':') {
            Some((scheme, url)) if scheme.eq_ignore_ascii_case("webhook") => {
                if url.starts_with("http://") || url.starts_with("https://") {
                    Ok(NotifyTarget::Webhook {
                        url: url.to_string(),
                    })
                } else {
                    Err(format!("webhook target needs an http(s) URL: '{spec}'"))
                }
            }
            _ => Err(format!("unknown notify target '{spec}'")),
        }
    }
}

/// Dispatch a notification to a target.
/// Returns Ok(()) on success, Err(reason) on failure.
pub async fn dispatch(
    client: &reqwest::Client,
    notification: &Notification,
    target: &NotifyTarget,
    timeout: Duration,
) -> Result<(), String> {
    match target {
        NotifyTarget::Webhook { url } => send_webhook(client, url, notification, timeout).await,
        NotifyTarget::Log => {
            tracing::info!("📢 {}: {}", notification.title, notification.body);
            Ok(())
        }
    }
}

/// Send notification via generic HTTP webhook.
async fn send_webhook(
    client: &reqwest::Client,
    url: &str,
    notification: &Notification,
    timeout: Duration,
) -> Result<(), String> {
    let resp = client
        .post(url)
        .json(&serde_json::json!({
            "task_id": notification.task_id,
            "kind": notification.kind,
            "state": notification.state,
            "title": notification.title,
            "body": notification.body,
            "timestamp": notification.timestamp.to_rfc3339(),
        }))
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| format!("Webhook send failed: {e}"))?;

    if resp.status().is_success() {
        tracing::info!("✅ Webhook notification sent to {}: {}", url, notification.title);
        Ok(())
    } else {
        let status = resp.status();
        Err(format!("Webhook error {status}"))
    }
}

/// Dispatch to every target, collecting per-target results.
pub async fn dispatch_all(
    client: &reqwest::Client,
    notification: &Notification,
    targets: &[NotifyTarget],
    timeout: Duration,
) -> Vec<Result<(), String>> {
    let sends = targets
        .iter()
        .map(|target| dispatch(client, notification, target, timeout));
    futures::future::join_all(sends).await
}
