use futures_util::future::BoxFuture;
use tracing::debug;

use parley_types::events::PushMessage;

/// External push-notification collaborator. Failures are the caller's to log
/// and swallow — push delivery never blocks or fails a message send.
pub trait PushNotifier: Send + Sync {
    fn notify<'a>(&'a self, message: PushMessage) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Posts push payloads to a configured webhook endpoint.
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookNotifier {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

impl PushNotifier for WebhookNotifier {
    fn notify<'a>(&'a self, message: PushMessage) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.endpoint)
                .json(&message)
                .send()
                .await?;
            response.error_for_status()?;
            Ok(())
        })
    }
}

/// Stand-in when no push endpoint is configured.
pub struct NoopNotifier;

impl PushNotifier for NoopNotifier {
    fn notify<'a>(&'a self, message: PushMessage) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            debug!("push for user {} dropped (no endpoint configured)", message.user_id);
            Ok(())
        })
    }
}
