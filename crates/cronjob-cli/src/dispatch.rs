//! Dispatchers owned by the binary: HTTP webhook and log-only.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::info;

use cronjob_core::{DispatchError, TaskDispatcher};
use cronjob_types::{DispatchedCommand, TaskOptions};

/// POSTs each command as a JSON [`DispatchedCommand`].
pub struct WebhookDispatcher {
    client: Client,
    url: String,
    auth_token: Option<String>,
}

impl WebhookDispatcher {
    pub fn new(url: &str, auth_token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            auth_token,
        })
    }
}

#[async_trait]
impl TaskDispatcher for WebhookDispatcher {
    async fn dispatch(&self, command: &str, options: &TaskOptions) -> Result<(), DispatchError> {
        let failed = |reason: String| DispatchError::Failed {
            command: command.to_string(),
            reason,
        };

        let payload = DispatchedCommand {
            command: command.to_string(),
            options: options.clone(),
        };
        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(failed(format!("webhook answered {}", response.status())));
        }
        Ok(())
    }
}

/// Logs each command and does nothing else.
pub struct LogDispatcher;

#[async_trait]
impl TaskDispatcher for LogDispatcher {
    async fn dispatch(&self, command: &str, options: &TaskOptions) -> Result<(), DispatchError> {
        let options = serde_json::to_string(options).unwrap_or_default();
        info!(command = %command, options = %options, "Scheduled command due");
        Ok(())
    }
}
