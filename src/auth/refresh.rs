// Token refresh exchange

use reqwest::Client;
use std::time::Duration;

use crate::error::RefreshError;
use crate::http_client::RequestExecutor;
use crate::models::{Envelope, RefreshRequest, RefreshedTokens};

/// Performs `POST /auth/refresh` against the platform API
pub struct RefreshClient {
    client: Client,
    url: String,
    timeout: Duration,
}

impl RefreshClient {
    pub fn new(client: Client, url: String, timeout: Duration) -> Self {
        Self {
            client,
            url,
            timeout,
        }
    }

    /// Share the executor's connection pool and base URL
    pub fn from_executor(executor: &RequestExecutor, timeout: Duration) -> Self {
        Self::new(
            executor.client().clone(),
            executor.url_for("/auth/refresh"),
            timeout,
        )
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// Called exactly once per refresh cycle; there is no retry here because
    /// refresh tokens may be single-use.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RefreshError> {
        tracing::info!("Refreshing access token...");

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, url = %self.url, "Failed to send refresh request");
                RefreshError::Transport(e.to_string())
            })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        let envelope = Envelope::parse(&body);

        if !status.is_success() {
            let message = envelope
                .unwrap_or_default()
                .error_message(status.as_u16());
            tracing::error!(
                status = status.as_u16(),
                message = %message,
                "Token refresh rejected"
            );
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let envelope = envelope.map_err(|e| RefreshError::Malformed(e.to_string()))?;
        let tokens: RefreshedTokens = serde_json::from_value(envelope.into_data())
            .map_err(|e| RefreshError::Malformed(e.to_string()))?;

        if tokens.access_token.is_empty() {
            return Err(RefreshError::Malformed(
                "response does not contain access_token".to_string(),
            ));
        }

        tracing::info!(
            refresh_token_returned = tokens.refresh_token.is_some(),
            expires_in = ?tokens.expires_in,
            "Access token refreshed"
        );

        Ok(tokens)
    }
}
