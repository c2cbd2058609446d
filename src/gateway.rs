// Authenticated gateway
// Attaches the session's access token, refreshes once on 401, retries once

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::auth::{RefreshClient, RefreshCoordinator};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::http_client::{RawResponse, RequestDescriptor, RequestExecutor};
use crate::models::Envelope;
use crate::session::{Session, SessionEvent, SessionInvalidator, SessionStore};

/// Entry point for every call the presentation layer makes to the platform API
#[derive(Clone)]
pub struct Gateway {
    store: Arc<dyn SessionStore>,
    executor: Arc<RequestExecutor>,
    coordinator: Arc<RefreshCoordinator>,
    invalidator: Arc<SessionInvalidator>,
}

impl Gateway {
    pub fn new(
        store: Arc<dyn SessionStore>,
        executor: RequestExecutor,
        refresh_timeout: Duration,
    ) -> Self {
        let invalidator = Arc::new(SessionInvalidator::new(store.clone()));
        let refresher = RefreshClient::from_executor(&executor, refresh_timeout);
        let coordinator = RefreshCoordinator::new(store.clone(), invalidator.clone(), refresher);

        Self {
            store,
            executor: Arc::new(executor),
            coordinator,
            invalidator,
        }
    }

    /// Build a gateway from loaded configuration
    pub fn from_config(config: &Config, store: Arc<dyn SessionStore>) -> anyhow::Result<Self> {
        let executor = RequestExecutor::new(
            &config.api_base_url,
            config.http_max_connections,
            Duration::from_secs(config.http_connect_timeout),
        )?;
        Ok(Self::new(
            store,
            executor,
            Duration::from_millis(config.refresh_timeout_ms),
        ))
    }

    /// Issue an authenticated request and decode the envelope's `data` into `T`.
    ///
    /// A 401 triggers at most one refresh and one retry. A retry that is
    /// still unauthorized ends the session instead of refreshing again.
    pub async fn request<T: DeserializeOwned>(&self, descriptor: RequestDescriptor) -> Result<T> {
        let session = self.store.get()?.ok_or(GatewayError::NotAuthenticated)?;

        let first = self.executor.send(&descriptor, &session.access_token).await?;
        if !first.is_unauthorized() {
            return classify(&descriptor, first);
        }

        tracing::warn!(
            method = %descriptor.method,
            path = %descriptor.path,
            "Received 401, refreshing access token"
        );

        let wait = self.coordinator.fresh_token(&session.access_token);
        let token = match tokio::time::timeout(descriptor.timeout, wait).await {
            Ok(Ok(token)) => token,
            Ok(Err(e)) => {
                tracing::error!(error = %e, path = %descriptor.path, "Token refresh failed");
                self.invalidate(&session.access_token, &e.to_string());
                return Err(GatewayError::SessionExpired);
            }
            Err(_) => {
                let after_ms = descriptor.timeout.as_millis() as u64;
                tracing::warn!(
                    path = %descriptor.path,
                    after_ms = after_ms,
                    "Gave up waiting for token refresh"
                );
                return Err(GatewayError::Timeout { after_ms });
            }
        };

        let retried = self.executor.send(&descriptor, &token).await?;
        if retried.is_unauthorized() {
            tracing::error!(
                path = %descriptor.path,
                "Request still unauthorized after token refresh"
            );
            // A newer session installed meanwhile survives this rejection
            self.invalidate(&token, "request unauthorized after refresh");
            return Err(GatewayError::SessionExpired);
        }

        classify(&descriptor, retried)
    }

    /// `request` with an untyped JSON payload
    pub async fn request_json(&self, descriptor: RequestDescriptor) -> Result<Value> {
        self.request(descriptor).await
    }

    /// Current session, if any
    pub fn session(&self) -> Result<Option<Session>> {
        Ok(self.store.get()?)
    }

    pub fn tenant_id(&self) -> Result<Option<String>> {
        Ok(self.store.get()?.and_then(|s| s.tenant_id))
    }

    /// Install a session issued outside the gateway (login, import)
    pub fn sign_in(&self, session: Session) -> Result<()> {
        tracing::info!(tenant_id = ?session.tenant_id, "Session installed");
        self.store.set(&session)?;
        Ok(())
    }

    /// Explicit logout; returns whether a session was removed
    pub fn sign_out(&self) -> Result<bool> {
        Ok(self.invalidator.sign_out()?)
    }

    /// Session events for the presentation layer (redirect to login)
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.invalidator.subscribe()
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    fn invalidate(&self, rejected_token: &str, reason: &str) {
        if let Err(e) = self.invalidator.invalidate(rejected_token, reason) {
            tracing::error!(error = %e, "Failed to clear session");
        }
    }
}

/// Turn a non-401 response into the caller's payload or a typed failure
fn classify<T: DeserializeOwned>(descriptor: &RequestDescriptor, response: RawResponse) -> Result<T> {
    let envelope = Envelope::parse(&response.body);

    if !response.is_success() {
        let message = envelope
            .unwrap_or_default()
            .error_message(response.status);
        tracing::warn!(
            status = response.status,
            path = %descriptor.path,
            message = %message,
            "Request failed"
        );
        return Err(GatewayError::RequestFailed {
            status: response.status,
            message,
        });
    }

    let envelope = envelope
        .map_err(|e| GatewayError::InvalidResponse(format!("response body is not JSON: {}", e)))?;

    serde_json::from_value(envelope.into_data())
        .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
}
