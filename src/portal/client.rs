//! Winker portal API client
//!
//! Typed boundary over the portal REST API. Owns failure classification and
//! the one-shot re-login after an auth rejection; request construction lives
//! in the `HttpTransport` adapter.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::PortalError;
use crate::models::{DeviceState, LoginResponse, PortalInfo, RemoteDevice};
use crate::portal::session::Session;

/// Raw portal calls, classified. Implemented over HTTP in production and by
/// fixtures in tests.
#[async_trait]
pub trait PortalTransport: Send + Sync {
    async fn login(
        &self,
        username: &str,
        password: &str,
        key: &str,
    ) -> Result<LoginResponse, PortalError>;

    async fn change_portal(&self, token: &str, id_portal: i64) -> Result<PortalInfo, PortalError>;

    async fn list_devices(
        &self,
        token: &str,
        id_portal: i64,
    ) -> Result<Vec<RemoteDevice>, PortalError>;

    async fn set_device_state(
        &self,
        token: &str,
        id_portal: i64,
        device_id: &str,
        state: DeviceState,
    ) -> Result<(), PortalError>;
}

/// Portal client bound to one session.
pub struct PortalClient {
    transport: Arc<dyn PortalTransport>,
    session: Session,
}

impl PortalClient {
    pub fn new(transport: Arc<dyn PortalTransport>, session: Session) -> Self {
        Self { transport, session }
    }

    /// Fetch all devices for the configured portal.
    pub async fn list_devices(&self) -> Result<Vec<RemoteDevice>, PortalError> {
        let transport = Arc::clone(&self.transport);
        let id_portal = self.session.portal();
        self.with_token(move |token| {
            let transport = Arc::clone(&transport);
            async move { transport.list_devices(&token, id_portal).await }
        })
        .await
    }

    /// Command a device into the given state.
    pub async fn set_device_state(
        &self,
        device_id: &str,
        state: DeviceState,
    ) -> Result<(), PortalError> {
        tracing::debug!(
            "[Portal] Updating remote state of {} to {:?}",
            device_id,
            state
        );
        let transport = Arc::clone(&self.transport);
        let id_portal = self.session.portal();
        let device_id = device_id.to_string();
        self.with_token(move |token| {
            let transport = Arc::clone(&transport);
            let device_id = device_id.clone();
            async move {
                transport
                    .set_device_state(&token, id_portal, &device_id, state)
                    .await
            }
        })
        .await
    }

    /// Run a data call with a session token. On an auth rejection the session
    /// is reset and the call retried exactly once; a second rejection
    /// surfaces.
    async fn with_token<T, F, Fut>(&self, call: F) -> Result<T, PortalError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, PortalError>>,
    {
        let token = self.session.token(self.transport.as_ref()).await?;
        match call(token).await {
            Err(PortalError::Auth(reason)) => {
                tracing::warn!("[Portal] Auth rejected ({}), logging in again", reason);
                self.session.reset().await;
                let token = self.session.token(self.transport.as_ref()).await?;
                call(token).await
            }
            result => result,
        }
    }
}

// ============================================================================
// HTTP transport
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChangePortalResponse {
    portal: PortalInfo,
}

/// HTTP adapter for the production portal.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self, PortalError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, PortalError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PortalError::from_status(status.as_u16(), &body));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl PortalTransport for HttpTransport {
    async fn login(
        &self,
        username: &str,
        password: &str,
        key: &str,
    ) -> Result<LoginResponse, PortalError> {
        let url = self.url("auth/login");
        let body = serde_json::json!({
            "username": username,
            "password": password,
            "key": key,
        });
        tracing::debug!("[Portal] POST {} {}", url, redact(&body));

        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PortalError::Auth(format!(
                "login failed with status {}: {}",
                status.as_u16(),
                body
            )));
        }
        Ok(response.json().await?)
    }

    async fn change_portal(&self, token: &str, id_portal: i64) -> Result<PortalInfo, PortalError> {
        let url = self.url("me/change-portal");
        tracing::debug!("[Portal] POST {} id_portal={}", url, id_portal);

        let response = self
            .http
            .post(&url)
            .header("Authorization", token)
            .json(&serde_json::json!({ "id_portal": id_portal }))
            .send()
            .await?;
        Self::read_json::<ChangePortalResponse>(response)
            .await
            .map(|body| body.portal)
    }

    async fn list_devices(
        &self,
        token: &str,
        id_portal: i64,
    ) -> Result<Vec<RemoteDevice>, PortalError> {
        let url = self.url("access-control/user/devices");
        tracing::debug!("[Portal] GET {} id_portal={}", url, id_portal);

        let response = self
            .http
            .get(&url)
            .header("Authorization", token)
            .query(&[("id_portal", id_portal)])
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn set_device_state(
        &self,
        token: &str,
        id_portal: i64,
        device_id: &str,
        state: DeviceState,
    ) -> Result<(), PortalError> {
        let url = self.url("access-control/user/device/open");
        let body = serde_json::json!({
            "id_portal": id_portal,
            "device": {
                "id_device": device_id,
                "state": state,
            },
        });
        tracing::debug!("[Portal] POST {} {}", url, redact(&body));

        let response = self
            .http
            .post(&url)
            .header("Authorization", token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PortalError::from_status(status.as_u16(), &body));
        }
        Ok(())
    }
}

/// Mask values of credential-looking keys before they reach the debug log.
fn redact(value: &serde_json::Value) -> serde_json::Value {
    const SENSITIVE: [&str; 4] = ["password", "key", "token", "secret"];

    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(key, val)| {
                    let lower = key.to_lowercase();
                    if SENSITIVE.iter().any(|needle| lower.contains(needle)) {
                        (
                            key.clone(),
                            serde_json::Value::String("************".to_string()),
                        )
                    } else {
                        (key.clone(), redact(val))
                    }
                })
                .collect(),
        ),
        other => other.clone(),
    }
}
