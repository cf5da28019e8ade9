//! Portal session: credentials, cached token, single-flight login

use tokio::sync::Mutex;

use crate::error::PortalError;
use crate::portal::client::PortalTransport;

/// Login credentials for one portal account.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub client_key: String,
    pub portal: i64,
}

#[derive(Debug, Default)]
struct SessionState {
    token: Option<String>,
    user_id: Option<i64>,
    unit_ids: Vec<i64>,
    responsible_user_ids: Vec<i64>,
}

/// Authenticated session for one portal account.
///
/// The state lock is held across the login round-trips, so callers that
/// arrive while a login is in flight await that login instead of starting a
/// second one.
pub struct Session {
    credentials: Credentials,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn portal(&self) -> i64 {
        self.credentials.portal
    }

    /// Return the cached token, logging in first if there is none.
    ///
    /// A complete login is the login call followed by the portal-selection
    /// call; the token is only cached once both have succeeded.
    pub async fn token(&self, transport: &dyn PortalTransport) -> Result<String, PortalError> {
        let mut state = self.state.lock().await;
        if let Some(token) = &state.token {
            return Ok(token.clone());
        }

        let login = transport
            .login(
                &self.credentials.username,
                &self.credentials.password,
                &self.credentials.client_key,
            )
            .await?;

        let portal = transport
            .change_portal(&login.token, self.credentials.portal)
            .await?;

        state.token = Some(login.token.clone());
        state.user_id = Some(login.id_user);
        state.unit_ids = portal
            .units_with_user_responsible
            .iter()
            .map(|unit| unit.id_user_unit)
            .collect();
        state.responsible_user_ids = portal
            .units_with_user_responsible
            .iter()
            .map(|unit| unit.id_user)
            .collect();

        tracing::info!(
            "[Session] Authenticated as {} on portal {}",
            self.credentials.username,
            portal.name
        );

        Ok(login.token)
    }

    /// Drop the cached token and derived metadata. The next `token()` call
    /// logs in again.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        *state = SessionState::default();
    }

    /// Unit ids the account is responsible for, per the last login.
    pub async fn unit_ids(&self) -> Vec<i64> {
        self.state.lock().await.unit_ids.clone()
    }

    /// Authenticated user id, per the last login.
    pub async fn user_id(&self) -> Option<i64> {
        self.state.lock().await.user_id
    }
}
