//! Error handling module

use thiserror::Error;

/// Classified failure from the Winker portal.
///
/// The classification drives the retry policy: `Throttle` is absorbed by the
/// sync layer, `Auth` triggers exactly one re-login, `Transport` surfaces to
/// the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortalError {
    #[error("portal rate limit hit")]
    Throttle,

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl PortalError {
    /// Classify a non-success HTTP status from a data endpoint.
    ///
    /// The portal signals rate limiting with a plain 400.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            400 | 429 => PortalError::Throttle,
            401 | 403 => PortalError::Auth(format!("status {}: {}", status, body)),
            _ => PortalError::Transport(format!("status {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for PortalError {
    fn from(err: reqwest::Error) -> Self {
        PortalError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_statuses() {
        assert_eq!(PortalError::from_status(400, ""), PortalError::Throttle);
        assert_eq!(PortalError::from_status(429, ""), PortalError::Throttle);
    }

    #[test]
    fn test_auth_statuses() {
        assert!(matches!(
            PortalError::from_status(401, "expired"),
            PortalError::Auth(_)
        ));
        assert!(matches!(
            PortalError::from_status(403, ""),
            PortalError::Auth(_)
        ));
    }

    #[test]
    fn test_other_statuses_are_transport() {
        assert!(matches!(
            PortalError::from_status(500, "boom"),
            PortalError::Transport(_)
        ));
        assert!(matches!(
            PortalError::from_status(502, ""),
            PortalError::Transport(_)
        ));
    }
}
