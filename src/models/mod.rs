//! Data models for doorsync

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Wire Models (portal API)
// ============================================================================

/// Device state as reported (and accepted) by the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceState {
    Open,
    Closed,
    /// Anything the portal reports outside OPEN/CLOSED.
    #[serde(other)]
    Other,
}

/// Device snapshot returned by the portal. Replaced wholesale on every poll,
/// never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteDevice {
    #[serde(rename = "id_device")]
    pub id: String,
    #[serde(rename = "name_device")]
    pub name: String,
    pub state: DeviceState,
    pub event: String,
    pub version: String,
}

/// Login response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub id_user: i64,
}

/// Unit/user pair the account is responsible for on a portal.
#[derive(Debug, Clone, Deserialize)]
pub struct UnitWithResponsible {
    pub id_user_unit: i64,
    pub id_user: i64,
}

/// Portal metadata returned by the portal-selection call.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalInfo {
    pub name: String,
    #[serde(default)]
    pub units_with_user_responsible: Vec<UnitWithResponsible>,
}

// ============================================================================
// Lock Models
// ============================================================================

/// Lock state exposed to the accessory layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unsecured,
    Secured,
    Jammed,
    Unknown,
}

impl LockState {
    /// Map the remote wire state. `Jammed` is never produced here; it is part
    /// of the outward domain for accessories that report it.
    pub fn from_remote(state: DeviceState) -> Self {
        match state {
            DeviceState::Closed => LockState::Secured,
            DeviceState::Open => LockState::Unsecured,
            DeviceState::Other => LockState::Unknown,
        }
    }
}

/// Accessory-facing description of a tracked device.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub identity: Uuid,
    pub device_id: String,
    pub display_name: String,
    pub model: String,
    pub serial_number: String,
}

// ============================================================================
// Device Identity
// ============================================================================

/// Identity derivation, pure `seed -> Uuid`. Injected so tests can supply
/// deterministic ids.
pub type IdentityFn = Arc<dyn Fn(&str) -> Uuid + Send + Sync>;

/// Production identity: name-based UUID over the device serial string,
/// reproducible across restarts.
pub fn default_identity() -> IdentityFn {
    Arc::new(|seed| Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes()))
}

/// Serial-number string for a portal device, also used as the identity seed.
pub fn serial_number(device_id: &str) -> String {
    format!("winker-{}", device_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_state_mapping() {
        assert_eq!(LockState::from_remote(DeviceState::Closed), LockState::Secured);
        assert_eq!(LockState::from_remote(DeviceState::Open), LockState::Unsecured);
        assert_eq!(LockState::from_remote(DeviceState::Other), LockState::Unknown);
    }

    #[test]
    fn test_device_state_wire_format() {
        assert_eq!(serde_json::to_string(&DeviceState::Open).unwrap(), "\"OPEN\"");
        assert_eq!(serde_json::to_string(&DeviceState::Closed).unwrap(), "\"CLOSED\"");

        let open: DeviceState = serde_json::from_str("\"OPEN\"").unwrap();
        assert_eq!(open, DeviceState::Open);
    }

    #[test]
    fn test_unknown_wire_state_is_tolerated() {
        let device: RemoteDevice = serde_json::from_str(
            r#"{
                "id_device": "d1",
                "name_device": "Front door",
                "state": "JAMMED",
                "event": "EVENT",
                "version": "1.2.5"
            }"#,
        )
        .unwrap();
        assert_eq!(device.state, DeviceState::Other);
        assert_eq!(LockState::from_remote(device.state), LockState::Unknown);
    }

    #[test]
    fn test_identity_is_deterministic() {
        let identity = default_identity();
        let a = identity(&serial_number("nature-8"));
        let b = identity(&serial_number("nature-8"));
        assert_eq!(a, b);
        assert_ne!(a, identity(&serial_number("nature-9")));
    }
}
