//! Accessory layer boundary
//!
//! The engine does not own the accessory/characteristic object model. It
//! feeds one through these traits: a registry keyed by stable device
//! identity, and a notification channel for lock state changes. `LogBridge`
//! is the built-in stand-in used when no real accessory backend is wired in.

use uuid::Uuid;

use crate::models::{DeviceDescriptor, LockState};

/// Registry of accessories keyed by stable device identity.
pub trait AccessoryRegistry: Send + Sync {
    fn device_registered(&self, descriptor: &DeviceDescriptor);
    fn device_updated(&self, descriptor: &DeviceDescriptor);
    fn device_removed(&self, identity: Uuid, display_name: &str);
}

/// Outward notification channel for per-device lock state changes.
pub trait StateSink: Send + Sync {
    fn current_state_changed(&self, identity: Uuid, state: LockState);
    fn target_state_changed(&self, identity: Uuid, state: LockState);
}

/// Logging-only accessory bridge.
pub struct LogBridge;

impl AccessoryRegistry for LogBridge {
    fn device_registered(&self, descriptor: &DeviceDescriptor) {
        tracing::info!(
            "[Accessory] Registered \"{}\" ({}, serial {})",
            descriptor.display_name,
            descriptor.model,
            descriptor.serial_number
        );
    }

    fn device_updated(&self, descriptor: &DeviceDescriptor) {
        tracing::debug!("[Accessory] Updated \"{}\"", descriptor.display_name);
    }

    fn device_removed(&self, identity: Uuid, display_name: &str) {
        tracing::info!("[Accessory] Removed \"{}\" ({})", display_name, identity);
    }
}

impl StateSink for LogBridge {
    fn current_state_changed(&self, identity: Uuid, state: LockState) {
        tracing::debug!("[Accessory] {} current state -> {:?}", identity, state);
    }

    fn target_state_changed(&self, identity: Uuid, state: LockState) {
        tracing::debug!("[Accessory] {} target state -> {:?}", identity, state);
    }
}
