//! Synchronization engine
//!
//! - `registry`: Tracked-device registry, discovery and refresh passes
//! - `scheduler`: Adaptive polling cadence with bounded fast windows

pub mod registry;
pub mod scheduler;

pub use registry::{DeviceRegistry, TrackedDevice};
pub use scheduler::{PollScheduler, SchedulerDriver, WindowHandle, DEFAULT_CHECK_FREQUENCY};
