//! Per-device lock state machines
//!
//! - `machine`: Optimistic open transitions with remote-confirmed and
//!   self-timed convergence policies

pub mod machine;

pub use machine::{LockMachine, LockPolicy, OpenHandle};
