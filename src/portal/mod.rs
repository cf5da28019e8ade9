//! Winker portal integration module
//!
//! - `session`: Credential store and single-flight authentication
//! - `client`: Classified API client (token injection, one-shot auth retry)

pub mod client;
pub mod session;

pub use client::{HttpTransport, PortalClient, PortalTransport};
pub use session::{Credentials, Session};
