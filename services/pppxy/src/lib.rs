//! pppxy: TCP relay that prepends a PROXY protocol header.
//!
//! Each configured relay listens on one address, dials a fixed backend for
//! every accepted client, sends a PROXY v1 or v2 header describing the
//! client, then copies bytes in both directions until both sides are done.

pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;

pub use config::{Config, ProxyConfig};
pub use error::{PppxyError, Result};
pub use proxy::{InstanceGroup, ProtocolVersion, ProxyHeader, ProxyInstance};
