//! PROXY protocol relay.
//!
//! This module provides:
//! - PROXY protocol v1/v2 header encoding
//! - Bidirectional relaying with half-close propagation
//! - Per-address proxy instances and the group that supervises them
//!
//! ## Architecture
//!
//! ```text
//! Client -> ProxyInstance (accept) -> dial backend -> PROXY header -> relay
//!                                                                      |
//!                                                    Client <-> Backend (both directions)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use pppxy::proxy::{InstanceGroup, ProtocolVersion};
//! use pppxy::config::ProxyConfig;
//!
//! let mut group = InstanceGroup::new(vec![ProxyConfig::new(
//!     ":8080",
//!     "backend.internal:80",
//!     ProtocolVersion::V2,
//! )]);
//! group.start().await;
//! // ...
//! group.shutdown().await;
//! ```

mod classify;
mod connection;
mod group;
mod listener;
mod proxy_protocol;
mod relay;

pub use classify::{classify, ErrorClass, IoOp};
pub use group::{InstanceFailure, InstanceGroup};
pub use listener::{InstanceStats, ProxyInstance, ACCEPT_ERROR_PAUSE};
pub use proxy_protocol::{AddressPair, ProtocolVersion, ProxyHeader};
pub use relay::{relay, CloseWrite, Direction, HalfClose, RelayError, RelayResult};
