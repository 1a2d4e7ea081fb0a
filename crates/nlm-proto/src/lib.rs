//! # nlm-proto
//!
//! Protocol types, status codes, and constants for the network lock
//! manager. This crate defines the decoded request and response
//! structs the service handlers operate on, the peer identity types,
//! and the status-monitor call arguments shared by all components.

pub mod constants;
pub mod defaults;
pub mod error;
pub mod types;

// Re-export commonly used types at the crate root
pub use error::{NlmStatus, RpcError, RpcResult};
pub use types::{Fh, NetId, NlmLock, NlmShare, Oh, OwnerHandle, PeerAddr};
