//! # nlm-core
//!
//! Collaborator interfaces the lock-manager engine drives: the local
//! byte-range lock manager, share reservations, file-handle
//! resolution, and the RPC surfaces toward peers and the status
//! monitor. Each interface ships with an in-process implementation
//! used for development and tests.

pub mod flock;
pub mod fs;
pub mod rpc;
pub mod share;
