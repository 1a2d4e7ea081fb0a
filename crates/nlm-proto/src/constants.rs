/// NLM and SM protocol constants.

/// RPC program number of the network lock manager.
pub const NLM_PROG: u32 = 100_021;

/// Oldest NLM protocol version we answer for.
pub const NLM_VERS: u32 = 1;
/// NLM version that introduced share reservations.
pub const NLM_VERSX: u32 = 3;
/// NLM version 4 (64-bit offsets, NFSv3).
pub const NLM4_VERS: u32 = 4;
/// Private NLM version the local status monitor calls back on.
pub const NLM_SM_VERS: u32 = 2;
/// Procedure number of the status-change callback (NLM_SM_NOTIFY1).
pub const NLM_SM_NOTIFY1: u32 = 17;

/// RPC program number of the local status monitor.
pub const SM_PROG: u32 = 100_024;
/// Status monitor protocol version.
pub const SM_VERS: u32 = 1;

/// Smallest sysid handed to a remote peer. Sysid 0 is reserved for
/// locks taken by local processes and must never identify a peer.
pub const SYSID_MIN: u32 = 1;

/// Largest sysid the local lock manager can attribute. The value is
/// the sysid mask of the lock-table encoding; ids above it would alias
/// into the cluster-node bits.
pub const SYSID_MAX: u32 = 0x3FFF;

/// Flag OR-ed into a sysid when querying the local lock manager for
/// locks we own as a *client* of the peer, rather than locks the peer
/// owns on our files.
pub const SYSID_CLIENT_FLAG: u32 = 0x4000;

/// Size in bytes of the opaque `priv` cookie registered with the
/// status monitor. We plant our sysid for the peer in it so a NOTIFY1
/// callback can be routed without a name lookup.
pub const SM_PRIV_SIZE: usize = 16;
