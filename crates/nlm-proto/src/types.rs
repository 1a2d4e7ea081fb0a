/// Peer identity and NLM wire types.
///
/// The request/response structs here are what the RPC dispatcher hands
/// the service handlers after XDR decoding; the exact bit layout on the
/// wire is the codec's business, not ours.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;

use crate::constants::SM_PRIV_SIZE;

/// Transport family label a peer reached us over ("tcp", "udp",
/// "tcp6", "udp6", or "loopback" for the status monitor).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetId(String);

impl NetId {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Network address of a remote peer.
///
/// The port is carried for RPC binding but is explicitly *not* part of
/// the peer's identity: a client that reconnects from an ephemeral
/// port is still the same peer. [`PeerAddr::identity_cmp`] therefore
/// orders by address family and raw address octets only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Order two peer addresses for the host registry: address family
    /// first, then raw address octets. The port never participates.
    pub fn identity_cmp(&self, other: &Self) -> Ordering {
        match (&self.ip, &other.ip) {
            (IpAddr::V4(a), IpAddr::V4(b)) => a.octets().cmp(&b.octets()),
            (IpAddr::V6(a), IpAddr::V6(b)) => a.octets().cmp(&b.octets()),
            (IpAddr::V4(_), IpAddr::V6(_)) => Ordering::Less,
            (IpAddr::V6(_), IpAddr::V4(_)) => Ordering::Greater,
        }
    }

    /// Whether two addresses name the same peer (port ignored).
    pub fn identity_eq(&self, other: &Self) -> bool {
        self.identity_cmp(other) == Ordering::Equal
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Opaque NFS file handle bytes, as sent by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fh(pub Vec<u8>);

impl Fh {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Opaque lock-owner handle bytes. Servers echo these back verbatim;
/// our own client side plants an encoded [`OwnerHandle`] in them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Oh(pub Vec<u8>);

/// What our client side stores in the lock-owner handle of an
/// outgoing blocking lock request: the sysid we allocated for the
/// server. A GRANTED back-call carries the handle back, letting us
/// find the host without an address lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerHandle {
    pub sysid: u32,
}

impl OwnerHandle {
    pub fn encode(&self) -> Oh {
        // Infallible for a two-field POD.
        Oh(bincode::serialize(self).expect("owner handle encode"))
    }

    pub fn decode(oh: &Oh) -> Option<Self> {
        bincode::deserialize(&oh.0).ok()
    }
}

/// Build the opaque `priv` cookie registered with the status monitor
/// for a peer: the sysid in the leading bytes, zero padded.
pub fn sm_priv_from_sysid(sysid: u32) -> [u8; SM_PRIV_SIZE] {
    let mut cookie = [0u8; SM_PRIV_SIZE];
    cookie[..4].copy_from_slice(&sysid.to_le_bytes());
    cookie
}

/// Recover the sysid from a NOTIFY1 `priv` cookie.
pub fn sysid_from_sm_priv(cookie: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = cookie.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// A byte-range lock as it appears in NLM arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NlmLock {
    /// Hostname the peer calls itself.
    pub caller_name: String,
    /// File handle of the target file.
    pub fh: Fh,
    /// Opaque lock-owner handle.
    pub oh: Oh,
    /// Process id of the lock owner on the peer.
    pub svid: u32,
    /// Byte offset of the locked range.
    pub offset: u64,
    /// Length of the range; 0 means to end of file.
    pub len: u64,
}

/// The conflicting holder returned by a denied TEST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NlmHolder {
    pub exclusive: bool,
    pub svid: u32,
    pub oh: Oh,
    pub offset: u64,
    pub len: u64,
}

/// File-open access requested with a share reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareAccess {
    None,
    Read,
    Write,
    ReadWrite,
}

impl ShareAccess {
    /// Bit encoding used for conflict arithmetic: read=1, write=2.
    pub fn bits(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Read => 1,
            Self::Write => 2,
            Self::ReadWrite => 3,
        }
    }
}

/// Deny mode requested with a share reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareMode {
    DenyNone,
    DenyRead,
    DenyWrite,
    DenyReadWrite,
}

impl ShareMode {
    pub fn bits(self) -> u8 {
        match self {
            Self::DenyNone => 0,
            Self::DenyRead => 1,
            Self::DenyWrite => 2,
            Self::DenyReadWrite => 3,
        }
    }
}

/// A DOS-style share reservation as it appears in NLM arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NlmShare {
    pub caller_name: String,
    pub fh: Fh,
    pub oh: Oh,
    pub mode: ShareMode,
    pub access: ShareAccess,
}

// ─── Decoded request/response structs ───────────────────────────────────────

/// NLM_TEST arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestArgs {
    pub cookie: Vec<u8>,
    pub exclusive: bool,
    pub alock: NlmLock,
}

/// NLM_TEST result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRes {
    pub cookie: Vec<u8>,
    pub stat: crate::error::NlmStatus,
    /// Filled in when `stat` is `Denied`.
    pub holder: Option<NlmHolder>,
}

/// NLM_LOCK arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockArgs {
    pub cookie: Vec<u8>,
    /// Whether the caller is willing to wait for a grant callback.
    pub block: bool,
    pub exclusive: bool,
    pub alock: NlmLock,
    /// Set when the peer is re-asserting a lock it held before we
    /// restarted; exempts the request from grace-period gating.
    pub reclaim: bool,
    /// The peer's view of its own SM state number.
    pub state: u32,
}

/// Generic status reply (LOCK, CANCEL, UNLOCK, GRANTED).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NlmRes {
    pub cookie: Vec<u8>,
    pub stat: crate::error::NlmStatus,
}

/// NLM_CANCEL arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelArgs {
    pub cookie: Vec<u8>,
    pub block: bool,
    pub exclusive: bool,
    pub alock: NlmLock,
}

/// NLM_UNLOCK arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockArgs {
    pub cookie: Vec<u8>,
    pub alock: NlmLock,
}

/// NLM_SHARE / NLM_UNSHARE arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareArgs {
    pub cookie: Vec<u8>,
    pub share: NlmShare,
    pub reclaim: bool,
}

/// NLM_SHARE / NLM_UNSHARE result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRes {
    pub cookie: Vec<u8>,
    pub stat: crate::error::NlmStatus,
    pub sequence: u32,
}

/// NLM_FREE_ALL arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyArgs {
    pub name: String,
    pub state: u32,
}

/// NLM_SM_NOTIFY1 callback arguments from the local status monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmNotifyArgs {
    pub mon_name: String,
    pub state: u32,
    pub priv_cookie: [u8; SM_PRIV_SIZE],
}

// ─── Status monitor call arguments ──────────────────────────────────────────

/// SM_MON arguments: who to watch and how to call us back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonArgs {
    pub mon_name: String,
    pub my_name: String,
    pub my_prog: u32,
    pub my_vers: u32,
    pub my_proc: u32,
    pub priv_cookie: [u8; SM_PRIV_SIZE],
}

/// SM_UNMON arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonId {
    pub mon_name: String,
    pub my_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_peer_addr_identity_ignores_port() {
        let a = PeerAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 2001);
        let b = PeerAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 2002);
        assert!(a.identity_eq(&b));
        assert_eq!(a.identity_cmp(&b), Ordering::Equal);
    }

    #[test]
    fn test_peer_addr_identity_orders_family_first() {
        let v4 = PeerAddr::new(IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255)), 1);
        let v6 = PeerAddr::new("::1".parse().unwrap(), 1);
        assert_eq!(v4.identity_cmp(&v6), Ordering::Less);
        assert_eq!(v6.identity_cmp(&v4), Ordering::Greater);
    }

    #[test]
    fn test_owner_handle_roundtrip() {
        let oh = OwnerHandle { sysid: 0x2A7 }.encode();
        assert_eq!(OwnerHandle::decode(&oh), Some(OwnerHandle { sysid: 0x2A7 }));
        assert_eq!(OwnerHandle::decode(&Oh(vec![1])), None);
    }

    #[test]
    fn test_sm_priv_roundtrip() {
        let cookie = sm_priv_from_sysid(913);
        assert_eq!(sysid_from_sm_priv(&cookie), Some(913));
        assert_eq!(sysid_from_sm_priv(&[0u8; 2]), None);
    }
}
