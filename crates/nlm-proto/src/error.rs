/// NLM status codes and transport errors.
///
/// `NlmStatus` carries the full NLM version 4 status set. Version 1-3
/// peers do not know the statuses past `DeniedGracePeriod`; responders
/// speaking the old versions map them down with [`NlmStatus::downgrade`].

use serde::{Deserialize, Serialize};

/// Protocol-visible result of an NLM operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum NlmStatus {
    #[error("granted")]
    Granted,
    #[error("denied")]
    Denied,
    #[error("denied, no locks available")]
    DeniedNolocks,
    #[error("blocked, grant callback will follow")]
    Blocked,
    #[error("denied, server in grace period")]
    DeniedGracePeriod,
    #[error("denied, deadlock detected")]
    Deadlock,
    #[error("read-only file system")]
    RoFs,
    #[error("stale file handle")]
    StaleFh,
    #[error("offset or length too big")]
    FBig,
    #[error("request failed")]
    Failed,
}

impl NlmStatus {
    /// Convert from the wire status code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Granted),
            1 => Some(Self::Denied),
            2 => Some(Self::DeniedNolocks),
            3 => Some(Self::Blocked),
            4 => Some(Self::DeniedGracePeriod),
            5 => Some(Self::Deadlock),
            6 => Some(Self::RoFs),
            7 => Some(Self::StaleFh),
            8 => Some(Self::FBig),
            9 => Some(Self::Failed),
            _ => None,
        }
    }

    /// Convert to the wire status code.
    pub fn to_code(self) -> u32 {
        match self {
            Self::Granted => 0,
            Self::Denied => 1,
            Self::DeniedNolocks => 2,
            Self::Blocked => 3,
            Self::DeniedGracePeriod => 4,
            Self::Deadlock => 5,
            Self::RoFs => 6,
            Self::StaleFh => 7,
            Self::FBig => 8,
            Self::Failed => 9,
        }
    }

    /// Map a version 4 status to the closest status an NLM v1-v3 peer
    /// understands.
    pub fn downgrade(self) -> Self {
        match self {
            Self::Deadlock | Self::RoFs | Self::StaleFh | Self::FBig | Self::Failed => {
                Self::Denied
            }
            other => other,
        }
    }

    /// Whether the operation succeeded.
    pub fn is_granted(self) -> bool {
        self == Self::Granted
    }
}

/// Transport-level failure of an RPC call (to the status monitor or to
/// a peer's NLM service).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// The target program is not registered with the portmapper yet.
    #[error("program not registered")]
    NotRegistered,
    /// The call timed out.
    #[error("rpc timed out")]
    Timeout,
    /// The target answered but does not serve the requested program
    /// or version.
    #[error("program unavailable")]
    ProgUnavail,
    /// Connection or framing failure.
    #[error("rpc transport error: {0}")]
    Io(String),
}

/// Result type alias for RPC calls made by the lock manager.
pub type RpcResult<T> = Result<T, RpcError>;
