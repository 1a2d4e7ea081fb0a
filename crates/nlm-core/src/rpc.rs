//! RPC interfaces toward remote peers and the local status monitor.
//!
//! The wire codec and dispatcher live elsewhere; the engine only needs
//! to *originate* two kinds of calls: the GRANTED back-call to a peer
//! whose blocking lock finally succeeded, and the five status-monitor
//! procedures. Both are expressed as traits so the transport can be
//! swapped; the channel-backed implementations here are used for
//! development and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use nlm_proto::types::{MonArgs, MonId, SmNotifyArgs, TestArgs};
use nlm_proto::{NetId, NlmStatus, PeerAddr, RpcError, RpcResult};

/// A bound client handle to one peer's NLM service at one version.
#[async_trait]
pub trait NlmHandle: Send + Sync {
    /// Issue the GRANTED back-call for a blocking lock that succeeded.
    async fn granted(&self, args: &TestArgs) -> RpcResult<NlmStatus>;
}

/// Factory for peer NLM handles, resolving the transport binding for a
/// `(netid, address, version)` triple.
#[async_trait]
pub trait PeerRpc: Send + Sync {
    async fn bind(
        &self,
        netid: &NetId,
        addr: &PeerAddr,
        vers: u32,
    ) -> RpcResult<Arc<dyn NlmHandle>>;
}

/// A GRANTED back-call captured by [`ChanRpc`].
#[derive(Debug, Clone)]
pub struct GrantedEvent {
    pub addr: PeerAddr,
    pub vers: u32,
    pub args: TestArgs,
}

/// Loopback peer RPC: back-calls are pushed into an in-process channel
/// instead of a socket. Development and test transport.
pub struct ChanRpc {
    tx: mpsc::UnboundedSender<GrantedEvent>,
}

impl ChanRpc {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GrantedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PeerRpc for ChanRpc {
    async fn bind(
        &self,
        _netid: &NetId,
        addr: &PeerAddr,
        vers: u32,
    ) -> RpcResult<Arc<dyn NlmHandle>> {
        Ok(Arc::new(ChanHandle {
            addr: addr.clone(),
            vers,
            tx: self.tx.clone(),
        }))
    }
}

struct ChanHandle {
    addr: PeerAddr,
    vers: u32,
    tx: mpsc::UnboundedSender<GrantedEvent>,
}

#[async_trait]
impl NlmHandle for ChanHandle {
    async fn granted(&self, args: &TestArgs) -> RpcResult<NlmStatus> {
        debug!("loopback granted call to {}", self.addr);
        self.tx
            .send(GrantedEvent {
                addr: self.addr.clone(),
                vers: self.vers,
                args: args.clone(),
            })
            .map_err(|_| RpcError::Io("granted channel closed".into()))?;
        Ok(NlmStatus::Granted)
    }
}

/// Transport to the local status monitor. One call at a time; the
/// engine's SM client layers the serialization on top.
#[async_trait]
pub trait SmTransport: Send + Sync {
    /// Resolve the monitor's endpoint. Yields
    /// [`RpcError::NotRegistered`] while the monitor has not yet
    /// registered itself with the portmapper.
    async fn bind(&self) -> RpcResult<()>;

    /// Tell the monitor we restarted, so it renotifies our peers.
    async fn simu_crash(&self) -> RpcResult<()>;

    /// Fetch our own state number (the incarnation peers see).
    async fn stat(&self) -> RpcResult<u32>;

    /// Start watching a peer.
    async fn mon(&self, args: &MonArgs) -> RpcResult<()>;

    /// Stop watching a peer.
    async fn unmon(&self, id: &MonId) -> RpcResult<()>;

    /// Stop watching everything we registered.
    async fn unmon_all(&self) -> RpcResult<()>;
}

#[derive(Default)]
struct SmState {
    bound: bool,
    /// Binds left to fail with NotRegistered before succeeding.
    flaky_binds: u32,
    /// Our own state number; bumped by two per simulated crash so it
    /// stays odd ("up") like a real monitor reports.
    our_state: u32,
    monitored: HashMap<String, MonArgs>,
    unmon_calls: u32,
    unmon_all_calls: u32,
}

/// In-process status monitor. Tracks the monitored set and can inject
/// NOTIFY1 callbacks, standing in for the real out-of-process daemon
/// in development and tests.
pub struct LocalStatMon {
    state: Mutex<SmState>,
}

impl LocalStatMon {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SmState {
                our_state: 1,
                ..SmState::default()
            }),
        }
    }

    /// A monitor whose first `fail_binds` bind attempts report
    /// NotRegistered, for exercising startup retry.
    pub fn with_bind_failures(fail_binds: u32) -> Self {
        Self {
            state: Mutex::new(SmState {
                our_state: 1,
                flaky_binds: fail_binds,
                ..SmState::default()
            }),
        }
    }

    /// Names currently monitored.
    pub async fn monitored_names(&self) -> Vec<String> {
        let st = self.state.lock().await;
        let mut names: Vec<String> = st.monitored.keys().cloned().collect();
        names.sort();
        names
    }

    /// The priv cookie registered for a monitored name, as a NOTIFY1
    /// for that peer would carry it.
    pub async fn notify_args_for(&self, mon_name: &str, new_state: u32) -> Option<SmNotifyArgs> {
        let st = self.state.lock().await;
        let args = st.monitored.get(mon_name)?;
        Some(SmNotifyArgs {
            mon_name: mon_name.to_string(),
            state: new_state,
            priv_cookie: args.priv_cookie,
        })
    }

    pub async fn unmon_calls(&self) -> u32 {
        self.state.lock().await.unmon_calls
    }

    pub async fn unmon_all_calls(&self) -> u32 {
        self.state.lock().await.unmon_all_calls
    }
}

impl Default for LocalStatMon {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmTransport for LocalStatMon {
    async fn bind(&self) -> RpcResult<()> {
        let mut st = self.state.lock().await;
        if st.flaky_binds > 0 {
            st.flaky_binds -= 1;
            return Err(RpcError::NotRegistered);
        }
        st.bound = true;
        Ok(())
    }

    async fn simu_crash(&self) -> RpcResult<()> {
        let mut st = self.state.lock().await;
        if !st.bound {
            return Err(RpcError::NotRegistered);
        }
        st.our_state += 2;
        st.monitored.clear();
        Ok(())
    }

    async fn stat(&self) -> RpcResult<u32> {
        let st = self.state.lock().await;
        if !st.bound {
            return Err(RpcError::NotRegistered);
        }
        Ok(st.our_state)
    }

    async fn mon(&self, args: &MonArgs) -> RpcResult<()> {
        let mut st = self.state.lock().await;
        if !st.bound {
            return Err(RpcError::NotRegistered);
        }
        st.monitored.insert(args.mon_name.clone(), args.clone());
        Ok(())
    }

    async fn unmon(&self, id: &MonId) -> RpcResult<()> {
        let mut st = self.state.lock().await;
        if !st.bound {
            return Err(RpcError::NotRegistered);
        }
        st.monitored.remove(&id.mon_name);
        st.unmon_calls += 1;
        Ok(())
    }

    async fn unmon_all(&self) -> RpcResult<()> {
        let mut st = self.state.lock().await;
        if !st.bound {
            return Err(RpcError::NotRegistered);
        }
        st.monitored.clear();
        st.unmon_all_calls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nlm_proto::types::sm_priv_from_sysid;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_chan_rpc_delivers_granted() {
        let (rpc, mut rx) = ChanRpc::new();
        let addr = PeerAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 700);
        let handle = rpc.bind(&NetId::from("tcp"), &addr, 4).await.unwrap();

        let args = TestArgs {
            cookie: vec![1],
            exclusive: true,
            alock: nlm_proto::NlmLock {
                caller_name: "alpha".into(),
                fh: nlm_proto::Fh(vec![2]),
                oh: nlm_proto::Oh(vec![3]),
                svid: 4,
                offset: 5,
                len: 6,
            },
        };
        assert_eq!(handle.granted(&args).await.unwrap(), NlmStatus::Granted);

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.addr, addr);
        assert_eq!(ev.vers, 4);
        assert_eq!(ev.args, args);
    }

    #[tokio::test]
    async fn test_local_statmon_bind_retry_and_mon() {
        let sm = LocalStatMon::with_bind_failures(2);
        assert_eq!(sm.bind().await, Err(RpcError::NotRegistered));
        assert_eq!(sm.bind().await, Err(RpcError::NotRegistered));
        assert_eq!(sm.bind().await, Ok(()));

        let state = sm.stat().await.unwrap();
        assert_eq!(state % 2, 1);

        sm.mon(&MonArgs {
            mon_name: "alpha".into(),
            my_name: "self".into(),
            my_prog: 100_021,
            my_vers: 2,
            my_proc: 17,
            priv_cookie: sm_priv_from_sysid(5),
        })
        .await
        .unwrap();
        assert_eq!(sm.monitored_names().await, vec!["alpha".to_string()]);

        let notify = sm.notify_args_for("alpha", state + 2).await.unwrap();
        assert_eq!(notify.priv_cookie, sm_priv_from_sysid(5));

        sm.unmon_all().await.unwrap();
        assert!(sm.monitored_names().await.is_empty());
        assert_eq!(sm.unmon_all_calls().await, 1);
    }
}
