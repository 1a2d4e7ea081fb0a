//! Remote peer tracking.
//!
//! Every peer we talk to, as server or client, gets a host entry with
//! a unique sysid. The registry indexes hosts two ways: an ordered map
//! keyed by (address, netid, name) for request routing, and a sysid
//! map for NOTIFY1 and GRANTED routing. Hosts are reference counted;
//! an unreferenced host sits on the idle list, ordered by deadline,
//! until the garbage collector decides nothing keeps it alive.
//!
//! Locking: the registry lock is always taken before any host mutex,
//! never the other way around. Paths that need both drop the registry
//! lock first and revalidate afterwards.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use nlm_core::flock::LockManager;
use nlm_core::share::ShareManager;
use nlm_proto::constants::{NLM_PROG, NLM_SM_NOTIFY1, NLM_SM_VERS};
use nlm_proto::types::{sm_priv_from_sysid, MonArgs, MonId};
use nlm_proto::{NetId, PeerAddr};

use crate::daemon::{Globals, RunStatus};
use crate::rpc_cache::RpcCache;
use crate::sysid::SysidPool;
use crate::vhold::VholdTable;

/// Registry key. Ordering matches peer identity: address family and
/// octets first (port ignored), then netid, then caller name, so all
/// entries for one transport endpoint are adjacent.
#[derive(Debug, Clone)]
pub(crate) struct HostKey {
    pub addr: PeerAddr,
    pub netid: NetId,
    pub name: String,
}

impl Ord for HostKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.addr
            .identity_cmp(&other.addr)
            .then_with(|| self.netid.cmp(&other.netid))
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for HostKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HostKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for HostKey {}

/// State guarded by the host mutex.
pub(crate) struct HostInner {
    /// Last SM state number observed for this peer; 0 until first seen.
    pub state: u32,
    /// Whether the status monitor watches this peer for us.
    pub monitored: bool,
    /// A reclaimer task is rebuilding our client-side locks on this
    /// peer.
    pub reclaiming: bool,
    /// A task is resolving the peer's RPC binding right now.
    pub binding: bool,
    pub vholds: VholdTable,
}

/// One remote peer.
pub struct Host {
    pub name: String,
    pub netid: NetId,
    pub addr: PeerAddr,
    pub sysid: u32,
    /// Outstanding external references. Mutated only under the
    /// registry writer lock, atomically readable for revalidation.
    refs: AtomicU32,
    /// When an unreferenced host becomes GC-eligible. Only touched
    /// under the registry lock.
    idle_deadline: StdMutex<Instant>,
    pub(crate) inner: Mutex<HostInner>,
    /// Broadcast when a reclaimer finishes.
    pub(crate) recovery_notify: Notify,
    /// Broadcast when an RPC binding attempt finishes.
    pub(crate) binding_notify: Notify,
    pub(crate) rpc_cache: RpcCache,
}

impl Host {
    fn new(name: &str, netid: &NetId, addr: &PeerAddr, sysid: u32, cache_cap: usize) -> Self {
        Self {
            name: name.to_string(),
            netid: netid.clone(),
            addr: addr.clone(),
            sysid,
            refs: AtomicU32::new(0),
            idle_deadline: StdMutex::new(Instant::now()),
            inner: Mutex::new(HostInner {
                state: 0,
                monitored: false,
                reclaiming: false,
                binding: false,
                vholds: VholdTable::default(),
            }),
            recovery_notify: Notify::new(),
            binding_notify: Notify::new(),
            rpc_cache: RpcCache::new(cache_cap),
        }
    }

    pub(crate) fn key(&self) -> HostKey {
        HostKey {
            addr: self.addr.clone(),
            netid: self.netid.clone(),
            name: self.name.clone(),
        }
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    /// Last observed SM state for this peer.
    pub async fn state(&self) -> u32 {
        self.inner.lock().await.state
    }

    pub async fn is_monitored(&self) -> bool {
        self.inner.lock().await.monitored
    }

    pub async fn is_reclaiming(&self) -> bool {
        self.inner.lock().await.reclaiming
    }

    pub(crate) fn idle_deadline(&self) -> Instant {
        *self.idle_deadline.lock().unwrap()
    }

    pub(crate) fn restamp_idle(&self, at: Instant) {
        *self.idle_deadline.lock().unwrap() = at;
    }
}

/// The per-zone host registry, guarded by the registry RwLock.
pub(crate) struct Registry {
    pub run_status: RunStatus,
    hosts: BTreeMap<HostKey, Arc<Host>>,
    by_sysid: HashMap<u32, Arc<Host>>,
    /// Hosts with `refs == 0`, in idle-deadline order.
    idle: VecDeque<Arc<Host>>,
    sysids: SysidPool,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            run_status: RunStatus::Starting,
            hosts: BTreeMap::new(),
            by_sysid: HashMap::new(),
            idle: VecDeque::new(),
            sysids: SysidPool::new(),
        }
    }

    /// First host bound to this transport endpoint, name disregarded.
    fn find_endpoint(&self, netid: &NetId, addr: &PeerAddr) -> Option<Arc<Host>> {
        let low = HostKey {
            addr: addr.clone(),
            netid: netid.clone(),
            name: String::new(),
        };
        self.hosts
            .range(low..)
            .take_while(|(k, _)| k.addr.identity_eq(addr) && k.netid == *netid)
            .map(|(_, h)| h.clone())
            .next()
    }

    /// Bump refs and, on the 0 -> 1 edge, leave the idle list.
    fn acquire(&mut self, host: &Arc<Host>) {
        let prev = host.refs.fetch_add(1, Ordering::SeqCst);
        if prev == 0 {
            self.idle.retain(|h| !Arc::ptr_eq(h, host));
        }
    }

    fn insert(&mut self, host: Arc<Host>) {
        let dup = self.hosts.insert(host.key(), host.clone());
        assert!(dup.is_none(), "duplicate host key for {}", host.name);
        let dup = self.by_sysid.insert(host.sysid, host);
        assert!(dup.is_none(), "duplicate sysid in registry");
    }

    /// Remove a host from every index. Requires `refs == 0`.
    pub fn remove(&mut self, host: &Arc<Host>) {
        debug_assert_eq!(host.refs(), 0, "unregistering a referenced host");
        self.hosts.remove(&host.key());
        self.by_sysid.remove(&host.sysid);
        self.idle.retain(|h| !Arc::ptr_eq(h, host));
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn all_hosts(&self) -> Vec<Arc<Host>> {
        self.hosts.values().cloned().collect()
    }

    /// Pop the idle-list head if its deadline has passed.
    pub fn pop_expired_idle(&mut self, now: Instant) -> Option<Arc<Host>> {
        let head = self.idle.front()?;
        if head.idle_deadline() <= now {
            self.idle.pop_front()
        } else {
            None
        }
    }

    pub fn push_idle(&mut self, host: Arc<Host>) {
        self.idle.push_back(host);
    }

    #[cfg(test)]
    pub fn idle_contains(&self, host: &Arc<Host>) -> bool {
        self.idle.iter().any(|h| Arc::ptr_eq(h, host))
    }
}

impl Globals {
    /// Look up a host by transport endpoint, taking a reference.
    pub async fn host_find(&self, netid: &NetId, addr: &PeerAddr) -> Option<Arc<Host>> {
        let mut reg = self.registry.write().await;
        let host = reg.find_endpoint(netid, addr)?;
        reg.acquire(&host);
        Some(host)
    }

    /// Look up a host by sysid, taking a reference.
    pub async fn host_find_by_sysid(&self, sysid: u32) -> Option<Arc<Host>> {
        let mut reg = self.registry.write().await;
        let host = reg.by_sysid.get(&sysid).cloned()?;
        reg.acquire(&host);
        Some(host)
    }

    /// Find the host for this peer identity, creating it on first
    /// sight. None when shutting down or out of sysids. The returned
    /// host carries a reference; pair with [`Globals::host_release`].
    pub async fn host_findcreate(
        &self,
        name: &str,
        netid: &NetId,
        addr: &PeerAddr,
    ) -> Option<Arc<Host>> {
        let key = HostKey {
            addr: addr.clone(),
            netid: netid.clone(),
            name: name.to_string(),
        };
        let sysid = {
            let mut reg = self.registry.write().await;
            if matches!(reg.run_status, RunStatus::Stopping | RunStatus::Down) {
                return None;
            }
            if let Some(host) = reg.hosts.get(&key).cloned() {
                reg.acquire(&host);
                return Some(host);
            }
            match reg.sysids.alloc() {
                Some(id) => id,
                None => {
                    warn!("sysid pool exhausted, refusing peer {name}");
                    return None;
                }
            }
        };

        // Build outside the registry lock, then recheck for a racing
        // creator before inserting.
        let host = Arc::new(Host::new(
            name,
            netid,
            addr,
            sysid,
            self.config.rpc_cache_per_vers,
        ));

        let mut reg = self.registry.write().await;
        if let Some(existing) = reg.hosts.get(&key).cloned() {
            reg.sysids.free(sysid);
            reg.acquire(&existing);
            return Some(existing);
        }
        if matches!(reg.run_status, RunStatus::Stopping | RunStatus::Down) {
            reg.sysids.free(sysid);
            return None;
        }
        reg.insert(host.clone());
        reg.acquire(&host);
        debug!("new host {} ({}/{}) sysid {}", name, netid, addr, sysid);
        Some(host)
    }

    /// Take an additional reference on an already-resolved host.
    pub(crate) async fn host_acquire(&self, host: &Arc<Host>) {
        let mut reg = self.registry.write().await;
        reg.acquire(host);
    }

    /// Drop a reference. The last one stamps the idle deadline and
    /// parks the host on the idle list for the GC.
    pub async fn host_release(&self, host: &Arc<Host>) {
        let mut reg = self.registry.write().await;
        let prev = host.refs.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "released host {} with zero refs", host.name);
        if prev == 1 {
            host.restamp_idle(Instant::now() + self.config.idle_timeout);
            reg.push_idle(host.clone());
        }
    }

    /// Free everything a destroyed host owns. The host must already be
    /// unregistered and its vhold table empty.
    pub(crate) async fn host_destroy(&self, host: &Arc<Host>) {
        {
            let inner = host.inner.lock().await;
            assert!(
                inner.vholds.is_empty(),
                "destroying host {} with vholds",
                host.name
            );
        }
        host.rpc_cache.clear();
        let mut reg = self.registry.write().await;
        reg.sysids.free(host.sysid);
        debug!("destroyed host {} (sysid {})", host.name, host.sysid);
    }

    /// Ask the status monitor to watch this peer. `state` is the SM
    /// state number the peer reported about itself; the first nonzero
    /// observation is recorded as the baseline for reboot detection.
    ///
    /// A monitor failure is logged and the flag cleared; the lock the
    /// caller just installed stands either way, monitoring is
    /// best-effort crash bookkeeping.
    pub async fn host_monitor(&self, host: &Arc<Host>, state: u32) {
        {
            let mut inner = host.inner.lock().await;
            if state != 0 && inner.state == 0 {
                inner.state = state;
                debug!("host {} (sysid {}) has SM state {}", host.name, host.sysid, state);
            }
            if inner.monitored {
                return;
            }
            inner.monitored = true;
        }

        debug!("monitoring {} (sysid {})", host.name, host.sysid);
        // Our sysid for the peer rides in the priv cookie so NOTIFY1
        // can find the host without a name lookup.
        let args = MonArgs {
            mon_name: host.name.clone(),
            my_name: self.config.node_name.clone(),
            my_prog: NLM_PROG,
            my_vers: NLM_SM_VERS,
            my_proc: NLM_SM_NOTIFY1,
            priv_cookie: sm_priv_from_sysid(host.sysid),
        };
        if let Err(e) = self.sm.mon(&args).await {
            warn!("failed to monitor {}: {}", host.name, e);
            host.inner.lock().await.monitored = false;
        }
    }

    /// Stop watching an idle peer. Requires `refs == 0`.
    pub(crate) async fn host_unmonitor(&self, host: &Arc<Host>) {
        debug_assert_eq!(host.refs(), 0, "unmonitoring a referenced host");
        {
            let mut inner = host.inner.lock().await;
            if !inner.monitored {
                return;
            }
            inner.monitored = false;
        }

        debug!("unmonitoring {} (sysid {})", host.name, host.sysid);
        let id = MonId {
            mon_name: host.name.clone(),
            my_name: self.config.node_name.clone(),
        };
        if let Err(e) = self.sm.unmon(&id).await {
            warn!("failed to unmonitor {}: {}", host.name, e);
        }
    }

    /// Server-side cleanup after the peer restarted or went away: drop
    /// every sleep request and every lock and share its sysid owns.
    /// `state == 0` cleans up without recording a new state (the
    /// shutdown path).
    pub async fn host_notify_server(&self, host: &Arc<Host>, state: u32) {
        if state != 0 {
            info!(
                "host {} (sysid {}) rebooted, new state {}",
                host.name, host.sysid, state
            );
        }

        let (discarded, vps) = {
            let mut inner = host.inner.lock().await;
            if state != 0 {
                inner.state = state;
            }
            (inner.vholds.take_slreqs(), inner.vholds.vnodes())
        };

        for vp in &vps {
            self.lockmgr.unlock_sysid(vp, host.sysid).await;
            self.sharemgr.unset_sysid(vp, host.sysid).await;
        }
        drop(discarded);
    }

    /// Client-side reaction to a peer restart: remember the new state
    /// and spawn the reclaimer for our locks on it. Re-notifications
    /// while a reclaim is running are no-ops.
    pub async fn host_notify_client(self: &Arc<Self>, host: &Arc<Host>, state: u32) {
        let start_reclaim = {
            let mut inner = host.inner.lock().await;
            if state != 0 {
                inner.state = state;
            }
            if inner.reclaiming {
                false
            } else {
                inner.reclaiming = true;
                true
            }
        };
        if !start_reclaim {
            return;
        }

        // The reclaimer owns this reference until it exits.
        self.host_acquire(host).await;
        let g = self.clone();
        let h = host.clone();
        tokio::spawn(async move {
            crate::recovery::reclaimer_task(g, h).await;
        });
    }

    /// Registry size, for the shutdown drain and tests.
    pub async fn host_count(&self) -> usize {
        self.registry.read().await.len()
    }
}
