//! Instance-wide engine state.
//!
//! One [`Globals`] per isolation domain owns everything transitively:
//! the host registry, the client-side sleeping-lock list, the status
//! monitor client, and the lifecycle state machine
//! `Starting -> Up -> Stopping -> Down`.
//!
//! Lock order, left before right, never the reverse:
//!
//! ```text
//! registry RwLock < slock Mutex < host Mutex < SM call Mutex
//! ```
//!
//! The GC honors it by dropping the registry lock across per-host work
//! and revalidating afterwards.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use nlm_core::flock::LockManager;
use nlm_core::fs::FhResolver;
use nlm_core::rpc::{PeerRpc, SmTransport};
use nlm_core::share::ShareManager;
use nlm_proto::RpcError;

use crate::config::Config;
use crate::host::Registry;
use crate::recovery::LockReclaimer;
use crate::slock::SlockTable;
use crate::statmon::StatMon;

/// Lifecycle of one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Starting,
    Up,
    Stopping,
    Down,
}

/// The external services the engine drives. Production wires the real
/// file system and RPC stack; tests and the dev binary wire the
/// in-process drivers from `nlm-core`.
pub struct Collaborators {
    pub lockmgr: Arc<dyn LockManager>,
    pub sharemgr: Arc<dyn ShareManager>,
    pub fhres: Arc<dyn FhResolver>,
    pub rpc: Arc<dyn PeerRpc>,
    pub sm: Arc<dyn SmTransport>,
    pub reclaimer: Arc<dyn LockReclaimer>,
}

/// Why startup failed.
#[derive(Debug)]
pub enum StartError {
    /// The instance is not in `Starting` state.
    WrongState(RunStatus),
    /// The status monitor could not be reached.
    StatMon(RpcError),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::WrongState(s) => write!(f, "cannot start from state {s:?}"),
            StartError::StatMon(e) => write!(f, "status monitor unreachable: {e}"),
        }
    }
}

impl std::error::Error for StartError {}

/// Zone-global engine state. Owns hosts, vholds, sleeping locks, and
/// the background tasks, transitively.
pub struct Globals {
    pub config: Config,
    pub(crate) registry: RwLock<Registry>,
    pub(crate) slocks: Mutex<SlockTable>,
    pub(crate) sm: StatMon,
    /// End of the grace period; requests before it need `reclaim`.
    grace_until: RwLock<Instant>,
    /// Our incarnation number from the status monitor.
    nsm_state: AtomicU32,
    pub(crate) gc_notify: Notify,
    pub shutdown_notify: Notify,
    /// Permits for parked server-side blocking waits.
    pub(crate) blocking_slots: Arc<Semaphore>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) lockmgr: Arc<dyn LockManager>,
    pub(crate) sharemgr: Arc<dyn ShareManager>,
    pub(crate) fhres: Arc<dyn FhResolver>,
    pub(crate) rpc: Arc<dyn PeerRpc>,
    pub(crate) reclaimer: Arc<dyn LockReclaimer>,
}

impl Globals {
    pub fn new(config: Config, ext: Collaborators) -> Arc<Self> {
        let blocking_slots = Arc::new(Semaphore::new(config.max_blocking_waiters));
        Arc::new(Self {
            registry: RwLock::new(Registry::new()),
            slocks: Mutex::new(SlockTable::default()),
            sm: StatMon::new(ext.sm),
            grace_until: RwLock::new(Instant::now()),
            nsm_state: AtomicU32::new(0),
            gc_notify: Notify::new(),
            shutdown_notify: Notify::new(),
            blocking_slots,
            gc_task: Mutex::new(None),
            lockmgr: ext.lockmgr,
            sharemgr: ext.sharemgr,
            fhres: ext.fhres,
            rpc: ext.rpc,
            reclaimer: ext.reclaimer,
            config,
        })
    }

    pub async fn run_status(&self) -> RunStatus {
        self.registry.read().await.run_status
    }

    /// Whether we are still inside the post-startup grace window.
    pub async fn in_grace(&self) -> bool {
        Instant::now() < *self.grace_until.read().await
    }

    /// Our incarnation number, as peers see it.
    pub fn nsm_state(&self) -> u32 {
        self.nsm_state.load(Ordering::SeqCst)
    }

    /// Ask the GC for an early pass (memory pressure hook, tests).
    /// The wake is a stored permit, so it is never lost between the
    /// reaper's sleeps.
    pub fn schedule_gc(&self) {
        self.gc_notify.notify_one();
    }

    /// Bring the instance up: reach the status monitor, announce our
    /// restart, fetch our state number, open the grace window, start
    /// the reaper.
    pub async fn svc_start(self: &Arc<Self>) -> Result<(), StartError> {
        {
            let reg = self.registry.read().await;
            if reg.run_status != RunStatus::Starting {
                return Err(StartError::WrongState(reg.run_status));
            }
        }

        self.sm
            .bind_with_retries(self.config.sm_bind_retries, self.config.sm_bind_backoff)
            .await
            .map_err(StartError::StatMon)?;

        // Tell the monitor we restarted so peers relearn our state,
        // then record the state number we will hand out as ours.
        self.sm.simu_crash().await.map_err(StartError::StatMon)?;
        let state = self.sm.stat().await.map_err(StartError::StatMon)?;
        self.nsm_state.store(state, Ordering::SeqCst);

        *self.grace_until.write().await = Instant::now() + self.config.grace_period;
        self.registry.write().await.run_status = RunStatus::Up;

        let handle = tokio::spawn(crate::gc::gc_task(self.clone()));
        *self.gc_task.lock().await = Some(handle);

        info!(
            "lock manager up, nsm state {}, grace {}s",
            state,
            self.config.grace_period.as_secs()
        );
        Ok(())
    }

    /// Tear the instance down: stop host creation, join the reaper,
    /// run state-0 cleanup on every host, drain them, and finally drop
    /// all monitoring in one call.
    pub async fn svc_stop(self: &Arc<Self>) {
        {
            let mut reg = self.registry.write().await;
            if reg.run_status != RunStatus::Up {
                warn!("shutdown requested from state {:?}", reg.run_status);
            }
            reg.run_status = RunStatus::Stopping;
        }
        info!("lock manager shutting down");
        self.shutdown_notify.notify_waiters();
        self.gc_notify.notify_one();
        if let Some(handle) = self.gc_task.lock().await.take() {
            if let Err(e) = handle.await {
                error!("host reaper panicked: {e}");
            }
        }

        // Fake a state-0 notification for every host: cancel our own
        // parked client waits and purge all server-side state.
        let hosts = { self.registry.read().await.all_hosts() };
        for host in &hosts {
            self.slock_cancel_all(host).await;
            self.host_notify_server(host, 0).await;
        }

        // Destroy idle hosts; poll with backoff for hosts still
        // referenced by in-flight handlers or reclaimers.
        let mut attempts = 0;
        loop {
            loop {
                let host = {
                    let mut reg = self.registry.write().await;
                    match reg.pop_expired_idle(Instant::now() + self.config.idle_timeout) {
                        Some(h) => {
                            reg.remove(&h);
                            Some(h)
                        }
                        None => None,
                    }
                };
                let Some(host) = host else { break };
                self.vhold_gc(&host).await;
                self.host_unmonitor(&host).await;
                self.host_destroy(&host).await;
            }

            let remaining = self.host_count().await;
            if remaining == 0 {
                break;
            }
            attempts += 1;
            if attempts > self.config.shutdown_drain_attempts {
                warn!("shutdown drain gave up with {remaining} hosts still referenced");
                break;
            }
            tokio::time::sleep(self.config.shutdown_drain_backoff).await;
        }

        if let Err(e) = self.sm.unmon_all().await {
            warn!("unmon_all failed: {e}");
        }

        self.registry.write().await.run_status = RunStatus::Down;
        info!("lock manager stopped");
    }
}
