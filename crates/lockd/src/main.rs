//! Network lock manager daemon (lockd).
//!
//! Hosts the NLM host/lock-state engine: the peer registry, grace and
//! recovery handling, and the TEST/LOCK/CANCEL/UNLOCK/GRANTED/SHARE
//! service handlers. The RPC endpoints and the exporting file system
//! are pluggable collaborators; this binary wires the in-process
//! drivers, which makes it a single-machine development harness. A
//! production embedding supplies the kernel-facing implementations
//! instead.

mod config;
mod daemon;
mod gc;
mod host;
mod recovery;
mod rpc_cache;
mod service;
mod slock;
mod statmon;
mod sysid;
mod vhold;


use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use nlm_core::flock::MemLockManager;
use nlm_core::fs::MemFs;
use nlm_core::rpc::{ChanRpc, LocalStatMon};
use nlm_core::share::MemShareManager;

use crate::config::Config;
use crate::daemon::{Collaborators, Globals};
use crate::recovery::NullReclaimer;

/// Network lock manager daemon
#[derive(Parser, Debug)]
#[command(name = "lockd", version, about = "Network lock manager daemon")]
struct Args {
    /// Node name registered with the status monitor
    #[arg(short = 'n', long, default_value = "lockd")]
    node_name: String,

    /// Grace period in seconds
    #[arg(short = 'g', long, default_value_t = nlm_proto::defaults::DEFAULT_GRACE_PERIOD_SECS)]
    grace_period: u64,

    /// Host idle timeout in seconds
    #[arg(short = 't', long, default_value_t = nlm_proto::defaults::DEFAULT_IDLE_TIMEOUT_SECS)]
    idle_timeout: u64,

    /// Recovery-wait wake interval in seconds
    #[arg(long, default_value_t = nlm_proto::defaults::DEFAULT_RETRANS_TIMEOUT_SECS)]
    retrans_timeout: u64,

    /// Status-monitor bind attempts before startup fails
    #[arg(long, default_value_t = nlm_proto::defaults::DEFAULT_SM_BIND_RETRIES)]
    sm_bind_retries: u32,

    /// Backoff between status-monitor bind attempts, in milliseconds
    #[arg(long, default_value_t = nlm_proto::defaults::DEFAULT_SM_BIND_BACKOFF_MS)]
    sm_bind_backoff_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("lockd v{} starting", env!("CARGO_PKG_VERSION"));

    let cfg = Config {
        node_name: args.node_name,
        grace_period: Duration::from_secs(args.grace_period),
        idle_timeout: Duration::from_secs(args.idle_timeout),
        retrans_timeout: Duration::from_secs(args.retrans_timeout),
        sm_bind_retries: args.sm_bind_retries,
        sm_bind_backoff: Duration::from_millis(args.sm_bind_backoff_ms),
        ..Config::default()
    };

    // In-process collaborators; a production embedding substitutes the
    // exporting file system and the kernel RPC stack here.
    let (rpc, mut granted_rx) = ChanRpc::new();
    let ext = Collaborators {
        lockmgr: Arc::new(MemLockManager::new()),
        sharemgr: Arc::new(MemShareManager::new()),
        fhres: Arc::new(MemFs::new()),
        rpc: Arc::new(rpc),
        sm: Arc::new(LocalStatMon::new()),
        reclaimer: Arc::new(NullReclaimer),
    };

    let g = Globals::new(cfg, ext);

    if let Err(e) = g.svc_start().await {
        error!("startup failed: {e}");
        std::process::exit(1);
    }

    // Drain outgoing granted back-calls; with the loopback transport
    // they only show up in the log.
    tokio::spawn(async move {
        while let Some(ev) = granted_rx.recv().await {
            info!("granted back-call to {} (vers {})", ev.addr, ev.vers);
        }
    });

    tokio::select! {
        _ = g.shutdown_notify.notified() => {
            info!("shutdown signal received");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
        }
    }

    g.svc_stop().await;
    info!("lockd stopped");
}
