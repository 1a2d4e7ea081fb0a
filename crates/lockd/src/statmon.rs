//! Serialized client to the local status monitor.
//!
//! The monitor is an out-of-process daemon that is not safe against
//! interleaved calls on one handle, so every procedure goes through a
//! single mutex. Startup resolves the endpoint with bounded retries:
//! the monitor may simply not have registered itself yet, which is the
//! one failure worth waiting out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use nlm_core::rpc::SmTransport;
use nlm_proto::types::{MonArgs, MonId};
use nlm_proto::{RpcError, RpcResult};

pub struct StatMon {
    transport: Arc<dyn SmTransport>,
    /// Serializes every call on the shared handle.
    call_lock: Mutex<()>,
}

impl StatMon {
    pub fn new(transport: Arc<dyn SmTransport>) -> Self {
        Self {
            transport,
            call_lock: Mutex::new(()),
        }
    }

    /// Resolve the monitor endpoint. `NotRegistered` is retried up to
    /// `retries` times with a fixed backoff; anything else is fatal.
    pub async fn bind_with_retries(&self, retries: u32, backoff: Duration) -> RpcResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let res = {
                let _serial = self.call_lock.lock().await;
                self.transport.bind().await
            };
            match res {
                Ok(()) => return Ok(()),
                Err(RpcError::NotRegistered) if attempt < retries => {
                    debug!("status monitor not registered yet, attempt {attempt}/{retries}");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Tell the monitor we restarted so it renotifies our peers.
    pub async fn simu_crash(&self) -> RpcResult<()> {
        let _serial = self.call_lock.lock().await;
        self.transport.simu_crash().await
    }

    /// Our own state number, handed to peers as our incarnation.
    pub async fn stat(&self) -> RpcResult<u32> {
        let _serial = self.call_lock.lock().await;
        self.transport.stat().await
    }

    pub async fn mon(&self, args: &MonArgs) -> RpcResult<()> {
        let _serial = self.call_lock.lock().await;
        self.transport.mon(args).await
    }

    pub async fn unmon(&self, id: &MonId) -> RpcResult<()> {
        let _serial = self.call_lock.lock().await;
        self.transport.unmon(id).await
    }

    pub async fn unmon_all(&self) -> RpcResult<()> {
        let _serial = self.call_lock.lock().await;
        self.transport.unmon_all().await
    }
}
