//! Per-host cache of bound peer RPC handles.
//!
//! Back-calls (GRANTED, `_msg` replies) need a client handle to the
//! peer's NLM service at the request's protocol version. Binding one
//! costs a portmapper round trip, so handles are pooled per version
//! and reused. Binding is single-flight per host: concurrent callers
//! park on the host's binding notify instead of racing the resolver.

use std::sync::Arc;

use dashmap::DashMap;

use nlm_core::rpc::{NlmHandle, PeerRpc};
use nlm_proto::RpcResult;

use crate::daemon::Globals;
use crate::host::Host;

/// Pool of bound handles, keyed by NLM protocol version.
pub(crate) struct RpcCache {
    pools: DashMap<u32, Vec<Arc<dyn NlmHandle>>>,
    max_per_vers: usize,
}

impl RpcCache {
    pub fn new(max_per_vers: usize) -> Self {
        Self {
            pools: DashMap::new(),
            max_per_vers,
        }
    }

    pub fn checkout(&self, vers: u32) -> Option<Arc<dyn NlmHandle>> {
        self.pools.get_mut(&vers)?.pop()
    }

    pub fn checkin(&self, vers: u32, handle: Arc<dyn NlmHandle>) {
        let mut pool = self.pools.entry(vers).or_default();
        if pool.len() < self.max_per_vers {
            pool.push(handle);
        }
        // Drop the handle if the pool is full
    }

    pub fn clear(&self) {
        self.pools.clear();
    }
}

impl Globals {
    /// Check out an RPC handle to the host at the given version,
    /// binding one if the pool is dry. Return it with
    /// [`Globals::host_rele_rpc`] when the call is done.
    pub(crate) async fn host_get_rpc(
        &self,
        host: &Arc<Host>,
        vers: u32,
    ) -> RpcResult<Arc<dyn NlmHandle>> {
        loop {
            if let Some(handle) = host.rpc_cache.checkout(vers) {
                return Ok(handle);
            }
            // Become the binder, or wait for the one in flight.
            let notified = host.binding_notify.notified();
            {
                let mut inner = host.inner.lock().await;
                if !inner.binding {
                    inner.binding = true;
                    break;
                }
            }
            notified.await;
        }

        let res = self.rpc.bind(&host.netid, &host.addr, vers).await;
        host.inner.lock().await.binding = false;
        host.binding_notify.notify_waiters();
        res
    }

    /// Return a handle to the host's pool for reuse.
    pub(crate) fn host_rele_rpc(&self, host: &Arc<Host>, vers: u32, handle: Arc<dyn NlmHandle>) {
        host.rpc_cache.checkin(vers, handle);
    }
}
