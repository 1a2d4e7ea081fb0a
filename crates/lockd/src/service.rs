//! NLM service handlers.
//!
//! Thin orchestration over the host registry, vhold tables, sleeping
//! locks, and the local lock/share managers. The RPC layer decodes
//! arguments, calls one of the `do_*` functions with the caller's
//! transport identity, and encodes whatever comes back. Handlers never
//! panic on peer input; broken internal invariants do panic.

use std::sync::Arc;

use tracing::{debug, warn};

use nlm_core::flock::{Flock, FlockKind, LockManager, SetLockResult, WaitLockResult};
use nlm_core::fs::{FhResolver, Vnode};
use nlm_core::rpc::NlmHandle;
use nlm_core::share::{ShareManager, Shr};
use nlm_proto::types::{
    sysid_from_sm_priv, CancelArgs, LockArgs, NlmHolder, NlmLock, NlmRes, NlmShare, NotifyArgs,
    ShareArgs, ShareRes, SmNotifyArgs, TestArgs, TestRes, UnlockArgs,
};
use nlm_proto::{NetId, NlmStatus, Oh, OwnerHandle, PeerAddr};

use crate::daemon::Globals;
use crate::host::Host;
use crate::vhold::VholdId;

/// Transport identity of the requester, as the RPC layer saw it.
#[derive(Debug, Clone)]
pub struct Caller {
    pub netid: NetId,
    pub addr: PeerAddr,
    /// NLM protocol version of the request, reused for back-calls.
    pub vers: u32,
}

fn share_args_to_shr(share: &NlmShare, sysid: u32) -> Shr {
    Shr {
        sysid,
        owner: share.oh.0.clone(),
        access: share.access,
        deny: share.mode,
    }
}

fn flock_from(alock: &NlmLock, sysid: u32, exclusive: bool) -> Flock {
    Flock {
        sysid,
        pid: alock.svid,
        start: alock.offset,
        len: alock.len,
        kind: if exclusive { FlockKind::Write } else { FlockKind::Read },
    }
}

/// Resolve a file handle for a state-changing operation: stale handles
/// and read-only file systems are both refused.
async fn fh_to_vp_checked(g: &Globals, fh: &nlm_proto::Fh) -> Result<Arc<Vnode>, NlmStatus> {
    let vp = g.fhres.fh_to_vp(fh).await.ok_or(NlmStatus::StaleFh)?;
    if vp.read_only {
        return Err(NlmStatus::RoFs);
    }
    Ok(vp)
}

/// NLM_TEST: is the range lockable. Purely a read; no vhold, no
/// monitoring.
pub async fn do_test(g: &Arc<Globals>, caller: &Caller, args: &TestArgs) -> TestRes {
    let cookie = args.cookie.clone();
    let Some(host) = g
        .host_findcreate(&args.alock.caller_name, &caller.netid, &caller.addr)
        .await
    else {
        return TestRes { cookie, stat: NlmStatus::DeniedNolocks, holder: None };
    };

    let (stat, holder) = test_inner(g, &host, args).await;
    g.host_release(&host).await;
    TestRes { cookie, stat, holder }
}

async fn test_inner(
    g: &Arc<Globals>,
    host: &Arc<Host>,
    args: &TestArgs,
) -> (NlmStatus, Option<NlmHolder>) {
    if g.in_grace().await {
        return (NlmStatus::DeniedGracePeriod, None);
    }
    // A plain read of lock state; stale handle is the only file check.
    let Some(vp) = g.fhres.fh_to_vp(&args.alock.fh).await else {
        return (NlmStatus::StaleFh, None);
    };

    let fl = flock_from(&args.alock, host.sysid, args.exclusive);
    match g.lockmgr.test(&vp, &fl).await {
        None => (NlmStatus::Granted, None),
        Some(conflict) => (
            NlmStatus::Denied,
            Some(NlmHolder {
                exclusive: conflict.kind == FlockKind::Write,
                svid: conflict.pid,
                // The conflicting owner's handle is unknown here.
                oh: Oh::default(),
                offset: conflict.start,
                len: conflict.len,
            }),
        ),
    }
}

/// NLM_LOCK: set a lock, possibly blocking. `has_grant_cb` is false
/// for the non-monitored variants, which can neither receive a GRANTED
/// back-call nor be status-monitored.
pub async fn do_lock(
    g: &Arc<Globals>,
    caller: &Caller,
    args: &LockArgs,
    has_grant_cb: bool,
) -> NlmRes {
    let cookie = args.cookie.clone();
    let Some(host) = g
        .host_findcreate(&args.alock.caller_name, &caller.netid, &caller.addr)
        .await
    else {
        return NlmRes { cookie, stat: NlmStatus::DeniedNolocks };
    };

    let stat = lock_inner(g, caller, &host, args, has_grant_cb).await;
    g.host_release(&host).await;
    NlmRes { cookie, stat }
}

async fn lock_inner(
    g: &Arc<Globals>,
    caller: &Caller,
    host: &Arc<Host>,
    args: &LockArgs,
    has_grant_cb: bool,
) -> NlmStatus {
    if !args.reclaim && g.in_grace().await {
        return NlmStatus::DeniedGracePeriod;
    }

    // The peer's state number moved past what we recorded: it rebooted
    // and we missed the NOTIFY. Clean up before taking the new lock.
    if host.state().await != args.state {
        g.host_notify_server(host, args.state).await;
    }

    let vp = match fh_to_vp_checked(g, &args.alock.fh).await {
        Ok(vp) => vp,
        Err(stat) => return stat,
    };
    let vid = g.vhold_get(host, &vp).await;
    let fl = flock_from(&args.alock, host.sysid, args.exclusive);

    // Non-blocking attempt first; a direct grant skips the whole
    // callback dance.
    let mut do_monitor = false;
    let stat = match g.lockmgr.set(&vp, &fl).await {
        SetLockResult::Granted => {
            do_monitor = true;
            NlmStatus::Granted
        }
        SetLockResult::NoLocks => NlmStatus::DeniedNolocks,
        SetLockResult::Conflict => {
            if !args.block || !has_grant_cb {
                NlmStatus::Denied
            } else {
                match g.blocking_slots.clone().try_acquire_owned() {
                    Err(_) => NlmStatus::DeniedNolocks,
                    Ok(permit) => {
                        do_monitor = true;
                        // The blocking wait outlives this request; hand
                        // the continuation its own host and vhold refs.
                        g.host_acquire(host).await;
                        g.vhold_ref(host, vid).await;
                        tokio::spawn(block_wait(
                            g.clone(),
                            host.clone(),
                            vid,
                            vp.clone(),
                            fl.clone(),
                            args.clone(),
                            caller.vers,
                            permit,
                        ));
                        NlmStatus::Blocked
                    }
                }
            }
        }
    };

    g.vhold_release(host, vid).await;
    if do_monitor && has_grant_cb {
        g.host_monitor(host, args.state).await;
    }
    stat
}

/// Continuation of a blocking LOCK after `Blocked` was sent: park in
/// the local lock manager, then deliver the GRANTED back-call.
#[allow(clippy::too_many_arguments)]
async fn block_wait(
    g: Arc<Globals>,
    host: Arc<Host>,
    vid: VholdId,
    vp: Arc<Vnode>,
    fl: Flock,
    args: LockArgs,
    vers: u32,
    _permit: tokio::sync::OwnedSemaphorePermit,
) {
    // An identical sleep request already parked means a retransmitted
    // LOCK; the first worker owns the wait.
    if g.slreq_register(&host, vid, &fl).await {
        let wait = g.lockmgr.set_wait(&vp, &fl).await;
        let _ = g.slreq_unregister(&host, vid, &fl).await;

        match wait {
            WaitLockResult::Granted => {
                grant_callback(&g, &host, &args, vers).await;
            }
            WaitLockResult::Cancelled => {
                // No way to tell the peer; its retransmission or
                // timeout sorts it out.
                debug!("blocking lock for {} cancelled", host.name);
            }
        }
    }

    g.vhold_release(&host, vid).await;
    g.host_release(&host).await;
}

/// Deliver the GRANTED back-call. Failures are logged and dropped; the
/// peer retransmits its LOCK if it never hears from us.
async fn grant_callback(g: &Arc<Globals>, host: &Arc<Host>, args: &LockArgs, vers: u32) {
    let targs = TestArgs {
        cookie: args.cookie.clone(),
        exclusive: args.exclusive,
        alock: args.alock.clone(),
    };
    match g.host_get_rpc(host, vers).await {
        Ok(handle) => {
            match handle.granted(&targs).await {
                Ok(stat) => debug!("granted call to {} answered {:?}", host.name, stat),
                Err(e) => warn!("granted call to {} failed: {}", host.name, e),
            }
            g.host_rele_rpc(host, vers, handle);
        }
        Err(e) => warn!("no rpc binding for {}: {}", host.name, e),
    }
}

/// NLM_CANCEL: give up on a blocking lock. Clears the parked sleep
/// request, and pokes the local lock manager in case the lock was
/// granted between the peer's decision and our arrival.
pub async fn do_cancel(g: &Arc<Globals>, caller: &Caller, args: &CancelArgs) -> NlmRes {
    let cookie = args.cookie.clone();
    let Some(host) = g.host_find(&caller.netid, &caller.addr).await else {
        return NlmRes { cookie, stat: NlmStatus::DeniedNolocks };
    };

    let stat = cancel_inner(g, &host, args).await;
    g.host_release(&host).await;
    NlmRes { cookie, stat }
}

async fn cancel_inner(g: &Arc<Globals>, host: &Arc<Host>, args: &CancelArgs) -> NlmStatus {
    if g.in_grace().await {
        return NlmStatus::DeniedGracePeriod;
    }
    let vp = match fh_to_vp_checked(g, &args.alock.fh).await {
        Ok(vp) => vp,
        Err(stat) => return stat,
    };
    let vid = g.vhold_get(host, &vp).await;

    let fl = flock_from(&args.alock, host.sysid, args.exclusive);
    let unregistered = g.slreq_unregister(host, vid, &fl).await;
    // Cancels the parked waiter by exact range, or removes the lock if
    // the sleep already succeeded.
    let cleared = g.lockmgr.unlock(&vp, &fl).await;

    g.vhold_release(host, vid).await;
    if unregistered || cleared {
        NlmStatus::Granted
    } else {
        NlmStatus::Denied
    }
}

/// NLM_UNLOCK: remove a lock. The protocol has no failure code here,
/// so the answer is always `Granted`.
pub async fn do_unlock(g: &Arc<Globals>, caller: &Caller, args: &UnlockArgs) -> NlmRes {
    let cookie = args.cookie.clone();
    let Some(host) = g.host_find(&caller.netid, &caller.addr).await else {
        return NlmRes { cookie, stat: NlmStatus::DeniedNolocks };
    };

    let stat = unlock_inner(g, &host, args).await;
    g.host_release(&host).await;
    NlmRes { cookie, stat }
}

async fn unlock_inner(g: &Arc<Globals>, host: &Arc<Host>, args: &UnlockArgs) -> NlmStatus {
    if g.in_grace().await {
        return NlmStatus::DeniedGracePeriod;
    }
    let vp = match fh_to_vp_checked(g, &args.alock.fh).await {
        Ok(vp) => vp,
        Err(stat) => return stat,
    };
    let fl = flock_from(&args.alock, host.sysid, false);
    let cleared = g.lockmgr.unlock(&vp, &fl).await;
    debug!("unlock for {} cleared={}", host.name, cleared);
    NlmStatus::Granted
}

/// NLM_GRANTED: a server we are client of grants our blocking lock.
/// The host is found by the sysid our client side planted in the
/// owner handle.
pub async fn do_granted(g: &Arc<Globals>, _caller: &Caller, args: &TestArgs) -> NlmRes {
    let cookie = args.cookie.clone();
    let Some(oh) = OwnerHandle::decode(&args.alock.oh) else {
        return NlmRes { cookie, stat: NlmStatus::Denied };
    };
    let Some(host) = g.host_find_by_sysid(oh.sysid).await else {
        return NlmRes { cookie, stat: NlmStatus::Denied };
    };

    let matched = g
        .slock_grant(
            &host,
            args.alock.svid,
            args.alock.offset,
            args.alock.len,
            &args.alock.fh,
        )
        .await;
    g.host_release(&host).await;

    NlmRes {
        cookie,
        stat: if matched { NlmStatus::Granted } else { NlmStatus::Denied },
    }
}

/// NLM_SHARE: DOS-style share reservation.
pub async fn do_share(g: &Arc<Globals>, caller: &Caller, args: &ShareArgs) -> ShareRes {
    let cookie = args.cookie.clone();
    let Some(host) = g
        .host_findcreate(&args.share.caller_name, &caller.netid, &caller.addr)
        .await
    else {
        return ShareRes { cookie, stat: NlmStatus::DeniedNolocks, sequence: 0 };
    };

    let stat = share_inner(g, &host, args).await;
    g.host_release(&host).await;
    ShareRes { cookie, stat, sequence: 0 }
}

async fn share_inner(g: &Arc<Globals>, host: &Arc<Host>, args: &ShareArgs) -> NlmStatus {
    if !args.reclaim && g.in_grace().await {
        return NlmStatus::DeniedGracePeriod;
    }
    let vp = match fh_to_vp_checked(g, &args.share.fh).await {
        Ok(vp) => vp,
        Err(stat) => return stat,
    };
    let vid = g.vhold_get(host, &vp).await;

    let shr = share_args_to_shr(&args.share, host.sysid);
    let ok = g.sharemgr.set(&vp, &shr).await;

    g.vhold_release(host, vid).await;
    if ok {
        // Share holders have no grant callback; monitor with no state.
        g.host_monitor(host, 0).await;
        NlmStatus::Granted
    } else {
        NlmStatus::Denied
    }
}

/// NLM_UNSHARE: release a share reservation. Like UNLOCK, the answer
/// carries no failure mode.
pub async fn do_unshare(g: &Arc<Globals>, caller: &Caller, args: &ShareArgs) -> ShareRes {
    let cookie = args.cookie.clone();
    let Some(host) = g.host_find(&caller.netid, &caller.addr).await else {
        return ShareRes { cookie, stat: NlmStatus::DeniedNolocks, sequence: 0 };
    };

    let stat = unshare_inner(g, &host, args).await;
    g.host_release(&host).await;
    ShareRes { cookie, stat, sequence: 0 }
}

async fn unshare_inner(g: &Arc<Globals>, host: &Arc<Host>, args: &ShareArgs) -> NlmStatus {
    if g.in_grace().await {
        return NlmStatus::DeniedGracePeriod;
    }
    let vp = match fh_to_vp_checked(g, &args.share.fh).await {
        Ok(vp) => vp,
        Err(stat) => return stat,
    };
    let shr = share_args_to_shr(&args.share, host.sysid);
    g.sharemgr.unset(&vp, &shr).await;
    NlmStatus::Granted
}

/// NLM_FREE_ALL: the peer asks us to drop everything it owns here.
/// Server-side cleanup only; client-side state is touched exclusively
/// by status-monitor notifications.
pub async fn do_free_all(g: &Arc<Globals>, caller: &Caller, args: &NotifyArgs) {
    let Some(host) = g.host_find(&caller.netid, &caller.addr).await else {
        return;
    };
    debug!("free_all from {} (state {})", args.name, args.state);
    g.host_notify_server(&host, args.state).await;
    g.host_release(&host).await;
}

/// NLM_SM_NOTIFY1: the local status monitor reports a peer state
/// change. Fans out to server-side cleanup and client-side reclaim.
pub async fn do_notify1(g: &Arc<Globals>, args: &SmNotifyArgs) {
    let Some(sysid) = sysid_from_sm_priv(&args.priv_cookie) else {
        warn!("notify with malformed priv cookie for {}", args.mon_name);
        return;
    };
    let Some(host) = g.host_find_by_sysid(sysid).await else {
        debug!("notify for unknown sysid {sysid}");
        return;
    };

    g.host_notify_server(&host, args.state).await;
    g.host_notify_client(&host, args.state).await;
    g.host_release(&host).await;
}
