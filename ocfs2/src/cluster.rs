//! Cluster / lock coordination (component F).
//!
//! The core talks to the cluster stack through the [`ClusterStack`]
//! trait, never a wire protocol directly, mirroring how `mount.ocfs2`
//! and `tunefs.ocfs2` go through an abstract `o2cb`/`pcmk` control-plane
//! library rather than talking DLM wire format themselves.
//! [`LocalStack`] is the only concrete implementation shipped, mirroring
//! `mount_local` volumes which never join a cluster; a real DLM-backed
//! stack is an explicit non-goal.
//!
//! The binary crates that drive this module stay thin: they call into
//! [`acquire_lock`] and the maintenance composites and otherwise do
//! nothing but argument parsing and the final syscall.

use std::fmt;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::disk::superblock::Superblock;
use crate::disk::{feature, superblock};
use crate::error::{Ocfs2Error, Ocfs2Result};

/// The four cluster-stack control-plane verbs, plus the per-operation
/// named lock every mutating call takes.
pub trait ClusterStack: fmt::Debug {
    fn init(&mut self) -> Ocfs2Result<()>;
    fn begin_group_join(&mut self, cluster: &str, region: &str) -> Ocfs2Result<()>;
    fn complete_group_join(&mut self, cluster: &str, region: &str, result: i32) -> Ocfs2Result<()>;
    fn stop_heartbeat(&mut self) -> Ocfs2Result<()>;

    /// Acquires the named exclusive lock. `blocking = false` must return
    /// `Ok(false)` rather than block when the lock is already held
    /// elsewhere (the "online" non-blocking mode).
    fn lock(&mut self, name: &str, blocking: bool) -> Ocfs2Result<bool>;
    fn unlock(&mut self, name: &str) -> Ocfs2Result<()>;
}

/// No-op stack used for `mount_local` volumes, where there is by
/// definition only one node and no coordination is needed.
#[derive(Debug, Default)]
pub struct LocalStack;

impl ClusterStack for LocalStack {
    fn init(&mut self) -> Ocfs2Result<()> {
        Ok(())
    }
    fn begin_group_join(&mut self, _cluster: &str, _region: &str) -> Ocfs2Result<()> {
        Ok(())
    }
    fn complete_group_join(&mut self, _cluster: &str, _region: &str, _result: i32) -> Ocfs2Result<()> {
        Ok(())
    }
    fn stop_heartbeat(&mut self) -> Ocfs2Result<()> {
        Ok(())
    }
    fn lock(&mut self, _name: &str, _blocking: bool) -> Ocfs2Result<bool> {
        Ok(true)
    }
    fn unlock(&mut self, _name: &str) -> Ocfs2Result<()> {
        Ok(())
    }
}

/// Whether the operation wants a blocking (offline tool) or non-blocking
/// (online, kernel-cooperating) lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Offline,
    Online,
}

/// Environment variable through which a parent process delegates an
/// already-held lock mode to a child.
pub const LOCK_DELEGATION_ENV: &str = "OCFS2_LOCKED_MODE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delegation {
    Locked,
    Online,
}

fn read_delegation() -> Option<Delegation> {
    match std::env::var(LOCK_DELEGATION_ENV).ok()?.as_str() {
        "locked" => Some(Delegation::Locked),
        "online" => Some(Delegation::Online),
        _ => None,
    }
}

/// Rejects an open/lock attempt if the superblock carries an incompatible
/// or in-progress bit.
fn check_incompat_for_lock(sb: &Superblock) -> Ocfs2Result<()> {
    if sb.has_incompat(feature::INCOMPAT_HEARTBEAT_DEV) {
        return Err(Ocfs2Error::HeartbeatDev);
    }
    if sb.has_incompat(feature::INCOMPAT_RESIZE_INPROG) {
        return Err(Ocfs2Error::ResizeInProgress);
    }
    if sb.has_incompat(feature::INCOMPAT_TUNEFS_INPROG) {
        return Err(Ocfs2Error::TunefsInProgress);
    }
    Ok(())
}

const BLOCKED_SIGNALS: [libc::c_int; 4] = [libc::SIGINT, libc::SIGTERM, libc::SIGHUP, libc::SIGQUIT];

/// What the `SIGSEGV` handler needs to attempt an unlock: a raw pointer to
/// the held stack plus the lock name, stashed here for the duration of a
/// held lock since an `extern "C"` handler can't capture anything.
struct ActiveLock {
    stack: *mut dyn ClusterStack,
    name: String,
}

static ACTIVE_LOCK: AtomicPtr<ActiveLock> = AtomicPtr::new(std::ptr::null_mut());

/// Installed over `SIGSEGV` while a cluster lock is held (`SIGSEGV` is
/// deliberately never in `BLOCKED_SIGNALS`: blocking it is undefined
/// behaviour if it actually fires for a fault, only deferrable signals
/// belong in a process mask). Attempts one best-effort unlock, then
/// restores the default disposition and re-raises so the process still
/// dies the normal way (core dump, correct exit status).
extern "C" fn handle_segv(sig: libc::c_int) {
    let ptr = ACTIVE_LOCK.load(Ordering::SeqCst);
    if !ptr.is_null() {
        let active = unsafe { &*ptr };
        let stack = unsafe { &mut *active.stack };
        let _ = stack.unlock(&active.name);
    }
    unsafe {
        let mut dfl: libc::sigaction = std::mem::zeroed();
        dfl.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut dfl.sa_mask);
        libc::sigaction(sig, &dfl, std::ptr::null_mut());
        libc::raise(sig);
    }
}

/// RAII guard for a held named cluster lock plus its signal mask and the
/// `SIGSEGV` handler installed alongside it. Dropping it always unblocks
/// signals, restores the prior `SIGSEGV` disposition, and releases the
/// lock (best-effort — a failed `unlock` is logged, never panics, since
/// we're frequently running in a `Drop`).
pub struct ClusterLockGuard<'a> {
    stack: &'a mut dyn ClusterStack,
    name: String,
    prev_mask: libc::sigset_t,
    prev_segv: libc::sigaction,
    active_lock: *mut ActiveLock,
    delegated: bool,
}

impl<'a> Drop for ClusterLockGuard<'a> {
    fn drop(&mut self) {
        if !self.delegated {
            if let Err(e) = self.stack.unlock(&self.name) {
                log::warn!("failed to release cluster lock {}: {e}", self.name);
            }
        }
        ACTIVE_LOCK.store(std::ptr::null_mut(), Ordering::SeqCst);
        unsafe {
            drop(Box::from_raw(self.active_lock));
            libc::sigaction(libc::SIGSEGV, &self.prev_segv, std::ptr::null_mut());
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.prev_mask, std::ptr::null_mut());
        }
    }
}

/// Acquires `name` under `mode`, honouring a delegated lock from the
/// parent process and the superblock's in-progress/heartbeat bits.
///
/// Returns `Ok(None)` for `mount_local` volumes or a delegated lock
/// (nothing new was acquired, so there is nothing to release). Returns
/// `Err(TryLockFailed)` for a non-blocking attempt that lost the race;
/// callers must treat that as "fall back to the kernel-cooperating path",
/// not a hard failure.
pub fn acquire_lock<'a>(
    stack: &'a mut dyn ClusterStack,
    sb: &Superblock,
    name: &str,
    mode: LockMode,
    mount_local: bool,
) -> Ocfs2Result<Option<ClusterLockGuard<'a>>> {
    if mount_local || sb.is_local_mount() {
        return Ok(None);
    }
    if read_delegation().is_some() {
        return Ok(None);
    }

    check_incompat_for_lock(sb)?;

    let mut set = unsafe { std::mem::zeroed::<libc::sigset_t>() };
    let mut prev = unsafe { std::mem::zeroed::<libc::sigset_t>() };
    unsafe {
        libc::sigemptyset(&mut set);
        for sig in BLOCKED_SIGNALS {
            libc::sigaddset(&mut set, sig);
        }
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut prev);
    }

    let blocking = mode == LockMode::Offline;
    let acquired = match stack.lock(name, blocking) {
        Ok(acquired) => acquired,
        Err(e) => {
            unsafe {
                libc::pthread_sigmask(libc::SIG_SETMASK, &prev, std::ptr::null_mut());
            }
            return Err(e);
        }
    };
    if !acquired {
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &prev, std::ptr::null_mut());
        }
        return Err(Ocfs2Error::TryLockFailed);
    }

    let active_lock = Box::into_raw(Box::new(ActiveLock {
        stack: stack as *mut dyn ClusterStack,
        name: name.to_string(),
    }));
    ACTIVE_LOCK.store(active_lock, Ordering::SeqCst);

    let mut segv_action: libc::sigaction = unsafe { std::mem::zeroed() };
    segv_action.sa_sigaction = handle_segv as usize;
    unsafe {
        libc::sigemptyset(&mut segv_action.sa_mask);
    }
    segv_action.sa_flags = 0;
    let mut prev_segv: libc::sigaction = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigaction(libc::SIGSEGV, &segv_action, &mut prev_segv);
    }

    Ok(Some(ClusterLockGuard {
        stack,
        name: name.to_string(),
        prev_mask: prev,
        prev_segv,
        active_lock,
        delegated: false,
    }))
}

/// Sets one of the two "operation in progress" incompat bits on an
/// in-memory superblock copy. Callers must persist the superblock
/// immediately after: write ordering everywhere else goes descendants
/// before parents, superblock totals last, but the in-progress bit is
/// the one exception, written *first* so a crash mid-operation is
/// detectable.
pub fn set_in_progress(sb: &mut Superblock, bit: u32) {
    sb.feature_incompat |= bit;
}

pub fn clear_in_progress(sb: &mut Superblock, bit: u32) {
    sb.feature_incompat &= !bit;
}

pub use superblock::FsState;

#[cfg(test)]
mod test {
    use super::*;
    use crate::disk::Geometry;

    fn sample_sb(incompat: u32) -> Superblock {
        Superblock {
            major_rev_level: 2,
            minor_rev_level: 0,
            mnt_count: 0,
            state: FsState::Clean,
            errors: superblock::ErrorPolicy::Continue,
            lastcheck: 0,
            feature_compat: 0,
            feature_incompat: incompat,
            feature_ro_compat: 0,
            root_blkno: 10,
            system_dir_blkno: 5,
            first_cluster_group_blkno: 3,
            geometry: Geometry::new(12, 12).unwrap(),
            max_slots: 1,
            clusters_count: 100,
            blocks_count: 100,
            uuid: [0u8; 16],
            label: [0u8; 64],
            cluster_stack: [0u8; 16],
        }
    }

    #[test]
    fn local_mount_needs_no_lock() {
        let sb = sample_sb(feature::INCOMPAT_LOCAL_MOUNT);
        let mut stack = LocalStack;
        let guard = acquire_lock(&mut stack, &sb, "vol", LockMode::Offline, false).unwrap();
        assert!(guard.is_none());
    }

    #[test]
    fn resize_inprog_blocks_new_lock() {
        let sb = sample_sb(feature::INCOMPAT_RESIZE_INPROG);
        let mut stack = LocalStack;
        let err = acquire_lock(&mut stack, &sb, "vol", LockMode::Offline, false).unwrap_err();
        assert!(matches!(err, Ocfs2Error::ResizeInProgress));
    }

    #[derive(Debug, Default)]
    struct DenyStack;
    impl ClusterStack for DenyStack {
        fn init(&mut self) -> Ocfs2Result<()> {
            Ok(())
        }
        fn begin_group_join(&mut self, _c: &str, _r: &str) -> Ocfs2Result<()> {
            Ok(())
        }
        fn complete_group_join(&mut self, _c: &str, _r: &str, _res: i32) -> Ocfs2Result<()> {
            Ok(())
        }
        fn stop_heartbeat(&mut self) -> Ocfs2Result<()> {
            Ok(())
        }
        fn lock(&mut self, _name: &str, _blocking: bool) -> Ocfs2Result<bool> {
            Ok(false)
        }
        fn unlock(&mut self, _name: &str) -> Ocfs2Result<()> {
            Ok(())
        }
    }

    #[test]
    fn online_trylock_failure_is_not_fatal_signal() {
        let sb = sample_sb(0);
        let mut stack = DenyStack;
        let err = acquire_lock(&mut stack, &sb, "vol", LockMode::Online, false).unwrap_err();
        assert!(matches!(err, Ocfs2Error::TryLockFailed));
    }

    #[derive(Debug, Default)]
    struct GrantStack;
    impl ClusterStack for GrantStack {
        fn init(&mut self) -> Ocfs2Result<()> {
            Ok(())
        }
        fn begin_group_join(&mut self, _c: &str, _r: &str) -> Ocfs2Result<()> {
            Ok(())
        }
        fn complete_group_join(&mut self, _c: &str, _r: &str, _res: i32) -> Ocfs2Result<()> {
            Ok(())
        }
        fn stop_heartbeat(&mut self) -> Ocfs2Result<()> {
            Ok(())
        }
        fn lock(&mut self, _name: &str, _blocking: bool) -> Ocfs2Result<bool> {
            Ok(true)
        }
        fn unlock(&mut self, _name: &str) -> Ocfs2Result<()> {
            Ok(())
        }
    }

    #[test]
    fn successful_lock_installs_and_tears_down_segv_handler() {
        let sb = sample_sb(0);
        let mut stack = GrantStack;
        let guard = acquire_lock(&mut stack, &sb, "vol", LockMode::Offline, false).unwrap();
        assert!(guard.is_some());
        assert!(!ACTIVE_LOCK.load(Ordering::SeqCst).is_null());
        drop(guard);
        assert!(ACTIVE_LOCK.load(Ordering::SeqCst).is_null());
    }
}
