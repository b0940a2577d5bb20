//! Page-granularity strict two-phase locking.
//!
//! Each page has a lock entry owning its own mutex and condition
//! variable; waiters sleep on the entry's condvar in bounded slices and
//! re-check on every wake. A request that has waited longer than the
//! total budget aborts with a suspected deadlock, unless it is the
//! front of the entry's FIFO waiter queue: the longest-waiting request
//! keeps waiting, so at least one contender survives a pile-up. This is
//! a timeout heuristic, not a wait-for-graph detector; it can abort
//! transactions that were not actually deadlocked.

use crate::error::{DbError, DbResult};
use crate::page::PageId;
use crate::transaction::{Permission, TransactionId};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Total time one acquire may spend blocked before it is presumed
/// deadlocked.
const DEFAULT_WAIT_BUDGET: Duration = Duration::from_millis(1000);
/// Base length of one sleep slice between re-checks.
const WAIT_SLICE: Duration = Duration::from_millis(200);
/// Upper bound of the random jitter added to each slice.
const WAIT_JITTER_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl From<Permission> for LockMode {
    fn from(perm: Permission) -> Self {
        match perm {
            Permission::ReadOnly => LockMode::Shared,
            Permission::ReadWrite => LockMode::Exclusive,
        }
    }
}

#[derive(Debug, Default)]
struct LockState {
    sharers: HashSet<TransactionId>,
    exclusive: Option<TransactionId>,
    /// Arrival order of blocked requests; the front is the only request
    /// exempt from the wait budget.
    waiters: VecDeque<TransactionId>,
}

impl LockState {
    /// Does `tid` already hold a lock at least as strong as `mode`?
    fn holds_sufficient(&self, tid: TransactionId, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.sharers.contains(&tid) || self.exclusive == Some(tid),
            LockMode::Exclusive => self.exclusive == Some(tid),
        }
    }

    /// Can `mode` be granted to `tid` right now?
    fn can_grant(&self, tid: TransactionId, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.exclusive.is_none(),
            LockMode::Exclusive => {
                self.exclusive.is_none()
                    && (self.sharers.is_empty()
                        || (self.sharers.len() == 1 && self.sharers.contains(&tid)))
            }
        }
    }

    fn grant(&mut self, tid: TransactionId, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                self.sharers.insert(tid);
            }
            LockMode::Exclusive => {
                // Upgrade path: the sole sharer becomes the exclusive holder.
                self.sharers.remove(&tid);
                self.exclusive = Some(tid);
            }
        }
    }
}

#[derive(Debug, Default)]
struct LockEntry {
    state: Mutex<LockState>,
    cvar: Condvar,
}

/// Grants and revokes page locks for transactions. One entry per page,
/// created on first contact and kept for the life of the manager.
#[derive(Debug)]
pub struct LockManager {
    table: Mutex<HashMap<PageId, Arc<LockEntry>>>,
    wait_budget: Duration,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        LockManager {
            table: Mutex::new(HashMap::new()),
            wait_budget: DEFAULT_WAIT_BUDGET,
        }
    }

    /// A manager with a shorter deadlock budget, for tests that provoke
    /// aborts without waiting out the full second.
    pub fn with_wait_budget(wait_budget: Duration) -> Self {
        LockManager {
            table: Mutex::new(HashMap::new()),
            wait_budget,
        }
    }

    fn entry(&self, pid: PageId) -> Arc<LockEntry> {
        self.table.lock().entry(pid).or_default().clone()
    }

    /// Acquires `mode` on `pid` for `tid`, blocking up to the wait budget.
    /// Idempotent when the transaction already holds sufficient strength.
    /// Returns `TransactionAborted` on a suspected deadlock.
    pub fn acquire(&self, tid: TransactionId, pid: PageId, mode: LockMode) -> DbResult<()> {
        let entry = self.entry(pid);
        let mut state = entry.state.lock();

        if state.holds_sufficient(tid, mode) {
            return Ok(());
        }

        let start = Instant::now();
        loop {
            if state.can_grant(tid, mode) {
                state.grant(tid, mode);
                remove_waiter(&mut state.waiters, tid);
                return Ok(());
            }

            if !state.waiters.contains(&tid) {
                state.waiters.push_back(tid);
            }

            let slice = WAIT_SLICE
                + Duration::from_millis(rand::thread_rng().gen_range(0..=WAIT_JITTER_MS));
            let _ = entry.cvar.wait_for(&mut state, slice);

            if start.elapsed() > self.wait_budget && state.waiters.front() != Some(&tid) {
                remove_waiter(&mut state.waiters, tid);
                crate::strata_debug_log!(
                    "[lock] tid {} presumed deadlocked on {:?} after {:?}",
                    tid.id(),
                    pid,
                    start.elapsed()
                );
                return Err(DbError::TransactionAborted(tid));
            }
        }
    }

    /// Drops `tid`'s lock on `pid` and wakes every waiter on that page.
    /// Fails if the transaction holds no lock there.
    pub fn release(&self, tid: TransactionId, pid: PageId) -> DbResult<()> {
        let entry = self.entry(pid);
        let mut state = entry.state.lock();
        let held = state.sharers.remove(&tid) || {
            if state.exclusive == Some(tid) {
                state.exclusive = None;
                true
            } else {
                false
            }
        };
        if !held {
            return Err(DbError::LockNotHeld(tid, pid));
        }
        entry.cvar.notify_all();
        Ok(())
    }

    /// Releases every lock `tid` holds, shared and exclusive, and drops
    /// any waiter registrations it left behind.
    pub fn release_all(&self, tid: TransactionId) {
        let entries: Vec<Arc<LockEntry>> = self.table.lock().values().cloned().collect();
        for entry in entries {
            let mut state = entry.state.lock();
            let mut changed = state.sharers.remove(&tid);
            if state.exclusive == Some(tid) {
                state.exclusive = None;
                changed = true;
            }
            remove_waiter(&mut state.waiters, tid);
            if changed {
                entry.cvar.notify_all();
            }
        }
    }

    /// Pure query: does `tid` hold any lock on `pid`?
    pub fn holds(&self, tid: TransactionId, pid: PageId) -> bool {
        let table = self.table.lock();
        match table.get(&pid) {
            Some(entry) => {
                let state = entry.state.lock();
                state.sharers.contains(&tid) || state.exclusive == Some(tid)
            }
            None => false,
        }
    }
}

fn remove_waiter(waiters: &mut VecDeque<TransactionId>, tid: TransactionId) {
    waiters.retain(|w| *w != tid);
}
