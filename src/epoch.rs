//! Epoch-based deferred reclamation.
//!
//! Connections and operations are reachable from shared indexes (the client
//! list, a backend's pools, a connection's operation set) by threads that hold
//! no strong reference to them. A reader wraps every such traversal in a
//! [`Reclaimer::join`]/guard-drop pair; teardown paths unlink the object from
//! all indexes first, then hand its disposer to [`Reclaimer::defer`]. The
//! disposer only runs once every thread that might have observed the object
//! has left its epoch.
//!
//! A thread that joins and never leaves stalls reclamation forever. That is an
//! accepted limitation of the scheme, inherited from the epoch design, and
//! shows up as a growing garbage queue rather than a crash.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

/// Sentinel for a participant slot that is not inside any epoch.
const INACTIVE: u64 = u64::MAX;

type Disposer = Box<dyn FnOnce() + Send>;

struct Garbage {
    epoch: u64,
    disposer: Disposer,
}

#[derive(Default)]
struct Participants {
    /// One slot per concurrent joiner, `INACTIVE` when free. Slots are reused
    /// but never removed, so the vector stays as small as the peak join count.
    slots: Vec<u64>,
}

pub struct Reclaimer {
    global: AtomicU64,
    participants: Mutex<Participants>,
    garbage: Mutex<VecDeque<Garbage>>,
    pending: AtomicUsize,
}

impl Default for Reclaimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Reclaimer {
    pub fn new() -> Reclaimer {
        Reclaimer {
            global: AtomicU64::new(0),
            participants: Mutex::new(Participants::default()),
            garbage: Mutex::new(VecDeque::new()),
            pending: AtomicUsize::new(0),
        }
    }

    /// Enter the current epoch. Shared indexes may only be traversed while
    /// the returned guard is alive.
    pub fn join(self: &Arc<Self>) -> EpochGuard {
        let epoch = self.global.load(Ordering::SeqCst);
        let mut participants = self.participants.lock();
        let slot = match participants.slots.iter().position(|&e| e == INACTIVE) {
            Some(slot) => {
                participants.slots[slot] = epoch;
                slot
            }
            None => {
                participants.slots.push(epoch);
                participants.slots.len() - 1
            }
        };
        EpochGuard {
            reclaimer: self.clone(),
            slot,
        }
    }

    /// Schedule `disposer` to run once no thread can still observe the
    /// object it tears down. The caller must already have unlinked the object
    /// from every shared index.
    pub fn defer(&self, disposer: Disposer) {
        let epoch = self.global.fetch_add(1, Ordering::SeqCst);
        self.garbage.lock().push_back(Garbage { epoch, disposer });
        self.pending.fetch_add(1, Ordering::Relaxed);
        self.collect();
    }

    /// Disposers queued but not yet safe to run.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Run every disposer whose epoch is older than all active joiners.
    pub fn collect(&self) {
        let horizon = {
            let participants = self.participants.lock();
            participants
                .slots
                .iter()
                .copied()
                .filter(|&e| e != INACTIVE)
                .min()
        };

        let mut ripe = Vec::new();
        {
            let mut garbage = self.garbage.lock();
            while let Some(front) = garbage.front() {
                let safe = match horizon {
                    // a joiner at epoch `e` may observe anything deferred at
                    // `e` or later, so only strictly older garbage is ripe
                    Some(min_active) => front.epoch < min_active,
                    None => true,
                };
                if !safe {
                    break;
                }
                ripe.push(garbage.pop_front().map(|g| g.disposer));
            }
        }

        // run outside both locks, a disposer may itself call defer()
        for disposer in ripe.into_iter().flatten() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            disposer();
        }
    }

    fn leave(&self, slot: usize) {
        {
            let mut participants = self.participants.lock();
            participants.slots[slot] = INACTIVE;
        }
        self.collect();
    }
}

/// Proof of epoch membership, returned by [`Reclaimer::join`].
pub struct EpochGuard {
    reclaimer: Arc<Reclaimer>,
    slot: usize,
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        self.reclaimer.leave(self.slot);
    }
}

/// Logical reference count layered over `Arc`.
///
/// `Arc` keeps the memory alive; this counter tracks whether the object is
/// still *usable*. `acquire` fails once the count has reached zero, which is
/// how a reader that found a dying connection through a shared index learns it
/// must not touch it.
pub struct RefCount(AtomicUsize);

impl RefCount {
    pub fn new(count: usize) -> RefCount {
        RefCount(AtomicUsize::new(count))
    }

    /// Increment unless the object is already logically dead.
    pub fn acquire(&self) -> bool {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Decrement; returns true on the transition to zero, at which point the
    /// caller owns the teardown and must hand it to [`Reclaimer::defer`].
    pub fn release(&self) -> bool {
        let previous = self.0.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "refcount released below zero");
        previous == 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[test]
    fn defer_without_joiners_runs_immediately() {
        let reclaimer = Arc::new(Reclaimer::new());
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        reclaimer.defer(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(reclaimer.pending(), 0);
    }

    #[test]
    fn joiner_blocks_reclamation_until_it_leaves() {
        let reclaimer = Arc::new(Reclaimer::new());
        let guard = reclaimer.join();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        reclaimer.defer(Box::new(move || flag.store(true, Ordering::SeqCst)));

        // the guard joined before the deferral, so the disposer must wait
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(reclaimer.pending(), 1);

        drop(guard);
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(reclaimer.pending(), 0);
    }

    #[test]
    fn late_joiner_does_not_block_older_garbage() {
        let reclaimer = Arc::new(Reclaimer::new());
        let early = reclaimer.join();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        reclaimer.defer(Box::new(move || flag.store(true, Ordering::SeqCst)));

        // joins after the deferral, cannot have observed the object
        let late = reclaimer.join();
        drop(early);
        assert!(ran.load(Ordering::SeqCst));
        drop(late);
    }

    #[test]
    fn disposers_run_oldest_first() {
        let reclaimer = Arc::new(Reclaimer::new());
        let guard = reclaimer.join();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            reclaimer.defer(Box::new(move || order.lock().push(i)));
        }
        drop(guard);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn acquire_fails_once_released_to_zero() {
        let count = RefCount::new(1);
        assert!(count.acquire());
        assert!(!count.release());
        assert!(count.release());
        assert!(!count.acquire());
    }
}
