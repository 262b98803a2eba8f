//! [`ReentrantLock`] — fair, timed, reentrant mutex with owner tracking.
//!
//! # Design
//!
//! The lock state is modelled explicitly rather than wrapping a platform
//! reentrant mutex, so misuse can be detected and reported instead of
//! corrupting the lock:
//!
//! ```text
//!   LockState
//!   ├── owner       Option<thread id + name>
//!   ├── holds       reentrant hold count of the owner
//!   └── queue       FIFO tickets of waiting threads
//! ```
//!
//! A waiter may take the lock only when it is free *and* its ticket is at the
//! head of the queue, which makes acquisition first-come first-served. A
//! waiter that times out removes its ticket and wakes the others so the next
//! ticket can advance.
//!
//! Releasing a lock the caller does not own logs a warning with a captured
//! backtrace and otherwise does nothing. It is a programming error, and
//! raising it would hide whatever failure triggered the cleanup path.

use std::backtrace::Backtrace;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

// ---

use parking_lot::{Condvar, Mutex};

// ---

use brokerlink_domain::{BrokerError, Result};

// ---------------------------------------------------------------------------
// LockState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Owner {
    // ---
    id: ThreadId,
    name: String,
}

impl Owner {
    fn current() -> Self {
        // ---
        let t = thread::current();
        Self {
            id: t.id(),
            name: t.name().map_or_else(|| format!("{:?}", t.id()), str::to_string),
        }
    }
}

#[derive(Debug, Default)]
struct LockState {
    // ---
    owner: Option<Owner>,
    holds: u32,
    queue: VecDeque<u64>,
    next_ticket: u64,
}

// ---------------------------------------------------------------------------
// ReentrantLock
// ---------------------------------------------------------------------------

pub struct ReentrantLock {
    // ---
    /// Shown in timeout errors and misuse warnings.
    name: String,
    state: Mutex<LockState>,
    cond: Condvar,
}

// ---

impl ReentrantLock {
    // ---
    pub fn new(name: impl Into<String>) -> Self {
        // ---
        Self {
            name: name.into(),
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
        }
    }

    /// Acquire and return a guard that releases on drop.
    ///
    /// `None` waits indefinitely. On timeout returns
    /// [`BrokerError::LockTimeout`].
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<LockGuard<'_>> {
        // ---
        self.acquire_raw(timeout)?;
        Ok(LockGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Acquire without a guard. Every success must be paired with
    /// [`ReentrantLock::release`] on the same thread.
    pub fn acquire_raw(&self, timeout: Option<Duration>) -> Result<()> {
        // ---
        let me = thread::current().id();
        let mut st = self.state.lock();

        if st.owner.as_ref().is_some_and(|o| o.id == me) {
            st.holds += 1;
            return Ok(());
        }

        let ticket = st.next_ticket;
        st.next_ticket += 1;
        st.queue.push_back(ticket);
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // ---
            if st.owner.is_none() && st.queue.front() == Some(&ticket) {
                st.queue.pop_front();
                st.owner = Some(Owner::current());
                st.holds = 1;
                return Ok(());
            }

            match deadline {
                None => self.cond.wait(&mut st),
                Some(d) => {
                    if self.cond.wait_until(&mut st, d).timed_out() {
                        // One last look: the lock may have been handed over
                        // just as the wait expired.
                        if st.owner.is_none() && st.queue.front() == Some(&ticket) {
                            continue;
                        }
                        st.queue.retain(|t| *t != ticket);
                        drop(st);
                        self.cond.notify_all();
                        tracing::debug!(lock = %self.name, ?timeout, "lock wait timed out");
                        return Err(BrokerError::LockTimeout {
                            resource: self.name.clone(),
                            timeout: timeout.unwrap_or_default(),
                        });
                    }
                }
            }
        }
    }

    /// Release one hold. Misuse is logged, never raised.
    pub fn release(&self) {
        // ---
        let me = thread::current().id();
        let mut st = self.state.lock();

        let owner = st.owner.clone();
        match owner {
            Some(owner) if owner.id == me => {
                st.holds -= 1;
                if st.holds == 0 {
                    st.owner = None;
                    drop(st);
                    self.cond.notify_all();
                }
            }
            Some(owner) => {
                let owner = owner.name;
                drop(st);
                tracing::warn!(
                    lock = %self.name,
                    %owner,
                    caller = %Owner::current().name,
                    "release by a thread that does not own the lock\n{}",
                    Backtrace::force_capture()
                );
            }
            None => {
                drop(st);
                tracing::warn!(
                    lock = %self.name,
                    "release of a lock that is not held\n{}",
                    Backtrace::force_capture()
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        // ---
        let me = thread::current().id();
        self.state.lock().owner.as_ref().is_some_and(|o| o.id == me)
    }

    /// Name of the owning thread, if any.
    pub fn owner(&self) -> Option<String> {
        self.state.lock().owner.as_ref().map(|o| o.name.clone())
    }

    /// Holds of the current owner; zero when unlocked.
    pub fn hold_count(&self) -> u32 {
        self.state.lock().holds
    }

    /// Threads currently waiting to acquire.
    pub fn queued_threads(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// LockGuard
// ---------------------------------------------------------------------------

/// Releases one hold when dropped. Not `Send`: a hold belongs to the thread
/// that took it.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    // ---
    lock: &'a ReentrantLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::ReentrantLock;

    /// N threads hammering one lock: never more than one owner inside the
    /// critical section, and acquisitions balance releases at quiescence.
    #[test]
    fn at_most_one_owner_under_contention() {
        // ---
        const THREADS: usize = 8;
        const ROUNDS: usize = 200;

        let lock = Arc::new(ReentrantLock::new("contended"));
        let inside = Arc::new(AtomicUsize::new(0));
        let acquired = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let (lock, inside, acquired, released, barrier) = (
                    lock.clone(),
                    inside.clone(),
                    acquired.clone(),
                    released.clone(),
                    barrier.clone(),
                );
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..ROUNDS {
                        let guard = lock.acquire(Some(Duration::from_secs(10))).unwrap();
                        acquired.fetch_add(1, Ordering::SeqCst);
                        let n = inside.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(n, 0, "two owners inside the critical section");
                        inside.fetch_sub(1, Ordering::SeqCst);
                        drop(guard);
                        released.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(acquired.load(Ordering::SeqCst), THREADS * ROUNDS);
        assert_eq!(acquired.load(Ordering::SeqCst), released.load(Ordering::SeqCst));
        assert!(!lock.is_locked());
        assert_eq!(lock.queued_threads(), 0);
    }

    /// A thread holding the lock twice must release twice before anyone
    /// else gets it.
    #[test]
    fn reentrant_hold_must_fully_unwind() {
        // ---
        let lock = Arc::new(ReentrantLock::new("reentrant"));
        lock.acquire_raw(None).unwrap();
        lock.acquire_raw(None).unwrap();
        assert_eq!(lock.hold_count(), 2);

        let other = {
            let lock = lock.clone();
            thread::spawn(move || lock.acquire_raw(Some(Duration::from_millis(100))).is_ok())
        };
        assert!(!other.join().unwrap(), "other thread got a lock still held twice");

        lock.release();
        assert!(lock.is_held_by_current_thread(), "one release must not hand over");

        let other = {
            let lock = lock.clone();
            thread::spawn(move || lock.acquire_raw(Some(Duration::from_millis(100))).is_ok())
        };
        assert!(!other.join().unwrap());

        lock.release();
        assert!(!lock.is_locked());

        let other = {
            let lock = lock.clone();
            thread::spawn(move || {
                let ok = lock.acquire_raw(Some(Duration::from_millis(500))).is_ok();
                lock.release();
                ok
            })
        };
        assert!(other.join().unwrap(), "fully released lock must be available");
    }

    #[test]
    fn timeout_is_contention_and_leaves_no_ticket() {
        // ---
        let lock = Arc::new(ReentrantLock::new("busy"));
        let _held = lock.acquire(None).unwrap();

        let waiter = {
            let lock = lock.clone();
            thread::spawn(move || lock.acquire_raw(Some(Duration::from_millis(50))))
        };
        let err = waiter.join().unwrap().unwrap_err();
        assert!(err.is_contention(), "got {err}");
        assert_eq!(lock.queued_threads(), 0);
    }

    /// Release without ownership is logged, never corrupts the state.
    #[test]
    fn foreign_release_is_ignored() {
        // ---
        let lock = Arc::new(ReentrantLock::new("owned"));
        lock.release();
        assert!(!lock.is_locked());

        let _held = lock.acquire(None).unwrap();
        let intruder = {
            let lock = lock.clone();
            thread::spawn(move || lock.release())
        };
        intruder.join().unwrap();

        assert!(lock.is_held_by_current_thread());
        assert_eq!(lock.hold_count(), 1);
    }

    /// Waiters are served in arrival order.
    #[test]
    fn waiters_acquire_in_fifo_order() {
        // ---
        let lock = Arc::new(ReentrantLock::new("fifo"));
        let order = Arc::new(Mutex::new(Vec::new()));
        let guard = lock.acquire(None).unwrap();

        let mut waiters = Vec::new();
        for i in 0..4 {
            let (waiter_lock, order) = (lock.clone(), order.clone());
            waiters.push(thread::spawn(move || {
                let _g = waiter_lock.acquire(None).unwrap();
                order.lock().push(i);
            }));
            // Let each waiter enqueue before the next one starts.
            while lock.queued_threads() < i + 1 {
                thread::yield_now();
            }
        }

        drop(guard);
        for w in waiters {
            w.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }
}
