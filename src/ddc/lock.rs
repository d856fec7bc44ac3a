//! Process-wide open-display lock.
//!
//! A bus must be accessed by at most one thread at a time. Opening acquires
//! the per-bus lock; closing (dropping the handle) releases it. `open` can
//! either fail fast (`Locked`) or block until free (`wait`).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;

use super::error::DdcError;

/// Opaque per-bus identifier. The engine only ever uses this as a map key
/// and in log strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusId(pub u32);

/// Identifies a single opened handle for the valid-handles registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

enum LockState {
    Free,
    Held(ThreadId),
}

struct Registry {
    locks: Mutex<HashMap<BusId, LockState>>,
    condvar: Condvar,
    valid_handles: Mutex<HashSet<HandleId>>,
}

impl Registry {
    fn new() -> Self {
        Registry {
            locks: Mutex::new(HashMap::new()),
            condvar: Condvar::new(),
            valid_handles: Mutex::new(HashSet::new()),
        }
    }
}

/// Process-wide registry of per-bus locks and live handles.
pub struct DisplayLock {
    registry: Registry,
}

impl DisplayLock {
    pub fn new() -> Self {
        DisplayLock {
            registry: Registry::new(),
        }
    }

    /// Acquire the lock for `bus`. Without `wait`, a busy bus fails
    /// immediately with [`DdcError::Locked`]; with `wait`, blocks until
    /// free. A second open of the same bus by the same thread fails with
    /// [`DdcError::AlreadyOpen`].
    pub fn open(&self, bus: BusId, wait: bool) -> Result<DisplayGuard<'_>, DdcError> {
        let this_thread = std::thread::current().id();
        let mut locks = self.registry.locks.lock().unwrap();
        loop {
            match locks.get(&bus) {
                Some(LockState::Held(holder)) if *holder == this_thread => {
                    return Err(DdcError::AlreadyOpen);
                }
                Some(LockState::Held(_)) => {
                    if !wait {
                        return Err(DdcError::Locked);
                    }
                    log::debug!("bus {:?} busy, waiting for release", bus);
                    locks = self.registry.condvar.wait(locks).unwrap();
                    continue;
                }
                Some(LockState::Free) | None => {
                    locks.insert(bus, LockState::Held(this_thread));
                    break;
                }
            }
        }
        drop(locks);

        let handle_id = HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::SeqCst));
        self.registry.valid_handles.lock().unwrap().insert(handle_id);

        Ok(DisplayGuard {
            registry: &self.registry,
            bus,
            handle_id,
        })
    }

    /// `true` if `handle_id` refers to a handle that has not yet been
    /// released — used to reject use of a handle after close
    /// ([`DdcError::InvalidOperation`]).
    pub fn is_valid(&self, handle_id: HandleId) -> bool {
        self.registry.valid_handles.lock().unwrap().contains(&handle_id)
    }

    /// Force `handle_id` out of the valid-handle registry, simulating a
    /// bus closed out from under a caller still holding a copy of its
    /// guard. Test-only: normal callers can only invalidate a handle by
    /// dropping its `DisplayGuard`.
    #[cfg(test)]
    pub(crate) fn force_invalidate(&self, handle_id: HandleId) {
        self.registry.valid_handles.lock().unwrap().remove(&handle_id);
    }
}

impl Default for DisplayLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard representing an open display bus. Releasing the bus lock and
/// invalidating the handle both happen on drop, so ordinary thread
/// abandonment (panics, early return) cannot leak the lock.
pub struct DisplayGuard<'a> {
    registry: &'a Registry,
    bus: BusId,
    handle_id: HandleId,
}

impl<'a> DisplayGuard<'a> {
    pub fn bus(&self) -> BusId {
        self.bus
    }

    pub fn handle_id(&self) -> HandleId {
        self.handle_id
    }

    pub fn is_valid(&self) -> bool {
        self.registry.valid_handles.lock().unwrap().contains(&self.handle_id)
    }
}

impl<'a> Drop for DisplayGuard<'a> {
    fn drop(&mut self) {
        self.registry.valid_handles.lock().unwrap().remove(&self.handle_id);
        let mut locks = self.registry.locks.lock().unwrap();
        locks.insert(self.bus, LockState::Free);
        drop(locks);
        self.registry.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn second_open_same_thread_fails_already_open() {
        let lock = DisplayLock::new();
        let bus = BusId(1);
        let _guard = lock.open(bus, false).unwrap();
        let err = lock.open(bus, false).unwrap_err();
        assert_eq!(err, DdcError::AlreadyOpen);
    }

    #[test]
    fn busy_bus_without_wait_fails_locked() {
        let lock = Arc::new(DisplayLock::new());
        let bus = BusId(2);
        let guard = lock.open(bus, false).unwrap();

        let lock2 = Arc::clone(&lock);
        let handle = std::thread::spawn(move || lock2.open(bus, false).map(|_| ()));
        let result = handle.join().unwrap();
        assert_eq!(result.unwrap_err(), DdcError::Locked);
        drop(guard);
    }

    #[test]
    fn waiting_open_unblocks_after_release() {
        let lock = Arc::new(DisplayLock::new());
        let bus = BusId(3);
        let guard = lock.open(bus, false).unwrap();

        let lock2 = Arc::clone(&lock);
        let waiter = std::thread::spawn(move || {
            let _g = lock2.open(bus, true).unwrap();
        });

        std::thread::sleep(Duration::from_millis(20));
        drop(guard);
        waiter.join().unwrap();
    }

    #[test]
    fn dropped_handle_is_invalidated() {
        let lock = DisplayLock::new();
        let bus = BusId(4);
        let guard = lock.open(bus, false).unwrap();
        let id = guard.handle_id();
        assert!(lock.is_valid(id));
        drop(guard);
        assert!(!lock.is_valid(id));
    }
}
