//! Shared session and lock registry keyed by device identity.
//!
//! Multiple driver instances addressing the same physical device must share
//! one live session instead of opening competing connections, and must take
//! turns on it. This module provides the pieces that make that sharing
//! explicit:
//!
//! - [`DeviceKey`]: the identity "this device, in this mode" that all
//!   sharing is keyed on
//! - [`DeviceLock`]: a re-entrant per-device mutual-exclusion primitive
//! - [`SessionPool`]: get-or-create storage for sessions and locks, owned by
//!   whatever composition root constructs drivers
//!
//! The pool is a cheap-clone handle; clones see the same state. There is no
//! global teardown hook: entries disappear as drivers are closed.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use tracing::debug;

use crate::error::Result;
use crate::session::Session;

// =============================================================================
// Device Identity
// =============================================================================

/// Identity of one device in one mode.
///
/// Derived from the driver-type name, the caller-supplied device id, and the
/// simulation flag. Two driver instances with an equal key resolve to the
/// same session and the same lock; instances with different keys share
/// neither. Opaque outside the framework.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct DeviceKey {
    driver: String,
    device: String,
    simulation: bool,
}

impl DeviceKey {
    pub(crate) fn new(driver: &str, device: &str, simulation: bool) -> Self {
        Self {
            driver: driver.to_string(),
            device: device.to_string(),
            simulation,
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.driver, self.device)?;
        if self.simulation {
            write!(f, ":sim")?;
        }
        Ok(())
    }
}

// =============================================================================
// Re-entrant Device Lock
// =============================================================================

struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Re-entrant mutual exclusion for one device key.
///
/// The owning thread may acquire the lock again without deadlocking, so a
/// connection-check hook or a wrapper method can call other locked methods
/// on the same driver. Waiters block until the owner's outermost guard is
/// dropped; each waiter eventually proceeds.
pub struct DeviceLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl DeviceLock {
    /// Create an unheld lock.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                owner: None,
                depth: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Block until this thread holds the lock, then return the RAII guard.
    ///
    /// Re-entrant: if the calling thread already holds the lock, the depth
    /// count is bumped and the call returns immediately.
    #[must_use = "the lock is released when the guard is dropped"]
    pub fn acquire(&self) -> DeviceLockGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    break;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    break;
                }
                Some(_) => {
                    state = self
                        .released
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        DeviceLockGuard { lock: self }
    }
}

impl Default for DeviceLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard returned by [`DeviceLock::acquire`]; releases one level on drop.
pub struct DeviceLockGuard<'a> {
    lock: &'a DeviceLock,
}

impl Drop for DeviceLockGuard<'_> {
    fn drop(&mut self) {
        let mut state = self
            .lock
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.lock.released.notify_one();
        }
    }
}

// =============================================================================
// Session Pool
// =============================================================================

#[derive(Default)]
struct PoolState {
    sessions: HashMap<DeviceKey, Arc<dyn Session>>,
    locks: HashMap<DeviceKey, Arc<DeviceLock>>,
}

/// Keyed storage for shared sessions and their locks.
///
/// One pool per process (or per test) is typical; drivers constructed
/// against the same pool and the same [`DeviceKey`] share a session. The
/// handle is cheap to clone and all clones observe the same state.
#[derive(Clone, Default)]
pub struct SessionPool {
    inner: Arc<Mutex<PoolState>>,
}

impl SessionPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the lock for `key`, creating it on first use.
    pub(crate) fn lock_for(&self, key: &DeviceKey) -> Arc<DeviceLock> {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(DeviceLock::new()))
            .clone()
    }

    /// Get the session for `key`, or create one with `factory`.
    ///
    /// The factory runs outside the pool's own mutex so that slow transport
    /// opens do not stall unrelated keys; callers hold the device lock, which
    /// excludes same-key races. A re-check on insertion keeps the map
    /// consistent regardless.
    pub(crate) fn get_or_create(
        &self,
        key: &DeviceKey,
        factory: impl FnOnce() -> Result<Arc<dyn Session>>,
    ) -> Result<Arc<dyn Session>> {
        {
            let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = state.sessions.get(key) {
                debug!("reusing existing session for {}", key);
                return Ok(existing.clone());
            }
        }

        let session = factory()?;

        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = state.sessions.get(key) {
            return Ok(existing.clone());
        }
        debug!("storing new session for {}", key);
        state.sessions.insert(key.clone(), session.clone());
        Ok(session)
    }

    /// Remove both the session and the lock for `key`.
    ///
    /// Called by `close()`; afterwards the key may legitimately be reused by
    /// a fresh driver instance.
    pub(crate) fn remove(&self, key: &DeviceKey) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.sessions.remove(key);
        state.locks.remove(key);
    }

    /// Number of live sessions in the pool.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .len()
    }

    /// Check whether the pool holds no sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
