//! Named reader/writer lock with bounded waits

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, VaultError};

/// What holds the write side of an [`IndexLock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockHolder {
    Rebuild,
    Writer,
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockHolder::Rebuild => f.write_str("rebuild"),
            LockHolder::Writer => f.write_str("writer"),
        }
    }
}

pub struct IndexLock<T> {
    name: &'static str,
    timeout: Duration,
    inner: RwLock<T>,
    holder: Mutex<Option<LockHolder>>,
}

impl<T> IndexLock<T> {
    pub fn new(name: &'static str, value: T, timeout: Duration) -> Self {
        Self {
            name,
            timeout,
            inner: RwLock::new(value),
            holder: Mutex::new(None),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, T>> {
        self.inner
            .try_read_for(self.timeout)
            .ok_or_else(|| self.contended())
    }

    pub fn write(&self, holder: LockHolder) -> Result<IndexWriteGuard<'_, T>> {
        let guard = self
            .inner
            .try_write_for(self.timeout)
            .ok_or_else(|| self.contended())?;
        *self.holder.lock() = Some(holder);
        Ok(IndexWriteGuard {
            guard,
            holder: &self.holder,
        })
    }

    fn contended(&self) -> VaultError {
        // Readers are not tracked; contention with them reports as Writer.
        let holder = (*self.holder.lock()).unwrap_or(LockHolder::Writer);
        warn!(lock = self.name, %holder, waited = ?self.timeout, "lock wait timed out");
        VaultError::Locked {
            lock: self.name,
            holder,
            waited: self.timeout,
        }
    }
}

/// Write access that clears the recorded holder on release
pub struct IndexWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    holder: &'a Mutex<Option<LockHolder>>,
}

impl<T> Deref for IndexWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IndexWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IndexWriteGuard<'_, T> {
    fn drop(&mut self) {
        *self.holder.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_times_out_behind_rebuild() {
        let lock = IndexLock::new("search-index", 0u32, Duration::from_millis(20));
        let _guard = lock.write(LockHolder::Rebuild).unwrap();

        match lock.read() {
            Err(VaultError::Locked { lock, holder, waited }) => {
                assert_eq!(lock, "search-index");
                assert_eq!(holder, LockHolder::Rebuild);
                assert_eq!(waited, Duration::from_millis(20));
            }
            other => panic!("expected Locked, got {:?}", other.map(|g| *g)),
        };
    }

    #[test]
    fn test_holder_cleared_on_release() {
        let lock = IndexLock::new("search-index", 0u32, Duration::from_millis(20));
        {
            let mut guard = lock.write(LockHolder::Writer).unwrap();
            *guard += 1;
        }
        assert_eq!(*lock.read().unwrap(), 1);
        assert!(lock.holder.lock().is_none());
    }

    #[test]
    fn test_concurrent_readers() {
        let lock = IndexLock::new("search-index", 7u32, Duration::from_millis(20));
        let a = lock.read().unwrap();
        let b = lock.read().unwrap();
        assert_eq!(*a + *b, 14);
    }
}
