use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};

use crate::error::{LibraryError, Result};

/// Serializes conflict detection and the write that follows it per target
/// directory, so two callers cannot both observe a free name and then collide.
///
/// A held directory also covers everything below it: renaming `A` and
/// writing into `A/Sub` never run at the same time.
#[derive(Default)]
pub struct PathLocks {
    held: Mutex<BTreeSet<PathBuf>>,
    released: Condvar,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until no held key overlaps any of `keys`, then takes all of
    /// them at once.
    pub fn acquire(&self, keys: &[PathBuf]) -> Result<PathGuard<'_>> {
        let keys: BTreeSet<PathBuf> = keys.iter().cloned().collect();
        let mut held = self.held.lock().map_err(|_| LibraryError::LockPoisoned)?;
        while keys
            .iter()
            .any(|key| held.iter().any(|other| overlaps(key, other)))
        {
            held = self
                .released
                .wait(held)
                .map_err(|_| LibraryError::LockPoisoned)?;
        }
        held.extend(keys.iter().cloned());
        Ok(PathGuard { locks: self, keys })
    }
}

/// Same path, or one is an ancestor of the other (compared by component).
fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

pub struct PathGuard<'a> {
    locks: &'a PathLocks,
    keys: BTreeSet<PathBuf>,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        // a poisoned set still has to drop our keys or waiters hang forever
        let mut held = match self.locks.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        for key in &self.keys {
            held.remove(key);
        }
        drop(held);
        self.locks.released.notify_all();
    }
}
