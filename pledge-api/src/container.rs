//! Weak registry of queued jobs, used to cancel them by id.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::promise::PromiseId;
use crate::runner::Job;
use crate::sync::lock;

/// Maps promise ids to the jobs a runner still holds.
///
/// Entries are weak: once the runner drops a job the entry is dead and is
/// treated as absent.
#[derive(Default)]
pub struct PromiseContainer {
    entries: Mutex<HashMap<PromiseId, Weak<dyn Job>>>,
}

impl PromiseContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, job: &Arc<dyn Job>) {
        lock(&self.entries).insert(job.id(), Arc::downgrade(job));
    }

    /// Remove an entry. Returns whether it was present.
    pub fn remove(&self, id: &PromiseId) -> bool {
        lock(&self.entries).remove(id).is_some()
    }

    pub fn get(&self, id: &PromiseId) -> Option<Arc<dyn Job>> {
        lock(&self.entries).get(id).and_then(Weak::upgrade)
    }

    pub fn contains(&self, id: &PromiseId) -> bool {
        self.get(id).is_some()
    }

    /// Mark the job canceled if it is still held. Returns whether it was found.
    ///
    /// The flag is set under the registry lock, so a runner that removes the
    /// entry before checking `is_canceled` either sees the flag or makes this
    /// return `false`.
    pub fn cancel(&self, id: &PromiseId) -> bool {
        let entries = lock(&self.entries);
        match entries.get(id).and_then(Weak::upgrade) {
            Some(job) => {
                job.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        lock(&self.entries)
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop dead entries, returning how many were removed.
    pub fn prune(&self) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| entry.strong_count() > 0);
        before - entries.len()
    }
}

impl fmt::Debug for PromiseContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseContainer")
            .field("entries", &lock(&self.entries).len())
            .finish()
    }
}
