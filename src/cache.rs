//! Incremental cache keyed by input fingerprints.
//!
//! Every task owns a partition of the cache. An entry means "this input
//! was seen and processed by a successful pass"; its absence means the
//! input has to be reprocessed. Misses are never errors. Partitions are
//! cleared wholesale, either explicitly at the start of a clean build or
//! by the watch subsystem when it detects a structural change.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::hash::Fingerprint;

#[derive(Debug, Default)]
pub struct FingerprintCache {
    partitions: RwLock<HashMap<Box<str>, HashSet<Fingerprint>>>,
}

impl FingerprintCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `input` is already known to the `task` partition.
    pub fn has(&self, task: &str, input: &Fingerprint) -> bool {
        let partitions = self.partitions.read().unwrap();
        partitions
            .get(task)
            .is_some_and(|entries| entries.contains(input))
    }

    /// Mark `input` as processed under the `task` partition.
    pub fn remember(&self, task: &str, input: Fingerprint) {
        let mut partitions = self.partitions.write().unwrap();
        partitions.entry(task.into()).or_default().insert(input);
    }

    /// Discard every entry stored under `task`.
    pub fn invalidate(&self, task: &str) {
        let mut partitions = self.partitions.write().unwrap();
        partitions.remove(task);
    }

    /// Discard everything.
    pub fn invalidate_all(&self) {
        let mut partitions = self.partitions.write().unwrap();
        partitions.clear();
    }

    /// Number of entries stored under `task`.
    pub fn len(&self, task: &str) -> usize {
        let partitions = self.partitions.read().unwrap();
        partitions.get(task).map_or(0, HashSet::len)
    }
}
