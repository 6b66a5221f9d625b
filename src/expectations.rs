//! Pod expectations
//!
//! The pod cache lags behind a successful create or delete call. Before
//! creating or deleting a role pod the reconciler raises an expectation for
//! the claim's key; the pod watch lowers it once the change shows up in the
//! cache. While anything is outstanding no further pods are created for
//! that key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::annotations::ObjectKey;

/// Outstanding expectations older than this count as satisfied, so a lost
/// watch event cannot wedge a claim forever.
pub const EXPECTATIONS_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct Expectation {
    adds: AtomicI64,
    deletes: AtomicI64,
    armed_at: Instant,
}

impl Expectation {
    fn new(adds: i64, deletes: i64) -> Self {
        Self {
            adds: AtomicI64::new(adds),
            deletes: AtomicI64::new(deletes),
            armed_at: Instant::now(),
        }
    }

    fn fulfilled(&self) -> bool {
        self.adds.load(Ordering::SeqCst) <= 0 && self.deletes.load(Ordering::SeqCst) <= 0
    }
}

/// Per-key expectation records, safe to share across workers
#[derive(Debug)]
pub struct PodExpectations {
    records: Mutex<HashMap<ObjectKey, Arc<Expectation>>>,
    ttl: Duration,
}

impl Default for PodExpectations {
    fn default() -> Self {
        Self::with_ttl(EXPECTATIONS_TTL)
    }
}

impl PodExpectations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ObjectKey, Arc<Expectation>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, key: &ObjectKey) -> Option<Arc<Expectation>> {
        self.records().get(key).cloned()
    }

    /// Re-arm `key` to a fresh baseline
    pub fn set_expectations(&self, key: &ObjectKey, adds: i64, deletes: i64) {
        debug!(claim = %key, adds, deletes, "Setting expectations");
        self.records()
            .insert(key.clone(), Arc::new(Expectation::new(adds, deletes)));
    }

    /// Add to the outstanding counts of `key`
    pub fn raise_expectations(&self, key: &ObjectKey, adds: i64, deletes: i64) {
        let record = self
            .records()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Expectation::new(0, 0)))
            .clone();
        record.adds.fetch_add(adds, Ordering::SeqCst);
        record.deletes.fetch_add(deletes, Ordering::SeqCst);
        debug!(claim = %key, adds, deletes, "Raised expectations");
    }

    /// One expected creation for `key` was observed (or abandoned)
    pub fn creation_observed(&self, key: &ObjectKey) {
        if let Some(record) = self.get(key) {
            record.adds.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// One expected deletion for `key` was observed (or abandoned)
    pub fn deletion_observed(&self, key: &ObjectKey) {
        if let Some(record) = self.get(key) {
            record.deletes.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// True when nothing is outstanding for `key`, none was ever raised, or
    /// the record outlived the TTL.
    pub fn satisfied_expectations(&self, key: &ObjectKey) -> bool {
        match self.get(key) {
            None => true,
            Some(record) if record.fulfilled() => true,
            Some(record) if record.armed_at.elapsed() > self.ttl => {
                debug!(claim = %key, "Expectations expired");
                true
            }
            Some(_) => false,
        }
    }

    pub fn delete_expectations(&self, key: &ObjectKey) {
        self.records().remove(key);
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("ns", name)
    }

    #[test]
    fn unknown_key_is_satisfied() {
        let exp = PodExpectations::new();
        assert!(exp.satisfied_expectations(&key("target")));
    }

    #[test]
    fn raised_creation_blocks_until_observed() {
        let exp = PodExpectations::new();
        let k = key("target");
        exp.set_expectations(&k, 0, 0);
        assert!(exp.satisfied_expectations(&k));

        exp.raise_expectations(&k, 1, 0);
        assert!(!exp.satisfied_expectations(&k));

        exp.creation_observed(&k);
        assert!(exp.satisfied_expectations(&k));
    }

    #[test]
    fn outstanding_deletes_block_until_observed() {
        let exp = PodExpectations::new();
        let k = key("target");
        exp.raise_expectations(&k, 0, 2);
        exp.deletion_observed(&k);
        assert!(!exp.satisfied_expectations(&k));

        // Creations do not settle deletions
        exp.creation_observed(&k);
        assert!(!exp.satisfied_expectations(&k));

        exp.deletion_observed(&k);
        assert!(exp.satisfied_expectations(&k));
    }

    #[test]
    fn observing_an_untracked_key_creates_no_record() {
        let exp = PodExpectations::new();
        exp.deletion_observed(&key("target"));
        exp.creation_observed(&key("target"));
        assert!(exp.is_empty());
    }

    #[test]
    fn set_rearms_to_fresh_baseline() {
        let exp = PodExpectations::new();
        let k = key("target");
        exp.raise_expectations(&k, 2, 0);
        exp.set_expectations(&k, 0, 0);
        assert!(exp.satisfied_expectations(&k));
    }

    #[test]
    fn expired_records_count_as_satisfied() {
        let exp = PodExpectations::with_ttl(Duration::ZERO);
        let k = key("target");
        exp.raise_expectations(&k, 1, 0);
        thread::sleep(Duration::from_millis(5));
        assert!(exp.satisfied_expectations(&k));
    }

    #[test]
    fn delete_drops_record() {
        let exp = PodExpectations::new();
        let k = key("target");
        exp.raise_expectations(&k, 1, 0);
        assert_eq!(exp.len(), 1);
        exp.delete_expectations(&k);
        assert!(exp.is_empty());
        assert!(exp.satisfied_expectations(&k));
    }

    #[test]
    fn keys_are_independent_across_threads() {
        let exp = Arc::new(PodExpectations::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let exp = exp.clone();
                thread::spawn(move || {
                    let k = key(&format!("claim-{}", i));
                    for _ in 0..100 {
                        exp.raise_expectations(&k, 1, 0);
                    }
                    for _ in 0..100 {
                        exp.creation_observed(&k);
                    }
                    exp.satisfied_expectations(&k)
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(exp.len(), 8);
    }
}
