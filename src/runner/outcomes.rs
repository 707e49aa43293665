//! Outcome buckets and run counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::domain::hit::{Bucket, Hit};

/// Append-only result collections for one run
#[derive(Debug, Default)]
pub struct OutcomeBuckets {
    hits: Mutex<Vec<Hit>>,
    fails: Mutex<Vec<Hit>>,
    customs: Mutex<Vec<Hit>>,
    to_check: Mutex<Vec<Hit>>,
    retries: AtomicU64,
    tested: AtomicU64,
}

/// Per-bucket sizes plus counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BucketCounts {
    pub hits: usize,
    pub fails: usize,
    pub customs: usize,
    pub to_check: usize,
    pub retries: u64,
    pub tested: u64,
}

impl OutcomeBuckets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, bucket: Bucket) -> &Mutex<Vec<Hit>> {
        match bucket {
            Bucket::Hit => &self.hits,
            Bucket::Fail => &self.fails,
            Bucket::Custom => &self.customs,
            Bucket::ToCheck => &self.to_check,
        }
    }

    /// Appends a terminal result and counts it as tested
    pub fn push(&self, hit: Hit) {
        self.bucket(hit.bucket)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hit);
        self.tested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn hits_found(&self) -> usize {
        self.hits.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn tested(&self) -> u64 {
        self.tested.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn counts(&self) -> BucketCounts {
        let len = |bucket: Bucket| {
            self.bucket(bucket)
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        };
        BucketCounts {
            hits: len(Bucket::Hit),
            fails: len(Bucket::Fail),
            customs: len(Bucket::Custom),
            to_check: len(Bucket::ToCheck),
            retries: self.retries.load(Ordering::Relaxed),
            tested: self.tested.load(Ordering::Relaxed),
        }
    }

    /// Copy of one bucket's content
    #[must_use]
    pub fn list(&self, bucket: Bucket) -> Vec<Hit> {
        self.bucket(bucket)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        for bucket in [Bucket::Hit, Bucket::Fail, Bucket::Custom, Bucket::ToCheck] {
            self.bucket(bucket)
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
        self.retries.store(0, Ordering::Relaxed);
        self.tested.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_routes_by_bucket_and_counts_tested() {
        let buckets = OutcomeBuckets::new();
        buckets.push(Hit::new("a", Bucket::Hit, "SUCCESS"));
        buckets.push(Hit::new("b", Bucket::Fail, "FAIL"));
        buckets.push(Hit::new("c", Bucket::ToCheck, "NONE"));
        buckets.add_retry();

        let counts = buckets.counts();
        assert_eq!(
            counts,
            BucketCounts {
                hits: 1,
                fails: 1,
                customs: 0,
                to_check: 1,
                retries: 1,
                tested: 3,
            }
        );
        assert_eq!(buckets.list(Bucket::Fail)[0].record, "b");

        buckets.clear();
        assert_eq!(buckets.counts(), BucketCounts::default());
    }
}
