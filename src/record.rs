//! Completed-request records and their free-list.
//!
//! A `Record` carries one finished request from a worker to the aggregator.
//! Ownership moves worker -> queue -> aggregator -> pool; the pool hands
//! reset records back to workers so the hot path does not allocate per
//! request.

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Outcome of one completed request attempt.
#[derive(Debug, Clone, Default)]
pub struct Record {
    /// Request latency (zero for failures that never issued, e.g. a body
    /// file that failed to open).
    pub elapsed: Duration,
    /// Status class "1xx".."5xx", or empty on transport error.
    pub code: &'static str,
    /// Error message, empty on success.
    pub error: String,
    /// Cumulative connection read bytes at completion time.
    pub read_bytes: i64,
    /// Cumulative connection write bytes at completion time.
    pub write_bytes: i64,
}

impl Record {
    fn reset(&mut self) {
        self.elapsed = Duration::ZERO;
        self.code = "";
        self.error.clear();
        self.read_bytes = 0;
        self.write_bytes = 0;
    }
}

/// Thread-safe free-list of records.
#[derive(Debug, Clone, Default)]
pub struct RecordPool {
    free: Arc<Mutex<Vec<Box<Record>>>>,
}

impl RecordPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow a reset record, allocating only when the pool is empty.
    pub fn get(&self) -> Box<Record> {
        let mut free = self.free.lock().unwrap();
        match free.pop() {
            Some(mut r) => {
                r.reset();
                r
            }
            None => Box::default(),
        }
    }

    /// Return a consumed record for reuse.
    pub fn put(&self, record: Box<Record>) {
        self.free.lock().unwrap().push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_recycles() {
        let pool = RecordPool::new();
        let mut r = pool.get();
        r.elapsed = Duration::from_millis(7);
        r.code = "2xx";
        r.error.push_str("boom");
        r.read_bytes = 42;
        pool.put(r);

        let r = pool.get();
        assert_eq!(r.elapsed, Duration::ZERO);
        assert_eq!(r.code, "");
        assert!(r.error.is_empty());
        assert_eq!(r.read_bytes, 0);
    }

    #[test]
    fn test_pool_allocates_when_empty() {
        let pool = RecordPool::new();
        let a = pool.get();
        let b = pool.get();
        assert_eq!(a.code, "");
        assert_eq!(b.code, "");
    }
}
