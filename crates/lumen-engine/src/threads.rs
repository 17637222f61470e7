//! Thread-pool port and worker failure collection.
//!
//! The engine never spawns threads itself: it drives phases through the
//! [`ThreadPool`] trait, a barrier-per-phase contract. Each `dispatch`
//! fans a job out to every worker and blocks until all of them return.
//! The default implementation runs on a dedicated rayon pool.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rayon::prelude::*;

use crate::error::{EngineError, Result};

/// A pool of workers with a barrier-per-phase dispatch contract.
pub trait ThreadPool: Send + Sync {
    /// Number of workers.
    fn thnum(&self) -> usize;

    /// Run `job(worker_index)` on every worker and block until all finish.
    fn dispatch(&self, job: &(dyn Fn(usize) + Sync));
}

/// Default [`ThreadPool`] backed by a dedicated rayon pool.
pub struct RayonPool {
    pool: rayon::ThreadPool,
    thnum: usize,
}

impl RayonPool {
    /// Build a pool with `thnum` workers; `0` selects the machine's
    /// available parallelism.
    pub fn new(thnum: usize) -> Result<Self> {
        let thnum = if thnum == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            thnum
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(thnum)
            .build()
            .map_err(|e| EngineError::WorkerFailure(e.to_string()))?;
        Ok(Self { pool, thnum })
    }
}

impl ThreadPool for RayonPool {
    fn thnum(&self) -> usize {
        self.thnum
    }

    fn dispatch(&self, job: &(dyn Fn(usize) + Sync)) {
        let thnum = self.thnum;
        self.pool
            .install(|| (0..thnum).into_par_iter().for_each(job));
    }
}

/// Per-worker error slots plus the shared failure counter workers check
/// at barrier entry.
pub struct WorkerErrors {
    eout: AtomicUsize,
    slots: Vec<Mutex<Option<String>>>,
}

impl WorkerErrors {
    /// Slots for `thnum` workers.
    pub fn new(thnum: usize) -> Self {
        Self {
            eout: AtomicUsize::new(0),
            slots: (0..thnum).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// True once any worker has failed; checked at barrier entry.
    pub fn failed(&self) -> bool {
        self.eout.load(Ordering::Acquire) != 0
    }

    /// Record a failure for one worker.
    pub fn record(&self, worker: usize, msg: String) {
        log::error!("worker {worker} failed: {msg}");
        if let Ok(mut slot) = self.slots[worker].lock() {
            *slot = Some(msg);
        }
        self.eout.fetch_add(1, Ordering::Release);
    }

    /// Clear all slots for the next frame.
    pub fn reset(&self) {
        self.eout.store(0, Ordering::Release);
        for slot in &self.slots {
            if let Ok(mut s) = slot.lock() {
                *s = None;
            }
        }
    }

    /// First recorded error, if any.
    pub fn first(&self) -> Option<String> {
        for slot in &self.slots {
            if let Ok(s) = slot.lock() {
                if let Some(msg) = s.as_ref() {
                    return Some(msg.clone());
                }
            }
        }
        None
    }

    /// Run a worker body, converting a panic into a recorded failure.
    /// Skips the body entirely when another worker already failed.
    pub fn guard(&self, worker: usize, body: impl FnOnce()) {
        if self.failed() {
            return;
        }
        if let Err(panic) = catch_unwind(AssertUnwindSafe(body)) {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            self.record(worker, msg);
        }
    }

    /// Surface the first failure as an error and reset for the next frame.
    pub fn check(&self) -> Result<()> {
        if self.failed() {
            let msg = self.first().unwrap_or_else(|| "unknown worker error".into());
            self.reset();
            return Err(EngineError::WorkerFailure(msg));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_covers_all_workers() {
        let pool = RayonPool::new(4).unwrap();
        assert_eq!(pool.thnum(), 4);
        let hits: Vec<AtomicUsize> = (0..4).map(|_| AtomicUsize::new(0)).collect();
        pool.dispatch(&|i| {
            hits[i].fetch_add(1, Ordering::Relaxed);
        });
        for h in &hits {
            assert_eq!(h.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn test_worker_errors_record_and_check() {
        let errs = WorkerErrors::new(2);
        assert!(!errs.failed());
        errs.guard(1, || panic!("boom"));
        assert!(errs.failed());
        let err = errs.check().unwrap_err();
        assert!(err.to_string().contains("boom"));
        // check() resets
        assert!(!errs.failed());
        assert!(errs.check().is_ok());
    }

    #[test]
    fn test_guard_skips_after_failure() {
        let errs = WorkerErrors::new(2);
        errs.record(0, "first".into());
        let ran = AtomicUsize::new(0);
        errs.guard(1, || {
            ran.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }
}
