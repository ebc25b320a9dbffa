//! Bounded worker pool for calls that may block on the network.
//!
//! Every embedding, backend write and remote transfer runs on this pool so a
//! slow collaborator can only ever occupy `size` threads. The caller waits
//! for the result with a deadline; a job that overruns it keeps running on
//! its worker and its result is dropped.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{self, RecvTimeoutError},
    Arc,
};
use std::time::Duration;

use crate::errors::StoreError;

/// Cooperative cancellation shared between a caller and its in-flight work.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct WorkerPool {
    pool: rayon::ThreadPool,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self, StoreError> {
        let size = size.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|idx| format!("expertdb-worker-{idx}"))
            .build()
            .map_err(|e| StoreError::Internal(format!("failed to build worker pool: {e}")))?;

        Ok(Self { pool, size })
    }

    /// Number of CPU cores times two.
    pub fn default_size() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            * 2
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` on the pool and wait at most `timeout` for it.
    ///
    /// A cancelled flag is honoured only before the job starts. After that the
    /// job runs to completion; if the flag was raised meanwhile its result is
    /// discarded and `Cancelled` is returned. Timeouts are reported as
    /// transient so the retry policy treats them like a dropped connection.
    pub fn run<T, F>(
        &self,
        label: &str,
        timeout: Duration,
        cancel: Option<&CancelFlag>,
        job: F,
    ) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(StoreError::Cancelled);
        }

        let (tx, rx) = mpsc::sync_channel(1);
        self.pool.spawn(move || {
            // receiver is gone when the caller already timed out
            let _ = tx.send(job());
        });

        let result = match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("{label}: no response within {}ms", timeout.as_millis());
                return Err(StoreError::Transient(format!(
                    "{label} timed out after {}ms",
                    timeout.as_millis()
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(StoreError::Internal(format!(
                    "{label} worker exited without a result"
                )))
            }
        };

        if cancel.is_some_and(|c| c.is_cancelled()) {
            log::debug!("{label}: discarding result of cancelled call");
            return Err(StoreError::Cancelled);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_returns_job_result() {
        let pool = WorkerPool::new(2).unwrap();
        let result = pool.run("add", Duration::from_secs(5), None, || Ok(2 + 2));
        assert_eq!(result.unwrap(), 4);
    }

    #[test]
    fn test_timeout_is_transient() {
        let pool = WorkerPool::new(1).unwrap();
        let result: Result<(), _> = pool.run("slow", Duration::from_millis(20), None, || {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        });
        let err = result.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }

    #[test]
    fn test_cancelled_before_start_never_runs() {
        let pool = WorkerPool::new(1).unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_job = ran.clone();
        let result: Result<(), _> = pool.run("job", Duration::from_secs(1), Some(&cancel), move || {
            ran_in_job.store(true, Ordering::SeqCst);
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::Cancelled)));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_during_call_discards_result() {
        let pool = WorkerPool::new(1).unwrap();
        let cancel = CancelFlag::new();
        let cancel_in_job = cancel.clone();
        let result = pool.run("job", Duration::from_secs(5), Some(&cancel), move || {
            cancel_in_job.cancel();
            Ok(7)
        });
        assert!(matches!(result, Err(StoreError::Cancelled)));
    }

    #[test]
    fn test_default_size_is_twice_the_cores() {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        assert_eq!(WorkerPool::default_size(), cores * 2);
    }
}
