use std::sync::Arc;
use std::time::Duration;

use crate::errors::StoreError;
use crate::pool::{CancelFlag, WorkerPool};
use crate::retry::RetryPolicy;
use crate::semantic::Embedder;

/// Calls the embedder through the worker pool with a deadline and the
/// retry policy, and checks that what comes back fits the collection.
pub struct EmbeddingGateway {
    embedder: Arc<dyn Embedder>,
    pool: Arc<WorkerPool>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl EmbeddingGateway {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        pool: Arc<WorkerPool>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            pool,
            retry,
            timeout,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }

    pub fn model_name(&self) -> &str {
        self.embedder.name()
    }

    pub fn model_id_hash(&self) -> [u8; 32] {
        self.embedder.model_id_hash()
    }

    pub fn embed_batch(
        &self,
        texts: Vec<String>,
        cancel: &CancelFlag,
    ) -> Result<Vec<Vec<f32>>, StoreError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let texts = Arc::new(texts);
        let expected = texts.len();
        let dimensions = self.dimensions();

        let vectors = self.retry.run("embedding", || {
            let embedder = self.embedder.clone();
            let texts = texts.clone();
            self.pool.run("embedding", self.timeout, Some(cancel), move || {
                embedder.embed_batch(&texts).map_err(StoreError::from)
            })
        })?;

        if vectors.len() != expected {
            return Err(StoreError::Permanent(format!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                expected
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimensions) {
            return Err(StoreError::Permanent(format!(
                "embedder returned a {}-dimensional vector, expected {dimensions}",
                bad.len()
            )));
        }

        Ok(vectors)
    }

    pub fn embed(&self, text: &str, cancel: &CancelFlag) -> Result<Vec<f32>, StoreError> {
        self.embed_batch(vec![text.to_string()], cancel)?
            .pop()
            .ok_or_else(|| StoreError::Internal("embedder returned no vector".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::EmbeddingError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyEmbedder {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        error: fn() -> EmbeddingError,
    }

    impl Embedder for FlakyEmbedder {
        fn name(&self) -> &str {
            "flaky"
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err((self.error)());
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn gateway(embedder: Arc<FlakyEmbedder>) -> EmbeddingGateway {
        EmbeddingGateway::new(
            embedder,
            Arc::new(WorkerPool::new(2).unwrap()),
            RetryPolicy::new(3, Duration::ZERO, 2),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let embedder = Arc::new(FlakyEmbedder {
            failures_left: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
            error: || EmbeddingError::Unavailable("connection reset".into()),
        });
        let vectors = gateway(embedder.clone())
            .embed_batch(vec!["a".into(), "b".into()], &CancelFlag::new())
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_rejected_call_is_not_retried() {
        let embedder = Arc::new(FlakyEmbedder {
            failures_left: AtomicUsize::new(1),
            calls: AtomicUsize::new(0),
            error: || EmbeddingError::Rejected("quota exceeded".into()),
        });
        let result = gateway(embedder.clone()).embed("a", &CancelFlag::new());
        assert!(matches!(result, Err(StoreError::Permanent(_))));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_before_call_is_never_sent() {
        let embedder = Arc::new(FlakyEmbedder {
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            error: || EmbeddingError::Unavailable("unused".into()),
        });
        let cancel = CancelFlag::new();
        cancel.cancel();
        let result = gateway(embedder.clone()).embed("a", &cancel);
        assert!(matches!(result, Err(StoreError::Cancelled)));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }
}
