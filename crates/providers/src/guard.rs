use crate::limiter::TokenBucket;
use crate::{
    Classification, ClassificationProvider, ClassifyRequest, EmbedResponse, EmbeddingProvider,
    ProviderError, TargetSchema,
};
use std::sync::Arc;
use std::time::Duration;

/// Applies a provider's rate limit and call timeout around any engine.
pub struct Guarded<P> {
    inner: P,
    limiter: Option<Arc<TokenBucket>>,
    timeout: Duration,
}

impl<P> Guarded<P> {
    pub fn new(inner: P, limiter: Option<Arc<TokenBucket>>, timeout: Duration) -> Self {
        Self {
            inner,
            limiter,
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl<P: ClassificationProvider> ClassificationProvider for Guarded<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn classify(
        &self,
        request: &ClassifyRequest<'_>,
        schema: &TargetSchema,
    ) -> Result<Classification, ProviderError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
        match tokio::time::timeout(self.timeout, self.inner.classify(request, schema)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    provider = self.inner.name(),
                    path = request.path,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "provider call timed out"
                );
                Err(ProviderError::Timeout)
            }
        }
    }
}

#[async_trait::async_trait]
impl<P: EmbeddingProvider> EmbeddingProvider for Guarded<P> {
    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ProviderError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
        tokio::time::timeout(self.timeout, self.inner.embed(texts))
            .await
            .unwrap_or_else(|_| {
                tracing::warn!(
                    texts = texts.len(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "embedding call timed out"
                );
                Err(ProviderError::Timeout)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Slow {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ClassificationProvider for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn classify(
            &self,
            _request: &ClassifyRequest<'_>,
            _schema: &TargetSchema,
        ) -> Result<Classification, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Classification {
                purpose: "slow answer".into(),
                rules: vec![],
                workflows: vec![],
                integration_points: vec![],
                confidence: 0.5,
            })
        }
    }

    fn request() -> ClassifyRequest<'static> {
        ClassifyRequest {
            path: "a.rs",
            project: "a",
            kind: FileKind::Code,
            content: "fn main() {}",
        }
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_slow_calls() {
        let guarded = Guarded::new(
            Slow {
                delay: Duration::from_secs(5),
                calls: AtomicUsize::new(0),
            },
            None,
            Duration::from_secs(1),
        );
        let err = guarded
            .classify(&request(), &TargetSchema::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn passes_through_fast_calls_under_the_rate_limit() {
        let guarded = Guarded::new(
            Slow {
                delay: Duration::from_millis(10),
                calls: AtomicUsize::new(0),
            },
            Some(Arc::new(TokenBucket::new(60, 1))),
            Duration::from_secs(1),
        );
        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            let c = guarded
                .classify(&request(), &TargetSchema::default())
                .await
                .unwrap();
            assert_eq!(c.purpose, "slow answer");
        }
        assert_eq!(guarded.inner.calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    struct StalledEmbedder;

    #[async_trait::async_trait]
    impl EmbeddingProvider for StalledEmbedder {
        async fn embed(&self, _texts: &[String]) -> Result<EmbedResponse, ProviderError> {
            std::future::pending::<()>().await;
            Ok(EmbedResponse { vectors: vec![] })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_embedding_server_times_out() {
        let guarded = Guarded::new(StalledEmbedder, None, Duration::from_secs(30));
        let start = tokio::time::Instant::now();
        let err = guarded.embed(&["loyalty points".to_string()]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout));
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }
}
