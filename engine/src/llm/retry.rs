//! Deadline and backoff around model calls

use async_trait::async_trait;
use sdk::errors::ModelError;
use std::future::Future;
use std::time::Duration;

use super::{Embedder, GenerationParams, Result, TextGenerator};
use crate::config::ModelConfig;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wall-clock limit for each attempt
    pub timeout: Duration,
    /// Attempts after the first one
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            timeout: config.request_timeout(),
            max_retries: config.max_retries,
            backoff_base: config.backoff_base(),
        }
    }

    /// `backoff_base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. Every attempt is bounded by `timeout`.
    pub async fn run<F, Fut, T>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ModelError::Timeout {
                    after: self.timeout,
                }),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        call = label,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Model call failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(call = label, attempts = attempt + 1, error = %e, "Model call failed");
                    return Err(e);
                }
            }
        }
    }
}

/// Wraps a generator or embedder with [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct Resilient<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> Resilient<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl<T: TextGenerator> TextGenerator for Resilient<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        self.policy
            .run("generate", || self.inner.generate(prompt, params))
            .await
    }
}

#[async_trait]
impl<T: Embedder> Embedder for Resilient<T> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.policy.run("embed", || self.inner.embed(text)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Flaky {
        calls: Arc<AtomicU32>,
        fail_first: u32,
        error: ModelError,
    }

    #[async_trait]
    impl TextGenerator for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn generate(&self, _prompt: &str, _params: &GenerationParams) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(self.error.clone())
            } else {
                Ok("ok".to_string())
            }
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(200),
            max_retries,
            backoff_base: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(40), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let gen = Resilient::new(
            Flaky {
                calls: Arc::clone(&calls),
                fail_first: 2,
                error: ModelError::Server {
                    status: 503,
                    body: String::new(),
                },
            },
            fast_policy(3),
        );
        let out = gen.generate("x", &GenerationParams::default()).await.unwrap();
        assert_eq!(out, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_malformed_response() {
        let calls = Arc::new(AtomicU32::new(0));
        let gen = Resilient::new(
            Flaky {
                calls: Arc::clone(&calls),
                fail_first: 5,
                error: ModelError::Response("bad".into()),
            },
            fast_policy(3),
        );
        let err = gen.generate("x", &GenerationParams::default()).await.unwrap_err();
        assert!(matches!(err, ModelError::Response(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let gen = Resilient::new(
            Flaky {
                calls: Arc::clone(&calls),
                fail_first: 10,
                error: ModelError::Server {
                    status: 500,
                    body: "boom".into(),
                },
            },
            fast_policy(2),
        );
        let err = gen.generate("x", &GenerationParams::default()).await.unwrap_err();
        assert!(matches!(err, ModelError::Server { status: 500, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    struct Hang;

    #[async_trait]
    impl TextGenerator for Hang {
        fn name(&self) -> &str {
            "hang"
        }

        async fn generate(&self, _prompt: &str, _params: &GenerationParams) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_hung_call_times_out() {
        let gen = Resilient::new(
            Hang,
            RetryPolicy {
                timeout: Duration::from_millis(20),
                max_retries: 1,
                backoff_base: Duration::from_millis(1),
            },
        );
        let err = gen.generate("x", &GenerationParams::default()).await.unwrap_err();
        assert!(matches!(err, ModelError::Timeout { .. }));
    }
}
