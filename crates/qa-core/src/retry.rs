use qa_error::{QaError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// 外部调用的重试策略：指数退避加随机抖动
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// 首次失败后的额外尝试次数
    pub retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            base: Duration::from_millis(250),
            cap: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    /// 第 attempt 次失败后的退避时长（带 50%-100% 抖动）
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.cap);
        let jitter = 0.5 + rand::random::<f64>() * 0.5;
        Duration::from_secs_f64(capped.as_secs_f64() * jitter)
    }
}

/// 对瞬时失败重试调用；不可重试的错误直接透传
pub async fn retry_with_backoff<T, F, Fut>(
    policy: BackoffPolicy,
    operation: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.retries => {
                let delay = policy.delay(attempt);
                warn!(
                    operation = operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            retries: 2,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = retry_with_backoff(fast_policy(), "test", move || {
            let calls = calls2.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(QaError::Network {
                        operation: "connect".into(),
                        message: "refused".into(),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<()> = retry_with_backoff(fast_policy(), "test", move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(QaError::Network {
                    operation: "connect".into(),
                    message: "refused".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        // 1 次原始调用 + 2 次重试
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<()> = retry_with_backoff(fast_policy(), "test", move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(QaError::GuardrailInput {
                    reason: "injection".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_capped() {
        let policy = BackoffPolicy::default();
        for attempt in 0..10 {
            assert!(policy.delay(attempt) <= policy.cap);
        }
    }
}
