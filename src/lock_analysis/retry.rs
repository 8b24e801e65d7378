//! Collection Retry Strategies
//!
//! スナップショット収集のリトライ戦略（有限回・バックオフ付き）

use crate::error::CollectionError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// リトライ戦略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// リトライしない
    None,
    /// 固定間隔でリトライ
    FixedInterval { interval_ms: u64, max_attempts: u32 },
    /// 指数バックオフ
    ExponentialBackoff {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
        max_attempts: u32,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::default_exponential()
    }
}

/// リトライ失敗時の情報
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure {
    pub attempts: u32,
    pub last_error: CollectionError,
}

impl RetryStrategy {
    /// デフォルトの指数バックオフ戦略
    pub fn default_exponential() -> Self {
        Self::ExponentialBackoff {
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
            multiplier: 2.0,
            max_attempts: 3,
        }
    }

    /// 最大試行回数
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::FixedInterval { max_attempts, .. } => (*max_attempts).max(1),
            Self::ExponentialBackoff { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    /// attempt 回目の失敗後に待つ時間（attempt は1始まり）
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::FixedInterval { interval_ms, .. } => Duration::from_millis(*interval_ms),
            Self::ExponentialBackoff {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
                ..
            } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let delay = (*initial_delay_ms as f64) * multiplier.powi(exponent);
                Duration::from_millis(delay.min(*max_delay_ms as f64) as u64)
            }
        }
    }

    /// 設定値の検証
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::None => Ok(()),
            Self::FixedInterval { max_attempts, .. } if *max_attempts == 0 => {
                Err("retry.max_attempts must be at least 1".to_string())
            }
            Self::ExponentialBackoff {
                max_attempts,
                multiplier,
                initial_delay_ms,
                max_delay_ms,
            } => {
                if *max_attempts == 0 {
                    return Err("retry.max_attempts must be at least 1".to_string());
                }
                if !multiplier.is_finite() || *multiplier < 1.0 {
                    return Err(format!("retry.multiplier must be >= 1.0, got {}", multiplier));
                }
                if initial_delay_ms > max_delay_ms {
                    return Err("retry.initial_delay_ms must not exceed max_delay_ms".to_string());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// リトライ可能な操作を実行
    ///
    /// 成功時は (結果, 試行回数)。リトライ不可のエラーは即座に返す。
    pub async fn execute<F, T, Fut>(&self, operation: F) -> Result<(T, u32), RetryFailure>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, CollectionError>> + Send,
        T: Send,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(result) => return Ok((result, attempt)),
                Err(e) => {
                    if !e.is_retryable() {
                        warn!("Collection failed with non-retryable error: {}", e);
                        return Err(RetryFailure {
                            attempts: attempt,
                            last_error: e,
                        });
                    }
                    if attempt >= max_attempts {
                        warn!("All {} collection attempts failed: {}", max_attempts, e);
                        return Err(RetryFailure {
                            attempts: attempt,
                            last_error: e,
                        });
                    }

                    let delay = self.delay_after(attempt);
                    info!(
                        "Retrying collection (attempt {}/{}), delay: {:?}",
                        attempt, max_attempts, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_exponential_delays_are_capped() {
        let strategy = RetryStrategy::ExponentialBackoff {
            initial_delay_ms: 100,
            max_delay_ms: 300,
            multiplier: 2.0,
            max_attempts: 5,
        };
        assert_eq!(strategy.delay_after(1), Duration::from_millis(100));
        assert_eq!(strategy.delay_after(2), Duration::from_millis(200));
        assert_eq!(strategy.delay_after(3), Duration::from_millis(300));
        assert_eq!(strategy.delay_after(4), Duration::from_millis(300));
    }

    #[test]
    fn test_validate() {
        assert!(RetryStrategy::default().validate().is_ok());
        let bad = RetryStrategy::ExponentialBackoff {
            initial_delay_ms: 10,
            max_delay_ms: 100,
            multiplier: 0.5,
            max_attempts: 3,
        };
        assert!(bad.validate().is_err());
        let zero = RetryStrategy::FixedInterval {
            interval_ms: 10,
            max_attempts: 0,
        };
        assert!(zero.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let strategy = RetryStrategy::default_exponential();

        let counter = calls.clone();
        let result = strategy
            .execute(move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(CollectionError::Unavailable("connection reset".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, (3, 3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let strategy = RetryStrategy::FixedInterval {
            interval_ms: 50,
            max_attempts: 2,
        };
        let failure = strategy
            .execute(|| async { Err::<(), _>(CollectionError::Timeout("slow".into())) })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 2);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let failure = RetryStrategy::default_exponential()
            .execute(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(CollectionError::InvalidTarget("nope".into()))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_none_makes_a_single_attempt() {
        let failure = tokio_test::block_on(
            RetryStrategy::None
                .execute(|| async { Err::<(), _>(CollectionError::Unavailable("down".into())) }),
        )
        .unwrap_err();
        assert_eq!(failure.attempts, 1);

        let ok = tokio_test::block_on(RetryStrategy::None.execute(|| async { Ok::<_, CollectionError>(7) }));
        tokio_test::assert_ok!(&ok);
        assert_eq!(ok.unwrap(), (7, 1));
    }
}
