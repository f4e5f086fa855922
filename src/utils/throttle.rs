use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;

/// 每个外部服务商一个节流阀：固定间隔放行一次调用，不允许突发。
/// 新闻搜索和语言分析是两个独立的配额，各持一个实例。
pub struct ProviderThrottle {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl ProviderThrottle {
    pub fn new(min_delay: Duration) -> Self {
        let period = if min_delay.is_zero() {
            Duration::from_millis(1)
        } else {
            min_delay
        };
        let quota = Quota::with_period(period)
            .expect("throttle period is non-zero")
            .allow_burst(NonZeroU32::new(1).expect("burst of one"));
        Self {
            limiter: RateLimiter::direct(quota),
        }
    }

    /// 等到下一个放行时刻
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

/// 显式重试策略：次数 + 指数退避，由调用方注入而不是散落在调用点
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// 第 attempt 次失败后的退避时长 (attempt 从 1 开始)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
    }

    #[test]
    fn at_least_one_attempt() {
        let policy = RetryPolicy::new(0, Duration::from_millis(100));
        assert_eq!(policy.max_attempts, 1);
    }

    #[tokio::test]
    async fn throttle_spaces_out_calls() {
        let throttle = ProviderThrottle::new(Duration::from_millis(30));
        let start = std::time::Instant::now();
        throttle.acquire().await; // 第一发立即放行
        throttle.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
