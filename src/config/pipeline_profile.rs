use serde::Deserialize;
use config::{Config, Environment, File};
use anyhow::Result;

// 回看窗口的合法区间（天）。搜索服务商对更久远的窗口不保证召回。
pub const LOOKBACK_MIN_DAYS: u32 = 1;
pub const LOOKBACK_MAX_DAYS: u32 = 30;

#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    pub cycle_interval_sec: u64,
    pub cycle_deadline_sec: u64,
    pub per_ticker_timeout_sec: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    pub max_articles_per_ticker: u32,
    pub lookback_days: u32,
    pub max_concurrent_tickers: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThrottleConfig {
    // 两个服务商分开限速：新闻搜索和语言分析不共享配额
    pub news_call_delay_ms: u64,
    pub llm_call_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    pub membership_ttl_sec: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    /// 拼进搜索串的财经关键词，由配置方决定，网关不内置
    pub extra_keywords: Vec<String>,
    /// 非空时只保留这些域名下的文章
    pub allowed_domains: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineProfile {
    pub timing: TimingConfig,
    pub ingest: IngestConfig,
    pub throttle: ThrottleConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub query: QueryConfig,
}

impl PipelineProfile {
    pub fn load() -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name("pipeline_config"))
            // 环境变量覆盖，如 NEWS_PIPELINE__TIMING__CYCLE_INTERVAL_SEC=600
            .add_source(Environment::with_prefix("NEWS_PIPELINE").separator("__"))
            .build()?;

        let mut profile: PipelineProfile = settings.try_deserialize()?;
        profile.clamp();
        Ok(profile)
    }

    /// 越界参数收敛到合法区间，而不是拒绝启动
    pub fn clamp(&mut self) {
        self.ingest.lookback_days = self
            .ingest
            .lookback_days
            .clamp(LOOKBACK_MIN_DAYS, LOOKBACK_MAX_DAYS);
        if self.ingest.max_concurrent_tickers == 0 {
            self.ingest.max_concurrent_tickers = 1;
        }
        if self.ingest.max_articles_per_ticker == 0 {
            self.ingest.max_articles_per_ticker = 1;
        }
        if self.retry.max_attempts == 0 {
            self.retry.max_attempts = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_with_lookback(days: u32) -> PipelineProfile {
        PipelineProfile {
            timing: TimingConfig {
                cycle_interval_sec: 300,
                cycle_deadline_sec: 270,
                per_ticker_timeout_sec: 90,
            },
            ingest: IngestConfig {
                max_articles_per_ticker: 15,
                lookback_days: days,
                max_concurrent_tickers: 4,
            },
            throttle: ThrottleConfig {
                news_call_delay_ms: 1000,
                llm_call_delay_ms: 500,
            },
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 500,
            },
            cache: CacheConfig {
                membership_ttl_sec: 3600,
            },
            query: QueryConfig {
                extra_keywords: vec![],
                allowed_domains: vec![],
            },
        }
    }

    #[test]
    fn lookback_zero_clamps_to_one() {
        let mut p = profile_with_lookback(0);
        p.clamp();
        assert_eq!(p.ingest.lookback_days, 1);
    }

    #[test]
    fn lookback_over_max_clamps_to_thirty() {
        let mut p = profile_with_lookback(31);
        p.clamp();
        assert_eq!(p.ingest.lookback_days, 30);
    }

    #[test]
    fn lookback_in_range_untouched() {
        let mut p = profile_with_lookback(3);
        p.clamp();
        assert_eq!(p.ingest.lookback_days, 3);
    }

    #[test]
    fn zero_concurrency_floors_to_one() {
        let mut p = profile_with_lookback(3);
        p.ingest.max_concurrent_tickers = 0;
        p.retry.max_attempts = 0;
        p.clamp();
        assert_eq!(p.ingest.max_concurrent_tickers, 1);
        assert_eq!(p.retry.max_attempts, 1);
    }
}
