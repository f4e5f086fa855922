use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde_json::Value;
use std::env;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{info, warn};
use url::Url;

use crate::config::pipeline_profile::{LOOKBACK_MAX_DAYS, LOOKBACK_MIN_DAYS};
use crate::utils::throttle::{ProviderThrottle, RetryPolicy};
use super::structs::{CandidateArticle, GatewayError};

const DEFAULT_SEARCH_URL: &str = "https://api.search.brave.com/res/v1/news/search";
// 服务商单次请求上限
const MAX_RESULTS_PER_CALL: u32 = 50;

/// 查询约束由调用方提供，网关不内置任何关键词或域名集合
#[derive(Debug, Clone, Default)]
pub struct SearchProfile {
    /// 追加到查询串的财经关键词，把搜索往实质性内容上引
    pub extra_keywords: Vec<String>,
    /// 非空时只保留这些域名（含子域）下的文章
    pub allowed_domains: Vec<String>,
}

pub struct NewsSearcher {
    client: Client,
    api_key: String,
    base_url: String,
    throttle: Arc<ProviderThrottle>,
    retry: RetryPolicy,
}

impl NewsSearcher {
    pub fn new(client: Client, throttle: Arc<ProviderThrottle>, retry: RetryPolicy) -> Self {
        Self {
            client,
            api_key: env::var("BRAVE_SEARCH_API_KEY").unwrap_or_default(),
            base_url: env::var("NEWS_SEARCH_API_URL")
                .unwrap_or_else(|_| DEFAULT_SEARCH_URL.to_string()),
            throttle,
            retry,
        }
    }

    #[cfg(test)]
    pub fn with_base_url(
        client: Client,
        throttle: Arc<ProviderThrottle>,
        retry: RetryPolicy,
        base_url: &str,
    ) -> Self {
        Self {
            client,
            api_key: "test-key".to_string(),
            base_url: base_url.to_string(),
            throttle,
            retry,
        }
    }

    pub fn build_query(ticker: &str, profile: &SearchProfile) -> String {
        let mut query = format!("{} stock", ticker);
        for keyword in &profile.extra_keywords {
            query.push(' ');
            query.push_str(keyword);
        }
        query
    }

    /// 回看窗口转成服务商的 freshness 区间 (YYYY-MM-DDtoYYYY-MM-DD)。
    /// 入参越界先收敛，保证发出去的请求永远在 [1,30] 天内。
    fn freshness_window(lookback_days: u32) -> String {
        let days = lookback_days.clamp(LOOKBACK_MIN_DAYS, LOOKBACK_MAX_DAYS) as i64;
        let to = Utc::now().date_naive();
        let from = to - ChronoDuration::days(days);
        format!("{}to{}", from, to)
    }

    fn domain_allowed(url_str: &str, allowed: &[String]) -> bool {
        if allowed.is_empty() {
            return true;
        }
        let Ok(parsed) = Url::parse(url_str) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let host = host.trim_start_matches("www.");
        allowed.iter().any(|domain| {
            let domain = domain.trim_start_matches("www.").to_lowercase();
            host == domain || host.ends_with(&format!(".{}", domain))
        })
    }

    pub async fn search(
        &self,
        ticker: &str,
        lookback_days: u32,
        max_results: u32,
        profile: &SearchProfile,
    ) -> Result<Vec<CandidateArticle>, GatewayError> {
        let query = Self::build_query(ticker, profile);
        let count = max_results.clamp(1, MAX_RESULTS_PER_CALL).to_string();
        let freshness = Self::freshness_window(lookback_days);

        let mut last_err = String::new();
        for attempt in 1..=self.retry.max_attempts {
            // 固定间隔放行，保护服务商配额
            self.throttle.acquire().await;

            let resp = self
                .client
                .get(&self.base_url)
                .query(&[
                    ("q", query.as_str()),
                    ("count", count.as_str()),
                    ("search_lang", "en"),
                    ("country", "US"),
                    ("freshness", freshness.as_str()),
                ])
                .header("Accept", "application/json")
                .header("X-Subscription-Token", &self.api_key)
                .send()
                .await;

            match resp {
                Ok(r) if r.status().is_success() => match r.json::<Value>().await {
                    Ok(data) => {
                        let articles = Self::parse_results(&data, &profile.allowed_domains);
                        info!("🔎 [{}] {} candidate articles", ticker, articles.len());
                        return Ok(articles);
                    }
                    Err(e) => last_err = format!("bad json: {}", e),
                },
                Ok(r) => {
                    last_err = format!("status {}", r.status());
                    warn!(
                        "⚠️ News API {} for {} (attempt {}/{})",
                        last_err, ticker, attempt, self.retry.max_attempts
                    );
                }
                Err(e) => last_err = e.to_string(),
            }

            if attempt < self.retry.max_attempts {
                sleep(self.retry.delay_for(attempt)).await;
            }
        }

        Err(GatewayError::Provider {
            provider: "news_search",
            attempts: self.retry.max_attempts,
            cause: last_err,
        })
    }

    fn parse_results(data: &Value, allowed_domains: &[String]) -> Vec<CandidateArticle> {
        let mut out = Vec::new();
        if let Some(items) = data["results"].as_array() {
            for item in items {
                let title = item["title"].as_str().unwrap_or("").trim();
                let url = item["url"].as_str().unwrap_or("").trim();
                // 没有标题或链接的条目无法计算指纹，直接丢弃
                if title.is_empty() || url.is_empty() {
                    continue;
                }
                if !Self::domain_allowed(url, allowed_domains) {
                    continue;
                }

                let source = item["source"]
                    .as_str()
                    .or_else(|| item["meta_url"]["hostname"].as_str())
                    .unwrap_or("")
                    .to_string();
                let published_at = item["published"]
                    .as_str()
                    .or_else(|| item["page_age"].as_str())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc));

                out.push(CandidateArticle {
                    title: title.to_string(),
                    description: item["description"].as_str().unwrap_or("").to_string(),
                    url: url.to_string(),
                    source,
                    published_at,
                    content: item["content"].as_str().unwrap_or("").to_string(),
                });
            }
        }
        out
    }

    /// 启动自检：打一发最小查询确认服务商可达，失败只告警不拦启动
    pub async fn probe(&self) -> Result<usize, GatewayError> {
        let articles = self.search("SPY", 1, 2, &SearchProfile::default()).await?;
        Ok(articles.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, MockServer};
    use serde_json::json;
    use std::time::Duration;

    fn test_searcher(base_url: &str) -> NewsSearcher {
        NewsSearcher::with_base_url(
            reqwest::Client::new(),
            Arc::new(ProviderThrottle::new(Duration::from_millis(1))),
            RetryPolicy::new(2, Duration::from_millis(1)),
            base_url,
        )
    }

    #[test]
    fn query_includes_caller_keywords() {
        let profile = SearchProfile {
            extra_keywords: vec!["earnings".into(), "guidance".into()],
            allowed_domains: vec![],
        };
        assert_eq!(
            NewsSearcher::build_query("AAPL", &profile),
            "AAPL stock earnings guidance"
        );
        assert_eq!(
            NewsSearcher::build_query("TSLA", &SearchProfile::default()),
            "TSLA stock"
        );
    }

    #[test]
    fn freshness_window_clamps_out_of_range_lookback() {
        // 0 和 1 收敛到同一个窗口，31 和 30 收敛到同一个窗口
        assert_eq!(
            NewsSearcher::freshness_window(0),
            NewsSearcher::freshness_window(1)
        );
        assert_eq!(
            NewsSearcher::freshness_window(31),
            NewsSearcher::freshness_window(30)
        );
        assert_ne!(
            NewsSearcher::freshness_window(1),
            NewsSearcher::freshness_window(30)
        );
        assert!(NewsSearcher::freshness_window(3).contains("to"));
    }

    #[test]
    fn domain_restriction_matches_host_and_subdomains() {
        let allowed = vec!["reuters.com".to_string()];
        assert!(NewsSearcher::domain_allowed(
            "https://www.reuters.com/markets/apple",
            &allowed
        ));
        assert!(NewsSearcher::domain_allowed(
            "https://feeds.reuters.com/article/1",
            &allowed
        ));
        assert!(!NewsSearcher::domain_allowed(
            "https://notreuters.com/article",
            &allowed
        ));
        assert!(!NewsSearcher::domain_allowed("not a url", &allowed));
        // 空列表 = 不限制
        assert!(NewsSearcher::domain_allowed("https://anything.io/x", &[]));
    }

    #[tokio::test]
    async fn search_parses_provider_results() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/news");
            then.status(200).json_body(json!({"results": [
                {
                    "title": "Apple beats expectations",
                    "url": "https://example.com/apple-beats",
                    "description": "Strong quarter for the iPhone maker.",
                    "source": "Example Wire",
                    "published": "2025-06-01T09:30:00Z"
                },
                {
                    "title": "",
                    "url": "https://example.com/no-title"
                }
            ]}));
        });

        let searcher = test_searcher(&server.url("/news"));
        let articles = searcher
            .search("AAPL", 3, 15, &SearchProfile::default())
            .await
            .unwrap();

        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].title, "Apple beats expectations");
        assert_eq!(articles[0].source, "Example Wire");
        assert!(articles[0].published_at.is_some());
    }

    #[tokio::test]
    async fn search_filters_by_allowed_domains() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/news");
            then.status(200).json_body(json!({"results": [
                {"title": "kept", "url": "https://www.reuters.com/a"},
                {"title": "dropped", "url": "https://tabloid.example/b"}
            ]}));
        });

        let profile = SearchProfile {
            extra_keywords: vec![],
            allowed_domains: vec!["reuters.com".into()],
        };
        let searcher = test_searcher(&server.url("/news"));
        let articles = searcher.search("AAPL", 3, 15, &profile).await.unwrap();

        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].title, "kept");
    }

    #[tokio::test]
    async fn search_exhausts_retry_budget_then_fails() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/news");
            then.status(500);
        });

        let searcher = test_searcher(&server.url("/news"));
        let err = searcher
            .search("AAPL", 3, 15, &SearchProfile::default())
            .await
            .unwrap_err();

        match err {
            GatewayError::Provider { provider, attempts, cause } => {
                assert_eq!(provider, "news_search");
                assert_eq!(attempts, 2);
                assert!(cause.contains("500"));
            }
            other => panic!("unexpected error: {}", other),
        }
        mock.assert_hits(2);
    }
}
