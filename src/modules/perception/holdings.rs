use reqwest::Client;
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::database::ArticleStore;
use crate::utils::throttle::RetryPolicy;
use super::structs::{normalize_ticker, GatewayError, TickerSource};

/// 持仓 / 自选 / 用户画像三个协作方的统一网关。
/// 端点从环境变量拿，和其它密钥一个管理方式。
pub struct HoldingsGateway {
    client: Client,
    portfolio_base: String,
    watchlist_base: String,
    prefs_base: String,
    retry: RetryPolicy,
}

impl HoldingsGateway {
    pub fn new(client: Client, retry: RetryPolicy) -> Self {
        Self {
            client,
            portfolio_base: env::var("PORTFOLIO_API_URL").unwrap_or_default(),
            watchlist_base: env::var("WATCHLIST_API_URL").unwrap_or_default(),
            prefs_base: env::var("USER_PREFERENCES_API_URL").unwrap_or_default(),
            retry,
        }
    }

    // 测试用：绕过环境变量直接指定端点
    #[cfg(test)]
    pub fn with_endpoints(
        client: Client,
        retry: RetryPolicy,
        portfolio_base: &str,
        watchlist_base: &str,
        prefs_base: &str,
    ) -> Self {
        Self {
            client,
            portfolio_base: portfolio_base.to_string(),
            watchlist_base: watchlist_base.to_string(),
            prefs_base: prefs_base.to_string(),
            retry,
        }
    }

    async fn get_json(&self, url: &str, provider: &'static str) -> Result<Value, GatewayError> {
        let mut last_err = String::new();
        for attempt in 1..=self.retry.max_attempts {
            match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                    Ok(v) => return Ok(v),
                    Err(e) => last_err = format!("bad json: {}", e),
                },
                Ok(resp) => last_err = format!("status {}", resp.status()),
                Err(e) => last_err = e.to_string(),
            }
            if attempt < self.retry.max_attempts {
                sleep(self.retry.delay_for(attempt)).await;
            }
        }
        Err(GatewayError::Provider {
            provider,
            attempts: self.retry.max_attempts,
            cause: last_err,
        })
    }

    pub async fn fetch_portfolio(&self, user_id: &str) -> Result<Vec<String>, GatewayError> {
        let url = format!("{}{}/holdings", self.portfolio_base, user_id);
        let data = self.get_json(&url, "portfolio").await?;
        Ok(extract_tickers(&data, "holdings"))
    }

    pub async fn fetch_watchlist(&self, user_id: &str) -> Result<Vec<String>, GatewayError> {
        let url = format!("{}{}/", self.watchlist_base, user_id);
        let data = self.get_json(&url, "watchlist").await?;
        Ok(extract_tickers(&data, "watchlist"))
    }

    /// 用户画像是增值信息，拿不到不影响流水线
    pub async fn fetch_preferences(&self, user_id: &str) -> Option<Value> {
        if self.prefs_base.is_empty() {
            return None;
        }
        let url = format!("{}{}/", self.prefs_base, user_id);
        match self.get_json(&url, "preferences").await {
            Ok(v) => {
                info!("✅ User preferences loaded for {}", user_id);
                Some(v)
            }
            Err(e) => {
                warn!("⚠️ No user preferences available: {}. Using default analysis.", e);
                None
            }
        }
    }

    /// 拉取本轮要处理的代码全集：持仓 ∪ 自选。
    /// 单边失败 → 回退到 TTL 缓存（降级，告警不中断）；
    /// 两边都拿不到且缓存为空 → UpstreamUnavailable，本轮放弃。
    pub async fn fetch_tickers<S: ArticleStore>(
        &self,
        user_id: &str,
        store: &S,
        cache_ttl_sec: u64,
    ) -> Result<Vec<(String, TickerSource)>, GatewayError> {
        let mut portfolio_live = true;
        let portfolio = match self.fetch_portfolio(user_id).await {
            Ok(tickers) => {
                store.cache_portfolio(&tickers, user_id).await;
                tickers
            }
            Err(e) => {
                warn!("⚠️ Portfolio source down ({}). Falling back to cache...", e);
                portfolio_live = false;
                store.cached_portfolio(user_id, cache_ttl_sec).await
            }
        };

        let mut watchlist_live = true;
        let watchlist = match self.fetch_watchlist(user_id).await {
            Ok(tickers) => {
                store.cache_watchlist(&tickers, user_id).await;
                tickers
            }
            Err(e) => {
                warn!("⚠️ Watchlist source down ({}). Falling back to cache...", e);
                watchlist_live = false;
                store.cached_watchlist(user_id, cache_ttl_sec).await
            }
        };

        if !portfolio_live && !watchlist_live && portfolio.is_empty() && watchlist.is_empty() {
            return Err(GatewayError::UpstreamUnavailable(
                "live fetch failed and caches are empty or stale".to_string(),
            ));
        }

        Ok(merge_ticker_sets(portfolio, watchlist))
    }
}

fn extract_tickers(data: &Value, key: &str) -> Vec<String> {
    let mut tickers = Vec::new();
    if let Some(items) = data[key].as_array() {
        for item in items {
            if let Some(t) = item["ticker"].as_str() {
                if !t.trim().is_empty() {
                    tickers.push(normalize_ticker(t));
                }
            }
        }
    }
    tickers
}

/// 并集 + 来源标记。BTreeMap 保证顺序稳定，日志可读、测试可断言。
pub fn merge_ticker_sets(
    portfolio: Vec<String>,
    watchlist: Vec<String>,
) -> Vec<(String, TickerSource)> {
    let mut merged: BTreeMap<String, TickerSource> = BTreeMap::new();
    for ticker in portfolio {
        merged.insert(ticker, TickerSource::Portfolio);
    }
    for ticker in watchlist {
        merged
            .entry(ticker)
            .and_modify(|tag| *tag = tag.union(TickerSource::Watchlist))
            .or_insert(TickerSource::Watchlist);
    }
    merged.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, MockServer};
    use serde_json::json;
    use std::time::Duration;

    fn test_retry() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1))
    }

    #[test]
    fn merge_tags_overlap_as_both() {
        let merged = merge_ticker_sets(
            vec!["AAPL".into(), "MSFT".into()],
            vec!["MSFT".into(), "TSLA".into()],
        );
        assert_eq!(
            merged,
            vec![
                ("AAPL".to_string(), TickerSource::Portfolio),
                ("MSFT".to_string(), TickerSource::Both),
                ("TSLA".to_string(), TickerSource::Watchlist),
            ]
        );
    }

    #[test]
    fn merge_deduplicates_within_one_side() {
        let merged = merge_ticker_sets(vec!["AAPL".into(), "AAPL".into()], vec![]);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn extract_tickers_skips_blank_entries() {
        let data = json!({"holdings": [
            {"ticker": "aapl", "quantity": "10"},
            {"ticker": "", "quantity": "1"},
            {"note": "no ticker field"}
        ]});
        assert_eq!(extract_tickers(&data, "holdings"), vec!["AAPL".to_string()]);
    }

    #[tokio::test]
    async fn fetch_portfolio_parses_holdings_payload() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/u1/holdings");
            then.status(200).json_body(json!({"holdings": [
                {"ticker": "AAPL"}, {"ticker": "googl"}
            ]}));
        });

        let gateway = HoldingsGateway::with_endpoints(
            reqwest::Client::new(),
            test_retry(),
            &format!("{}/", server.base_url()),
            "",
            "",
        );
        let tickers = gateway.fetch_portfolio("u1").await.unwrap();
        assert_eq!(tickers, vec!["AAPL".to_string(), "GOOGL".to_string()]);
    }

    #[tokio::test]
    async fn fetch_watchlist_surfaces_provider_error_after_retries() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/u1/");
            then.status(503);
        });

        let gateway = HoldingsGateway::with_endpoints(
            reqwest::Client::new(),
            test_retry(),
            "",
            &format!("{}/", server.base_url()),
            "",
        );
        let err = gateway.fetch_watchlist("u1").await.unwrap_err();
        match err {
            GatewayError::Provider { provider, attempts, .. } => {
                assert_eq!(provider, "watchlist");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
        mock.assert_hits(2);
    }
}
