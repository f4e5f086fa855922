use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 股票代码统一格式：去空白 + 大写
pub fn normalize_ticker(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// 代码来源标记。同一代码同时出现在持仓和自选时只处理一次，标记取并集。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickerSource {
    Portfolio,
    Watchlist,
    Both,
}

impl TickerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickerSource::Portfolio => "portfolio",
            TickerSource::Watchlist => "watchlist",
            TickerSource::Both => "both",
        }
    }

    pub fn union(self, other: TickerSource) -> TickerSource {
        if self == other {
            self
        } else {
            TickerSource::Both
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
            Sentiment::Neutral => "neutral",
        }
    }

    /// 只认三个合法值，其余一律视为无效
    pub fn parse(raw: &str) -> Option<Sentiment> {
        match raw.trim().to_lowercase().as_str() {
            "positive" => Some(Sentiment::Positive),
            "negative" => Some(Sentiment::Negative),
            "neutral" => Some(Sentiment::Neutral),
            _ => None,
        }
    }
}

/// 搜索服务商返回的原始候选文章，只活在一轮流水线内
#[derive(Debug, Clone)]
pub struct CandidateArticle {
    pub title: String,
    pub description: String,
    pub url: String,
    pub source: String,
    // 部分服务商不给发布时间
    pub published_at: Option<DateTime<Utc>>,
    pub content: String,
}

/// 语言分析产物。bullet_points 恒为 3 条，由富化引擎保证。
#[derive(Debug, Clone)]
pub struct Enrichment {
    pub bullet_points: Vec<String>,
    pub sentiment: Sentiment,
    pub relevance_score: f64,
    pub personalized_insights: String,
    /// 分析服务商失败或输出不可解析时走了兜底生成
    pub degraded: bool,
}

#[derive(Debug, Clone)]
pub struct EnrichedArticle {
    pub fingerprint: String,
    pub ticker: String,
    pub source_tag: TickerSource,
    pub article: CandidateArticle,
    pub enrichment: Enrichment,
}

/// 单 ticker 单轮的处理结果，汇总进周期统计和状态表
#[derive(Debug, Clone, Default)]
pub struct TickerOutcome {
    pub stored: u32,
    pub duplicates: u32,
    pub storage_failures: u32,
    pub degraded: u32,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// 持仓和自选两路数据源全部不可达（含缓存兜底为空），本轮放弃
    #[error("both membership sources unavailable: {0}")]
    UpstreamUnavailable(String),
    /// 单个服务商在重试预算内仍然失败，只影响当前 ticker
    #[error("provider '{provider}' failed after {attempts} attempts: {cause}")]
    Provider {
        provider: &'static str,
        attempts: u32,
        cause: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_normalization_uppercases_and_trims() {
        assert_eq!(normalize_ticker(" aapl "), "AAPL");
        assert_eq!(normalize_ticker("Tsla"), "TSLA");
    }

    #[test]
    fn source_union_same_side_is_identity() {
        assert_eq!(
            TickerSource::Portfolio.union(TickerSource::Portfolio),
            TickerSource::Portfolio
        );
        assert_eq!(
            TickerSource::Watchlist.union(TickerSource::Watchlist),
            TickerSource::Watchlist
        );
    }

    #[test]
    fn source_union_mixed_is_both() {
        assert_eq!(
            TickerSource::Portfolio.union(TickerSource::Watchlist),
            TickerSource::Both
        );
        assert_eq!(
            TickerSource::Both.union(TickerSource::Portfolio),
            TickerSource::Both
        );
    }

    #[test]
    fn sentiment_parse_rejects_unknown_labels() {
        assert_eq!(Sentiment::parse(" Positive "), Some(Sentiment::Positive));
        assert_eq!(Sentiment::parse("NEGATIVE"), Some(Sentiment::Negative));
        assert_eq!(Sentiment::parse("bullish"), None);
        assert_eq!(Sentiment::parse(""), None);
    }
}
