use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::pipeline_profile::PipelineProfile;
use crate::database::ArticleStore;
use crate::modules::brain::ArticleAnalyst;
use crate::modules::perception::fingerprint;
use crate::modules::perception::structs::{EnrichedArticle, TickerOutcome, TickerSource};
use crate::modules::perception::{HoldingsGateway, NewsSearcher, SearchProfile};

/// 一轮周期的汇总统计，周期结束打一条横幅日志
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub tickers_attempted: usize,
    pub articles_stored: u32,
    pub duplicates_skipped: u32,
    pub tickers_failed: u32,
    pub storage_failures: u32,
    pub degraded_enrichments: u32,
}

impl CycleStats {
    pub fn absorb(&mut self, outcome: &TickerOutcome) {
        self.articles_stored += outcome.stored;
        self.duplicates_skipped += outcome.duplicates;
        self.storage_failures += outcome.storage_failures;
        self.degraded_enrichments += outcome.degraded;
        if outcome.error.is_some() {
            self.tickers_failed += 1;
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "tickers: {} ({} failed) | stored: {} | duplicates skipped: {} | degraded: {} | storage failures: {}",
            self.tickers_attempted,
            self.tickers_failed,
            self.articles_stored,
            self.duplicates_skipped,
            self.degraded_enrichments,
            self.storage_failures
        )
    }
}

/// 周期编排器。状态机：取数据源 → 分发 ticker → 单线流水线 × N → 聚合。
/// 定时驱动在 main.rs，这里只负责"一轮"本身。落库走 ArticleStore 契约。
pub struct NewsAggregator<S: ArticleStore> {
    store: Arc<S>,
    holdings: Arc<HoldingsGateway>,
    searcher: Arc<NewsSearcher>,
    analyst: Arc<ArticleAnalyst>,
    profile: PipelineProfile,
    search_profile: SearchProfile,
    user_id: String,
    preferences: Option<Value>,
}

impl<S: ArticleStore> NewsAggregator<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        holdings: Arc<HoldingsGateway>,
        searcher: Arc<NewsSearcher>,
        analyst: Arc<ArticleAnalyst>,
        profile: PipelineProfile,
        user_id: String,
        preferences: Option<Value>,
    ) -> Self {
        let search_profile = SearchProfile {
            extra_keywords: profile.query.extra_keywords.clone(),
            allowed_domains: profile.query.allowed_domains.clone(),
        };
        Self {
            store,
            holdings,
            searcher,
            analyst,
            profile,
            search_profile,
            user_id,
            preferences,
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleStats> {
        info!("==================== 📰 NEWS CYCLE START ====================");

        // 两路成员数据源全挂 → 本轮直接放弃，等下一个 tick
        let tickers = self
            .holdings
            .fetch_tickers(
                &self.user_id,
                self.store.as_ref(),
                self.profile.cache.membership_ttl_sec,
            )
            .await?;

        if tickers.is_empty() {
            warn!("No tickers to process this cycle.");
            return Ok(CycleStats::default());
        }

        info!(
            "🎯 Processing {} tickers: {}",
            tickers.len(),
            tickers
                .iter()
                .map(|(t, tag)| format!("{}({})", t, tag.as_str()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        // 受限并发分发。单 ticker 超时/失败互不影响。
        let outcomes: Arc<DashMap<String, (TickerSource, TickerOutcome)>> =
            Arc::new(DashMap::new());
        let per_ticker_timeout = Duration::from_secs(self.profile.timing.per_ticker_timeout_sec);

        stream::iter(tickers.iter().cloned())
            .for_each_concurrent(
                self.profile.ingest.max_concurrent_tickers,
                |(ticker, tag)| {
                    let outcomes = outcomes.clone();
                    async move {
                        let outcome =
                            match timeout(per_ticker_timeout, self.process_ticker(&ticker, tag))
                                .await
                            {
                                Ok(outcome) => outcome,
                                Err(_) => {
                                    warn!(
                                        "⏱️ [{}] Pipeline timed out after {}s",
                                        ticker,
                                        per_ticker_timeout.as_secs()
                                    );
                                    TickerOutcome {
                                        error: Some(format!(
                                            "timeout after {}s",
                                            per_ticker_timeout.as_secs()
                                        )),
                                        ..Default::default()
                                    }
                                }
                            };
                        outcomes.insert(ticker, (tag, outcome));
                    }
                },
            )
            .await;

        // 聚合：逐 ticker 落状态行，汇总周期统计
        let mut stats = CycleStats {
            tickers_attempted: tickers.len(),
            ..Default::default()
        };
        for entry in outcomes.iter() {
            let (tag, outcome) = entry.value();
            stats.absorb(outcome);
            if !self.store.upsert_status(entry.key(), outcome, *tag).await {
                stats.storage_failures += 1;
            }
        }

        info!("==================== 📰 NEWS CYCLE END ======================");
        Ok(stats)
    }

    /// 单 ticker 流水线：搜索 → 指纹抢占 → 富化 → 落库，严格串行。
    /// 任何一步失败只影响这一个 ticker。
    async fn process_ticker(&self, ticker: &str, tag: TickerSource) -> TickerOutcome {
        let mut outcome = TickerOutcome::default();

        let candidates = match self
            .searcher
            .search(
                ticker,
                self.profile.ingest.lookback_days,
                self.profile.ingest.max_articles_per_ticker,
                &self.search_profile,
            )
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("❌ [{}] Search failed: {}", ticker, e);
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };

        if candidates.is_empty() {
            info!("📭 [{}] No fresh articles found.", ticker);
            return outcome;
        }

        for article in candidates {
            let fp = fingerprint::compute(&article.title, &article.url, article.published_at);

            match self
                .store
                .claim_fingerprint(&fp, ticker, &article.title, &article.url, tag)
                .await
            {
                Ok(true) => {} // 新文章，继续富化
                Ok(false) => {
                    outcome.duplicates += 1;
                    continue;
                }
                Err(e) => {
                    warn!("⚠️ [{}] Claim failed for {}: {}", ticker, fp, e);
                    outcome.storage_failures += 1;
                    continue;
                }
            }

            // 富化永不失败，最差也是一条降级记录
            let enrichment = self
                .analyst
                .enrich(ticker, &article, self.preferences.as_ref())
                .await;
            if enrichment.degraded {
                outcome.degraded += 1;
            }

            let item = EnrichedArticle {
                fingerprint: fp,
                ticker: ticker.to_string(),
                source_tag: tag,
                article,
                enrichment,
            };
            match self.store.upsert_article(&item).await {
                Ok(()) => outcome.stored += 1,
                Err(e) => {
                    warn!(
                        "⚠️ [{}] Store failed for {}: {}",
                        ticker, item.fingerprint, e
                    );
                    outcome.storage_failures += 1;
                }
            }
        }

        info!(
            "✅ [{}] {} stored, {} duplicates skipped ({})",
            ticker,
            outcome.stored,
            outcome.duplicates,
            tag.as_str()
        );
        outcome
    }
}
