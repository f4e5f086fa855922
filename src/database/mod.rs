use anyhow::Result;
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::modules::perception::structs::{EnrichedArticle, TickerOutcome, TickerSource};

/// 落库契约。编排器和网关只依赖这个 trait，
/// 生产实现是下面的 NewsStore，测试可以换成内存实现。
#[allow(async_fn_in_trait)]
pub trait ArticleStore: Send + Sync {
    async fn claim_fingerprint(
        &self,
        fingerprint: &str,
        ticker: &str,
        title: &str,
        url: &str,
        source_tag: TickerSource,
    ) -> Result<bool>;
    async fn upsert_article(&self, item: &EnrichedArticle) -> Result<()>;
    async fn upsert_status(
        &self,
        ticker: &str,
        outcome: &TickerOutcome,
        source_tag: TickerSource,
    ) -> bool;
    async fn cache_portfolio(&self, tickers: &[String], user_id: &str);
    async fn cached_portfolio(&self, user_id: &str, ttl_sec: u64) -> Vec<String>;
    async fn cache_watchlist(&self, tickers: &[String], user_id: &str);
    async fn cached_watchlist(&self, user_id: &str, ttl_sec: u64) -> Vec<String>;
}

/// 抢占语句。冲突时只有既有行还没富化完成 (bullet_points 为空) 才改签给当前
/// 流水线，所以上一轮在抢占和落库之间失败/被取消留下的骨架行，下一轮会被
/// 重新拿走补完，而不是永远当成重复跳过。rows_affected = 1 即持有处理权。
const CLAIM_SQL: &str = "INSERT INTO news (news_id, ticker, title, url, ticker_source)
     VALUES ($1, $2, $3, $4, $5)
     ON CONFLICT (news_id) DO UPDATE SET
        ticker = EXCLUDED.ticker,
        title = EXCLUDED.title,
        url = EXCLUDED.url,
        ticker_source = EXCLUDED.ticker_source
     WHERE news.bullet_points IS NULL";

/// 完整落库语句。抢占已经插过骨架行，所以这条几乎总是走冲突分支 ——
/// 冲突分支必须覆盖所有内容列 (含 source / published_at / url)，
/// 否则骨架行里的空值会一直留着。created_at 永远保持首次入库时间。
const UPSERT_ARTICLE_SQL: &str = "INSERT INTO news (
        news_id, ticker, title, description, url, source,
        published_at, content, bullet_points, sentiment,
        relevance_score, ticker_source, personalized_insights,
        created_at, updated_at
     ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW(), NOW())
     ON CONFLICT (news_id) DO UPDATE SET
        title = EXCLUDED.title,
        description = EXCLUDED.description,
        url = EXCLUDED.url,
        source = EXCLUDED.source,
        published_at = EXCLUDED.published_at,
        content = EXCLUDED.content,
        bullet_points = EXCLUDED.bullet_points,
        sentiment = EXCLUDED.sentiment,
        relevance_score = EXCLUDED.relevance_score,
        personalized_insights = EXCLUDED.personalized_insights,
        ticker_source = CASE
            WHEN news.ticker_source = EXCLUDED.ticker_source THEN news.ticker_source
            ELSE 'both'
        END,
        updated_at = NOW()";

/// 所有落库操作的唯一入口。指纹既是去重判据也是 news 表主键，
/// 所以"是否新文章"就是"这个主键是否已存在"。
pub struct NewsStore {
    pool: PgPool,
}

impl NewsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 建表语句全部 IF NOT EXISTS，启动时逐条执行
    pub async fn init_schema(&self) -> Result<()> {
        let sql = include_str!("schema.sql");
        for stmt in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            if let Err(e) = sqlx::query(stmt).execute(&self.pool).await {
                // 已存在类报错不算失败，保持和历史库兼容
                if !e.to_string().contains("already exists")
                    && !e.to_string().contains("duplicate column")
                {
                    warn!("Schema warning: {}", e);
                }
            }
        }
        info!("Database schema check complete.");
        Ok(())
    }
}

impl ArticleStore for NewsStore {
    /// 条件插入抢占指纹：插入或改签成功 = 这篇文章归当前流水线处理。
    /// 两个并发 ticker 流水线撞上同一篇宏观新闻时只有一个能抢到，
    /// 输掉的一方只做 ticker_source 并集更新，不再重复送去富化。
    async fn claim_fingerprint(
        &self,
        fingerprint: &str,
        ticker: &str,
        title: &str,
        url: &str,
        source_tag: TickerSource,
    ) -> Result<bool> {
        let claimed = sqlx::query(CLAIM_SQL)
            .bind(fingerprint)
            .bind(ticker)
            .bind(title)
            .bind(url)
            .bind(source_tag.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected()
            == 1;

        if !claimed {
            sqlx::query(
                "UPDATE news SET ticker_source = 'both'
                 WHERE news_id = $1 AND ticker_source <> $2",
            )
            .bind(fingerprint)
            .bind(source_tag.as_str())
            .execute(&self.pool)
            .await?;
        }

        Ok(claimed)
    }

    /// 幂等落库：同一指纹重放只刷新内容字段和 updated_at
    async fn upsert_article(&self, item: &EnrichedArticle) -> Result<()> {
        sqlx::query(UPSERT_ARTICLE_SQL)
            .bind(&item.fingerprint)
            .bind(&item.ticker)
            .bind(&item.article.title)
            .bind(&item.article.description)
            .bind(&item.article.url)
            .bind(&item.article.source)
            .bind(item.article.published_at)
            .bind(&item.article.content)
            .bind(json!(item.enrichment.bullet_points))
            .bind(item.enrichment.sentiment.as_str())
            .bind(item.enrichment.relevance_score)
            .bind(item.source_tag.as_str())
            .bind(&item.enrichment.personalized_insights)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// 状态行是运维审计轨迹，只增不删。
    /// 这里写失败不能把整轮搞挂：吞掉错误、告警、返回 false 让上层计数。
    async fn upsert_status(
        &self,
        ticker: &str,
        outcome: &TickerOutcome,
        source_tag: TickerSource,
    ) -> bool {
        let result = sqlx::query(
            "INSERT INTO news_processing_status
                (ticker, last_attempt, last_success, last_error, articles_stored_count, ticker_source)
             VALUES ($1, NOW(), CASE WHEN $2::text IS NULL THEN NOW() ELSE NULL END, $2, $3, $4)
             ON CONFLICT (ticker) DO UPDATE SET
                last_attempt = NOW(),
                last_success = CASE WHEN $2::text IS NULL THEN NOW()
                               ELSE news_processing_status.last_success END,
                last_error = $2,
                articles_stored_count = $3,
                ticker_source = $4",
        )
        .bind(ticker)
        .bind(outcome.error.as_deref())
        .bind(outcome.stored as i32)
        .bind(source_tag.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to update status for {}: {}", ticker, e);
                false
            }
        }
    }

    // ---- 成员缓存：TTL 判新鲜，不做 LRU，新鲜度优先于容量 ----

    async fn cache_portfolio(&self, tickers: &[String], user_id: &str) {
        for ticker in tickers {
            if let Err(e) = sqlx::query(
                "INSERT INTO portfolio_cache (ticker, user_id, last_updated)
                 VALUES ($1, $2, NOW())
                 ON CONFLICT (ticker) DO UPDATE SET user_id = $2, last_updated = NOW()",
            )
            .bind(ticker)
            .bind(user_id)
            .execute(&self.pool)
            .await
            {
                warn!("Failed to cache portfolio ticker {}: {}", ticker, e);
                return;
            }
        }
        info!("Cached {} portfolio tickers", tickers.len());
    }

    async fn cached_portfolio(&self, user_id: &str, ttl_sec: u64) -> Vec<String> {
        match sqlx::query_scalar::<_, String>(
            "SELECT ticker FROM portfolio_cache
             WHERE user_id = $1 AND last_updated > NOW() - make_interval(secs => $2)",
        )
        .bind(user_id)
        .bind(ttl_sec as f64)
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to read portfolio cache: {}", e);
                Vec::new()
            }
        }
    }

    async fn cache_watchlist(&self, tickers: &[String], user_id: &str) {
        for ticker in tickers {
            if let Err(e) = sqlx::query(
                "INSERT INTO watchlist_cache (ticker, user_id, last_updated)
                 VALUES ($1, $2, NOW())
                 ON CONFLICT (ticker) DO UPDATE SET user_id = $2, last_updated = NOW()",
            )
            .bind(ticker)
            .bind(user_id)
            .execute(&self.pool)
            .await
            {
                warn!("Failed to cache watchlist ticker {}: {}", ticker, e);
                return;
            }
        }
        info!("Cached {} watchlist tickers", tickers.len());
    }

    async fn cached_watchlist(&self, user_id: &str, ttl_sec: u64) -> Vec<String> {
        match sqlx::query_scalar::<_, String>(
            "SELECT ticker FROM watchlist_cache
             WHERE user_id = $1 AND last_updated > NOW() - make_interval(secs => $2)",
        )
        .bind(user_id)
        .bind(ttl_sec as f64)
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to read watchlist cache: {}", e);
                Vec::new()
            }
        }
    }
}
