mod config;
mod database;
mod utils;
mod modules;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::pipeline_profile::PipelineProfile;
use crate::database::NewsStore;
use crate::modules::brain::ArticleAnalyst;
use crate::modules::perception::{HoldingsGateway, NewsSearcher};
use crate::modules::pipeline::NewsAggregator;
use crate::utils::http_client::HttpClientFactory;
use crate::utils::throttle::{ProviderThrottle, RetryPolicy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();
    info!("Starting Porta News Pipeline V1.2...");

    // 1. 基础设施初始化
    let profile = PipelineProfile::load().expect("Failed to load pipeline config");
    let db_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set in .env");
    let user_id = env::var("DEFAULT_USER_ID").unwrap_or("demo-user".to_string());

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&db_url)
        .await
        .map_err(|e| {
            error!("CRITICAL: DB Connection Failed! Is Postgres running?");
            e
        })?;

    let store = Arc::new(NewsStore::new(pool));
    store.init_schema().await?;

    // 2. 模块初始化
    let std_client = HttpClientFactory::create()?;
    let llm_client = HttpClientFactory::create_llm()?;

    let retry = RetryPolicy::new(
        profile.retry.max_attempts,
        Duration::from_millis(profile.retry.base_delay_ms),
    );
    let news_throttle = Arc::new(ProviderThrottle::new(Duration::from_millis(
        profile.throttle.news_call_delay_ms,
    )));
    let llm_throttle = Arc::new(ProviderThrottle::new(Duration::from_millis(
        profile.throttle.llm_call_delay_ms,
    )));

    let holdings = Arc::new(HoldingsGateway::new(std_client.clone(), retry.clone()));
    let searcher = Arc::new(NewsSearcher::new(
        std_client.clone(),
        news_throttle,
        retry.clone(),
    ));
    let analyst = Arc::new(ArticleAnalyst::new(llm_client, llm_throttle));

    // 3. 搜索通道探活（失败不阻断启动，第一轮周期还会再试）
    match searcher.probe().await {
        Ok(_) => info!("✅ News search provider reachable."),
        Err(e) => warn!("⚠️ News search probe failed: {}. Will retry in cycle.", e),
    }

    // 4. 读者画像（可选，拿不到就用通用提示词）
    let preferences = holdings.fetch_preferences(&user_id).await;
    if preferences.is_some() {
        info!("✅ Loaded reader preferences for {}", user_id);
    }

    let cycle_interval = Duration::from_secs(profile.timing.cycle_interval_sec);
    let cycle_deadline = Duration::from_secs(profile.timing.cycle_deadline_sec);

    let aggregator = NewsAggregator::new(
        store,
        holdings,
        searcher,
        analyst,
        profile,
        user_id,
        preferences,
    );

    info!(
        "✅ System initialized. Cycle every {}s, deadline {}s.",
        cycle_interval.as_secs(),
        cycle_deadline.as_secs()
    );

    // 5. 固定间隔调度。上一轮拖过点就跳过错过的 tick，不追账
    let mut cycle_timer = interval(cycle_interval);
    cycle_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        cycle_timer.tick().await;
        let started = Instant::now();

        match timeout(cycle_deadline, aggregator.run_cycle()).await {
            Ok(Ok(stats)) => {
                info!("💤 Cycle done in {:?}. {}", started.elapsed(), stats.summary());
            }
            Ok(Err(e)) => {
                error!("🔥 Cycle aborted: {}", e);
            }
            Err(_) => {
                error!(
                    "🔥 Cycle exceeded deadline ({}s), abandoned.",
                    cycle_deadline.as_secs()
                );
            }
        }

        if started.elapsed() > cycle_interval {
            warn!(
                "⏱️ Cycle overran the interval ({:?} > {:?}), skipping missed ticks.",
                started.elapsed(),
                cycle_interval
            );
        }
    }
}
