use anyhow::{anyhow, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::modules::perception::structs::{CandidateArticle, Enrichment, Sentiment};
use crate::utils::throttle::ProviderThrottle;

/// 解析失败或服务商挂掉时的保底相关度（低置信）
pub const FALLBACK_RELEVANCE: f64 = 0.3;
const BULLET_COUNT: usize = 3;
const LLM_ATTEMPTS: u32 = 3;
// 控制送进模型的正文长度，整页新闻没必要
const MAX_CONTENT_CHARS: usize = 1500;

pub struct ArticleAnalyst {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    throttle: Arc<ProviderThrottle>,
}

impl ArticleAnalyst {
    pub fn new(client: Client, throttle: Arc<ProviderThrottle>) -> Self {
        Self {
            client,
            api_key: env::var("DEEPSEEK_API_KEY").unwrap_or_default(),
            base_url: env::var("DEEPSEEK_BASE_URL")
                .unwrap_or_else(|_| "https://api.deepseek.com".to_string()),
            model: env::var("ANALYSIS_MODEL").unwrap_or_else(|_| "deepseek-chat".to_string()),
            throttle,
        }
    }

    #[cfg(test)]
    pub fn with_endpoint(
        client: Client,
        throttle: Arc<ProviderThrottle>,
        base_url: &str,
        api_key: &str,
    ) -> Self {
        Self {
            client,
            api_key: api_key.to_string(),
            base_url: base_url.to_string(),
            model: "test-model".to_string(),
            throttle,
        }
    }

    /// 富化永不对外失败：拿不到像样的分析就降级兜底。
    /// 宁可存一条降级记录，也不能因为分析挂了丢文章。
    pub async fn enrich(
        &self,
        ticker: &str,
        article: &CandidateArticle,
        preferences: Option<&Value>,
    ) -> Enrichment {
        if self.api_key.is_empty() {
            warn!("⚠️ No analysis API key configured. Degraded enrichment for {}.", ticker);
            return Self::fallback(ticker, article);
        }

        let system_prompt = Self::system_prompt(ticker, preferences);
        let user_prompt = Self::user_prompt(ticker, article);

        // 分析服务商有自己的全局节流阀，和搜索配额无关
        self.throttle.acquire().await;

        match self.call_llm(&system_prompt, &user_prompt).await {
            Ok(raw) => match Self::extract_json(&raw).and_then(|v| Self::validate(ticker, &v)) {
                Some(enrichment) => {
                    info!(
                        "🧠 [{}] Enriched: sentiment={}, relevance={:.2}",
                        ticker,
                        enrichment.sentiment.as_str(),
                        enrichment.relevance_score
                    );
                    enrichment
                }
                None => {
                    warn!("⚠️ Malformed analysis output for {}. Using fallback.", ticker);
                    Self::fallback(ticker, article)
                }
            },
            Err(e) => {
                warn!("⚠️ Analysis provider failed for {}: {}. Using fallback.", ticker, e);
                Self::fallback(ticker, article)
            }
        }
    }

    fn system_prompt(ticker: &str, preferences: Option<&Value>) -> String {
        let mut prompt = format!(
            r#"You are a financial news analyst. Analyze this news article about {} and respond with ONLY this exact JSON format, no other text:
{{
    "bullet_points": ["point1", "point2", "point3"],
    "sentiment": "positive",
    "relevance_score": 0.85,
    "personalized_insights": "insights tailored to the reader"
}}

Rules:
- bullet_points: exactly 3 key insights from the article
- sentiment: only "positive", "negative", or "neutral"
- relevance_score: number between 0.0 and 1.0
- NO additional text, ONLY the JSON"#,
            ticker
        );

        if let Some(prefs) = preferences {
            prompt.push_str(&format!(
                "\n\nREADER PROFILE (tailor personalized_insights to it):\n\
                 - Experience level: {}\n\
                 - Investment style: {}\n\
                 - Risk tolerance: {}\n\
                 - Preferred sectors: {}",
                prefs["experience_level"].as_str().unwrap_or("intermediate"),
                prefs["investment_style"].as_str().unwrap_or("moderate"),
                prefs["risk_tolerance"].as_str().unwrap_or("medium"),
                prefs["preferred_sectors"]
                    .as_array()
                    .map(|a| a
                        .iter()
                        .filter_map(|v| v.as_str())
                        .collect::<Vec<_>>()
                        .join(", "))
                    .unwrap_or_default(),
            ));
        }

        prompt
    }

    fn user_prompt(ticker: &str, article: &CandidateArticle) -> String {
        let content: String = article.content.chars().take(MAX_CONTENT_CHARS).collect();
        format!(
            "Ticker: {}\nTitle: {}\nDescription: {}\nContent: {}",
            ticker, article.title, article.description, content
        )
    }

    async fn call_llm(&self, sys_prompt: &str, user_prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": sys_prompt},
                {"role": "user", "content": user_prompt}
            ],
            "temperature": 0.1,
        });

        for _attempt in 1..=LLM_ATTEMPTS {
            let resp_result = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp_result {
                Ok(r) => {
                    if !r.status().is_success() {
                        let err = r.text().await.unwrap_or_default();
                        warn!("⚠️ {} API Error: {}", self.model, err);
                        sleep(Duration::from_secs(2)).await;
                        continue;
                    }
                    let content_str = r.text().await.unwrap_or_default();
                    if let Ok(json_res) = serde_json::from_str::<Value>(&content_str) {
                        if let Some(content) =
                            json_res["choices"][0]["message"]["content"].as_str()
                        {
                            return Ok(content.to_string());
                        }
                    }
                    warn!("⚠️ Unexpected completion payload shape");
                }
                Err(e) => {
                    warn!("⚠️ {} Network Error: {}", self.model, e);
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
        Err(anyhow!("{} failed after {} attempts", self.model, LLM_ATTEMPTS))
    }

    /// 模型偶尔会包 markdown 栅栏或夹带解释文字，按宽松顺序尝试提取
    fn extract_json(raw: &str) -> Option<Value> {
        if let Ok(v) = serde_json::from_str::<Value>(raw) {
            return Some(v);
        }
        if let Some(start) = raw.find("```json") {
            let after = &raw[start + 7..];
            if let Some(end) = after.find("```") {
                if let Ok(v) = serde_json::from_str::<Value>(&after[..end]) {
                    return Some(v);
                }
            }
        }
        if let Some(start) = raw.find('{') {
            if let Some(end) = raw.rfind('}') {
                if end > start {
                    if let Ok(v) = serde_json::from_str::<Value>(&raw[start..=end]) {
                        return Some(v);
                    }
                }
            }
        }
        None
    }

    /// bullet_points 数组在场就算可用输出，其余字段缺了按保底值修正；
    /// 连 bullet_points 都没有就认定输出不可解析，走兜底。
    fn validate(ticker: &str, v: &Value) -> Option<Enrichment> {
        let raw_bullets = v["bullet_points"].as_array()?;

        let mut bullets: Vec<String> = raw_bullets
            .iter()
            .filter_map(|b| b.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        bullets.truncate(BULLET_COUNT);
        Self::pad_bullets(&mut bullets, ticker);

        let sentiment = v["sentiment"]
            .as_str()
            .and_then(Sentiment::parse)
            .unwrap_or(Sentiment::Neutral);

        let relevance_score = v["relevance_score"]
            .as_f64()
            .filter(|s| s.is_finite())
            .map(|s| s.clamp(0.0, 1.0))
            .unwrap_or(FALLBACK_RELEVANCE);

        Some(Enrichment {
            bullet_points: bullets,
            sentiment,
            relevance_score,
            personalized_insights: v["personalized_insights"]
                .as_str()
                .unwrap_or("")
                .to_string(),
            degraded: false,
        })
    }

    fn pad_bullets(bullets: &mut Vec<String>, ticker: &str) {
        let fillers = [
            format!("News update on {} stock", ticker),
            "Financial market development".to_string(),
            "Potential impact on holdings to monitor".to_string(),
        ];
        for filler in fillers {
            if bullets.len() >= BULLET_COUNT {
                break;
            }
            bullets.push(filler);
        }
    }

    /// 降级兜底：从摘要/正文里硬切三条要点，情感中性，相关度给低置信保底值
    fn fallback(ticker: &str, article: &CandidateArticle) -> Enrichment {
        let mut bullets = Self::snippet_bullets(article);
        bullets.truncate(BULLET_COUNT);
        Self::pad_bullets(&mut bullets, ticker);

        Enrichment {
            bullet_points: bullets,
            sentiment: Sentiment::Neutral,
            relevance_score: FALLBACK_RELEVANCE,
            personalized_insights: format!(
                "Automated summary for {} - analysis provider unavailable",
                ticker
            ),
            degraded: true,
        }
    }

    fn snippet_bullets(article: &CandidateArticle) -> Vec<String> {
        let text = if article.description.trim().is_empty() {
            &article.content
        } else {
            &article.description
        };
        text.split(['.', '!', '?'])
            .map(str::trim)
            .filter(|s| s.len() >= 20) // 太短的碎片不成要点
            .take(BULLET_COUNT)
            .map(|s| s.to_string())
            .collect()
    }
}
