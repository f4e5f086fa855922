use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

// sha256 hex 截断到 32 位，和存储主键宽度一致
const FINGERPRINT_LEN: usize = 32;

/// 内容指纹：同一篇现实世界的文章无论被哪个 ticker 的搜索带回来，
/// 指纹必须一致。输入是归一化后的 (标题, 链接, 发布日期截断到天)。
pub fn compute(title: &str, url: &str, published_at: Option<DateTime<Utc>>) -> String {
    let day = published_at
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    let material = format!("{}|{}|{}", normalize_title(title), normalize_url(url), day);

    let digest = Sha256::digest(material.as_bytes());
    let mut hexed = hex::encode(digest);
    hexed.truncate(FINGERPRINT_LEN);
    hexed
}

fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// 链接归一化刻意保守：只去 fragment 和末尾斜杠。
/// query 参数保留 —— 很多站点靠 ?id= 区分文章，去掉会把不同文章合并成一条。
fn normalize_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string().trim_end_matches('/').to_string()
        }
        Err(_) => raw.trim().trim_end_matches('/').to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(h: u32, m: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2025, 6, 1, h, m, 0).unwrap())
    }

    #[test]
    fn deterministic_and_fixed_width() {
        let a = compute("Apple beats earnings", "https://example.com/a", day(9, 30));
        let b = compute("Apple beats earnings", "https://example.com/a", day(9, 30));
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn title_case_and_whitespace_do_not_split_articles() {
        let a = compute("Apple  Beats   Earnings", "https://example.com/a", day(9, 30));
        let b = compute("apple beats earnings", "https://example.com/a", day(9, 30));
        assert_eq!(a, b);
    }

    #[test]
    fn published_time_truncates_to_day() {
        let morning = compute("t", "https://example.com/a", day(6, 0));
        let evening = compute("t", "https://example.com/a", day(22, 15));
        assert_eq!(morning, evening);

        let next_day = Some(Utc.with_ymd_and_hms(2025, 6, 2, 6, 0, 0).unwrap());
        assert_ne!(morning, compute("t", "https://example.com/a", next_day));
    }

    #[test]
    fn fragment_and_trailing_slash_ignored() {
        let a = compute("t", "https://example.com/story/", day(9, 0));
        let b = compute("t", "https://example.com/story#section-2", day(9, 0));
        assert_eq!(a, b);
    }

    #[test]
    fn query_strings_keep_articles_distinct() {
        let a = compute("t", "https://example.com/story?id=1", day(9, 0));
        let b = compute("t", "https://example.com/story?id=2", day(9, 0));
        assert_ne!(a, b);
    }

    #[test]
    fn distinct_titles_do_not_collide() {
        let a = compute("Apple beats earnings", "https://example.com/a", day(9, 0));
        let b = compute("Apple misses earnings", "https://example.com/a", day(9, 0));
        assert_ne!(a, b);
    }

    #[test]
    fn missing_published_date_is_stable() {
        let a = compute("t", "https://example.com/a", None);
        let b = compute("t", "https://example.com/a", None);
        assert_eq!(a, b);
        assert_ne!(a, compute("t", "https://example.com/a", day(9, 0)));
    }
}
