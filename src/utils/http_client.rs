use reqwest::Client;
use std::time::Duration;
use anyhow::Result;
use tracing::info;

pub struct HttpClientFactory;

impl HttpClientFactory {
    /// 创建通用 HTTP Client
    /// 用于新闻搜索 / 持仓 / 自选等常规 API，超时从紧
    pub fn create() -> Result<Client> {
        let builder = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Some(Duration::from_secs(30)));

        info!("🌐 [Http Client] General client ready (30s timeout)");

        let client = builder.build()?;
        Ok(client)
    }

    /// 创建长连接 HTTP Client (用于语言分析服务商)
    /// 分析一篇文章可能要推理很久，总超时放宽
    pub fn create_llm() -> Result<Client> {
        let builder = Client::builder()
            // 推理型模型响应慢，给足时间防止中途断开
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            // 强制 HTTP/1.1 (稳定，避免 HTTP/2 在某些云厂商网络下的断流问题)
            .http1_only()
            .pool_max_idle_per_host(0); // 关闭连接池复用，每次新建连接

        let client = builder.build()?;
        Ok(client)
    }
}
