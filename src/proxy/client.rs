//! 上游 HTTP 客户端构建

use std::time::Duration;

use reqwest::{Client, Proxy};

/// 上游连接超时
const CONNECT_TIMEOUT_SECS: u64 = 5;
/// 上游读取超时（流式响应可能持续很久）
const READ_TIMEOUT_SECS: u64 = 600;

/// 构建上游 HTTPS 客户端
///
/// # Arguments
/// * `proxy_url` - 可选的出站代理 URL，支持格式:
///   - http://host:port
///   - socks5://host:port
pub fn build_client(proxy_url: Option<&str>) -> anyhow::Result<Client> {
    // 重定向必须原样透传给客户端，客户端自行决定是否跟随
    let mut builder = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .read_timeout(Duration::from_secs(READ_TIMEOUT_SECS));

    if let Some(url) = proxy_url {
        builder = builder.proxy(Proxy::all(url)?);
        tracing::debug!("上游客户端使用代理: {}", url);
    }

    Ok(builder.build()?)
}
