//! claude-tap 入口
//!
//! 加载配置、初始化运行日志、装配共享状态并启动代理服务

mod capture;
mod common;
mod model;
mod proxy;
mod server;

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::capture::CaptureLog;
use crate::model::Config;
use crate::server::{create_app, AppState};

/// 优雅关闭时等待在途请求排空的期限
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_config_path().to_string());
    let config = Config::load(&config_path)?;

    init_tracing(config.verbose);

    let log = CaptureLog::new(&config.data_dir)?;
    tracing::info!(
        log_file = %log.path().display(),
        existing_entries = log.read_all().await.len(),
        "捕获日志就绪"
    );

    let client = proxy::build_client(config.proxy_url.as_deref())?;
    let state = AppState::new(log, client);
    let app = create_app(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("监听失败: {}", addr))?;
    tracing::info!(
        addr = %addr,
        upstream = proxy::UPSTREAM_HOST,
        "claude-tap 已启动"
    );

    let shutdown = CancellationToken::new();
    let server_token = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_token.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .context("等待退出信号失败")?;
    tracing::info!("收到退出信号，停止接收新连接");
    shutdown.cancel();

    match tokio::time::timeout(DRAIN_DEADLINE, server).await {
        Ok(join) => join.context("服务任务异常退出")??,
        Err(_) => tracing::warn!("在途请求排空超时，强制退出"),
    }

    tracing::info!("claude-tap 已退出");
    Ok(())
}

/// 初始化 stderr 运行日志
///
/// RUST_LOG 优先；未设置时 verbose 决定默认级别
fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "claude_tap=debug,info"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
