//! 应用状态与路由装配

use std::sync::Arc;

use axum::Router;

use crate::capture::{capture_routes, Broadcaster, CaptureLog};
use crate::proxy::proxy_handler;

/// 应用共享状态
#[derive(Clone)]
pub struct AppState {
    /// 捕获日志（独占文件句柄）
    pub log: Arc<CaptureLog>,
    /// 实时事件扇出
    pub broadcaster: Arc<Broadcaster>,
    /// 上游 HTTP 客户端
    pub client: reqwest::Client,
}

impl AppState {
    pub fn new(log: CaptureLog, client: reqwest::Client) -> Self {
        Self {
            log: Arc::new(log),
            broadcaster: Arc::new(Broadcaster::new()),
            client,
        }
    }
}

/// CORS 中间件层
///
/// 管理面供外部仪表盘消费，允许任意来源
pub fn cors_layer() -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// 装配完整路由：管理端点在前，其余路径全部兜底转发上游
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(capture_routes())
        .fallback(proxy_handler)
        .layer(cors_layer())
        .with_state(state)
}
