//! 捕获 API 路由

use axum::{routing::get, Router};

use crate::server::AppState;

use super::handlers::{clear_captures, get_captures, health, ws_handler};

/// 管理面路由：健康检查、捕获查询与清空、实时推送
///
/// 返回未绑定状态的 Router，可直接 merge 到主应用
pub fn capture_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/captures", get(get_captures).delete(clear_captures))
        .route("/ws", get(ws_handler))
}
