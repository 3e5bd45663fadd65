//! 捕获 API 处理器与 WebSocket 推送

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};

use crate::server::AppState;

use super::model::now_iso;

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": now_iso(),
    }))
}

/// GET /api/captures
pub async fn get_captures(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.log.get_pairs().await)
}

/// DELETE /api/captures
pub async fn clear_captures(State(state): State<AppState>) -> Response {
    match state.log.clear().await {
        Ok(()) => Json(serde_json::json!({"status": "cleared"})).into_response(),
        Err(e) => {
            tracing::error!("清空捕获日志失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": {"type": "internal_error", "message": format!("清空失败: {}", e)}
                })),
            )
                .into_response()
        }
    }
}

/// GET /ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| subscriber_connection(socket, state))
}

/// 单个订阅者连接
///
/// 把广播消息序列化为文本帧推送；对端关闭或发送失败即退出，
/// 订阅句柄 Drop 时自动退订
pub async fn subscriber_connection(mut socket: WebSocket, state: AppState) {
    let mut subscription = state.broadcaster.subscribe();
    tracing::debug!(
        subscribers = state.broadcaster.subscriber_count(),
        "订阅者已连接"
    );

    loop {
        tokio::select! {
            msg = subscription.recv() => {
                let Some(msg) = msg else { break };
                let text = match serde_json::to_string(&*msg) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!("序列化广播消息失败: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // 客户端发来的其他帧（ping/pong 由底层处理）直接忽略
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!("订阅者断开");
}
