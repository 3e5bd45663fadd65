//! 反向代理转发器
//!
//! 把入站请求原样转发到固定上游，响应字节逐 chunk 回传客户端，
//! 同时在旁路喂给流式重建器。捕获管线的任何失败都不影响代理交换本身。

use std::time::Instant;

use axum::{
    body::Body,
    extract::{FromRequestParts, State, WebSocketUpgrade},
    http::{header, HeaderMap, Request, Response, StatusCode},
    response::{IntoResponse, Json},
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::capture::handlers::subscriber_connection;
use crate::capture::model::{now_iso, CaptureRequest, CaptureResponse, ContentBlock, Usage};
use crate::capture::{BroadcastMessage, SseParser};
use crate::common::preview;
use crate::server::AppState;

use super::decompress::decode_body;

/// 固定上游主机
pub const UPSTREAM_HOST: &str = "api.anthropic.com";
/// 请求体上限（50 MiB）
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;
/// 逐跳头，不跨代理转发
const HOP_BY_HOP_HEADERS: &[&str] = &["connection", "keep-alive", "transfer-encoding"];
/// tee 通道容量：不超出 chunk 边界缓冲，慢客户端自然反压上游读取
const TEE_CHANNEL_CAPACITY: usize = 1;

/// 兜底处理器：携带 Upgrade 的连接转入订阅，其余请求转发上游
pub async fn proxy_handler(
    State(state): State<AppState>,
    req: Request<Body>,
) -> Response<Body> {
    let is_upgrade = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false)
        && req
            .headers()
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);

    if is_upgrade {
        let (mut parts, _body) = req.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(ws) => ws.on_upgrade(move |socket| subscriber_connection(socket, state)),
            Err(rejection) => rejection.into_response(),
        };
    }

    let started = Instant::now();
    let (parts, body) = req.into_parts();

    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({
                    "error": {
                        "type": "invalid_request_error",
                        "message": "Request body exceeds 50 MiB limit"
                    }
                })),
            )
                .into_response();
        }
    };

    let capture = CaptureRequest::from_body(&body_bytes);
    if capture.model == "unknown" && !body_bytes.is_empty() {
        tracing::debug!(
            body = %preview(&String::from_utf8_lossy(&body_bytes), 200),
            "请求体无法解析，按部分信息捕获"
        );
    }
    tracing::info!(
        id = %capture.id,
        model = %capture.model,
        stream = capture.stream,
        path = %parts.uri.path(),
        "捕获请求"
    );

    // 先持久化请求记录再打开上游连接，保证日志中请求先于响应
    if let Err(e) = state.log.log_request(&capture).await {
        tracing::error!("写入请求记录失败: {}", e);
    }
    state.broadcaster.publish(BroadcastMessage::Request {
        data: capture.clone(),
    });

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("https://{}{}", UPSTREAM_HOST, path_and_query);

    // 请求体按原始字节转发，保持与捕获解析无关的逐字节一致
    let upstream = match state
        .client
        .request(parts.method.clone(), &url)
        .headers(forwardable_headers(&parts.headers, true))
        .body(body_bytes)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(id = %capture.id, "上游请求失败: {}", e);
            return proxy_failed(&e.to_string());
        }
    };

    let status = upstream.status();
    let headers = forwardable_headers(upstream.headers(), false);
    // 仅对成功响应做旁路重建；错误响应原样透传、不产生响应记录
    let capturable = status.is_success();

    if capture.stream {
        stream_response(state, capture, started, status, headers, upstream, capturable)
    } else {
        buffered_response(state, capture, started, status, headers, upstream, capturable).await
    }
}

/// 502 响应体（格式对客户端是稳定契约）
fn proxy_failed(message: &str) -> Response<Body> {
    (
        StatusCode::BAD_GATEWAY,
        Json(serde_json::json!({
            "error": "Proxy request failed",
            "message": message,
        })),
    )
        .into_response()
}

/// 复制可转发的头：剔除逐跳头；入站方向同时剔除 Host，
/// 由上游客户端按目标主机重新生成
fn forwardable_headers(headers: &HeaderMap, strip_host: bool) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if strip_host && name == header::HOST {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// 流式分支：上游 chunk 同步喂给重建器后回传客户端
///
/// tee 通道容量为 1，发送端等待即是对上游读取的反压
fn stream_response(
    state: AppState,
    capture: CaptureRequest,
    started: Instant,
    status: StatusCode,
    headers: HeaderMap,
    upstream: reqwest::Response,
    capturable: bool,
) -> Response<Body> {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(TEE_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut parser = capturable.then(SseParser::new);
        let mut chunks = upstream.bytes_stream();
        let mut upstream_error = false;

        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    if let Some(parser) = parser.as_mut() {
                        parser.feed(&chunk);
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        // 客户端先断开：取消上游读取，丢弃部分重建状态
                        tracing::debug!(id = %capture.id, "客户端中断流式响应，丢弃重建状态");
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(id = %capture.id, "上游流中断: {}", e);
                    upstream_error = true;
                    let _ = tx.send(Err(std::io::Error::other(e))).await;
                    break;
                }
            }
        }
        drop(tx);

        if let Some(parser) = parser {
            let mut response = parser.finalize(&capture.id, started.elapsed().as_millis() as u64);
            if upstream_error {
                response.stop_reason = None;
            }
            emit_response(&state, response).await;
        }
    });

    let body = Body::from_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }));

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// 非流式分支：整体缓冲回传客户端，解码与重建在旁路任务中进行
async fn buffered_response(
    state: AppState,
    capture: CaptureRequest,
    started: Instant,
    status: StatusCode,
    headers: HeaderMap,
    upstream: reqwest::Response,
    capturable: bool,
) -> Response<Body> {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let body = match upstream.bytes().await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(id = %capture.id, "读取上游响应失败: {}", e);
            return proxy_failed(&e.to_string());
        }
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    if capturable {
        let raw = body.clone();
        tokio::spawn(async move {
            match synthesize_response(&capture.id, duration_ms, encoding.as_deref(), &raw) {
                Ok(response) => emit_response(&state, response).await,
                Err(e) => {
                    tracing::warn!(id = %capture.id, "响应体无法重建，跳过记录: {}", e);
                }
            }
        });
    }

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// 持久化并广播一条响应记录
async fn emit_response(state: &AppState, response: CaptureResponse) {
    tracing::info!(
        id = %response.request_id,
        model = %response.model,
        duration_ms = response.duration_ms,
        input_tokens = response.usage.input_tokens,
        output_tokens = response.usage.output_tokens,
        "捕获响应"
    );
    if let Err(e) = state.log.log_response(&response).await {
        tracing::error!("写入响应记录失败: {}", e);
    }
    state
        .broadcaster
        .publish(BroadcastMessage::Response { data: response });
}

/// 非流式响应体（仅捕获需要的字段）
#[derive(Debug, Deserialize)]
struct MessageBody {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

/// 从完整 JSON 响应体直接合成响应记录
fn synthesize_response(
    request_id: &str,
    duration_ms: u64,
    encoding: Option<&str>,
    raw: &[u8],
) -> anyhow::Result<CaptureResponse> {
    use anyhow::Context;

    let decoded = decode_body(encoding, raw)?;
    let parsed: MessageBody =
        serde_json::from_slice(&decoded).context("解析响应 JSON 失败")?;

    Ok(CaptureResponse {
        request_id: request_id.to_string(),
        timestamp: now_iso(),
        duration_ms,
        model: parsed.model.unwrap_or_else(|| "unknown".to_string()),
        content: parsed.content,
        stop_reason: parsed.stop_reason,
        usage: parsed.usage,
    })
}
