//! LLM 流量捕获模块
//!
//! 请求/响应记录模型、流式响应重建、JSONL 持久化与实时推送

pub mod broadcast;
pub mod handlers;
pub mod model;
pub mod router;
pub mod sse;
pub mod store;

pub use broadcast::{BroadcastMessage, Broadcaster};
pub use router::capture_routes;
pub use sse::SseParser;
pub use store::CaptureLog;
