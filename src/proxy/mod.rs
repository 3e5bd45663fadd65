//! 反向代理模块
//!
//! 上游客户端构建、请求转发与响应体解码

pub mod client;
pub mod decompress;
pub mod forwarder;

pub use client::build_client;
pub use forwarder::{proxy_handler, UPSTREAM_HOST};
