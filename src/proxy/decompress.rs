//! 非流式响应体解码
//!
//! 客户端收到的始终是上游原始字节；解码只服务于旁路捕获

use std::io::Read;

use anyhow::{Context, Result};

/// 按 Content-Encoding 解码响应体
///
/// 识别 gzip / deflate / br；其他编码（含 identity 与缺失）原样返回
pub fn decode_body(encoding: Option<&str>, body: &[u8]) -> Result<Vec<u8>> {
    let encoding = encoding.map(|e| e.trim().to_ascii_lowercase());
    match encoding.as_deref() {
        Some("gzip") | Some("x-gzip") => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(body)
                .read_to_end(&mut out)
                .context("gzip 解压失败")?;
            Ok(out)
        }
        Some("deflate") => {
            // HTTP 的 deflate 按规范是 zlib 封装，但部分实现发送裸 deflate，两种都尝试
            let mut out = Vec::new();
            if flate2::read::ZlibDecoder::new(body)
                .read_to_end(&mut out)
                .is_ok()
            {
                return Ok(out);
            }
            let mut out = Vec::new();
            flate2::read::DeflateDecoder::new(body)
                .read_to_end(&mut out)
                .context("deflate 解压失败")?;
            Ok(out)
        }
        Some("br") => {
            let mut out = Vec::new();
            brotli::Decompressor::new(body, 4096)
                .read_to_end(&mut out)
                .context("brotli 解压失败")?;
            Ok(out)
        }
        _ => Ok(body.to_vec()),
    }
}
