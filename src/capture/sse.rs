//! SSE 流式响应重建
//!
//! 对上游字节流做逐帧解析，增量累积出结构化的 CaptureResponse。
//! 解析器是纯状态机，由转发循环同步调用，不做任何 I/O。

use serde_json::Value;

use super::model::{now_iso, CaptureResponse, ContentBlock, Usage};

/// 当前打开的内容块槽位
#[derive(Debug)]
enum OpenBlock {
    Text { text: String },
    ToolUse { id: String, name: String, json: String },
    /// 未识别的块类型：吞掉它的 delta 和 stop，不产出内容
    Skipped,
}

/// 流式事件解析器兼累积器
///
/// 帧以换行分隔，`data: ` 前缀携带 JSON 事件，`[DONE]` 为终止符。
/// 任意字节边界都可能切断帧，pending 缓冲区保留跨 chunk 的残行
/// （按字节保留，多字节 UTF-8 字符也可能被切断）。
#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
    message_id: Option<String>,
    model: Option<String>,
    usage: Usage,
    stop_reason: Option<String>,
    current: Option<OpenBlock>,
    content: Vec<ContentBlock>,
    done: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入一段上游字节，处理其中所有完整行
    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);

        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            // 去掉 \n 和可能的 \r
            let mut end = line.len() - 1;
            if end > 0 && line[end - 1] == b'\r' {
                end -= 1;
            }
            self.process_line(&line[..end]);
        }
    }

    fn process_line(&mut self, line: &[u8]) {
        if self.done || line.is_empty() || line.first() == Some(&b':') {
            return;
        }
        let line = String::from_utf8_lossy(line);
        let Some(payload) = line.strip_prefix("data: ") else {
            return;
        };
        if payload == "[DONE]" {
            self.done = true;
            return;
        }
        // 残损帧的解析错误静默丢弃，继续处理下一帧
        match serde_json::from_str::<Value>(payload) {
            Ok(event) => self.apply_event(&event),
            Err(_) => {}
        }
    }

    fn apply_event(&mut self, event: &Value) {
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(message) = event.get("message") {
                    self.message_id = message
                        .get("id")
                        .and_then(Value::as_str)
                        .map(String::from);
                    self.model = message
                        .get("model")
                        .and_then(Value::as_str)
                        .map(String::from);
                    if let Some(usage) = message.get("usage") {
                        self.usage =
                            serde_json::from_value(usage.clone()).unwrap_or_default();
                    }
                }
            }
            Some("content_block_start") => {
                let block = event.get("content_block");
                self.current = Some(match block.and_then(|b| b.get("type")).and_then(Value::as_str)
                {
                    Some("text") => OpenBlock::Text {
                        text: block
                            .and_then(|b| b.get("text"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    },
                    Some("tool_use") => OpenBlock::ToolUse {
                        id: block
                            .and_then(|b| b.get("id"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .and_then(|b| b.get("name"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        json: String::new(),
                    },
                    _ => OpenBlock::Skipped,
                });
            }
            Some("content_block_delta") => {
                let delta = event.get("delta");
                match (
                    delta.and_then(|d| d.get("type")).and_then(Value::as_str),
                    self.current.as_mut(),
                ) {
                    (Some("text_delta"), Some(OpenBlock::Text { text })) => {
                        if let Some(t) = delta.and_then(|d| d.get("text")).and_then(Value::as_str) {
                            text.push_str(t);
                        }
                    }
                    (Some("input_json_delta"), Some(OpenBlock::ToolUse { json, .. })) => {
                        if let Some(p) = delta
                            .and_then(|d| d.get("partial_json"))
                            .and_then(Value::as_str)
                        {
                            json.push_str(p);
                        }
                    }
                    _ => {}
                }
            }
            Some("content_block_stop") => self.close_current(),
            Some("message_delta") => {
                if let Some(delta) = event.get("delta") {
                    if let Some(sr) = delta.get("stop_reason") {
                        self.stop_reason = sr.as_str().map(String::from);
                    }
                }
                if let Some(tokens) = event
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_u64)
                {
                    self.usage.output_tokens = tokens;
                }
            }
            // message_stop 不改变状态，仅标志干净结束（缺失也被容忍）；
            // ping 和未知事件一并忽略
            _ => {}
        }
    }

    /// 结算当前打开的块
    ///
    /// 没有活动块的 content_block_stop 会落到这里并被忽略
    fn close_current(&mut self) {
        match self.current.take() {
            Some(OpenBlock::Text { text }) => {
                self.content.push(ContentBlock::Text { text });
            }
            Some(OpenBlock::ToolUse { id, name, json }) => {
                let input = serde_json::from_str::<Value>(&json)
                    .unwrap_or_else(|_| serde_json::json!({}));
                self.content.push(ContentBlock::ToolUse { id, name, input });
            }
            Some(OpenBlock::Skipped) | None => {}
        }
    }

    /// 上游 EOF 时一次性读取累积状态，构造响应记录
    ///
    /// 仍然打开的块按已重建的部分结算；累积器随 self 消耗，不可复用
    pub fn finalize(mut self, request_id: &str, duration_ms: u64) -> CaptureResponse {
        self.close_current();
        if let Some(id) = &self.message_id {
            tracing::debug!(message_id = %id, blocks = self.content.len(), "流式响应重建完成");
        }
        CaptureResponse {
            request_id: request_id.to_string(),
            timestamp: now_iso(),
            duration_ms,
            model: self.model.unwrap_or_else(|| "unknown".to_string()),
            content: self.content,
            stop_reason: self.stop_reason,
            usage: self.usage,
        }
    }
}
