//! 捕获记录数据模型
//!
//! 请求/响应捕获实体与日志行格式定义

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 生成 ISO-8601 UTC 时间戳
pub fn now_iso() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// === 内容块 ===

/// 图片数据源
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

/// 内容块（按 type 字段区分的和类型）
///
/// 未识别的 type 落入 `Unknown`，避免单个陌生块导致整个请求解析失败
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Image {
        source: ImageSource,
    },
    #[serde(other)]
    Unknown,
}

/// 消息内容：string 或 ContentBlock 数组
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// 角色标注的消息
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CapturedMessage {
    pub role: String,
    pub content: MessageContent,
}

/// 系统提示块
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemPrompt {
    #[serde(rename = "type", default = "default_prompt_type")]
    pub prompt_type: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<Value>,
}

fn default_prompt_type() -> String {
    "text".to_string()
}

/// 工具定义
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

// === 请求体解析 ===

/// system 字段在请求体中可以是 string 或数组，存储时统一为数组
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SystemField {
    Text(String),
    Blocks(Vec<SystemPrompt>),
}

impl SystemField {
    fn into_blocks(self) -> Vec<SystemPrompt> {
        match self {
            Self::Text(text) => vec![SystemPrompt {
                prompt_type: default_prompt_type(),
                text,
                cache_control: None,
            }],
            Self::Blocks(blocks) => blocks,
        }
    }
}

/// Messages 请求体（仅捕获需要的字段）
#[derive(Debug, Deserialize)]
struct MessagesBody {
    model: String,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    system: Option<SystemField>,
    #[serde(default)]
    messages: Vec<CapturedMessage>,
    #[serde(default)]
    tools: Option<Vec<ToolDefinition>>,
}

// === 捕获实体 ===

/// 捕获的请求记录
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureRequest {
    pub id: String,
    pub timestamp: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Vec<SystemPrompt>>,
    #[serde(default)]
    pub messages: Vec<CapturedMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
}

impl CaptureRequest {
    /// 从请求体构建捕获记录（best-effort）
    ///
    /// 解析失败时记录 `model = "unknown"` 和空 messages，不影响转发
    pub fn from_body(body: &[u8]) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let timestamp = now_iso();

        match serde_json::from_slice::<MessagesBody>(body) {
            Ok(parsed) => Self {
                id,
                timestamp,
                model: parsed.model,
                max_tokens: parsed.max_tokens,
                stream: parsed.stream,
                system: parsed.system.map(SystemField::into_blocks),
                messages: parsed.messages,
                tools: parsed.tools,
            },
            Err(_) => Self {
                id,
                timestamp,
                model: "unknown".to_string(),
                max_tokens: None,
                stream: false,
                system: None,
                messages: Vec::new(),
                tools: None,
            },
        }
    }
}

/// Token 用量统计
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

/// 捕获的响应记录
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureResponse {
    pub request_id: String,
    pub timestamp: String,
    pub duration_ms: u64,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

/// 日志行：type 标注的请求或响应记录
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    Request {
        timestamp: String,
        data: CaptureRequest,
    },
    Response {
        timestamp: String,
        data: CaptureResponse,
    },
}

impl LogEntry {
    pub fn request(data: CaptureRequest) -> Self {
        Self::Request {
            timestamp: now_iso(),
            data,
        }
    }

    pub fn response(data: CaptureResponse) -> Self {
        Self::Response {
            timestamp: now_iso(),
            data,
        }
    }
}

/// 请求与其配对响应（无响应时为 null）
#[derive(Debug, Clone, Serialize)]
pub struct Pair {
    pub request: CaptureRequest,
    pub response: Option<CaptureResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试完整请求体解析：system 数组、工具定义、stream 标志
    #[test]
    fn test_full_request_body() {
        let json = r#"{
            "model": "claude-sonnet-4-5-20250929",
            "max_tokens": 8192,
            "stream": true,
            "system": [
                {"type": "text", "text": "You are a helpful assistant"}
            ],
            "messages": [
                {"role": "user", "content": "Hello"}
            ],
            "tools": [
                {
                    "name": "get_weather",
                    "description": "Get weather info",
                    "input_schema": {"type": "object"}
                }
            ]
        }"#;

        let capture = CaptureRequest::from_body(json.as_bytes());
        assert_eq!(capture.model, "claude-sonnet-4-5-20250929");
        assert_eq!(capture.max_tokens, Some(8192));
        assert!(capture.stream);
        assert_eq!(capture.messages.len(), 1);
        assert!(!capture.id.is_empty());

        let system = capture.system.expect("应该有 system");
        assert_eq!(system.len(), 1);
        assert_eq!(system[0].prompt_type, "text");

        let tools = capture.tools.expect("应该有 tools");
        assert_eq!(tools[0].name, "get_weather");
    }

    /// 测试 system 为 string 时规范化为单元素数组
    #[test]
    fn test_system_string_normalized() {
        let json = r#"{
            "model": "m",
            "system": "Be helpful",
            "messages": [{"role": "user", "content": "Hi"}]
        }"#;

        let capture = CaptureRequest::from_body(json.as_bytes());
        let system = capture.system.expect("string system 也应被捕获");
        assert_eq!(system.len(), 1);
        assert_eq!(system[0].text, "Be helpful");
        assert_eq!(system[0].prompt_type, "text");
    }

    /// 测试 system 块缺少 type 字段时使用默认值
    #[test]
    fn test_system_type_default() {
        let json = r#"{
            "model": "m",
            "system": [{"text": "Be helpful"}],
            "messages": []
        }"#;

        let capture = CaptureRequest::from_body(json.as_bytes());
        assert_eq!(capture.system.unwrap()[0].prompt_type, "text");
    }

    /// 测试数组格式消息内容的各种块
    #[test]
    fn test_content_block_variants() {
        let json = r#"{
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "What is this?"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "aGk="}},
                    {"type": "tool_result", "tool_use_id": "toolu_01", "content": "42", "is_error": false},
                    {"type": "tool_use", "id": "toolu_02", "name": "calc", "input": {"a": 1}}
                ]
            }]
        }"#;

        let capture = CaptureRequest::from_body(json.as_bytes());
        let blocks = match &capture.messages[0].content {
            MessageContent::Blocks(b) => b,
            MessageContent::Text(_) => panic!("应该是块数组"),
        };
        assert_eq!(blocks.len(), 4);
        assert!(matches!(&blocks[0], ContentBlock::Text { text } if text == "What is this?"));
        assert!(matches!(&blocks[1], ContentBlock::Image { source } if source.media_type == "image/png"));
        assert!(
            matches!(&blocks[2], ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "toolu_01")
        );
        assert!(matches!(&blocks[3], ContentBlock::ToolUse { name, .. } if name == "calc"));
    }

    /// 测试未识别的块类型不影响整体解析
    #[test]
    fn test_unknown_block_tolerated() {
        let json = r#"{
            "model": "m",
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "..."},
                    {"type": "text", "text": "answer"}
                ]
            }]
        }"#;

        let capture = CaptureRequest::from_body(json.as_bytes());
        assert_eq!(capture.model, "m");
        let blocks = match &capture.messages[0].content {
            MessageContent::Blocks(b) => b,
            MessageContent::Text(_) => panic!("应该是块数组"),
        };
        assert!(matches!(blocks[0], ContentBlock::Unknown));
        assert!(matches!(&blocks[1], ContentBlock::Text { .. }));
    }

    /// 测试无法解析的请求体回退为 unknown
    #[test]
    fn test_unparseable_body_fallback() {
        let capture = CaptureRequest::from_body(b"not json at all");
        assert_eq!(capture.model, "unknown");
        assert!(capture.messages.is_empty());
        assert!(!capture.stream);
        assert!(!capture.id.is_empty());
    }

    /// 测试工具定义 description 与 input_schema 可选
    #[test]
    fn test_tool_optional_fields() {
        let json = r#"{
            "model": "m",
            "messages": [],
            "tools": [
                {"name": "bare"},
                {"type": "web_search_20250305", "name": "web_search"}
            ]
        }"#;

        let capture = CaptureRequest::from_body(json.as_bytes());
        let tools = capture.tools.unwrap();
        assert_eq!(tools[0].name, "bare");
        assert!(tools[0].description.is_none());
        assert_eq!(tools[1].name, "web_search");
    }

    /// 测试日志行序列化格式：{"type":...,"timestamp":...,"data":{...}}
    #[test]
    fn test_log_entry_shape() {
        let capture = CaptureRequest::from_body(b"{\"model\":\"m\",\"messages\":[]}");
        let entry = LogEntry::request(capture);
        let line = serde_json::to_string(&entry).unwrap();
        assert!(line.starts_with(r#"{"type":"request""#));
        assert!(line.contains(r#""timestamp":"#));
        assert!(line.contains(r#""data":{"#));

        let back: LogEntry = serde_json::from_str(&line).expect("日志行应可解析回来");
        assert!(matches!(back, LogEntry::Request { .. }));
    }

    /// 测试 Pair 序列化时 response 缺失为 null
    #[test]
    fn test_pair_null_response() {
        let pair = Pair {
            request: CaptureRequest::from_body(b"{\"model\":\"m\",\"messages\":[]}"),
            response: None,
        };
        let json = serde_json::to_string(&pair).unwrap();
        assert!(json.contains(r#""response":null"#));
    }
}
