//! 公共工具模块

/// 生成用于日志的安全预览
///
/// 结果不超过 `max_bytes` 字节，不会在多字节 UTF-8 字符中间截断，
/// 发生截断时以省略号结尾
pub fn preview(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let budget = max_bytes.saturating_sub(3);
    let mut end = budget;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
