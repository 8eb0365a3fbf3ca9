//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 日志脱敏模块
//!
//! 安全事件中保存的请求数据先脱敏再截断，避免把口令、令牌原样写入日志。
//! 截断总是生效；基于正则的密钥脱敏需要 `log-redaction` feature。

#[cfg(feature = "log-redaction")]
use lazy_static::lazy_static;
#[cfg(feature = "log-redaction")]
use regex::Regex;
use std::borrow::Cow;

/// 按字符数截断，不会切断多字节字符
#[inline]
pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((byte_index, _)) => value[..byte_index].to_string(),
        None => value.to_string(),
    }
}

/// IP地址脱敏，用于诊断输出
#[inline]
pub fn redact_ip(value: Option<&str>) -> String {
    let Some(value) = value else {
        return "unknown".to_string();
    };

    let value = value.trim();
    if value.is_empty() {
        return "unknown".to_string();
    }

    // 如果是IP地址，保留前两段
    let parts: Vec<&str> = value.split('.').collect();
    if parts.len() == 4 {
        return format!("{}.{}.***.***", parts[0], parts[1]);
    }

    // IPv6简化处理
    if let Some((head, _)) = value.split_once(':') {
        return format!("{}:***:***", head);
    }

    "***".to_string()
}

#[cfg(feature = "log-redaction")]
lazy_static! {
    /// `key=value` / `"key": "value"` 形式的密钥字段
    static ref SECRET_ASSIGNMENT: Regex = Regex::new(
        r#"(?i)((?:password|passwd|pwd|token|api[_-]?key|secret|credential)["']?\s*[:=]\s*["']?)([^\s,&"'}]+)"#
    )
    .expect("secret assignment pattern is valid");

    /// `Authorization: Bearer xxx` 形式的凭据
    static ref AUTHORIZATION: Regex = Regex::new(
        r#"(?i)(authorization["']?\s*[:=]\s*["']?)((?:bearer|basic|token)\s+)?([^\s,&"'}]+)"#
    )
    .expect("authorization pattern is valid");
}

/// 掩盖文本中的密钥值
#[cfg(feature = "log-redaction")]
pub fn mask_secrets(value: &str) -> Cow<'_, str> {
    let masked = AUTHORIZATION.replace_all(value, "${1}${2}***");
    if !SECRET_ASSIGNMENT.is_match(&masked) {
        return masked;
    }
    let replaced = SECRET_ASSIGNMENT
        .replace_all(&masked, "${1}***")
        .into_owned();
    Cow::Owned(replaced)
}

/// 未启用 `log-redaction` 时原样返回
#[cfg(not(feature = "log-redaction"))]
pub fn mask_secrets(value: &str) -> Cow<'_, str> {
    Cow::Borrowed(value)
}

/// 生成安全事件的 `sanitized_request_data`
///
/// # 参数
/// - `data`: 原始请求数据（已解码为文本）
/// - `max_chars`: 最大字符数
pub fn sanitize_request_data(data: &str, max_chars: usize) -> String {
    truncate_chars(&mask_secrets(data), max_chars)
}

// ============================================================================
// 单元测试
// ============================================================================
