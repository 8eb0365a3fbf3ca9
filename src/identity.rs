//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 客户端标识解析
//!
//! 定义入站请求与出站响应的描述结构，并从请求中解析真实客户端 IP。
//!
//! # 安全说明
//!
//! 当存在 `X-Forwarded-For` 类转发头时取最左边的第一个 IP，
//! 即信任第一跳代理。若部署前没有可信代理，客户端可以伪造此头；
//! 此时应关闭 `trust_forwarded_header`。

use crate::config::IdentityConfig;
use crate::constants::{MAX_CLIENT_KEY_LENGTH, UNKNOWN_CLIENT_PREFIX};
use ahash::AHashMap as HashMap;
use lazy_static::lazy_static;
use std::fmt;
use std::net::IpAddr;

lazy_static! {
    /// 进程级临时令牌，无法解析 IP 的客户端共享同一个限流键
    static ref PROCESS_TOKEN: String = uuid::Uuid::new_v4().to_string();
}

// ============================================================================
// 请求 / 响应描述
// ============================================================================

/// 入站请求描述
#[derive(Clone, Default)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    /// HTTP头（键统一小写）
    pub headers: HashMap<String, String>,
    /// 查询参数（保持原始顺序，允许重复键）
    pub query_params: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// 传输层来源地址
    pub remote_addr: Option<String>,
}

impl fmt::Debug for InboundRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 脱敏 headers
        let headers: HashMap<&str, &str> = self
            .headers
            .iter()
            .map(|(k, v)| {
                let v = if is_sensitive_name(k) { "***" } else { v.as_str() };
                (k.as_str(), v)
            })
            .collect();

        f.debug_struct("InboundRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &headers)
            .field("query_params", &self.query_params.len())
            .field("body_len", &self.body.len())
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

fn is_sensitive_name(name: &str) -> bool {
    let name = name.to_lowercase();
    ["auth", "cookie", "key", "token", "secret"]
        .iter()
        .any(|needle| name.contains(needle))
}

impl InboundRequest {
    /// 创建新的请求描述
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    /// 添加HTTP头
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_lowercase(), value.to_string());
        self
    }

    /// 添加查询参数
    pub fn with_query_param(mut self, key: &str, value: &str) -> Self {
        self.query_params.push((key.to_string(), value.to_string()));
        self
    }

    /// 设置请求体
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// 设置传输层来源地址
    pub fn with_remote_addr(mut self, addr: &str) -> Self {
        self.remote_addr = Some(addr.to_string());
        self
    }

    /// 获取HTTP头（不区分大小写）
    pub fn get_header(&self, key: &str) -> Option<&String> {
        self.headers.get(&key.to_lowercase())
    }

    /// User-Agent，缺失时为空串
    pub fn user_agent(&self) -> &str {
        self.get_header("user-agent").map(String::as_str).unwrap_or("")
    }

    pub fn body_len(&self) -> u64 {
        self.body.len() as u64
    }
}

/// 出站响应描述
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutboundResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl OutboundResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// 构造 JSON 响应
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self {
            status,
            headers,
            body: value.to_string().into_bytes(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_lowercase(), value.to_string());
        self
    }

    pub fn body_len(&self) -> u64 {
        self.body.len() as u64
    }

    /// 将响应体解析为 JSON
    pub fn json_body(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

// ============================================================================
// 客户端标识
// ============================================================================

/// 客户端标识
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientIdentity {
    /// 解析出的 IP
    Ip(String),
    /// 无法解析；内含进程级共享键
    Unknown(String),
}

impl ClientIdentity {
    /// 无法解析 IP 时使用的标识
    pub fn unknown() -> Self {
        ClientIdentity::Unknown(format!("{}:{}", UNKNOWN_CLIENT_PREFIX, *PROCESS_TOKEN))
    }

    /// 限流与日志使用的键
    pub fn as_str(&self) -> &str {
        match self {
            ClientIdentity::Ip(ip) => ip,
            ClientIdentity::Unknown(key) => key,
        }
    }

    /// 已知 IP
    pub fn ip(&self) -> Option<&str> {
        match self {
            ClientIdentity::Ip(ip) => Some(ip),
            ClientIdentity::Unknown(_) => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, ClientIdentity::Ip(_))
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 客户端标识解析器
///
/// 从不失败：转发头与来源地址都不可用时返回 [`ClientIdentity::Unknown`]。
#[derive(Debug, Clone)]
pub struct ClientIdentityResolver {
    forwarded_header: String,
    trust_forwarded_header: bool,
    validate: bool,
}

impl ClientIdentityResolver {
    pub fn new(config: &IdentityConfig) -> Self {
        Self {
            forwarded_header: config.forwarded_header.to_lowercase(),
            trust_forwarded_header: config.trust_forwarded_header,
            validate: config.validate_ip,
        }
    }

    /// 解析请求的客户端标识
    pub fn resolve(&self, request: &InboundRequest) -> ClientIdentity {
        if self.trust_forwarded_header {
            if let Some(ip) = request
                .get_header(&self.forwarded_header)
                .and_then(|value| self.first_hop(value))
            {
                return ClientIdentity::Ip(ip);
            }
        }

        if let Some(ip) = request
            .remote_addr
            .as_deref()
            .and_then(|addr| self.normalize(addr))
        {
            return ClientIdentity::Ip(ip);
        }

        ClientIdentity::unknown()
    }

    /// 取转发头中第一个非空 IP
    fn first_hop(&self, value: &str) -> Option<String> {
        let first = value.split(',').map(str::trim).find(|s| !s.is_empty())?;
        self.normalize(first)
    }

    fn normalize(&self, value: &str) -> Option<String> {
        let value = value.trim();
        if value.is_empty() || value.len() > MAX_CLIENT_KEY_LENGTH {
            return None;
        }
        if self.validate && value.parse::<IpAddr>().is_err() {
            return None;
        }
        Some(value.to_string())
    }
}

impl Default for ClientIdentityResolver {
    fn default() -> Self {
        Self::new(&IdentityConfig::default())
    }
}

// ============================================================================
// 单元测试
// ============================================================================
