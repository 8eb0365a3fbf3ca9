//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 日志记录数据模型
//!
//! 六类只追加的日志记录（访问、认证、安全事件、设备连接、系统错误、前端事件）
//! 以及唯一可变的实体：IP 黑名单条目。

use crate::error::AdmissionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// 安全事件严重级别
///
/// 全序：`Low < Medium < High < Critical`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(AdmissionError::ValidationError(format!(
                "未知的严重级别: {}",
                other
            ))),
        }
    }
}

/// 安全事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RateLimit,
    InvalidToken,
    MalformedRequest,
    SqlInjection,
    XssAttempt,
    SuspiciousPattern,
    UnauthorizedAccess,
    CsrfFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RateLimit => "rate_limit",
            EventType::InvalidToken => "invalid_token",
            EventType::MalformedRequest => "malformed_request",
            EventType::SqlInjection => "sql_injection",
            EventType::XssAttempt => "xss_attempt",
            EventType::SuspiciousPattern => "suspicious_pattern",
            EventType::UnauthorizedAccess => "unauthorized_access",
            EventType::CsrfFailed => "csrf_failed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let event_type = match s.trim() {
            "rate_limit" => EventType::RateLimit,
            "invalid_token" => EventType::InvalidToken,
            "malformed_request" => EventType::MalformedRequest,
            "sql_injection" => EventType::SqlInjection,
            "xss_attempt" => EventType::XssAttempt,
            "suspicious_pattern" => EventType::SuspiciousPattern,
            "unauthorized_access" => EventType::UnauthorizedAccess,
            "csrf_failed" => EventType::CsrfFailed,
            other => {
                return Err(AdmissionError::ValidationError(format!(
                    "未知的事件类型: {}",
                    other
                )))
            }
        };
        Ok(event_type)
    }
}

/// 认证方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    WebLogin,
    ApiToken,
    WebAccess,
}

/// 认证结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Success,
    Failed,
    Blocked,
}

/// 系统错误级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// 前端日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrontendLevel {
    Info,
    Warning,
    Error,
}

/// API 访问记录，每个完成的请求一条
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub user_agent: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub request_bytes: u64,
    pub response_bytes: u64,
}

/// 认证尝试记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRecord {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub user_agent: String,
    pub auth_type: AuthType,
    pub username: Option<String>,
    pub status: AuthStatus,
    pub failure_reason: Option<String>,
}

/// 安全事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub user_agent: String,
    pub event_type: EventType,
    pub severity: Severity,
    pub description: String,
    pub request_path: String,
    pub request_method: String,
    /// 已脱敏并截断的请求数据
    pub sanitized_request_data: String,
}

/// 设备连接记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConnectionRecord {
    pub timestamp: DateTime<Utc>,
    pub device_ip: String,
    pub mode: String,
    pub data_received: bool,
    pub sensor_kinds: BTreeSet<String>,
    pub payload_bytes: u64,
    pub processing_time_ms: Option<u64>,
    pub error_text: Option<String>,
}

/// 系统错误记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub level: ErrorLevel,
    pub module: String,
    pub function: Option<String>,
    pub message: String,
    pub stack_trace: Option<String>,
    pub request_path: Option<String>,
    pub client_ip: Option<String>,
}

impl ErrorRecord {
    pub fn new(level: ErrorLevel, module: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            module: module.to_string(),
            function: None,
            message: message.into(),
            stack_trace: None,
            request_path: None,
            client_ip: None,
        }
    }

    pub fn with_function(mut self, function: &str) -> Self {
        self.function = Some(function.to_string());
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// 关联触发错误的请求
    pub fn with_request(mut self, path: &str, client_ip: Option<&str>) -> Self {
        self.request_path = Some(path.to_string());
        self.client_ip = client_ip.map(str::to_string);
        self
    }
}

impl DeviceConnectionRecord {
    pub fn new(device_ip: &str, mode: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            device_ip: device_ip.to_string(),
            mode: mode.to_string(),
            data_received: false,
            sensor_kinds: BTreeSet::new(),
            payload_bytes: 0,
            processing_time_ms: None,
            error_text: None,
        }
    }

    /// 记录收到的载荷
    pub fn with_payload<I, S>(mut self, payload_bytes: u64, sensor_kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.data_received = true;
        self.payload_bytes = payload_bytes;
        self.sensor_kinds = sensor_kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_processing_time(mut self, processing_time_ms: u64) -> Self {
        self.processing_time_ms = Some(processing_time_ms);
        self
    }

    pub fn with_error(mut self, error_text: impl Into<String>) -> Self {
        self.error_text = Some(error_text.into());
        self
    }
}

/// 前端上报事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontendRecord {
    pub timestamp: DateTime<Utc>,
    pub level: FrontendLevel,
    pub client_ip: String,
    pub user_agent: String,
    pub component: String,
    pub message: String,
    pub error_stack: Option<String>,
    pub url: String,
}

/// IP 黑名单条目
///
/// 以 `ip_address` 为唯一键，只更新不物理删除。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpBlacklistEntry {
    pub ip_address: String,
    pub blocked_at: DateTime<Utc>,
    pub reason: String,
    /// `"auto"` 或操作员标识
    pub blocked_by: String,
    pub violation_count: u32,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl IpBlacklistEntry {
    /// 在给定时刻是否生效：`is_active` 且（无过期时间或过期时间晚于 `now`）
    pub fn is_blocking_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |expires_at| expires_at > now)
    }

    /// 当前是否生效
    pub fn is_blocking(&self) -> bool {
        self.is_blocking_at(Utc::now())
    }

    /// 是否由系统自动封禁
    pub fn is_auto(&self) -> bool {
        self.blocked_by == crate::constants::AUTO_BLOCKED_BY
    }
}

/// 日志类别，运维查询按此选择存储
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Api,
    Auth,
    Security,
    Device,
    Errors,
    Frontend,
}

impl LogKind {
    pub const ALL: [LogKind; 6] = [
        LogKind::Api,
        LogKind::Auth,
        LogKind::Security,
        LogKind::Device,
        LogKind::Errors,
        LogKind::Frontend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Api => "api",
            LogKind::Auth => "auth",
            LogKind::Security => "security",
            LogKind::Device => "device",
            LogKind::Errors => "errors",
            LogKind::Frontend => "frontend",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            LogKind::Api => 0,
            LogKind::Auth => 1,
            LogKind::Security => 2,
            LogKind::Device => 3,
            LogKind::Errors => 4,
            LogKind::Frontend => 5,
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogKind {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" => Ok(LogKind::Api),
            "auth" => Ok(LogKind::Auth),
            "security" => Ok(LogKind::Security),
            "device" => Ok(LogKind::Device),
            "errors" => Ok(LogKind::Errors),
            "frontend" => Ok(LogKind::Frontend),
            other => Err(AdmissionError::ValidationError(format!(
                "未知的日志类别: {}",
                other
            ))),
        }
    }
}

/// 任意一类日志记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "log_type", rename_all = "snake_case")]
pub enum LogRecord {
    Access(AccessRecord),
    Auth(AuthRecord),
    Security(SecurityEvent),
    Device(DeviceConnectionRecord),
    Error(ErrorRecord),
    Frontend(FrontendRecord),
}

impl LogRecord {
    pub fn kind(&self) -> LogKind {
        match self {
            LogRecord::Access(_) => LogKind::Api,
            LogRecord::Auth(_) => LogKind::Auth,
            LogRecord::Security(_) => LogKind::Security,
            LogRecord::Device(_) => LogKind::Device,
            LogRecord::Error(_) => LogKind::Errors,
            LogRecord::Frontend(_) => LogKind::Frontend,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LogRecord::Access(r) => r.timestamp,
            LogRecord::Auth(r) => r.timestamp,
            LogRecord::Security(r) => r.timestamp,
            LogRecord::Device(r) => r.timestamp,
            LogRecord::Error(r) => r.timestamp,
            LogRecord::Frontend(r) => r.timestamp,
        }
    }

    /// 记录关联的客户端 IP（系统错误可能没有）
    pub fn client_ip(&self) -> Option<&str> {
        match self {
            LogRecord::Access(r) => Some(&r.client_ip),
            LogRecord::Auth(r) => Some(&r.client_ip),
            LogRecord::Security(r) => Some(&r.client_ip),
            LogRecord::Device(r) => Some(&r.device_ip),
            LogRecord::Error(r) => r.client_ip.as_deref(),
            LogRecord::Frontend(r) => Some(&r.client_ip),
        }
    }

    pub fn severity(&self) -> Option<Severity> {
        match self {
            LogRecord::Security(r) => Some(r.severity),
            _ => None,
        }
    }

    pub fn event_type(&self) -> Option<EventType> {
        match self {
            LogRecord::Security(r) => Some(r.event_type),
            _ => None,
        }
    }
}

macro_rules! impl_into_log_record {
    ($($record:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$record> for LogRecord {
                fn from(record: $record) -> Self {
                    LogRecord::$variant(record)
                }
            }
        )*
    };
}

impl_into_log_record! {
    AccessRecord => Access,
    AuthRecord => Auth,
    SecurityEvent => Security,
    DeviceConnectionRecord => Device,
    ErrorRecord => Error,
    FrontendRecord => Frontend,
}

// ============================================================================
// 单元测试
// ============================================================================
