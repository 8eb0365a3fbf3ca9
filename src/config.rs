//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 配置模块
//!
//! 定义准入管道的配置结构。配置在启动时加载并校验，
//! 之后以只读快照的形式交给管道，运行期不可修改。

use crate::constants::*;
use crate::error::AdmissionError;
use crate::pattern_detector::{default_signatures, Signature};
use crate::records::Severity;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 秒数转为 chrono 时长，超出表示范围时返回 `None`
pub(crate) fn checked_seconds(seconds: u64) -> Option<chrono::Duration> {
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
}

fn check_duration(name: &str, seconds: u64) -> Result<(), String> {
    if seconds == 0 {
        return Err(format!("{} 不能为0", name));
    }
    if seconds > MAX_CONFIGURED_DURATION_SECS {
        return Err(format!(
            "{} 超出上限: {} > {}",
            name, seconds, MAX_CONFIGURED_DURATION_SECS
        ));
    }
    Ok(())
}

/// 安全配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub rate_limit: RateLimitConfig,
    pub auto_block: AutoBlockConfig,
    pub patterns: PatternConfig,
    pub identity: IdentityConfig,
    pub logging: LoggingConfig,
}

impl SecurityConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        self.rate_limit
            .validate()
            .map_err(|e| format!("rate_limit 校验失败: {}", e))?;
        self.auto_block
            .validate()
            .map_err(|e| format!("auto_block 校验失败: {}", e))?;
        self.patterns
            .validate()
            .map_err(|e| format!("patterns 校验失败: {}", e))?;
        self.identity
            .validate()
            .map_err(|e| format!("identity 校验失败: {}", e))?;
        self.logging
            .validate()
            .map_err(|e| format!("logging 校验失败: {}", e))?;
        Ok(())
    }

    /// 从 YAML 文本解析并校验
    pub fn from_yaml_str(content: &str) -> Result<Self, AdmissionError> {
        let config: SecurityConfig = serde_yaml::from_str(content)?;
        config.validated()
    }

    /// 从 TOML 文本解析并校验
    pub fn from_toml_str(content: &str) -> Result<Self, AdmissionError> {
        let config: SecurityConfig = toml::from_str(content)?;
        config.validated()
    }

    /// 从 JSON 文本解析并校验
    pub fn from_json_str(content: &str) -> Result<Self, AdmissionError> {
        let config: SecurityConfig = serde_json::from_str(content)?;
        config.validated()
    }

    /// 按扩展名加载配置文件（`.yaml`/`.yml`/`.toml`/`.json`）
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AdmissionError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml_str(&content),
            "toml" => Self::from_toml_str(&content),
            "json" => Self::from_json_str(&content),
            other => Err(AdmissionError::ConfigError(format!(
                "不支持的配置文件格式: {:?}",
                other
            ))),
        }
    }

    fn validated(self) -> Result<Self, AdmissionError> {
        self.validate().map_err(AdmissionError::ConfigError)?;
        Ok(self)
    }
}

// ============================================================================
// 限流配置
// ============================================================================

/// 请求计数后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterBackend {
    /// 查询访问日志计数
    #[default]
    Store,
    /// 进程内滑动窗口
    Memory,
}

/// 一次限流检查使用的阈值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub max_requests: u64,
    pub window_seconds: u64,
}

impl RateLimitPolicy {
    pub fn window(&self) -> Option<chrono::Duration> {
        checked_seconds(self.window_seconds)
    }
}

/// 按路径前缀覆盖的限流阈值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLimit {
    pub path_prefix: String,
    pub max_requests: u64,
    pub window_seconds: u64,
}

/// 限流配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests: u64,
    pub window_seconds: u64,
    pub backend: CounterBackend,
    pub endpoint_overrides: Vec<EndpointLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: DEFAULT_RATE_LIMIT_MAX_REQUESTS,
            window_seconds: DEFAULT_RATE_LIMIT_WINDOW_SECS,
            backend: CounterBackend::default(),
            endpoint_overrides: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_requests == 0 {
            return Err("max_requests 不能为0".to_string());
        }
        check_duration("window_seconds", self.window_seconds)?;
        for limit in &self.endpoint_overrides {
            if limit.path_prefix.is_empty() {
                return Err("path_prefix 不能为空".to_string());
            }
            if limit.max_requests == 0 {
                return Err(format!("{} 的阈值不能为0", limit.path_prefix));
            }
            check_duration(&format!("{} window_seconds", limit.path_prefix), limit.window_seconds)?;
        }
        Ok(())
    }

    /// 路径对应的阈值：最长匹配前缀优先，无匹配时使用全局值
    pub fn policy_for(&self, path: &str) -> RateLimitPolicy {
        self.endpoint_overrides
            .iter()
            .filter(|limit| path.starts_with(limit.path_prefix.as_str()))
            .max_by_key(|limit| limit.path_prefix.len())
            .map(|limit| RateLimitPolicy {
                max_requests: limit.max_requests,
                window_seconds: limit.window_seconds,
            })
            .unwrap_or(RateLimitPolicy {
                max_requests: self.max_requests,
                window_seconds: self.window_seconds,
            })
    }

    /// 所有配置中最长的窗口，用于内存计数器的压缩
    pub fn longest_window(&self) -> Duration {
        let longest = self
            .endpoint_overrides
            .iter()
            .map(|limit| limit.window_seconds)
            .chain(std::iter::once(self.window_seconds))
            .max()
            .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECS);
        Duration::from_secs(longest)
    }

    pub fn with_limits(mut self, max_requests: u64, window_seconds: u64) -> Self {
        self.max_requests = max_requests;
        self.window_seconds = window_seconds;
        self
    }

    pub fn with_backend(mut self, backend: CounterBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_endpoint(mut self, path_prefix: &str, max_requests: u64, window_seconds: u64) -> Self {
        self.endpoint_overrides.push(EndpointLimit {
            path_prefix: path_prefix.to_string(),
            max_requests,
            window_seconds,
        });
        self
    }
}

// ============================================================================
// 自动封禁配置
// ============================================================================

/// 自动封禁配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoBlockConfig {
    pub enabled: bool,
    pub violation_threshold: u32,
    pub lookback_seconds: u64,
    pub block_duration_seconds: u64,
    /// 计入违规次数的严重级别
    pub trigger_severities: Vec<Severity>,
}

impl Default for AutoBlockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            violation_threshold: DEFAULT_AUTO_BLOCK_VIOLATION_THRESHOLD,
            lookback_seconds: DEFAULT_AUTO_BLOCK_LOOKBACK_SECS,
            block_duration_seconds: DEFAULT_AUTO_BLOCK_DURATION_SECS,
            trigger_severities: vec![Severity::High, Severity::Critical],
        }
    }
}

impl AutoBlockConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.violation_threshold == 0 {
            return Err("violation_threshold 不能为0".to_string());
        }
        check_duration("lookback_seconds", self.lookback_seconds)?;
        check_duration("block_duration_seconds", self.block_duration_seconds)?;
        if self.trigger_severities.is_empty() {
            return Err("trigger_severities 不能为空".to_string());
        }
        Ok(())
    }

    /// 回溯窗口，超出时间表示范围时为 `None`
    pub fn lookback(&self) -> Option<chrono::Duration> {
        checked_seconds(self.lookback_seconds)
    }

    /// 封禁时长，超出时间表示范围时为 `None`
    pub fn block_duration(&self) -> Option<chrono::Duration> {
        checked_seconds(self.block_duration_seconds)
    }

    /// 该级别的事件是否计入违规
    pub fn counts(&self, severity: Severity) -> bool {
        self.trigger_severities.contains(&severity)
    }

    /// 回溯窗口的可读描述，用于封禁原因
    pub fn lookback_label(&self) -> String {
        match self.lookback_seconds {
            3600 => "1 hour".to_string(),
            s if s % 3600 == 0 => format!("{} hours", s / 3600),
            s if s % 60 == 0 => format!("{} minutes", s / 60),
            s => format!("{} seconds", s),
        }
    }

    pub fn with_threshold(mut self, violation_threshold: u32) -> Self {
        self.violation_threshold = violation_threshold;
        self
    }

    pub fn with_block_duration(mut self, seconds: u64) -> Self {
        self.block_duration_seconds = seconds;
        self
    }
}

// ============================================================================
// 模式检测配置
// ============================================================================

/// 模式检测配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub enabled: bool,
    pub signatures: Vec<Signature>,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            signatures: default_signatures(),
        }
    }
}

impl PatternConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.signatures.is_empty() {
            return Err("启用检测时签名列表不能为空".to_string());
        }
        if let Some(index) = self
            .signatures
            .iter()
            .position(|sig| sig.pattern.trim().is_empty())
        {
            return Err(format!("签名[{}]为空", index));
        }
        Ok(())
    }
}

// ============================================================================
// 客户端标识配置
// ============================================================================

/// 客户端标识配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub forwarded_header: String,
    /// 是否信任转发头（仅在可信代理之后部署时开启）
    pub trust_forwarded_header: bool,
    pub validate_ip: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            forwarded_header: DEFAULT_FORWARDED_HEADER.to_string(),
            trust_forwarded_header: true,
            validate_ip: false,
        }
    }
}

impl IdentityConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.trust_forwarded_header && self.forwarded_header.trim().is_empty() {
            return Err("forwarded_header 不能为空".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// 日志配置
// ============================================================================

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub store_timeout_ms: u64,
    pub max_request_data_len: usize,
    pub max_user_agent_len: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            max_request_data_len: DEFAULT_MAX_REQUEST_DATA_LEN,
            max_user_agent_len: DEFAULT_MAX_USER_AGENT_LEN,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.store_timeout_ms == 0 {
            return Err("store_timeout_ms 不能为0".to_string());
        }
        if self.max_request_data_len == 0 {
            return Err("max_request_data_len 不能为0".to_string());
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout_ms = timeout.as_millis().max(1) as u64;
        self
    }
}

// ============================================================================
// 单元测试
// ============================================================================
