//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 错误类型定义
//!
//! 使用thiserror定义所有错误类型，以及准入决策结果。

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Admiteron 错误类型
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 存储错误
    #[error("存储错误: {0}")]
    StorageError(#[from] StorageError),

    /// 验证错误
    #[error("验证错误: {0}")]
    ValidationError(String),

    /// IO错误
    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// YAML解析错误
    #[error("YAML解析错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML解析错误
    #[error("TOML解析错误: {0}")]
    TomlError(#[from] toml::de::Error),

    /// 其他错误
    #[error("未知错误: {0}")]
    Other(String),
}

/// 存储错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// 连接错误
    #[error("连接错误: {0}")]
    ConnectionError(String),

    /// 查询错误
    #[error("查询错误: {0}")]
    QueryError(String),

    /// 超时错误
    #[error("超时错误: {0}")]
    TimeoutError(String),

    /// 未找到
    #[error("未找到: {0}")]
    NotFound(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => StorageError::QueryError(db_err.to_string()),
            sqlx::Error::PoolTimedOut => StorageError::TimeoutError("连接池超时".to_string()),
            sqlx::Error::PoolClosed => StorageError::ConnectionError("连接池已关闭".to_string()),
            sqlx::Error::RowNotFound => StorageError::NotFound("记录未找到".to_string()),
            _ => StorageError::QueryError(err.to_string()),
        }
    }
}

/// 准入决策结果
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// 放行，进入业务处理
    Admitted,
    /// 限流拒绝（429）
    RateLimited {
        current_count: u64,
        max_requests: u64,
        window_seconds: u64,
    },
    /// 黑名单拒绝（403）
    Blocked(BlockInfo),
}

impl Decision {
    /// 是否放行
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted)
    }

    /// 机器可读的拒绝原因
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Decision::Admitted => None,
            Decision::RateLimited { .. } => Some("rate_limited"),
            Decision::Blocked(_) => Some("access_denied"),
        }
    }
}

/// 封禁信息
#[derive(Debug, Clone, PartialEq)]
pub struct BlockInfo {
    pub reason: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub violation_count: u32,
}
