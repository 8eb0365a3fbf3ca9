//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! PostgreSQL存储实现
//!
//! 使用 sqlx 实现 [`LogStore`] 与 [`BlacklistStore`]。
//!
//! # 数据库Schema
//!
//! 六类日志各占一张结构相同的表，完整记录以 JSONB 保存，
//! 过滤与计数用到的字段单独成列并建索引：
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS security_logs (
//!     id BIGSERIAL PRIMARY KEY,
//!     logged_at TIMESTAMPTZ NOT NULL,
//!     client_ip VARCHAR(64),
//!     severity VARCHAR(16),
//!     event_type VARCHAR(32),
//!     record JSONB NOT NULL
//! );
//! CREATE INDEX IF NOT EXISTS idx_security_logs_ip_time
//!     ON security_logs(client_ip, logged_at);
//!
//! -- 黑名单表（唯一可变实体，从不物理删除）
//! CREATE TABLE IF NOT EXISTS ip_blacklist (
//!     ip_address VARCHAR(64) PRIMARY KEY,
//!     blocked_at TIMESTAMPTZ NOT NULL,
//!     reason TEXT NOT NULL,
//!     blocked_by VARCHAR(100) NOT NULL,
//!     violation_count INTEGER NOT NULL DEFAULT 0,
//!     is_active BOOLEAN NOT NULL DEFAULT true,
//!     expires_at TIMESTAMPTZ
//! );
//! ```

use crate::constants::MAX_CLIENT_KEY_LENGTH;
use crate::error::StorageError;
use crate::records::{IpBlacklistEntry, LogKind, LogRecord, Severity};
use crate::storage::{bounded, BlacklistFilter, BlacklistStore, LogQuery, LogStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{debug, error, info, instrument};

/// 黑名单表的一行
type BlacklistRow = (
    String,
    DateTime<Utc>,
    String,
    String,
    i32,
    bool,
    Option<DateTime<Utc>>,
);

const BLACKLIST_COLUMNS: &str =
    "ip_address, blocked_at, reason, blocked_by, violation_count, is_active, expires_at";

/// 日志类型到表名的映射
fn table_name(kind: LogKind) -> &'static str {
    match kind {
        LogKind::Api => "api_logs",
        LogKind::Auth => "auth_logs",
        LogKind::Security => "security_logs",
        LogKind::Device => "device_logs",
        LogKind::Errors => "error_logs",
        LogKind::Frontend => "frontend_logs",
    }
}

/// 建表语句：每类日志一张表加黑名单表
///
/// `client_ip` 与 `ip_address` 同宽，任何可记录的客户端键都能写入黑名单。
fn schema_statements() -> Vec<String> {
    let width = MAX_CLIENT_KEY_LENGTH;
    let mut statements = Vec::with_capacity(LogKind::ALL.len() * 3 + 1);
    for kind in LogKind::ALL {
        let table = table_name(kind);
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                logged_at TIMESTAMPTZ NOT NULL,
                client_ip VARCHAR({width}),
                severity VARCHAR(16),
                event_type VARCHAR(32),
                record JSONB NOT NULL
            )"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_ip_time ON {table}(client_ip, logged_at)"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_time ON {table}(logged_at)"
        ));
    }
    statements.push(format!(
        "CREATE TABLE IF NOT EXISTS ip_blacklist (
            ip_address VARCHAR({width}) PRIMARY KEY,
            blocked_at TIMESTAMPTZ NOT NULL,
            reason TEXT NOT NULL,
            blocked_by VARCHAR(100) NOT NULL,
            violation_count INTEGER NOT NULL DEFAULT 0,
            is_active BOOLEAN NOT NULL DEFAULT true,
            expires_at TIMESTAMPTZ
        )"
    ));
    statements
}

fn entry_from_row(row: BlacklistRow) -> IpBlacklistEntry {
    let (ip_address, blocked_at, reason, blocked_by, violation_count, is_active, expires_at) = row;
    IpBlacklistEntry {
        ip_address,
        blocked_at,
        reason,
        blocked_by,
        violation_count: violation_count.max(0) as u32,
        is_active,
        expires_at,
    }
}

/// PostgreSQL存储配置
#[derive(Clone)]
pub struct PostgresStorageConfig {
    /// 数据库连接URL（使用 Secret 包装以防止意外泄露）
    pub database_url: Secret<String>,
    /// 连接池最大连接数
    pub max_connections: u32,
    /// 连接池最小空闲连接数
    pub min_connections: u32,
    /// 连接超时时间（秒）
    pub connect_timeout: u64,
    /// 查询超时时间（秒）
    pub query_timeout: u64,
}

impl std::fmt::Debug for PostgresStorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStorageConfig")
            .field("database_url", &"***")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("connect_timeout", &self.connect_timeout)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

impl Default for PostgresStorageConfig {
    fn default() -> Self {
        Self {
            database_url: Secret::new(String::new()),
            max_connections: 20,
            min_connections: 2,
            connect_timeout: 30,
            query_timeout: 5,
        }
    }
}

impl PostgresStorageConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: Secret::new(database_url.into()),
            ..Default::default()
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout.as_secs();
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout.as_secs();
        self
    }
}

/// PostgreSQL存储实现
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
    query_timeout: Duration,
}

impl PostgresStorage {
    /// 连接数据库
    pub async fn new(config: PostgresStorageConfig) -> Result<Self, StorageError> {
        info!("正在连接PostgreSQL数据库...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(config.database_url.expose_secret())
            .await
            .map_err(|e| {
                error!("数据库连接失败: {}", e);
                StorageError::ConnectionError(format!("无法连接到数据库: {}", e))
            })?;

        info!("成功连接到PostgreSQL数据库");
        Ok(Self {
            pool,
            query_timeout: Duration::from_secs(config.query_timeout),
        })
    }

    /// 从已有连接池创建
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            query_timeout: Duration::from_secs(5),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::ConnectionError(format!("健康检查失败: {}", e)))?;
        Ok(())
    }

    /// 创建表和索引（幂等）
    pub async fn migrate(&self) -> Result<(), StorageError> {
        let statements = schema_statements();
        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::QueryError(format!("建表失败: {}", e)))?;
        }
        info!("数据库表已就绪: {} 条语句", statements.len());
        Ok(())
    }
}

#[async_trait]
impl LogStore for PostgresStorage {
    async fn append(&self, record: LogRecord) -> Result<(), StorageError> {
        let table = table_name(record.kind());
        let payload = serde_json::to_string(&record)
            .map_err(|e| StorageError::QueryError(format!("序列化日志失败: {}", e)))?;
        let sql = format!(
            "INSERT INTO {table} (logged_at, client_ip, severity, event_type, record)
             VALUES ($1, $2, $3, $4, $5::jsonb)"
        );

        bounded(self.query_timeout, "append", async {
            sqlx::query(&sql)
                .bind(record.timestamp())
                .bind(record.client_ip())
                .bind(record.severity().map(|s| s.as_str()))
                .bind(record.event_type().map(|t| t.as_str()))
                .bind(&payload)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::QueryError(format!("写入日志失败: {}", e)))?;
            Ok::<_, StorageError>(())
        })
        .await
    }

    async fn count_access_since(
        &self,
        client_ip: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        bounded(self.query_timeout, "count_access_since", async {
            let (count,) = sqlx::query_as::<_, (i64,)>(
                "SELECT COUNT(*) FROM api_logs WHERE client_ip = $1 AND logged_at >= $2",
            )
            .bind(client_ip)
            .bind(since)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::QueryError(format!("统计访问记录失败: {}", e)))?;
            Ok::<_, StorageError>(count.max(0) as u64)
        })
        .await
    }

    async fn count_security_events_since(
        &self,
        client_ip: &str,
        since: DateTime<Utc>,
        severities: &[Severity],
    ) -> Result<u64, StorageError> {
        let severities: Vec<String> = severities.iter().map(|s| s.as_str().to_string()).collect();

        bounded(self.query_timeout, "count_security_events_since", async {
            let (count,) = sqlx::query_as::<_, (i64,)>(
                "SELECT COUNT(*) FROM security_logs
                 WHERE client_ip = $1 AND logged_at >= $2 AND severity = ANY($3)",
            )
            .bind(client_ip)
            .bind(since)
            .bind(&severities)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::QueryError(format!("统计安全事件失败: {}", e)))?;
            Ok::<_, StorageError>(count.max(0) as u64)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn query(&self, query: &LogQuery) -> Result<Vec<LogRecord>, StorageError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT record::text FROM {} WHERE TRUE",
            table_name(query.kind)
        ));
        if let Some(ip) = &query.client_ip {
            builder.push(" AND client_ip = ").push_bind(ip.clone());
        }
        if let Some(severity) = query.severity {
            builder.push(" AND severity = ").push_bind(severity.as_str());
        }
        if let Some(event_type) = query.event_type {
            builder.push(" AND event_type = ").push_bind(event_type.as_str());
        }
        if let Some(since) = query.since {
            builder.push(" AND logged_at >= ").push_bind(since);
        }
        builder
            .push(" ORDER BY logged_at DESC, id DESC LIMIT ")
            .push_bind(query.effective_limit() as i64);

        let rows = bounded(self.query_timeout, "query", async {
            builder
                .build_query_as::<(String,)>()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::QueryError(format!("查询日志失败: {}", e)))
        })
        .await?;

        debug!("查询到 {} 条 {} 日志", rows.len(), query.kind);
        rows.into_iter()
            .map(|(payload,)| {
                serde_json::from_str(&payload)
                    .map_err(|e| StorageError::QueryError(format!("解析日志失败: {}", e)))
            })
            .collect()
    }
}

#[async_trait]
impl BlacklistStore for PostgresStorage {
    async fn get_entry(&self, ip_address: &str) -> Result<Option<IpBlacklistEntry>, StorageError> {
        let sql = format!("SELECT {BLACKLIST_COLUMNS} FROM ip_blacklist WHERE ip_address = $1");

        bounded(self.query_timeout, "get_entry", async {
            let row = sqlx::query_as::<_, BlacklistRow>(&sql)
                .bind(ip_address)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::QueryError(format!("获取黑名单条目失败: {}", e)))?;
            Ok::<_, StorageError>(row.map(entry_from_row))
        })
        .await
    }

    /// 单条 `INSERT … ON CONFLICT` 语句，行级原子
    async fn upsert_entry(
        &self,
        entry: &IpBlacklistEntry,
    ) -> Result<IpBlacklistEntry, StorageError> {
        let sql = format!(
            "INSERT INTO ip_blacklist ({BLACKLIST_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (ip_address) DO UPDATE
             SET blocked_at = EXCLUDED.blocked_at,
                 reason = EXCLUDED.reason,
                 blocked_by = EXCLUDED.blocked_by,
                 violation_count = EXCLUDED.violation_count,
                 is_active = EXCLUDED.is_active,
                 expires_at = EXCLUDED.expires_at
             RETURNING {BLACKLIST_COLUMNS}"
        );
        let violation_count = entry.violation_count.min(i32::MAX as u32) as i32;

        bounded(self.query_timeout, "upsert_entry", async {
            let row = sqlx::query_as::<_, BlacklistRow>(&sql)
                .bind(&entry.ip_address)
                .bind(entry.blocked_at)
                .bind(&entry.reason)
                .bind(&entry.blocked_by)
                .bind(violation_count)
                .bind(entry.is_active)
                .bind(entry.expires_at)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StorageError::QueryError(format!("写入黑名单失败: {}", e)))?;
            Ok::<_, StorageError>(entry_from_row(row))
        })
        .await
    }

    async fn set_active(&self, ip_address: &str, is_active: bool) -> Result<bool, StorageError> {
        bounded(self.query_timeout, "set_active", async {
            let result =
                sqlx::query("UPDATE ip_blacklist SET is_active = $2 WHERE ip_address = $1")
                    .bind(ip_address)
                    .bind(is_active)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::QueryError(format!("更新黑名单失败: {}", e)))?;
            Ok::<_, StorageError>(result.rows_affected() > 0)
        })
        .await
    }

    async fn list_entries(
        &self,
        filter: &BlacklistFilter,
    ) -> Result<Vec<IpBlacklistEntry>, StorageError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {BLACKLIST_COLUMNS} FROM ip_blacklist WHERE TRUE"
        ));
        if filter.active_only {
            builder
                .push(" AND is_active AND (expires_at IS NULL OR expires_at > ")
                .push_bind(Utc::now())
                .push(")");
        }
        if let Some(blocked_by) = &filter.blocked_by {
            builder.push(" AND blocked_by = ").push_bind(blocked_by.clone());
        }
        if let Some(fragment) = &filter.ip_contains {
            builder
                .push(" AND strpos(ip_address, ")
                .push_bind(fragment.clone())
                .push(") > 0");
        }
        builder
            .push(" ORDER BY blocked_at DESC LIMIT ")
            .push_bind(filter.effective_limit() as i64)
            .push(" OFFSET ")
            .push_bind(filter.offset as i64);

        let rows = bounded(self.query_timeout, "list_entries", async {
            builder
                .build_query_as::<BlacklistRow>()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::QueryError(format!("列出黑名单失败: {}", e)))
        })
        .await?;

        Ok(rows.into_iter().map(entry_from_row).collect())
    }
}

// ============================================================================
// 单元测试
// ============================================================================
