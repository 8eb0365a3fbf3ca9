//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 安全日志记录器
//!
//! 写入六类日志记录。所有写操作都不返回错误：存储失败或超时时丢弃记录，
//! 计入统计，并在 `admiteron::fallback` target 上输出一条 tracing 事件。
//! 系统错误写入失败时只走诊断通道，不会再次写入系统错误。
//!
//! 高危/严重安全事件写入成功后同步触发一次黑名单评估。

use crate::blacklist::{BlacklistManager, Evaluation};
use crate::config::{AutoBlockConfig, LoggingConfig};
use crate::constants::FALLBACK_TARGET;
use crate::error::AdmissionError;
use crate::identity::{ClientIdentity, InboundRequest};
use crate::log_redaction::{sanitize_request_data, truncate_chars};
use crate::records::{
    AccessRecord, AuthRecord, AuthStatus, AuthType, DeviceConnectionRecord, ErrorLevel,
    ErrorRecord, EventType, FrontendLevel, FrontendRecord, LogRecord, SecurityEvent, Severity,
};
use crate::storage::{bounded, LogQuery, LogStore};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, instrument, trace};

/// 事件关联的请求上下文
#[derive(Debug, Clone, PartialEq)]
pub struct EventContext {
    pub client: ClientIdentity,
    pub user_agent: String,
    pub path: String,
    pub method: String,
}

impl EventContext {
    pub fn new(client: ClientIdentity, method: &str, path: &str) -> Self {
        Self {
            client,
            user_agent: String::new(),
            path: path.to_string(),
            method: method.to_string(),
        }
    }

    /// 从请求与已解析的客户端标识构造
    pub fn from_request(request: &InboundRequest, client: &ClientIdentity) -> Self {
        Self {
            client: client.clone(),
            user_agent: request.user_agent().to_string(),
            path: request.path.clone(),
            method: request.method.clone(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn client_ip(&self) -> &str {
        self.client.as_str()
    }
}

/// 安全日志统计
#[derive(Debug, Default)]
pub struct SecurityLogStats {
    records_written: AtomicU64,
    write_failures: AtomicU64,
    security_events: AtomicU64,
    evaluations: AtomicU64,
    evaluation_failures: AtomicU64,
    system_errors: AtomicU64,
}

impl SecurityLogStats {
    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub fn security_events(&self) -> u64 {
        self.security_events.load(Ordering::Relaxed)
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    pub fn evaluation_failures(&self) -> u64 {
        self.evaluation_failures.load(Ordering::Relaxed)
    }

    pub fn system_errors(&self) -> u64 {
        self.system_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SecurityLogStatsSnapshot {
        SecurityLogStatsSnapshot {
            records_written: self.records_written(),
            write_failures: self.write_failures(),
            security_events: self.security_events(),
            evaluations: self.evaluations(),
            evaluation_failures: self.evaluation_failures(),
            system_errors: self.system_errors(),
        }
    }
}

/// 统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SecurityLogStatsSnapshot {
    pub records_written: u64,
    pub write_failures: u64,
    pub security_events: u64,
    pub evaluations: u64,
    pub evaluation_failures: u64,
    pub system_errors: u64,
}

/// 安全日志记录器
pub struct SecurityLogger {
    store: Arc<dyn LogStore>,
    blacklist: Option<Arc<BlacklistManager>>,
    logging: LoggingConfig,
    auto_block: AutoBlockConfig,
    stats: SecurityLogStats,
}

impl SecurityLogger {
    /// 创建不带黑名单评估的记录器
    pub fn new(store: Arc<dyn LogStore>, logging: LoggingConfig) -> Self {
        Self {
            store,
            blacklist: None,
            logging,
            auto_block: AutoBlockConfig::default(),
            stats: SecurityLogStats::default(),
        }
    }

    /// 挂接黑名单管理器，高危事件写入后触发评估
    pub fn with_blacklist(mut self, blacklist: Arc<BlacklistManager>) -> Self {
        self.auto_block = blacklist.config().clone();
        self.blacklist = Some(blacklist);
        self
    }

    pub fn stats(&self) -> &SecurityLogStats {
        &self.stats
    }

    /// 记录一次完成的请求
    pub async fn log_access(&self, mut record: AccessRecord) {
        record.user_agent = truncate_chars(&record.user_agent, self.logging.max_user_agent_len);
        self.write(record.into()).await;
    }

    /// 记录认证尝试
    pub async fn log_authentication(
        &self,
        context: &EventContext,
        auth_type: AuthType,
        username: Option<&str>,
        status: AuthStatus,
        failure_reason: Option<&str>,
    ) {
        let record = AuthRecord {
            timestamp: Utc::now(),
            client_ip: context.client_ip().to_string(),
            user_agent: truncate_chars(&context.user_agent, self.logging.max_user_agent_len),
            auth_type,
            username: username.map(str::to_string),
            status,
            failure_reason: failure_reason.map(str::to_string),
        };
        self.write(record.into()).await;
    }

    /// 记录安全事件
    ///
    /// 事件写入成功且严重级别计入违规（或为 `critical`）时，
    /// 对已知 IP 执行一次黑名单评估。
    ///
    /// # 返回
    /// - `Some(evaluation)`: 已执行评估
    /// - `None`: 未触发评估、写入失败或评估失败
    #[instrument(skip(self, context, description, request_data), fields(client = %context.client))]
    pub async fn log_security_event(
        &self,
        context: &EventContext,
        event_type: EventType,
        severity: Severity,
        description: &str,
        request_data: Option<&str>,
    ) -> Option<Evaluation> {
        let event = SecurityEvent {
            timestamp: Utc::now(),
            client_ip: context.client_ip().to_string(),
            user_agent: truncate_chars(&context.user_agent, self.logging.max_user_agent_len),
            event_type,
            severity,
            description: description.to_string(),
            request_path: context.path.clone(),
            request_method: context.method.clone(),
            sanitized_request_data: request_data
                .map(|data| sanitize_request_data(data, self.logging.max_request_data_len))
                .unwrap_or_default(),
        };

        self.stats.security_events.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Security event: type={}, severity={}, path={}",
            event_type, severity, context.path
        );

        if !self.write(event.into()).await {
            return None;
        }

        let triggers = self.auto_block.counts(severity) || severity == Severity::Critical;
        if !triggers {
            return None;
        }

        let blacklist = self.blacklist.as_ref()?;
        let ip = context.client.ip()?;

        self.stats.evaluations.fetch_add(1, Ordering::Relaxed);
        match blacklist.evaluate(ip).await {
            Ok(evaluation) => Some(evaluation),
            Err(e) => {
                self.stats
                    .evaluation_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.log_system_error(
                    ErrorRecord::new(
                        ErrorLevel::Error,
                        "blacklist",
                        format!("Blacklist evaluation failed: {}", e),
                    )
                    .with_function("evaluate")
                    .with_request(&context.path, Some(ip)),
                )
                .await;
                None
            }
        }
    }

    /// 记录畸形请求（medium）
    ///
    /// 供解析请求体失败的下游协作方调用。
    pub async fn log_malformed_request(
        &self,
        context: &EventContext,
        detail: &str,
        request_data: Option<&str>,
    ) {
        self.log_security_event(
            context,
            EventType::MalformedRequest,
            Severity::Medium,
            &format!("Malformed request: {}", detail),
            request_data,
        )
        .await;
    }

    /// 记录设备连接
    pub async fn log_device_connection(&self, record: DeviceConnectionRecord) {
        self.write(record.into()).await;
    }

    /// 记录系统错误
    ///
    /// 写入失败只输出到诊断通道。
    pub async fn log_system_error(&self, record: ErrorRecord) {
        self.stats.system_errors.fetch_add(1, Ordering::Relaxed);
        self.write(record.into()).await;
    }

    /// 记录前端上报事件
    #[allow(clippy::too_many_arguments)]
    pub async fn log_frontend_event(
        &self,
        client_ip: &str,
        user_agent: &str,
        level: FrontendLevel,
        component: &str,
        message: &str,
        error_stack: Option<&str>,
        url: &str,
    ) {
        let record = FrontendRecord {
            timestamp: Utc::now(),
            level,
            client_ip: client_ip.to_string(),
            user_agent: truncate_chars(user_agent, self.logging.max_user_agent_len),
            component: component.to_string(),
            message: message.to_string(),
            error_stack: error_stack.map(str::to_string),
            url: url.to_string(),
        };
        self.write(record.into()).await;
    }

    /// 运维查询
    ///
    /// 不在请求路径上，存储错误会返回给调用方。
    pub async fn query(&self, query: &LogQuery) -> Result<Vec<LogRecord>, AdmissionError> {
        Ok(bounded(self.logging.store_timeout(), "query", self.store.query(query)).await?)
    }

    /// 带超时写入；失败时吞掉错误
    async fn write(&self, record: LogRecord) -> bool {
        let kind = record.kind();
        match bounded(
            self.logging.store_timeout(),
            "append",
            self.store.append(record),
        )
        .await
        {
            Ok(()) => {
                self.stats.records_written.fetch_add(1, Ordering::Relaxed);
                trace!("Log record written: kind={}", kind);
                true
            }
            Err(e) => {
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                error!(target: FALLBACK_TARGET, kind = %kind, error = %e, "日志写入失败，记录已丢弃");
                false
            }
        }
    }
}

// ============================================================================
// 单元测试
// ============================================================================
