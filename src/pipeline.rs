//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 准入管道
//!
//! 在每个入站请求外围按固定顺序执行检查：
//!
//! 1. 解析客户端标识
//! 2. 限流检查，超限返回 429 并终止
//! 3. 黑名单检查，命中返回 403、写入 `unauthorized_access`/high 事件并终止
//! 4. 攻击特征扫描，命中只写入安全事件，不拦截
//! 5. 调用业务处理器并计时
//! 6. 处理器失败时写入系统错误，原样返回错误
//! 7. 写入访问日志（包括被拒绝的请求）
//!
//! 限流检查先于黑名单检查。任一检查因存储故障无法完成时放行请求，
//! 并尝试写入一条系统错误。

use crate::blacklist::BlacklistManager;
use crate::config::SecurityConfig;
use crate::constants::{STATUS_FORBIDDEN, STATUS_INTERNAL_ERROR, STATUS_TOO_MANY_REQUESTS};
use crate::error::{AdmissionError, BlockInfo, Decision};
use crate::identity::{ClientIdentity, ClientIdentityResolver, InboundRequest, OutboundResponse};
use crate::log_redaction::redact_ip;
use crate::pattern_detector::{PatternDetector, ScanReport};
use crate::rate_limiter::RateLimiter;
use crate::records::{AccessRecord, ErrorLevel, ErrorRecord, EventType, Severity};
use crate::security_logger::{EventContext, SecurityLogger};
use crate::storage::{BlacklistStore, LogStore};
#[cfg(feature = "monitoring")]
use crate::telemetry::Metrics;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

// ============================================================================
// 业务处理器
// ============================================================================

/// 业务处理器
///
/// 管道之外的应用逻辑；其错误会被记录后原样返回给传输层。
#[async_trait]
pub trait RequestHandler: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn handle(&self, request: InboundRequest) -> Result<OutboundResponse, Self::Error>;
}

/// 由闭包构造的处理器
pub struct FnHandler<F, Fut, E> {
    handler: F,
    _marker: PhantomData<fn() -> (Fut, E)>,
}

/// 用闭包构造处理器
pub fn handler_fn<F, Fut, E>(handler: F) -> FnHandler<F, Fut, E>
where
    F: Fn(InboundRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<OutboundResponse, E>> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    FnHandler {
        handler,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, E> RequestHandler for FnHandler<F, Fut, E>
where
    F: Fn(InboundRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<OutboundResponse, E>> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    async fn handle(&self, request: InboundRequest) -> Result<OutboundResponse, E> {
        (self.handler)(request).await
    }
}

// ============================================================================
// 准入结果
// ============================================================================

/// 一次准入检查的结果
#[derive(Debug, Clone)]
pub struct Admission {
    pub decision: Decision,
    pub context: EventContext,
    /// 攻击特征扫描结果（未扫描时为空）
    pub scan: ScanReport,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        self.decision.is_admitted()
    }

    pub fn client(&self) -> &ClientIdentity {
        &self.context.client
    }

    /// 拒绝时返回给客户端的响应
    pub fn denial_response(&self) -> Option<OutboundResponse> {
        denial_response(&self.decision)
    }
}

/// 拒绝响应：固定状态码与简短的机器可读原因，不包含内部细节
pub fn denial_response(decision: &Decision) -> Option<OutboundResponse> {
    match decision {
        Decision::Admitted => None,
        Decision::RateLimited { window_seconds, .. } => Some(
            OutboundResponse::json(
                STATUS_TOO_MANY_REQUESTS,
                &serde_json::json!({
                    "error": "rate_limited",
                    "message": "Rate limit exceeded. Please try again later.",
                }),
            )
            .with_header("retry-after", &window_seconds.to_string()),
        ),
        Decision::Blocked(_) => Some(OutboundResponse::json(
            STATUS_FORBIDDEN,
            &serde_json::json!({
                "error": "access_denied",
                "message": "Your IP address has been blocked.",
            }),
        )),
    }
}

// ============================================================================
// 统计
// ============================================================================

/// 管道统计
#[derive(Debug, Default)]
pub struct PipelineStats {
    total: AtomicU64,
    admitted: AtomicU64,
    rate_limited: AtomicU64,
    blocked: AtomicU64,
    suspicious: AtomicU64,
    handler_failures: AtomicU64,
    fail_open_checks: AtomicU64,
}

impl PipelineStats {
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn rate_limited(&self) -> u64 {
        self.rate_limited.load(Ordering::Relaxed)
    }

    pub fn blocked(&self) -> u64 {
        self.blocked.load(Ordering::Relaxed)
    }

    pub fn suspicious(&self) -> u64 {
        self.suspicious.load(Ordering::Relaxed)
    }

    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    pub fn fail_open_checks(&self) -> u64 {
        self.fail_open_checks.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            total: self.total(),
            admitted: self.admitted(),
            rate_limited: self.rate_limited(),
            blocked: self.blocked(),
            suspicious: self.suspicious(),
            handler_failures: self.handler_failures(),
            fail_open_checks: self.fail_open_checks(),
        }
    }
}

/// 统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub total: u64,
    pub admitted: u64,
    pub rate_limited: u64,
    pub blocked: u64,
    pub suspicious: u64,
    pub handler_failures: u64,
    pub fail_open_checks: u64,
}

// ============================================================================
// 准入管道
// ============================================================================

/// 准入管道
pub struct AdmissionPipeline {
    /// 只读配置快照
    config: Arc<SecurityConfig>,
    resolver: ClientIdentityResolver,
    rate_limiter: RateLimiter,
    blacklist: Arc<BlacklistManager>,
    detector: PatternDetector,
    logger: Arc<SecurityLogger>,
    stats: PipelineStats,
    #[cfg(feature = "monitoring")]
    metrics: Option<Arc<Metrics>>,
}

impl AdmissionPipeline {
    /// 使用同时实现日志与黑名单存储的后端创建管道
    pub fn new<S>(config: SecurityConfig, store: Arc<S>) -> Result<Self, AdmissionError>
    where
        S: LogStore + BlacklistStore + 'static,
    {
        Self::with_stores(config, store.clone(), store)
    }

    /// 分别指定日志存储与黑名单存储
    ///
    /// 配置先经校验，之后不可修改。
    pub fn with_stores(
        config: SecurityConfig,
        logs: Arc<dyn LogStore>,
        blacklist_store: Arc<dyn BlacklistStore>,
    ) -> Result<Self, AdmissionError> {
        config.validate().map_err(AdmissionError::ConfigError)?;
        let timeout = config.logging.store_timeout();

        let blacklist = Arc::new(
            BlacklistManager::new(blacklist_store, logs.clone(), config.auto_block.clone())
                .with_timeout(timeout),
        );
        let logger = Arc::new(
            SecurityLogger::new(logs.clone(), config.logging.clone())
                .with_blacklist(blacklist.clone()),
        );
        let rate_limiter = RateLimiter::from_config(&config.rate_limit, logs)
            .with_logger(logger.clone())
            .with_timeout(timeout);

        info!(
            "Admission pipeline created: rate_limit={}/{}s ({}), auto_block={} in {}s, signatures={}",
            config.rate_limit.max_requests,
            config.rate_limit.window_seconds,
            rate_limiter.counter_name(),
            config.auto_block.violation_threshold,
            config.auto_block.lookback_seconds,
            config.patterns.signatures.len()
        );

        Ok(Self {
            resolver: ClientIdentityResolver::new(&config.identity),
            detector: PatternDetector::new(config.patterns.signatures.clone()),
            config: Arc::new(config),
            rate_limiter,
            blacklist,
            logger,
            stats: PipelineStats::default(),
            #[cfg(feature = "monitoring")]
            metrics: None,
        })
    }

    /// 挂接 Prometheus 指标
    #[cfg(feature = "monitoring")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn logger(&self) -> &Arc<SecurityLogger> {
        &self.logger
    }

    pub fn blacklist(&self) -> &Arc<BlacklistManager> {
        &self.blacklist
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// 执行第 1–4 步，不调用处理器、不写访问日志
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn admit(&self, request: &InboundRequest) -> Admission {
        let started = Instant::now();
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        let client = self.resolver.resolve(request);
        let context = EventContext::from_request(request, &client);
        debug!("Client resolved: {}", redact_ip(client.ip()));

        let decision = self.decide(request, &context).await;
        let scan = if decision.is_admitted() {
            self.scan(request, &context).await
        } else {
            ScanReport::default()
        };

        match &decision {
            Decision::Admitted => {
                self.stats.admitted.fetch_add(1, Ordering::Relaxed);
            }
            Decision::RateLimited { .. } => {
                self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
            }
            Decision::Blocked(_) => {
                self.stats.blocked.fetch_add(1, Ordering::Relaxed);
            }
        }

        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            metrics.record_admission(&decision, !scan.is_empty(), started.elapsed());
        }
        debug!(
            "Admission decided in {:?}: {}",
            started.elapsed(),
            decision.reason().unwrap_or("admitted")
        );

        Admission {
            decision,
            context,
            scan,
        }
    }

    /// 执行完整的 1–7 步
    ///
    /// 拒绝时返回 `Ok` 的拒绝响应；处理器错误在记录后原样返回。
    pub async fn handle<H>(
        &self,
        request: InboundRequest,
        handler: &H,
    ) -> Result<OutboundResponse, H::Error>
    where
        H: RequestHandler + ?Sized,
    {
        let started = Instant::now();
        let request_bytes = request.body_len();
        let admission = self.admit(&request).await;

        if let Some(response) = admission.denial_response() {
            self.log_access(&admission.context, response.status, started, request_bytes, response.body_len())
                .await;
            return Ok(response);
        }

        match handler.handle(request).await {
            Ok(response) => {
                self.log_access(
                    &admission.context,
                    response.status,
                    started,
                    request_bytes,
                    response.body_len(),
                )
                .await;
                Ok(response)
            }
            Err(err) => {
                self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "monitoring")]
                if let Some(metrics) = &self.metrics {
                    metrics.record_handler_failure();
                }
                warn!(
                    "Handler failed: {} {}: {}",
                    admission.context.method, admission.context.path, err
                );

                let context = &admission.context;
                self.logger
                    .log_system_error(
                        ErrorRecord::new(ErrorLevel::Error, "handler", err.to_string())
                            .with_function(&format!("{} {}", context.method, context.path))
                            .with_stack_trace(error_chain(&err))
                            .with_request(&context.path, context.client.ip()),
                    )
                    .await;
                self.log_access(context, STATUS_INTERNAL_ERROR, started, request_bytes, 0)
                    .await;
                Err(err)
            }
        }
    }

    /// 第 2–3 步
    async fn decide(&self, request: &InboundRequest, context: &EventContext) -> Decision {
        if self.config.rate_limit.enabled {
            let policy = self.config.rate_limit.policy_for(&request.path);
            match self.rate_limiter.check_request(context, policy).await {
                Ok(outcome) if !outcome.allowed => {
                    return Decision::RateLimited {
                        current_count: outcome.current_count,
                        max_requests: policy.max_requests,
                        window_seconds: policy.window_seconds,
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    self.fail_open(context, "rate_limiter", "check", &e.to_string())
                        .await;
                }
            }
        }

        // 无法解析 IP 的客户端不参与封禁
        let Some(ip) = context.client.ip() else {
            return Decision::Admitted;
        };

        match self.blacklist.blocking_entry(ip).await {
            Ok(Some(entry)) => {
                warn!("Blocked IP rejected: ip={}, reason={}", ip, entry.reason);
                self.logger
                    .log_security_event(
                        context,
                        EventType::UnauthorizedAccess,
                        Severity::High,
                        &format!("Blocked IP attempted to access {}", context.path),
                        None,
                    )
                    .await;
                Decision::Blocked(BlockInfo {
                    reason: entry.reason,
                    expires_at: entry.expires_at,
                    violation_count: entry.violation_count,
                })
            }
            Ok(None) => Decision::Admitted,
            Err(e) => {
                self.blacklist.record_degraded_check();
                self.fail_open(context, "blacklist", "blocking_entry", &e.to_string())
                    .await;
                Decision::Admitted
            }
        }
    }

    /// 第 4 步
    async fn scan(&self, request: &InboundRequest, context: &EventContext) -> ScanReport {
        if !self.config.patterns.enabled {
            return ScanReport::default();
        }

        let report = self
            .detector
            .scan(&request.path, &request.query_params, &request.body);
        if let Some(event_type) = report.event_type() {
            self.stats.suspicious.fetch_add(1, Ordering::Relaxed);
            self.logger
                .log_security_event(
                    context,
                    event_type,
                    Severity::High,
                    &report.description(),
                    Some(&request_data(request)),
                )
                .await;
        }
        report
    }

    async fn fail_open(&self, context: &EventContext, module: &str, function: &str, error: &str) {
        self.stats.fail_open_checks.fetch_add(1, Ordering::Relaxed);
        warn!("{} unavailable, failing open: {}", module, error);
        self.logger
            .log_system_error(
                ErrorRecord::new(
                    ErrorLevel::Error,
                    module,
                    format!("Check failed, request admitted: {}", error),
                )
                .with_function(function)
                .with_request(&context.path, context.client.ip()),
            )
            .await;
    }

    async fn log_access(
        &self,
        context: &EventContext,
        status_code: u16,
        started: Instant,
        request_bytes: u64,
        response_bytes: u64,
    ) {
        self.logger
            .log_access(AccessRecord {
                timestamp: Utc::now(),
                client_ip: context.client_ip().to_string(),
                user_agent: context.user_agent.clone(),
                method: context.method.clone(),
                path: context.path.clone(),
                status_code,
                response_time_ms: started.elapsed().as_millis() as u64,
                request_bytes,
                response_bytes,
            })
            .await;
    }
}

/// 安全事件中保存的请求数据（路径、查询参数与请求体文本）
fn request_data(request: &InboundRequest) -> String {
    let query = request
        .query_params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    let body = String::from_utf8_lossy(&request.body);

    let mut data = request.path.clone();
    if !query.is_empty() {
        data.push('?');
        data.push_str(&query);
    }
    if !body.is_empty() {
        data.push('\n');
        data.push_str(&body);
    }
    data
}

/// 错误及其 source 链
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str("\ncaused by: ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

// ============================================================================
// 单元测试
// ============================================================================
