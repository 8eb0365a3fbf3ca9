//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 限流器
//!
//! 按客户端统计滑动窗口内的请求数：窗口内已有请求数达到 `max_requests` 时拒绝，
//! 并写入一条 `rate_limit`/medium 安全事件。
//!
//! 两种计数后端：
//! - [`StoreCounter`]：查询访问日志（每个完成的请求都有一条访问记录，包括被拒绝的请求）
//! - [`SlidingWindowCounter`]：进程内按键保存时间戳，定期压缩

use crate::config::{checked_seconds, CounterBackend, RateLimitConfig, RateLimitPolicy};
use crate::constants::{DEFAULT_STORE_TIMEOUT_MS, DEFAULT_WINDOW_COMPACTION_INTERVAL_SECS};
use crate::error::StorageError;
use crate::records::{EventType, Severity};
use crate::security_logger::{EventContext, SecurityLogger};
use crate::storage::{bounded, LogStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// 请求计数器
#[async_trait]
pub trait RequestCounter: Send + Sync {
    /// 返回 `since` 之后该键已有的请求数，并登记本次请求
    ///
    /// # 参数
    /// - `key`: 客户端键
    /// - `since`: 窗口起点
    /// - `max_requests`: 窗口上限，计数器可据此限制保存的时间戳数量
    async fn hit(
        &self,
        key: &str,
        since: DateTime<Utc>,
        max_requests: u64,
    ) -> Result<u64, StorageError>;

    /// 计数器名称
    fn name(&self) -> &'static str;
}

// ============================================================================
// 访问日志计数
// ============================================================================

/// 查询访问日志的计数器
///
/// 本次请求由管道在响应后写入访问日志，`hit` 本身不登记。
pub struct StoreCounter {
    logs: Arc<dyn LogStore>,
}

impl StoreCounter {
    pub fn new(logs: Arc<dyn LogStore>) -> Self {
        Self { logs }
    }
}

#[async_trait]
impl RequestCounter for StoreCounter {
    async fn hit(
        &self,
        key: &str,
        since: DateTime<Utc>,
        _max_requests: u64,
    ) -> Result<u64, StorageError> {
        self.logs.count_access_since(key, since).await
    }

    fn name(&self) -> &'static str {
        "StoreCounter"
    }
}

// ============================================================================
// 进程内滑动窗口
// ============================================================================

/// 进程内滑动窗口计数器
///
/// 被拒绝的请求不登记，每个键最多保存 `max_requests` 个时间戳。
/// 超过 `horizon` 未活动的键在压缩时整体移除。
pub struct SlidingWindowCounter {
    windows: DashMap<String, VecDeque<DateTime<Utc>>>,
    horizon: ChronoDuration,
    compaction_interval: Duration,
    last_compaction: Mutex<Instant>,
}

impl SlidingWindowCounter {
    /// 创建新的滑动窗口计数器
    ///
    /// # 参数
    /// - `horizon`: 最长窗口，早于此跨度的时间戳可被丢弃
    pub fn new(horizon: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            horizon: ChronoDuration::from_std(horizon)
                .unwrap_or_else(|_| ChronoDuration::seconds(60)),
            compaction_interval: Duration::from_secs(DEFAULT_WINDOW_COMPACTION_INTERVAL_SECS),
            last_compaction: Mutex::new(Instant::now()),
        }
    }

    pub fn with_compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// 跟踪中的键数
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// 移除过期时间戳与空闲的键
    ///
    /// # 返回
    /// 被移除的键数
    pub fn compact(&self) -> usize {
        let cutoff = Utc::now()
            .checked_sub_signed(self.horizon)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let before = self.windows.len();
        self.windows.retain(|_, stamps| {
            while stamps.front().map_or(false, |oldest| *oldest < cutoff) {
                stamps.pop_front();
            }
            !stamps.is_empty()
        });
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!("Sliding window compacted: removed_keys={}", removed);
        }
        removed
    }

    fn maybe_compact(&self) {
        let due = {
            let mut last = self.last_compaction.lock();
            if last.elapsed() >= self.compaction_interval {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if due {
            self.compact();
        }
    }
}

#[async_trait]
impl RequestCounter for SlidingWindowCounter {
    async fn hit(
        &self,
        key: &str,
        since: DateTime<Utc>,
        max_requests: u64,
    ) -> Result<u64, StorageError> {
        self.maybe_compact();

        let now = Utc::now();
        let cutoff = now
            .checked_sub_signed(self.horizon)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut stamps = self.windows.entry(key.to_string()).or_default();

        while stamps.front().map_or(false, |oldest| *oldest < cutoff) {
            stamps.pop_front();
        }

        let current = stamps.iter().filter(|ts| **ts >= since).count() as u64;
        if current < max_requests {
            stamps.push_back(now);
            // 保存上限随最严格的策略收缩
            while stamps.len() as u64 > max_requests {
                stamps.pop_front();
            }
        }
        Ok(current)
    }

    fn name(&self) -> &'static str {
        "SlidingWindowCounter"
    }
}

// ============================================================================
// 限流器
// ============================================================================

/// 一次限流检查的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    /// 本次请求之前窗口内的请求数
    pub current_count: u64,
}

/// 限流统计
#[derive(Debug, Default)]
pub struct RateLimiterStats {
    checks: AtomicU64,
    denied: AtomicU64,
}

impl RateLimiterStats {
    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    pub fn denied(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }
}

/// 限流器
pub struct RateLimiter {
    counter: Arc<dyn RequestCounter>,
    logger: Option<Arc<SecurityLogger>>,
    timeout: Duration,
    stats: RateLimiterStats,
}

impl RateLimiter {
    pub fn new(counter: Arc<dyn RequestCounter>) -> Self {
        Self {
            counter,
            logger: None,
            timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            stats: RateLimiterStats::default(),
        }
    }

    /// 按配置选择计数后端
    pub fn from_config(config: &RateLimitConfig, logs: Arc<dyn LogStore>) -> Self {
        let counter: Arc<dyn RequestCounter> = match config.backend {
            CounterBackend::Store => Arc::new(StoreCounter::new(logs)),
            CounterBackend::Memory => Arc::new(SlidingWindowCounter::new(config.longest_window())),
        };
        Self::new(counter)
    }

    /// 拒绝时通过此记录器写入安全事件
    pub fn with_logger(mut self, logger: Arc<SecurityLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn counter_name(&self) -> &'static str {
        self.counter.name()
    }

    pub fn stats(&self) -> &RateLimiterStats {
        &self.stats
    }

    /// 检查键是否超过限制
    ///
    /// # 参数
    /// - `key`: 客户端键
    /// - `max_requests`: 窗口内最大请求数
    /// - `window_seconds`: 窗口长度（秒）
    ///
    /// # 返回
    /// - `Ok(outcome)`: `allowed` 当且仅当已有请求数小于 `max_requests`
    /// - `Err(_)`: 计数失败或超时
    pub async fn check(
        &self,
        key: &str,
        max_requests: u64,
        window_seconds: u64,
    ) -> Result<RateLimitOutcome, StorageError> {
        self.stats.checks.fetch_add(1, Ordering::Relaxed);

        let since = checked_seconds(window_seconds)
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .ok_or_else(|| {
                StorageError::QueryError(format!("window_seconds 超出范围: {}", window_seconds))
            })?;
        let current_count = bounded(
            self.timeout,
            "rate_limit_count",
            self.counter.hit(key, since, max_requests),
        )
        .await?;

        let allowed = current_count < max_requests;
        if !allowed {
            self.stats.denied.fetch_add(1, Ordering::Relaxed);
        }
        Ok(RateLimitOutcome {
            allowed,
            current_count,
        })
    }

    /// 对一个请求执行限流检查，拒绝时写入 `rate_limit`/medium 事件
    #[instrument(skip(self, context), fields(client = %context.client))]
    pub async fn check_request(
        &self,
        context: &EventContext,
        policy: RateLimitPolicy,
    ) -> Result<RateLimitOutcome, StorageError> {
        let outcome = self
            .check(context.client_ip(), policy.max_requests, policy.window_seconds)
            .await?;

        if !outcome.allowed {
            debug!(
                "Rate limit exceeded: count={}, max={}, window={}s",
                outcome.current_count, policy.max_requests, policy.window_seconds
            );
            if let Some(logger) = &self.logger {
                logger
                    .log_security_event(
                        context,
                        EventType::RateLimit,
                        Severity::Medium,
                        &format!(
                            "Rate limit exceeded: {} requests in {}s",
                            outcome.current_count, policy.window_seconds
                        ),
                        None,
                    )
                    .await;
            }
        }
        Ok(outcome)
    }
}

// ============================================================================
// 单元测试
// ============================================================================
