//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 黑名单管理器
//!
//! 根据近期高危安全事件维护每个 IP 的封禁状态。
//!
//! # 状态机
//!
//! `clear` → `blocked(expires_at)` → `clear`（过期或被操作员停用）→ 可再次进入 `blocked`。
//!
//! 过期由判定谓词自身保证：`is_active` 且（无过期时间或过期时间晚于当前），
//! 不需要单独的清理任务。条目只更新，不物理删除。
//!
//! # 功能
//!
//! - 违规计数评估与自动封禁（upsert）
//! - 请求路径上的封禁判定
//! - 操作员启用/停用、手动封禁、列表查询

use crate::config::AutoBlockConfig;
use crate::constants::{
    AUTO_BLOCKED_BY, DEFAULT_STORE_TIMEOUT_MS, MAX_BLOCK_REASON_LENGTH, MAX_IP_ADDRESS_LENGTH,
    MAX_OPERATOR_LENGTH,
};
use crate::error::{AdmissionError, StorageError};
use crate::records::IpBlacklistEntry;
use crate::storage::{bounded, BlacklistFilter, BlacklistStore, LogStore};
use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, info, instrument, warn};

// ============================================================================
// 验证宏
// ============================================================================

/// 字符串验证宏
macro_rules! validate_string {
    ($value:expr, $name:expr, $max_len:expr) => {
        if $value.trim().is_empty() {
            return Err(AdmissionError::ValidationError(
                concat!($name, "不能为空").to_string(),
            ));
        }
        if $value.chars().count() > $max_len {
            return Err(AdmissionError::ValidationError(format!(
                concat!($name, "过长，最大长度为 {} 字符"),
                $max_len
            )));
        }
        if $value.contains(|c: char| c.is_control()) {
            return Err(AdmissionError::ValidationError(
                concat!($name, "包含非法字符").to_string(),
            ));
        }
    };
}

/// 验证IP地址格式
fn validate_ip_address(ip: &str) -> Result<(), AdmissionError> {
    if ip.is_empty() {
        return Err(AdmissionError::ValidationError(
            "IP地址不能为空".to_string(),
        ));
    }

    if ip.len() > MAX_IP_ADDRESS_LENGTH {
        return Err(AdmissionError::ValidationError("IP地址过长".to_string()));
    }

    if ip.parse::<std::net::IpAddr>().is_err() {
        return Err(AdmissionError::ValidationError(format!(
            "无效的IP地址格式: {}",
            ip
        )));
    }

    Ok(())
}

fn validate_reason(reason: &str) -> Result<(), AdmissionError> {
    validate_string!(reason, "封禁原因", MAX_BLOCK_REASON_LENGTH);
    Ok(())
}

fn validate_operator(operator: &str) -> Result<(), AdmissionError> {
    validate_string!(operator, "操作员", MAX_OPERATOR_LENGTH);
    if operator == AUTO_BLOCKED_BY {
        return Err(AdmissionError::ValidationError(format!(
            "操作员标识不能为保留值 {:?}",
            AUTO_BLOCKED_BY
        )));
    }
    Ok(())
}

/// 一次违规评估的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// 自动封禁已关闭
    Skipped,
    /// 未达到阈值
    BelowThreshold { violations: u64 },
    /// 已封禁（新建、刷新或保留更长的手动封禁）
    Blocked(IpBlacklistEntry),
}

impl Evaluation {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Evaluation::Blocked(_))
    }
}

/// 黑名单统计信息
#[derive(Debug, Default)]
pub struct BlacklistStats {
    evaluations: AtomicU64,
    auto_blocks: AtomicU64,
    checks: AtomicU64,
    blocked_hits: AtomicU64,
    degraded_checks: AtomicU64,
    operator_actions: AtomicU64,
}

impl BlacklistStats {
    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    pub fn auto_blocks(&self) -> u64 {
        self.auto_blocks.load(Ordering::Relaxed)
    }

    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    pub fn blocked_hits(&self) -> u64 {
        self.blocked_hits.load(Ordering::Relaxed)
    }

    pub fn degraded_checks(&self) -> u64 {
        self.degraded_checks.load(Ordering::Relaxed)
    }

    pub fn operator_actions(&self) -> u64 {
        self.operator_actions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BlacklistStatsSnapshot {
        BlacklistStatsSnapshot {
            evaluations: self.evaluations(),
            auto_blocks: self.auto_blocks(),
            checks: self.checks(),
            blocked_hits: self.blocked_hits(),
            degraded_checks: self.degraded_checks(),
            operator_actions: self.operator_actions(),
        }
    }
}

/// 统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlacklistStatsSnapshot {
    pub evaluations: u64,
    pub auto_blocks: u64,
    pub checks: u64,
    pub blocked_hits: u64,
    pub degraded_checks: u64,
    pub operator_actions: u64,
}

/// 黑名单管理器
pub struct BlacklistManager {
    /// 黑名单存储
    store: Arc<dyn BlacklistStore>,
    /// 违规计数来源
    logs: Arc<dyn LogStore>,
    config: AutoBlockConfig,
    timeout: StdDuration,
    stats: BlacklistStats,
}

impl BlacklistManager {
    /// 创建新的黑名单管理器
    ///
    /// # 参数
    /// - `store`: 黑名单存储
    /// - `logs`: 用于统计安全事件的日志存储
    /// - `config`: 自动封禁配置
    pub fn new(
        store: Arc<dyn BlacklistStore>,
        logs: Arc<dyn LogStore>,
        config: AutoBlockConfig,
    ) -> Self {
        Self {
            store,
            logs,
            config,
            timeout: StdDuration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            stats: BlacklistStats::default(),
        }
    }

    /// 设置单次存储调用的超时
    pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn config(&self) -> &AutoBlockConfig {
        &self.config
    }

    pub fn stats(&self) -> &BlacklistStats {
        &self.stats
    }

    /// 重新统计违规次数，达到阈值时 upsert 封禁条目
    ///
    /// 高危事件和严重事件两种触发都调用本方法。
    ///
    /// # 返回
    /// - `Ok(Evaluation)`: 评估结果
    /// - `Err(_)`: 存储不可用或超时
    #[instrument(skip(self))]
    pub async fn evaluate(&self, ip: &str) -> Result<Evaluation, AdmissionError> {
        if !self.config.enabled {
            return Ok(Evaluation::Skipped);
        }
        self.stats.evaluations.fetch_add(1, Ordering::Relaxed);

        let now = Utc::now();
        let since = self
            .config
            .lookback()
            .and_then(|lookback| now.checked_sub_signed(lookback))
            .ok_or_else(|| {
                AdmissionError::ConfigError(format!(
                    "lookback_seconds 超出范围: {}",
                    self.config.lookback_seconds
                ))
            })?;
        let violations = bounded(
            self.timeout,
            "count_security_events_since",
            self.logs
                .count_security_events_since(ip, since, &self.config.trigger_severities),
        )
        .await?;

        if violations < u64::from(self.config.violation_threshold) {
            debug!(
                "Violations below threshold: ip={}, violations={}, threshold={}",
                ip, violations, self.config.violation_threshold
            );
            return Ok(Evaluation::BelowThreshold { violations });
        }

        let expires_at = self
            .config
            .block_duration()
            .and_then(|duration| now.checked_add_signed(duration))
            .ok_or_else(|| {
                AdmissionError::ConfigError(format!(
                    "block_duration_seconds 超出范围: {}",
                    self.config.block_duration_seconds
                ))
            })?;

        // 更长的手动封禁不被自动封禁覆盖
        if let Some(existing) = self.fetch(ip).await? {
            let outlasts = existing
                .expires_at
                .map_or(true, |existing_expiry| existing_expiry >= expires_at);
            if !existing.is_auto() && existing.is_blocking_at(now) && outlasts {
                debug!("Manual block retained: ip={}, by={}", ip, existing.blocked_by);
                return Ok(Evaluation::Blocked(existing));
            }
        }

        let entry = IpBlacklistEntry {
            ip_address: ip.to_string(),
            blocked_at: now,
            reason: format!(
                "Auto-blocked: {} security violations in {}",
                violations,
                self.config.lookback_label()
            ),
            blocked_by: AUTO_BLOCKED_BY.to_string(),
            violation_count: u32::try_from(violations).unwrap_or(u32::MAX),
            is_active: true,
            expires_at: Some(expires_at),
        };

        let stored = bounded(self.timeout, "upsert_entry", self.store.upsert_entry(&entry)).await?;
        self.stats.auto_blocks.fetch_add(1, Ordering::Relaxed);

        warn!(
            "IP auto-blocked: ip={}, violations={}, expires_at={}",
            ip, violations, expires_at
        );

        Ok(Evaluation::Blocked(stored))
    }

    /// 请求路径上的封禁判定，返回生效中的条目
    ///
    /// 存储错误向上传递，由调用方决定降级策略。
    #[instrument(skip(self))]
    pub async fn blocking_entry(&self, ip: &str) -> Result<Option<IpBlacklistEntry>, StorageError> {
        self.stats.checks.fetch_add(1, Ordering::Relaxed);

        let entry = self.fetch(ip).await?;
        let now = Utc::now();
        let blocking = entry.filter(|entry| entry.is_blocking_at(now));

        if blocking.is_some() {
            self.stats.blocked_hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(blocking)
    }

    /// 是否处于封禁状态
    ///
    /// 存储不可用时放行（返回 `false`）并记为降级检查。
    pub async fn is_blocked(&self, ip: &str) -> bool {
        match self.blocking_entry(ip).await {
            Ok(entry) => entry.is_some(),
            Err(e) => {
                self.record_degraded_check();
                warn!("Blacklist check degraded, failing open: ip={}, error={}", ip, e);
                false
            }
        }
    }

    /// 记录一次降级（放行）的检查
    pub fn record_degraded_check(&self) {
        self.stats.degraded_checks.fetch_add(1, Ordering::Relaxed);
    }

    /// 获取条目（不论是否生效）
    pub async fn get_entry(&self, ip: &str) -> Result<Option<IpBlacklistEntry>, AdmissionError> {
        Ok(self.fetch(ip).await?)
    }

    /// 操作员启用条目，只修改 `is_active`
    ///
    /// # 返回
    /// - `Ok(true)`: 条目存在并已更新
    /// - `Ok(false)`: 条目不存在
    #[instrument(skip(self))]
    pub async fn activate(&self, ip: &str, operator: &str) -> Result<bool, AdmissionError> {
        self.set_active(ip, operator, true).await
    }

    /// 操作员停用条目，只修改 `is_active`
    #[instrument(skip(self))]
    pub async fn deactivate(&self, ip: &str, operator: &str) -> Result<bool, AdmissionError> {
        self.set_active(ip, operator, false).await
    }

    async fn set_active(
        &self,
        ip: &str,
        operator: &str,
        is_active: bool,
    ) -> Result<bool, AdmissionError> {
        validate_ip_address(ip)?;
        validate_operator(operator)?;

        let found = bounded(self.timeout, "set_active", self.store.set_active(ip, is_active)).await?;
        if found {
            self.stats.operator_actions.fetch_add(1, Ordering::Relaxed);
            info!(
                "Blacklist entry updated: ip={}, is_active={}, operator={}",
                ip, is_active, operator
            );
        } else {
            debug!("Blacklist entry not found: ip={}", ip);
        }
        Ok(found)
    }

    /// 手动封禁
    ///
    /// # 参数
    /// - `ip`: IP地址
    /// - `reason`: 封禁原因
    /// - `operator`: 操作员标识，写入 `blocked_by`
    /// - `duration`: 封禁时长，`None` 表示不过期
    #[instrument(skip(self))]
    pub async fn block_manually(
        &self,
        ip: &str,
        reason: &str,
        operator: &str,
        duration: Option<StdDuration>,
    ) -> Result<IpBlacklistEntry, AdmissionError> {
        validate_ip_address(ip)?;
        validate_reason(reason)?;
        validate_operator(operator)?;

        let now = Utc::now();
        let expires_at = match duration {
            Some(duration) => Some(
                Duration::from_std(duration)
                    .ok()
                    .and_then(|duration| now.checked_add_signed(duration))
                    .ok_or_else(|| {
                        AdmissionError::ValidationError(format!(
                            "封禁时长超出范围: {}s",
                            duration.as_secs()
                        ))
                    })?,
            ),
            None => None,
        };

        let violation_count = self
            .fetch(ip)
            .await?
            .map(|existing| existing.violation_count)
            .unwrap_or(0);

        let entry = IpBlacklistEntry {
            ip_address: ip.to_string(),
            blocked_at: now,
            reason: reason.to_string(),
            blocked_by: operator.to_string(),
            violation_count,
            is_active: true,
            expires_at,
        };

        let stored = bounded(self.timeout, "upsert_entry", self.store.upsert_entry(&entry)).await?;
        self.stats.operator_actions.fetch_add(1, Ordering::Relaxed);
        info!(
            "IP blocked manually: ip={}, operator={}, expires_at={:?}",
            ip, operator, expires_at
        );
        Ok(stored)
    }

    /// 列出条目
    #[instrument(skip(self))]
    pub async fn list(
        &self,
        filter: &BlacklistFilter,
    ) -> Result<Vec<IpBlacklistEntry>, AdmissionError> {
        Ok(bounded(self.timeout, "list_entries", self.store.list_entries(filter)).await?)
    }

    async fn fetch(&self, ip: &str) -> Result<Option<IpBlacklistEntry>, StorageError> {
        bounded(self.timeout, "get_entry", self.store.get_entry(ip)).await
    }
}

// ============================================================================
// 单元测试
// ============================================================================
