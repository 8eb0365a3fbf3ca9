//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 存储抽象层
//!
//! 定义日志存储与黑名单存储接口，以及内存实现和故障注入实现。
//!
//! 所有接口均可被多个并发请求安全调用；黑名单的 upsert 在行级别原子。

use crate::constants::{
    DEFAULT_MEMORY_RETENTION_PER_KIND, DEFAULT_QUERY_LIMIT, DEFAULT_WINDOW_COMPACTION_INTERVAL_SECS,
    MAX_QUERY_LIMIT,
};
use crate::error::StorageError;
use crate::records::{EventType, IpBlacklistEntry, LogKind, LogRecord, Severity};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// 日志存储接口
#[async_trait]
pub trait LogStore: Send + Sync {
    /// 追加一条日志记录
    async fn append(&self, record: LogRecord) -> Result<(), StorageError>;

    /// 统计某 IP 自 `since` 起的访问记录数
    async fn count_access_since(
        &self,
        client_ip: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StorageError>;

    /// 统计某 IP 自 `since` 起、严重级别在 `severities` 中的安全事件数
    async fn count_security_events_since(
        &self,
        client_ip: &str,
        since: DateTime<Utc>,
        severities: &[Severity],
    ) -> Result<u64, StorageError>;

    /// 运维查询，结果按时间倒序
    async fn query(&self, query: &LogQuery) -> Result<Vec<LogRecord>, StorageError>;
}

/// 黑名单存储接口
#[async_trait]
pub trait BlacklistStore: Send + Sync {
    /// 按 IP 获取条目（不论是否生效）
    async fn get_entry(&self, ip_address: &str) -> Result<Option<IpBlacklistEntry>, StorageError>;

    /// 以 `ip_address` 为键原子地插入或覆盖条目，返回写入后的条目
    async fn upsert_entry(&self, entry: &IpBlacklistEntry)
        -> Result<IpBlacklistEntry, StorageError>;

    /// 只修改 `is_active`，返回条目是否存在
    async fn set_active(&self, ip_address: &str, is_active: bool) -> Result<bool, StorageError>;

    /// 按过滤条件列出条目
    async fn list_entries(
        &self,
        filter: &BlacklistFilter,
    ) -> Result<Vec<IpBlacklistEntry>, StorageError>;
}

/// 为一次存储调用加上超时上限
///
/// 超时映射为 [`StorageError::TimeoutError`]。
pub async fn bounded<T, F>(timeout: Duration, operation: &str, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::TimeoutError(format!(
            "{} 超过 {}ms",
            operation,
            timeout.as_millis()
        ))),
    }
}

/// 日志查询条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogQuery {
    pub kind: LogKind,
    pub client_ip: Option<String>,
    pub severity: Option<Severity>,
    pub event_type: Option<EventType>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl LogQuery {
    pub fn new(kind: LogKind) -> Self {
        Self {
            kind,
            client_ip: None,
            severity: None,
            event_type: None,
            since: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }

    pub fn client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// 实际生效的条数上限：0 取默认值，超过上限时截断
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            0 => DEFAULT_QUERY_LIMIT,
            n => n.min(MAX_QUERY_LIMIT),
        }
    }

    /// 记录是否满足条件（不含条数限制）
    pub fn matches(&self, record: &LogRecord) -> bool {
        if record.kind() != self.kind {
            return false;
        }
        if let Some(ip) = &self.client_ip {
            if record.client_ip() != Some(ip.as_str()) {
                return false;
            }
        }
        if let Some(severity) = self.severity {
            if record.severity() != Some(severity) {
                return false;
            }
        }
        if let Some(event_type) = self.event_type {
            if record.event_type() != Some(event_type) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.timestamp() < since {
                return false;
            }
        }
        true
    }
}

/// 黑名单列表过滤条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistFilter {
    /// 仅列出当前生效的条目
    pub active_only: bool,
    pub blocked_by: Option<String>,
    /// IP 子串匹配
    pub ip_contains: Option<String>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for BlacklistFilter {
    fn default() -> Self {
        Self {
            active_only: false,
            blocked_by: None,
            ip_contains: None,
            offset: 0,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl BlacklistFilter {
    pub fn matches(&self, entry: &IpBlacklistEntry, now: DateTime<Utc>) -> bool {
        if self.active_only && !entry.is_blocking_at(now) {
            return false;
        }
        if let Some(blocked_by) = &self.blocked_by {
            if &entry.blocked_by != blocked_by {
                return false;
            }
        }
        if let Some(fragment) = &self.ip_contains {
            if !entry.ip_address.contains(fragment.as_str()) {
                return false;
            }
        }
        true
    }

    pub fn effective_limit(&self) -> usize {
        match self.limit {
            0 => DEFAULT_QUERY_LIMIT,
            n => n.min(MAX_QUERY_LIMIT),
        }
    }
}

// ============================================================================
// 内存存储
// ============================================================================

/// 内存存储实现
///
/// 每类日志一个有界队列；访问记录和安全事件另按 IP 建时间索引，
/// 使窗口计数只扫描该 IP 的近期记录。索引定期压缩，
/// 不再活跃的 IP 在超出 `index_horizon` 后被移除。
pub struct MemoryLogStore {
    logs: [RwLock<VecDeque<LogRecord>>; 6],
    access_index: DashMap<String, VecDeque<DateTime<Utc>>>,
    security_index: DashMap<String, VecDeque<(DateTime<Utc>, Severity)>>,
    blacklist: DashMap<String, IpBlacklistEntry>,
    retention: usize,
    index_horizon: ChronoDuration,
    compaction_interval: Duration,
    last_compaction: Mutex<Instant>,
}

impl MemoryLogStore {
    /// 创建新的内存存储
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_MEMORY_RETENTION_PER_KIND)
    }

    /// 指定每类日志保留的最大条数
    pub fn with_retention(retention: usize) -> Self {
        Self {
            logs: Default::default(),
            access_index: DashMap::new(),
            security_index: DashMap::new(),
            blacklist: DashMap::new(),
            retention: retention.max(1),
            index_horizon: ChronoDuration::hours(24),
            compaction_interval: Duration::from_secs(DEFAULT_WINDOW_COMPACTION_INTERVAL_SECS),
            last_compaction: Mutex::new(Instant::now()),
        }
    }

    /// 指定计数索引保留的时间跨度，早于此跨度的计数回退到全量扫描
    pub fn with_index_horizon(mut self, horizon: Duration) -> Self {
        self.index_horizon =
            ChronoDuration::from_std(horizon).unwrap_or_else(|_| ChronoDuration::hours(24));
        self
    }

    pub fn with_compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// 计数索引中跟踪的 IP 数（访问与安全事件两个索引之和）
    pub fn indexed_keys(&self) -> usize {
        self.access_index.len() + self.security_index.len()
    }

    /// 移除索引中超出时间跨度的时间戳与空闲的 IP
    ///
    /// # 返回
    /// 被移除的键数
    pub fn compact_index(&self) -> usize {
        let cutoff = self.index_cutoff();
        let before = self.indexed_keys();
        self.access_index.retain(|_, stamps| {
            stamps.retain(|ts| *ts >= cutoff);
            !stamps.is_empty()
        });
        self.security_index.retain(|_, stamps| {
            stamps.retain(|(ts, _)| *ts >= cutoff);
            !stamps.is_empty()
        });
        let removed = before.saturating_sub(self.indexed_keys());
        if removed > 0 {
            debug!("Memory store index compacted: removed_keys={}", removed);
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
            self.compact_index();
        }
    }

    fn index_cutoff(&self) -> DateTime<Utc> {
        Utc::now()
            .checked_sub_signed(self.index_horizon)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// 某类日志当前条数
    pub fn len(&self, kind: LogKind) -> usize {
        self.logs[kind.index()].read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.iter().all(|log| log.read().is_empty())
    }

    /// 黑名单行数
    pub fn blacklist_len(&self) -> usize {
        self.blacklist.len()
    }

    fn index_record(&self, record: &LogRecord) {
        let cutoff = self.index_cutoff();
        match record {
            LogRecord::Access(access) => {
                let mut stamps = self
                    .access_index
                    .entry(access.client_ip.clone())
                    .or_default();
                stamps.push_back(access.timestamp);
                if stamps.front().map_or(false, |oldest| *oldest < cutoff) {
                    stamps.retain(|ts| *ts >= cutoff);
                }
            }
            LogRecord::Security(event) => {
                let mut stamps = self
                    .security_index
                    .entry(event.client_ip.clone())
                    .or_default();
                stamps.push_back((event.timestamp, event.severity));
                if stamps.front().map_or(false, |(oldest, _)| *oldest < cutoff) {
                    stamps.retain(|(ts, _)| *ts >= cutoff);
                }
            }
            _ => {}
        }
    }

    fn within_horizon(&self, since: DateTime<Utc>) -> bool {
        since >= self.index_cutoff()
    }

    fn scan_count<F>(&self, kind: LogKind, predicate: F) -> u64
    where
        F: Fn(&LogRecord) -> bool,
    {
        self.logs[kind.index()]
            .read()
            .iter()
            .filter(|record| predicate(record))
            .count() as u64
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, record: LogRecord) -> Result<(), StorageError> {
        self.index_record(&record);
        self.maybe_compact();

        let mut log = self.logs[record.kind().index()].write();
        log.push_back(record);
        while log.len() > self.retention {
            log.pop_front();
        }
        Ok(())
    }

    async fn count_access_since(
        &self,
        client_ip: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        if !self.within_horizon(since) {
            return Ok(self.scan_count(LogKind::Api, |record| {
                record.client_ip() == Some(client_ip) && record.timestamp() >= since
            }));
        }

        Ok(self
            .access_index
            .get(client_ip)
            .map(|stamps| stamps.iter().filter(|ts| **ts >= since).count() as u64)
            .unwrap_or(0))
    }

    async fn count_security_events_since(
        &self,
        client_ip: &str,
        since: DateTime<Utc>,
        severities: &[Severity],
    ) -> Result<u64, StorageError> {
        if !self.within_horizon(since) {
            return Ok(self.scan_count(LogKind::Security, |record| {
                record.client_ip() == Some(client_ip)
                    && record.timestamp() >= since
                    && record.severity().map_or(false, |s| severities.contains(&s))
            }));
        }

        Ok(self
            .security_index
            .get(client_ip)
            .map(|stamps| {
                stamps
                    .iter()
                    .filter(|(ts, severity)| *ts >= since && severities.contains(severity))
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<LogRecord>, StorageError> {
        let log = self.logs[query.kind.index()].read();
        Ok(log
            .iter()
            .rev()
            .filter(|record| query.matches(record))
            .take(query.effective_limit())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BlacklistStore for MemoryLogStore {
    async fn get_entry(&self, ip_address: &str) -> Result<Option<IpBlacklistEntry>, StorageError> {
        Ok(self.blacklist.get(ip_address).map(|entry| entry.clone()))
    }

    async fn upsert_entry(
        &self,
        entry: &IpBlacklistEntry,
    ) -> Result<IpBlacklistEntry, StorageError> {
        // 写入在分片写锁内完成，同一 IP 的并发 upsert 串行化
        let slot = self
            .blacklist
            .entry(entry.ip_address.clone())
            .and_modify(|existing| *existing = entry.clone())
            .or_insert_with(|| entry.clone());
        Ok(slot.value().clone())
    }

    async fn set_active(&self, ip_address: &str, is_active: bool) -> Result<bool, StorageError> {
        match self.blacklist.get_mut(ip_address) {
            Some(mut entry) => {
                entry.is_active = is_active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_entries(
        &self,
        filter: &BlacklistFilter,
    ) -> Result<Vec<IpBlacklistEntry>, StorageError> {
        let now = Utc::now();
        let mut entries: Vec<IpBlacklistEntry> = self
            .blacklist
            .iter()
            .filter(|entry| filter.matches(entry.value(), now))
            .map(|entry| entry.value().clone())
            .collect();

        entries.sort_by(|a, b| b.blocked_at.cmp(&a.blocked_at));
        Ok(entries
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit())
            .collect())
    }
}

// ============================================================================
// 故障注入存储
// ============================================================================

/// 故障注入存储
///
/// 包装 [`MemoryLogStore`]，可按操作类别开启失败或延迟，
/// 并统计每类日志的追加尝试次数（包括失败的尝试）。
pub struct FaultInjectingStore {
    inner: Arc<MemoryLogStore>,
    fail_appends: AtomicBool,
    fail_counts: AtomicBool,
    fail_blacklist: AtomicBool,
    stall_ms: AtomicU64,
    append_attempts: [AtomicU64; 6],
}

impl FaultInjectingStore {
    pub fn new(inner: Arc<MemoryLogStore>) -> Self {
        Self {
            inner,
            fail_appends: AtomicBool::new(false),
            fail_counts: AtomicBool::new(false),
            fail_blacklist: AtomicBool::new(false),
            stall_ms: AtomicU64::new(0),
            append_attempts: Default::default(),
        }
    }

    pub fn inner(&self) -> &Arc<MemoryLogStore> {
        &self.inner
    }

    /// 所有追加操作失败
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// 所有计数操作失败
    pub fn set_fail_counts(&self, fail: bool) {
        self.fail_counts.store(fail, Ordering::SeqCst);
    }

    /// 所有黑名单操作失败
    pub fn set_fail_blacklist(&self, fail: bool) {
        self.fail_blacklist.store(fail, Ordering::SeqCst);
    }

    /// 每次调用前挂起的时长，用于触发超时
    pub fn set_stall(&self, stall: Duration) {
        self.stall_ms
            .store(stall.as_millis() as u64, Ordering::SeqCst);
    }

    /// 某类日志的追加尝试次数
    pub fn append_attempts(&self, kind: LogKind) -> u64 {
        self.append_attempts[kind.index()].load(Ordering::SeqCst)
    }

    async fn stall(&self) {
        let ms = self.stall_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn outage(flag: &AtomicBool, operation: &str) -> Result<(), StorageError> {
        if flag.load(Ordering::SeqCst) {
            Err(StorageError::ConnectionError(format!(
                "注入的存储故障: {}",
                operation
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LogStore for FaultInjectingStore {
    async fn append(&self, record: LogRecord) -> Result<(), StorageError> {
        self.append_attempts[record.kind().index()].fetch_add(1, Ordering::SeqCst);
        self.stall().await;
        Self::outage(&self.fail_appends, "append")?;
        self.inner.append(record).await
    }

    async fn count_access_since(
        &self,
        client_ip: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        self.stall().await;
        Self::outage(&self.fail_counts, "count_access_since")?;
        self.inner.count_access_since(client_ip, since).await
    }

    async fn count_security_events_since(
        &self,
        client_ip: &str,
        since: DateTime<Utc>,
        severities: &[Severity],
    ) -> Result<u64, StorageError> {
        self.stall().await;
        Self::outage(&self.fail_counts, "count_security_events_since")?;
        self.inner
            .count_security_events_since(client_ip, since, severities)
            .await
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<LogRecord>, StorageError> {
        self.stall().await;
        self.inner.query(query).await
    }
}

#[async_trait]
impl BlacklistStore for FaultInjectingStore {
    async fn get_entry(&self, ip_address: &str) -> Result<Option<IpBlacklistEntry>, StorageError> {
        self.stall().await;
        Self::outage(&self.fail_blacklist, "get_entry")?;
        self.inner.get_entry(ip_address).await
    }

    async fn upsert_entry(
        &self,
        entry: &IpBlacklistEntry,
    ) -> Result<IpBlacklistEntry, StorageError> {
        self.stall().await;
        Self::outage(&self.fail_blacklist, "upsert_entry")?;
        self.inner.upsert_entry(entry).await
    }

    async fn set_active(&self, ip_address: &str, is_active: bool) -> Result<bool, StorageError> {
        self.stall().await;
        Self::outage(&self.fail_blacklist, "set_active")?;
        self.inner.set_active(ip_address, is_active).await
    }

    async fn list_entries(
        &self,
        filter: &BlacklistFilter,
    ) -> Result<Vec<IpBlacklistEntry>, StorageError> {
        self.stall().await;
        Self::outage(&self.fail_blacklist, "list_entries")?;
        self.inner.list_entries(filter).await
    }
}

// ============================================================================
// 单元测试
// ============================================================================
