//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 监控和追踪模块
//!
//! - `telemetry` 特性：基于 tracing-subscriber 的日志初始化
//! - `monitoring` 特性：准入管道的 Prometheus 指标
//!
//! # 示例
//!
//! ```rust,ignore
//! use admiteron::telemetry::Metrics;
//! use std::sync::Arc;
//!
//! let metrics = Arc::new(Metrics::new().unwrap());
//! let pipeline = pipeline.with_metrics(metrics.clone());
//! println!("{}", metrics.gather());
//! ```

#[cfg(feature = "telemetry")]
use crate::error::AdmissionError;

/// 初始化全局 tracing 订阅者
///
/// `filter` 使用 `EnvFilter` 语法，例如 `"admiteron=debug,info"`；
/// 设置了 `RUST_LOG` 时以环境变量为准。
#[cfg(feature = "telemetry")]
pub fn init_tracing(filter: &str) -> Result<(), AdmissionError> {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .map_err(|e| AdmissionError::ConfigError(format!("无效的日志过滤器: {}", e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|e| AdmissionError::Other(format!("tracing 初始化失败: {}", e)))
}

#[cfg(feature = "monitoring")]
pub use metrics::Metrics;

#[cfg(feature = "monitoring")]
mod metrics {
    use crate::error::Decision;
    use prometheus::{Counter, Encoder, Histogram, Registry, TextEncoder};
    use std::time::Duration;
    use tracing::error;

    /// 创建并注册 Counter
    macro_rules! register_counter {
        ($name:expr, $help:expr, $registry:expr) => {{
            let counter = Counter::with_opts(prometheus::Opts::new($name, $help))?;
            $registry.register(Box::new(counter.clone()))?;
            counter
        }};
    }

    /// 创建并注册 Histogram
    macro_rules! register_histogram {
        ($name:expr, $help:expr, $registry:expr, $buckets:expr) => {{
            let histogram =
                Histogram::with_opts(prometheus::HistogramOpts::new($name, $help).buckets($buckets))?;
            $registry.register(Box::new(histogram.clone()))?;
            histogram
        }};
    }

    /// 准入管道指标
    #[derive(Clone)]
    pub struct Metrics {
        /// 检查的请求总数
        pub requests_total: Counter,
        /// 放行的请求数
        pub requests_admitted: Counter,
        /// 因限流拒绝的请求数
        pub requests_rate_limited: Counter,
        /// 因黑名单拒绝的请求数
        pub requests_blocked: Counter,
        /// 命中攻击特征的请求数
        pub requests_suspicious: Counter,
        /// 处理器失败数
        pub handler_failures: Counter,
        /// 准入检查耗时分布
        pub admission_duration: Histogram,
        registry: Registry,
    }

    impl Metrics {
        pub fn new() -> Result<Self, prometheus::Error> {
            let registry = Registry::new();

            let requests_total = register_counter!(
                "admiteron_requests_total",
                "Total number of admission checks",
                registry
            );
            let requests_admitted = register_counter!(
                "admiteron_requests_admitted_total",
                "Total number of admitted requests",
                registry
            );
            let requests_rate_limited = register_counter!(
                "admiteron_requests_rate_limited_total",
                "Total number of requests rejected by the rate limiter",
                registry
            );
            let requests_blocked = register_counter!(
                "admiteron_requests_blocked_total",
                "Total number of requests rejected by the IP blacklist",
                registry
            );
            let requests_suspicious = register_counter!(
                "admiteron_requests_suspicious_total",
                "Total number of requests matching an attack signature",
                registry
            );
            let handler_failures = register_counter!(
                "admiteron_handler_failures_total",
                "Total number of failed downstream handler calls",
                registry
            );
            let admission_duration = register_histogram!(
                "admiteron_admission_duration_seconds",
                "Admission check latency",
                registry,
                vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
            );

            Ok(Self {
                requests_total,
                requests_admitted,
                requests_rate_limited,
                requests_blocked,
                requests_suspicious,
                handler_failures,
                admission_duration,
                registry,
            })
        }

        /// 记录一次准入决策
        pub fn record_admission(&self, decision: &Decision, suspicious: bool, duration: Duration) {
            self.admission_duration.observe(duration.as_secs_f64());
            self.requests_total.inc();
            match decision {
                Decision::Admitted => self.requests_admitted.inc(),
                Decision::RateLimited { .. } => self.requests_rate_limited.inc(),
                Decision::Blocked(_) => self.requests_blocked.inc(),
            }
            if suspicious {
                self.requests_suspicious.inc();
            }
        }

        pub fn record_handler_failure(&self) {
            self.handler_failures.inc();
        }

        /// 以 Prometheus 文本格式导出
        pub fn gather(&self) -> String {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
                error!("Failed to encode metrics: {}", e);
                return String::new();
            }
            String::from_utf8(buffer).unwrap_or_default()
        }
    }

    // ============================================================================
    // 单元测试
    // ============================================================================

}
