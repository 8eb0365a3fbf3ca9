//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Admiteron - Request Admission and Security Monitoring
//!
//! Wraps every inbound request in a fixed pipeline: client identification,
//! rate limiting, IP blacklist enforcement, attack-signature scanning and
//! audit logging of six record kinds.
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use admiteron::prelude::*;` to import all commonly used types.
//!
//! ## Core API
//!
//! - [`AdmissionPipeline`] - Orchestrates the admission checks around a handler
//! - [`SecurityConfig`] - Validated, read-only configuration snapshot
//! - [`Decision`] - Admission result
//! - [`SecurityLogger`] - Audit logging facade that never fails its caller
//! - [`BlacklistManager`] - Auto-block evaluation and operator actions
//!
//! ## Storage
//!
//! - [`MemoryLogStore`] - In-process store for tests and single-node deployments
//! - `PostgresStorage` - Persistent store (requires `postgres` feature)
//!
//! # Examples
//!
//! ```rust
//! use admiteron::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(MemoryLogStore::new());
//!     let pipeline = AdmissionPipeline::new(SecurityConfig::default(), store).unwrap();
//!
//!     let handler = handler_fn(|_req: InboundRequest| async {
//!         Ok::<_, std::io::Error>(OutboundResponse::new(200))
//!     });
//!     let request = InboundRequest::new("GET", "/api/status").with_remote_addr("203.0.113.7");
//!
//!     let response = pipeline.handle(request, &handler).await.unwrap();
//!     assert_eq!(response.status, 200);
//! }
//! ```
//!
//! # Features
//!
//! - **postgres**: sqlx/PostgreSQL store with row-atomic blacklist upsert
//! - **log-redaction**: mask credentials in stored request data
//! - **telemetry**: tracing-subscriber initialisation
//! - **monitoring**: Prometheus admission metrics

pub mod prelude;

pub mod blacklist;
pub mod config;
pub mod constants;
pub mod error;
pub mod identity;
pub mod log_redaction;
pub mod pattern_detector;
pub mod pipeline;
#[cfg(feature = "postgres")]
pub mod postgres_storage;
pub mod rate_limiter;
pub mod records;
pub mod security_logger;
pub mod storage;
#[cfg(any(feature = "telemetry", feature = "monitoring"))]
pub mod telemetry;

// 重新导出常用类型
pub use blacklist::{BlacklistManager, BlacklistStats, BlacklistStatsSnapshot, Evaluation};
pub use config::{
    AutoBlockConfig, CounterBackend, EndpointLimit, IdentityConfig, LoggingConfig, PatternConfig,
    RateLimitConfig, RateLimitPolicy, SecurityConfig,
};
pub use error::{AdmissionError, BlockInfo, Decision, StorageError};
pub use identity::{ClientIdentity, ClientIdentityResolver, InboundRequest, OutboundResponse};
pub use pattern_detector::{
    default_signatures, Finding, FindingLocation, PatternDetector, ScanReport, Signature,
    SignatureFamily,
};
pub use pipeline::{
    denial_response, handler_fn, Admission, AdmissionPipeline, FnHandler, PipelineStats,
    PipelineStatsSnapshot, RequestHandler,
};
#[cfg(feature = "postgres")]
pub use postgres_storage::{PostgresStorage, PostgresStorageConfig};
pub use rate_limiter::{
    RateLimitOutcome, RateLimiter, RateLimiterStats, RequestCounter, SlidingWindowCounter,
    StoreCounter,
};
pub use records::{
    AccessRecord, AuthRecord, AuthStatus, AuthType, DeviceConnectionRecord, ErrorLevel,
    ErrorRecord, EventType, FrontendLevel, FrontendRecord, IpBlacklistEntry, LogKind, LogRecord,
    SecurityEvent, Severity,
};
pub use security_logger::{EventContext, SecurityLogStats, SecurityLogStatsSnapshot, SecurityLogger};
pub use storage::{
    BlacklistFilter, BlacklistStore, FaultInjectingStore, LogQuery, LogStore, MemoryLogStore,
};
#[cfg(feature = "telemetry")]
pub use telemetry::init_tracing;
#[cfg(feature = "monitoring")]
pub use telemetry::Metrics;
