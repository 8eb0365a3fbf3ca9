//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Prelude module - Commonly used types for quick imports
//!
//! `use admiteron::prelude::*;` brings in the pipeline, its configuration
//! and the in-memory store.

// Core types - always available
pub use crate::config::SecurityConfig;
pub use crate::error::{AdmissionError, Decision};
pub use crate::identity::{InboundRequest, OutboundResponse};
pub use crate::pipeline::{handler_fn, AdmissionPipeline, RequestHandler};

// Logging
pub use crate::records::{EventType, LogKind, Severity};
pub use crate::security_logger::{EventContext, SecurityLogger};

// Storage
pub use crate::storage::{BlacklistStore, LogQuery, LogStore, MemoryLogStore};

// Feature-gated exports
#[cfg(feature = "postgres")]
pub use crate::postgres_storage::PostgresStorage;

#[cfg(feature = "monitoring")]
pub use crate::telemetry::Metrics;
