//! 端到端测试：限流边界
//!
//! 测试场景：
//! 1. 窗口内已有 99 条访问记录时放行
//! 2. 窗口内已有 100 条访问记录时返回 429 并写入 rate_limit 事件
//! 3. 窗口外的记录不计入
//! 4. 端点覆盖阈值优先于全局阈值

use crate::common::*;
use admiteron::config::{CounterBackend, RateLimitConfig, SecurityConfig};
use admiteron::records::{EventType, LogKind, LogRecord, Severity};
use admiteron::storage::LogStore;
use admiteron::Decision;

#[tokio::test]
async fn test_99_prior_requests_admitted() {
    let store = create_memory_store();
    seed_access(&store, "192.0.2.10", 99).await;
    let pipeline = create_pipeline(store.clone());

    let response = pipeline
        .handle(get_from("192.0.2.10", "/api/data"), &ok_handler())
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert!(records_of(&store, LogKind::Security).await.is_empty());
}

#[tokio::test]
async fn test_100_prior_requests_rejected() {
    let store = create_memory_store();
    seed_access(&store, "192.0.2.11", 100).await;
    let pipeline = create_pipeline(store.clone());

    let response = pipeline
        .handle(get_from("192.0.2.11", "/api/data"), &ok_handler())
        .await
        .unwrap();

    assert_eq!(response.status, 429);
    let body = response.json_body().unwrap();
    assert_eq!(body["error"], "rate_limited");

    let events = records_of(&store, LogKind::Security).await;
    assert_eq!(events.len(), 1);
    let LogRecord::Security(event) = &events[0] else {
        panic!("expected security event");
    };
    assert_eq!(event.event_type, EventType::RateLimit);
    assert_eq!(event.severity, Severity::Medium);
    assert_eq!(event.client_ip, "192.0.2.11");

    // 拒绝同样写入访问日志
    let access = records_of(&store, LogKind::Api).await;
    let LogRecord::Access(latest) = &access[0] else {
        panic!("expected access record");
    };
    assert_eq!(latest.status_code, 429);
    assert_eq!(pipeline.stats().rate_limited(), 1);
}

#[tokio::test]
async fn test_records_outside_window_not_counted() {
    let store = create_memory_store();
    let old = chrono::Utc::now() - chrono::Duration::seconds(120);
    for _ in 0..150 {
        store
            .append(LogRecord::Access(admiteron::records::AccessRecord {
                timestamp: old,
                client_ip: "192.0.2.12".to_string(),
                user_agent: String::new(),
                method: "GET".to_string(),
                path: "/".to_string(),
                status_code: 200,
                response_time_ms: 1,
                request_bytes: 0,
                response_bytes: 0,
            }))
            .await
            .unwrap();
    }
    let pipeline = create_pipeline(store);

    let admission = pipeline.admit(&get_from("192.0.2.12", "/")).await;
    assert!(admission.is_admitted());
}

#[tokio::test]
async fn test_rate_limit_is_per_client() {
    let store = create_memory_store();
    seed_access(&store, "192.0.2.13", 100).await;
    let pipeline = create_pipeline(store);

    assert!(!pipeline.admit(&get_from("192.0.2.13", "/")).await.is_admitted());
    assert!(pipeline.admit(&get_from("192.0.2.14", "/")).await.is_admitted());
}

#[tokio::test]
async fn test_endpoint_override_applies() {
    let store = create_memory_store();
    seed_access(&store, "192.0.2.15", 3).await;
    let config = SecurityConfig {
        rate_limit: RateLimitConfig::default().with_endpoint("/auth/login", 3, 60),
        ..Default::default()
    };
    let pipeline = create_pipeline_with(config, store);

    let login = pipeline.admit(&get_from("192.0.2.15", "/auth/login")).await;
    match login.decision {
        Decision::RateLimited {
            current_count,
            max_requests,
            window_seconds,
        } => {
            assert_eq!(current_count, 3);
            assert_eq!(max_requests, 3);
            assert_eq!(window_seconds, 60);
        }
        other => panic!("expected rate limit, got {:?}", other),
    }

    assert!(pipeline.admit(&get_from("192.0.2.15", "/api/data")).await.is_admitted());
}

#[tokio::test]
async fn test_memory_counter_admits_exactly_max() {
    let config = SecurityConfig {
        rate_limit: RateLimitConfig::default()
            .with_limits(5, 60)
            .with_backend(CounterBackend::Memory),
        ..Default::default()
    };
    let pipeline = create_pipeline_with(config, create_memory_store());

    let mut admitted = 0;
    for _ in 0..8 {
        if pipeline.admit(&get_from("192.0.2.16", "/")).await.is_admitted() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);
    assert_eq!(pipeline.rate_limiter().counter_name(), "SlidingWindowCounter");
}

#[tokio::test]
async fn test_unknown_clients_share_a_rate_limit_key() {
    let config = SecurityConfig {
        rate_limit: RateLimitConfig::default()
            .with_limits(2, 60)
            .with_backend(CounterBackend::Memory),
        ..Default::default()
    };
    let pipeline = create_pipeline_with(config, create_memory_store());
    let anonymous = admiteron::InboundRequest::new("GET", "/");

    assert!(pipeline.admit(&anonymous).await.is_admitted());
    assert!(pipeline.admit(&anonymous).await.is_admitted());
    assert!(!pipeline.admit(&anonymous).await.is_admitted());
}
