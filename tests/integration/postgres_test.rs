//! PostgreSQL 存储集成测试
//!
//! 需要 `DATABASE_URL` 指向可写的测试库：
//! `DATABASE_URL=postgres://... cargo test --test integration_tests --features postgres -- --ignored`

use admiteron::config::SecurityConfig;
use admiteron::identity::{InboundRequest, OutboundResponse};
use admiteron::pipeline::{handler_fn, AdmissionPipeline};
use admiteron::postgres_storage::{PostgresStorage, PostgresStorageConfig};
use admiteron::records::{AccessRecord, IpBlacklistEntry, LogKind, LogRecord, Severity};
use admiteron::storage::{BlacklistFilter, BlacklistStore, LogQuery, LogStore};
use chrono::{Duration, Utc};
use std::sync::Arc;

async fn connect() -> PostgresStorage {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let storage = PostgresStorage::new(PostgresStorageConfig::new(url).max_connections(5))
        .await
        .expect("connect to postgres");
    storage.migrate().await.expect("create tables");
    storage
}

/// 每个测试使用独立的 IP，避免共享库中的干扰
fn unique_ip() -> String {
    let id = uuid::Uuid::new_v4().as_u128();
    format!("10.{}.{}.{}", (id >> 16) as u8, (id >> 8) as u8, id as u8)
}

#[tokio::test]
#[ignore]
async fn test_postgres_access_round_trip() {
    let storage = connect().await;
    let ip = unique_ip();
    let record = AccessRecord {
        timestamp: Utc::now(),
        client_ip: ip.clone(),
        user_agent: "integration".to_string(),
        method: "GET".to_string(),
        path: "/api/status".to_string(),
        status_code: 200,
        response_time_ms: 42,
        request_bytes: 0,
        response_bytes: 2,
    };
    storage.append(record.clone().into()).await.unwrap();

    let since = Utc::now() - Duration::minutes(1);
    assert_eq!(storage.count_access_since(&ip, since).await.unwrap(), 1);

    let records = storage
        .query(&LogQuery::new(LogKind::Api).client_ip(ip.clone()))
        .await
        .unwrap();
    let LogRecord::Access(read) = &records[0] else {
        panic!("expected access record");
    };
    assert_eq!(read.status_code, 200);
    assert_eq!(read.response_time_ms, 42);
}

#[tokio::test]
#[ignore]
async fn test_postgres_upsert_is_idempotent() {
    let storage = connect().await;
    let ip = unique_ip();
    let entry = IpBlacklistEntry {
        ip_address: ip.clone(),
        blocked_at: Utc::now(),
        reason: "Auto-blocked: 5 security violations in 1 hour".to_string(),
        blocked_by: "auto".to_string(),
        violation_count: 5,
        is_active: true,
        expires_at: Some(Utc::now() + Duration::hours(24)),
    };

    storage.upsert_entry(&entry).await.unwrap();
    let second = storage.upsert_entry(&entry).await.unwrap();
    assert_eq!(second.violation_count, 5);

    let listed = storage
        .list_entries(&BlacklistFilter {
            ip_contains: Some(ip.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    assert!(storage.set_active(&ip, false).await.unwrap());
    let stored = storage.get_entry(&ip).await.unwrap().unwrap();
    assert!(!stored.is_active);
}

#[tokio::test]
#[ignore]
async fn test_postgres_blacklist_accepts_longest_client_key() {
    let storage = connect().await;
    let key = format!("{}-{}", uuid::Uuid::new_v4(), "k".repeat(27));
    assert_eq!(key.len(), admiteron::constants::MAX_CLIENT_KEY_LENGTH);

    let entry = IpBlacklistEntry {
        ip_address: key.clone(),
        blocked_at: Utc::now(),
        reason: "Auto-blocked: 5 security violations in 1 hour".to_string(),
        blocked_by: "auto".to_string(),
        violation_count: 5,
        is_active: true,
        expires_at: Some(Utc::now() + Duration::hours(24)),
    };
    storage.upsert_entry(&entry).await.unwrap();
    assert!(storage.get_entry(&key).await.unwrap().is_some());
}

#[tokio::test]
#[ignore]
async fn test_postgres_pipeline_blocks_after_violations() {
    let storage = Arc::new(connect().await);
    let pipeline = AdmissionPipeline::new(SecurityConfig::default(), storage.clone()).unwrap();
    let handler = handler_fn(|_req: InboundRequest| async {
        Ok::<_, std::io::Error>(OutboundResponse::new(200))
    });
    let ip = unique_ip();

    for _ in 0..5 {
        let request = InboundRequest::new("GET", "/search")
            .with_query_param("q", "1 union select password from users")
            .with_remote_addr(&ip);
        let response = pipeline.handle(request, &handler).await.unwrap();
        assert_eq!(response.status, 200);
    }

    let request = InboundRequest::new("GET", "/").with_remote_addr(&ip);
    let response = pipeline.handle(request, &handler).await.unwrap();
    assert_eq!(response.status, 403);

    let since = Utc::now() - Duration::hours(1);
    let violations = storage
        .count_security_events_since(&ip, since, &[Severity::High, Severity::Critical])
        .await
        .unwrap();
    assert!(violations >= 6);
}
