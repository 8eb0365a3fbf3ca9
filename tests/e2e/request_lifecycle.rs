//! 端到端测试：单个请求的完整生命周期
//!
//! 测试场景：
//! 1. 正常请求写入访问日志
//! 2. 处理器失败时写入系统错误与 500 访问日志，错误原样返回
//! 3. 攻击特征按类别写入安全事件，请求继续处理
//! 4. 经代理转发的请求按转发头识别客户端

use crate::common::*;
use admiteron::identity::{InboundRequest, OutboundResponse};
use admiteron::pipeline::handler_fn;
use admiteron::records::{AccessRecord, EventType, LogKind, LogRecord, Severity};
use admiteron::storage::{LogQuery, LogStore};
use chrono::Utc;

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("sensor payload rejected")]
    Payload(#[source] serde_json::Error),
}

#[tokio::test]
async fn test_access_record_round_trip() {
    let store = create_memory_store();
    let written = AccessRecord {
        timestamp: Utc::now(),
        client_ip: "192.0.2.80".to_string(),
        user_agent: "curl/8.4".to_string(),
        method: "GET".to_string(),
        path: "/api/status".to_string(),
        status_code: 200,
        response_time_ms: 42,
        request_bytes: 0,
        response_bytes: 17,
    };
    store.append(written.clone().into()).await.unwrap();

    let records = store
        .query(&LogQuery::new(LogKind::Api).client_ip("192.0.2.80"))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    let LogRecord::Access(read) = &records[0] else {
        panic!("expected access record");
    };
    assert_eq!(read, &written);
    assert_eq!(read.status_code, 200);
    assert_eq!(read.response_time_ms, 42);
}

#[tokio::test]
async fn test_successful_request_logged_with_sizes() {
    let store = create_memory_store();
    let pipeline = create_pipeline(store.clone());
    let handler = handler_fn(|request: InboundRequest| async move {
        Ok::<_, std::io::Error>(OutboundResponse::new(201).with_body(request.body))
    });

    let request = InboundRequest::new("post", "/api/readings")
        .with_remote_addr("192.0.2.81")
        .with_body(r#"{"temperature": 21.5}"#);
    let response = pipeline.handle(request, &handler).await.unwrap();
    assert_eq!(response.status, 201);

    let access = records_of(&store, LogKind::Api).await;
    let LogRecord::Access(record) = &access[0] else {
        panic!("expected access record");
    };
    assert_eq!(record.method, "POST");
    assert_eq!(record.status_code, 201);
    assert_eq!(record.request_bytes, 21);
    assert_eq!(record.response_bytes, 21);
}

#[tokio::test]
async fn test_handler_error_propagates_with_500_access_log() {
    let store = create_memory_store();
    let pipeline = create_pipeline(store.clone());
    let handler = handler_fn(|request: InboundRequest| async move {
        serde_json::from_slice::<serde_json::Value>(&request.body).map_err(AppError::Payload)?;
        Ok::<_, AppError>(OutboundResponse::new(200))
    });

    let request = InboundRequest::new("POST", "/api/readings")
        .with_remote_addr("192.0.2.82")
        .with_body("{not json");
    let err = pipeline.handle(request, &handler).await.unwrap_err();
    assert!(matches!(err, AppError::Payload(_)));

    let errors = records_of(&store, LogKind::Errors).await;
    assert_eq!(errors.len(), 1);
    let LogRecord::Error(record) = &errors[0] else {
        panic!("expected error record");
    };
    assert_eq!(record.message, "sensor payload rejected");
    assert_eq!(record.request_path.as_deref(), Some("/api/readings"));
    assert!(record.stack_trace.as_deref().unwrap_or_default().contains("caused by"));

    let access = records_of(&store, LogKind::Api).await;
    let LogRecord::Access(access) = &access[0] else {
        panic!("expected access record");
    };
    assert_eq!(access.status_code, 500);
    assert_eq!(pipeline.stats().handler_failures(), 1);
}

#[tokio::test]
async fn test_pattern_classification_examples() {
    let store = create_memory_store();
    let pipeline = create_pipeline(store.clone());

    let traversal = get_from("192.0.2.83", "/../../etc/passwd");
    let xss = InboundRequest::new("POST", "/comments")
        .with_remote_addr("192.0.2.84")
        .with_body("<script>alert(1)</script>");
    let sql = get_from("192.0.2.85", "/items").with_query_param("id", "1; DROP TABLE users");

    assert_eq!(
        pipeline.admit(&traversal).await.scan.event_type(),
        Some(EventType::SuspiciousPattern)
    );
    assert_eq!(pipeline.admit(&xss).await.scan.event_type(), Some(EventType::XssAttempt));
    assert_eq!(pipeline.admit(&sql).await.scan.event_type(), Some(EventType::SqlInjection));

    let events = records_of(&store, LogKind::Security).await;
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.severity() == Some(Severity::High)));

    let sql_events = store
        .query(&LogQuery::new(LogKind::Security).event_type(EventType::SqlInjection))
        .await
        .unwrap();
    let LogRecord::Security(event) = &sql_events[0] else {
        panic!("expected security event");
    };
    assert_eq!(event.client_ip, "192.0.2.85");
    assert!(event.description.starts_with("Suspicious patterns detected: "));
    assert!(event.sanitized_request_data.contains("DROP TABLE"));
}

#[tokio::test]
async fn test_suspicious_request_still_reaches_handler() {
    let store = create_memory_store();
    let pipeline = create_pipeline(store.clone());
    let request = get_from("192.0.2.86", "/download").with_query_param("file", "../../secret");

    let response = pipeline.handle(request, &ok_handler()).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(pipeline.stats().suspicious(), 1);
}

#[tokio::test]
async fn test_forwarded_header_identifies_client() {
    let store = create_memory_store();
    let pipeline = create_pipeline(store.clone());
    let request = InboundRequest::new("GET", "/")
        .with_header("X-Forwarded-For", " 203.0.113.200 , 10.0.0.1")
        .with_remote_addr("10.0.0.1");

    let admission = pipeline.admit(&request).await;
    assert_eq!(admission.client().ip(), Some("203.0.113.200"));

    pipeline.handle(request, &ok_handler()).await.unwrap();
    let access = store
        .query(&LogQuery::new(LogKind::Api).client_ip("203.0.113.200"))
        .await
        .unwrap();
    assert_eq!(access.len(), 1);
}

#[tokio::test]
async fn test_unknown_client_is_never_blocked() {
    let store = create_memory_store();
    let pipeline = create_pipeline(store.clone());
    let request = InboundRequest::new("GET", "/").with_query_param("q", "union select 1");

    for _ in 0..8 {
        let admission = pipeline.admit(&request).await;
        assert!(admission.is_admitted());
        assert!(!admission.client().is_known());
    }
    assert_eq!(store.blacklist_len(), 0);
    assert_eq!(pipeline.blacklist().stats().evaluations(), 0);
}
