//! 审计日志测试
//!
//! 认证、设备、前端、畸形请求各类记录的写入与运维查询

use crate::common::*;
use admiteron::config::LoggingConfig;
use admiteron::records::{
    AuthStatus, AuthType, DeviceConnectionRecord, EventType, FrontendLevel, LogKind, LogRecord,
    Severity,
};
use admiteron::security_logger::SecurityLogger;
use admiteron::storage::LogQuery;

fn logger(store: &std::sync::Arc<admiteron::storage::MemoryLogStore>) -> SecurityLogger {
    SecurityLogger::new(store.clone(), LoggingConfig::default())
}

#[tokio::test]
async fn test_authentication_attempts() {
    let store = create_memory_store();
    let logger = logger(&store);
    let context = context_for("192.0.2.90");

    logger
        .log_authentication(
            &context,
            AuthType::WebLogin,
            Some("mallory"),
            AuthStatus::Failed,
            Some("invalid password"),
        )
        .await;
    logger
        .log_authentication(&context, AuthType::ApiToken, None, AuthStatus::Success, None)
        .await;

    let records = records_of(&store, LogKind::Auth).await;
    assert_eq!(records.len(), 2);
    let LogRecord::Auth(failed) = &records[1] else {
        panic!("expected auth record");
    };
    assert_eq!(failed.username.as_deref(), Some("mallory"));
    assert_eq!(failed.status, AuthStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("invalid password"));
    assert_eq!(failed.user_agent, "admiteron-tests/1.0");
}

#[tokio::test]
async fn test_device_connections() {
    let store = create_memory_store();
    let logger = logger(&store);

    logger
        .log_device_connection(
            DeviceConnectionRecord::new("10.50.0.7", "push")
                .with_payload(512, ["temperature", "humidity", "temperature"])
                .with_processing_time(12),
        )
        .await;
    logger
        .log_device_connection(
            DeviceConnectionRecord::new("10.50.0.8", "poll").with_error("checksum mismatch"),
        )
        .await;

    let records = store_query(&store, LogQuery::new(LogKind::Device).client_ip("10.50.0.7")).await;
    assert_eq!(records.len(), 1);
    let LogRecord::Device(record) = &records[0] else {
        panic!("expected device record");
    };
    assert!(record.data_received);
    assert_eq!(record.sensor_kinds.len(), 2);
    assert_eq!(record.processing_time_ms, Some(12));

    let failed = store_query(&store, LogQuery::new(LogKind::Device).client_ip("10.50.0.8")).await;
    let LogRecord::Device(record) = &failed[0] else {
        panic!("expected device record");
    };
    assert!(!record.data_received);
    assert_eq!(record.error_text.as_deref(), Some("checksum mismatch"));
}

#[tokio::test]
async fn test_frontend_events() {
    let store = create_memory_store();
    let logger = logger(&store);

    logger
        .log_frontend_event(
            "192.0.2.91",
            "Mozilla/5.0",
            FrontendLevel::Error,
            "SensorChart",
            "Cannot read properties of undefined",
            Some("TypeError at SensorChart.render"),
            "https://dashboard.example.com/devices/7",
        )
        .await;

    let records = records_of(&store, LogKind::Frontend).await;
    let LogRecord::Frontend(record) = &records[0] else {
        panic!("expected frontend record");
    };
    assert_eq!(record.component, "SensorChart");
    assert_eq!(record.level, FrontendLevel::Error);
    assert!(record.error_stack.is_some());
}

#[tokio::test]
async fn test_malformed_request_is_medium() {
    let store = create_memory_store();
    let logger = logger(&store);

    logger
        .log_malformed_request(&context_for("192.0.2.92"), "invalid JSON body", Some("{\"a\":"))
        .await;

    let records = store_query(
        &store,
        LogQuery::new(LogKind::Security).event_type(EventType::MalformedRequest),
    )
    .await;
    let LogRecord::Security(event) = &records[0] else {
        panic!("expected security event");
    };
    assert_eq!(event.severity, Severity::Medium);
    assert_eq!(event.description, "Malformed request: invalid JSON body");
}

#[tokio::test]
async fn test_user_agent_and_request_data_truncated() {
    let store = create_memory_store();
    let logger = SecurityLogger::new(
        store.clone(),
        LoggingConfig {
            max_request_data_len: 16,
            max_user_agent_len: 8,
            ..Default::default()
        },
    );
    let context = context_for("192.0.2.93").with_user_agent("Mozilla/5.0 (X11; Linux x86_64)");

    logger
        .log_security_event(
            &context,
            EventType::SuspiciousPattern,
            Severity::Low,
            "probe",
            Some("0123456789abcdefghijklmnopqrstuvwxyz"),
        )
        .await;

    let records = records_of(&store, LogKind::Security).await;
    let LogRecord::Security(event) = &records[0] else {
        panic!("expected security event");
    };
    assert_eq!(event.user_agent.chars().count(), 8);
    assert!(event.sanitized_request_data.chars().count() <= 16);
    assert!(event.sanitized_request_data.starts_with("0123456789"));
}

#[cfg(feature = "log-redaction")]
#[tokio::test]
async fn test_credentials_masked_in_request_data() {
    let store = create_memory_store();
    let logger = logger(&store);

    logger
        .log_security_event(
            &context_for("192.0.2.94"),
            EventType::SqlInjection,
            Severity::Low,
            "probe",
            Some("user=admin&password=hunter2' or 1=1 --"),
        )
        .await;

    let records = records_of(&store, LogKind::Security).await;
    let LogRecord::Security(event) = &records[0] else {
        panic!("expected security event");
    };
    assert!(!event.sanitized_request_data.contains("hunter2"));
    assert!(event.sanitized_request_data.contains("user=admin"));
}

#[tokio::test]
async fn test_query_filters_by_severity_and_limit() {
    let store = create_memory_store();
    let logger = logger(&store);
    let context = context_for("192.0.2.95");

    for severity in [Severity::Low, Severity::Medium, Severity::Low, Severity::Low] {
        logger
            .log_security_event(&context, EventType::SuspiciousPattern, severity, "probe", None)
            .await;
    }

    let low = logger
        .query(&LogQuery::new(LogKind::Security).severity(Severity::Low).limit(2))
        .await
        .unwrap();
    assert_eq!(low.len(), 2);
    assert!(low.iter().all(|r| r.severity() == Some(Severity::Low)));

    let all = logger
        .query(&LogQuery::new(LogKind::Security).limit(0))
        .await
        .unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(logger.stats().security_events(), 4);
}

async fn store_query(
    store: &admiteron::storage::MemoryLogStore,
    query: LogQuery,
) -> Vec<LogRecord> {
    use admiteron::storage::LogStore;
    store.query(&query).await.unwrap()
}
