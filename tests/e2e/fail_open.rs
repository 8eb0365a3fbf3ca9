//! 端到端测试：存储故障时的降级
//!
//! 测试场景：
//! 1. 黑名单存储不可用：放行请求，恰好尝试写入一条系统错误
//! 2. 计数存储不可用：放行请求，记录降级检查
//! 3. 日志写入失败：请求仍正常完成
//! 4. 存储挂起：超时后放行

use crate::common::*;
use admiteron::config::{LoggingConfig, SecurityConfig};
use admiteron::pipeline::AdmissionPipeline;
use admiteron::records::{EventType, LogKind, LogRecord, Severity};
use admiteron::storage::FaultInjectingStore;
use std::sync::Arc;
use std::time::Duration;

fn faulty_pipeline(config: SecurityConfig) -> (Arc<FaultInjectingStore>, AdmissionPipeline) {
    let store = Arc::new(FaultInjectingStore::new(create_memory_store()));
    let pipeline = AdmissionPipeline::new(config, store.clone()).expect("valid test config");
    (store, pipeline)
}

#[tokio::test]
async fn test_blacklist_outage_fails_open_with_one_error_record() {
    let (store, pipeline) = faulty_pipeline(SecurityConfig::default());
    store.set_fail_blacklist(true);

    let response = pipeline
        .handle(get_from("198.51.100.30", "/api/data"), &ok_handler())
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(store.append_attempts(LogKind::Errors), 1);
    assert_eq!(pipeline.stats().fail_open_checks(), 1);
    assert_eq!(pipeline.blacklist().stats().degraded_checks(), 1);

    let errors = records_of(store.inner(), LogKind::Errors).await;
    let LogRecord::Error(record) = &errors[0] else {
        panic!("expected error record");
    };
    assert_eq!(record.module, "blacklist");
    assert_eq!(record.client_ip.as_deref(), Some("198.51.100.30"));
}

#[tokio::test]
async fn test_counter_outage_fails_open() {
    let (store, pipeline) = faulty_pipeline(SecurityConfig::default());
    store.set_fail_counts(true);

    let admission = pipeline.admit(&get_from("198.51.100.31", "/")).await;

    assert!(admission.is_admitted());
    assert_eq!(store.append_attempts(LogKind::Errors), 1);
    let errors = records_of(store.inner(), LogKind::Errors).await;
    let LogRecord::Error(record) = &errors[0] else {
        panic!("expected error record");
    };
    assert_eq!(record.module, "rate_limiter");
}

#[tokio::test]
async fn test_log_write_failure_never_reaches_caller() {
    let (store, pipeline) = faulty_pipeline(SecurityConfig::default());
    store.set_fail_appends(true);

    let request = get_from("198.51.100.32", "/search").with_query_param("q", "<script>alert(1)</script>");
    let response = pipeline.handle(request, &ok_handler()).await.unwrap();

    assert_eq!(response.status, 200);
    // 安全事件与访问日志都尝试过写入
    assert_eq!(store.append_attempts(LogKind::Security), 1);
    assert_eq!(store.append_attempts(LogKind::Api), 1);
    assert!(pipeline.logger().stats().write_failures() >= 2);
    // 写入失败的事件不触发评估
    assert_eq!(pipeline.blacklist().stats().evaluations(), 0);
}

#[tokio::test]
async fn test_evaluation_failure_writes_one_error_record() {
    let (store, pipeline) = faulty_pipeline(SecurityConfig::default());
    store.set_fail_counts(true);

    let evaluation = pipeline
        .logger()
        .log_security_event(
            &context_for("198.51.100.33"),
            EventType::SqlInjection,
            Severity::High,
            "Suspicious patterns detected: GET param 'id' contains 'drop table'",
            None,
        )
        .await;

    assert!(evaluation.is_none());
    assert_eq!(store.append_attempts(LogKind::Security), 1);
    assert_eq!(store.append_attempts(LogKind::Errors), 1);
    assert_eq!(pipeline.logger().stats().evaluation_failures(), 1);
}

#[tokio::test]
async fn test_stalled_store_times_out_and_admits() {
    let config = SecurityConfig {
        logging: LoggingConfig::default().with_store_timeout(Duration::from_millis(50)),
        ..Default::default()
    };
    let (store, pipeline) = faulty_pipeline(config);
    store.set_stall(Duration::from_millis(300));

    let started = std::time::Instant::now();
    let admission = pipeline.admit(&get_from("198.51.100.34", "/")).await;

    assert!(admission.is_admitted());
    assert_eq!(pipeline.stats().fail_open_checks(), 2);
    // 计数、黑名单查询和两次错误写入各自受超时约束
    assert!(started.elapsed() < Duration::from_millis(1000));
}
