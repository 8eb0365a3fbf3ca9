//! 黑名单运维操作测试
//!
//! 手动封禁、启用/停用、列表过滤，以及自动封禁与手动封禁的交互

use crate::common::*;
use admiteron::blacklist::{BlacklistManager, Evaluation};
use admiteron::config::AutoBlockConfig;
use admiteron::records::Severity;
use admiteron::storage::{BlacklistFilter, MemoryLogStore};
use admiteron::AdmissionError;
use chrono::{Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;

fn manager(store: &Arc<MemoryLogStore>) -> BlacklistManager {
    BlacklistManager::new(store.clone(), store.clone(), AutoBlockConfig::default())
}

#[tokio::test]
async fn test_manual_block_with_and_without_expiry() {
    let store = create_memory_store();
    let manager = manager(&store);

    let permanent = manager
        .block_manually("198.51.100.70", "Credential stuffing source", "alice", None)
        .await
        .unwrap();
    assert!(permanent.expires_at.is_none());
    assert_eq!(permanent.blocked_by, "alice");
    assert!(manager.is_blocked("198.51.100.70").await);

    let temporary = manager
        .block_manually(
            "198.51.100.71",
            "Scraping",
            "alice",
            Some(StdDuration::from_secs(3600)),
        )
        .await
        .unwrap();
    let expires_at = temporary.expires_at.unwrap();
    assert!(expires_at > Utc::now() + Duration::minutes(59));
    assert!(expires_at <= Utc::now() + Duration::hours(1));
}

#[tokio::test]
async fn test_operator_input_validation() {
    let store = create_memory_store();
    let manager = manager(&store);

    let cases = [
        ("not-an-ip", "reason", "alice"),
        ("198.51.100.72", "", "alice"),
        ("198.51.100.72", "reason", "auto"),
        ("198.51.100.72", "bad\nreason", "alice"),
    ];
    for (ip, reason, operator) in cases {
        let result = manager.block_manually(ip, reason, operator, None).await;
        assert!(
            matches!(result, Err(AdmissionError::ValidationError(_))),
            "{:?} should be rejected",
            (ip, reason, operator)
        );
    }
    assert_eq!(store.blacklist_len(), 0);
}

#[tokio::test]
async fn test_activate_and_deactivate() {
    let store = create_memory_store();
    let manager = manager(&store);
    manager
        .block_manually("198.51.100.73", "Abuse report", "bob", None)
        .await
        .unwrap();

    assert!(manager.deactivate("198.51.100.73", "bob").await.unwrap());
    assert!(!manager.is_blocked("198.51.100.73").await);
    assert!(manager.activate("198.51.100.73", "bob").await.unwrap());
    assert!(manager.is_blocked("198.51.100.73").await);

    // 不存在的条目
    assert!(!manager.deactivate("198.51.100.74", "bob").await.unwrap());
    assert_eq!(manager.stats().operator_actions(), 3);
}

#[tokio::test]
async fn test_list_filters() {
    let store = create_memory_store();
    let manager = manager(&store);
    manager
        .block_manually("10.20.0.1", "Manual", "carol", None)
        .await
        .unwrap();
    manager
        .block_manually("10.20.0.2", "Manual", "dave", None)
        .await
        .unwrap();
    manager
        .block_manually("172.16.0.9", "Manual", "carol", None)
        .await
        .unwrap();
    manager.deactivate("10.20.0.2", "dave").await.unwrap();

    let active = manager
        .list(&BlacklistFilter {
            active_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(active.len(), 2);

    let by_carol_in_subnet = manager
        .list(&BlacklistFilter {
            blocked_by: Some("carol".to_string()),
            ip_contains: Some("10.20.".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_carol_in_subnet.len(), 1);
    assert_eq!(by_carol_in_subnet[0].ip_address, "10.20.0.1");

    let paged = manager
        .list(&BlacklistFilter {
            offset: 1,
            limit: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(paged.len(), 1);
}

#[tokio::test]
async fn test_auto_block_keeps_longer_manual_block() {
    let store = create_memory_store();
    let manager = manager(&store);
    manager
        .block_manually("198.51.100.75", "Known attacker", "erin", None)
        .await
        .unwrap();
    seed_security_events(&store, "198.51.100.75", 6, Severity::High, Duration::minutes(2)).await;

    let evaluation = manager.evaluate("198.51.100.75").await.unwrap();
    let Evaluation::Blocked(entry) = evaluation else {
        panic!("expected blocked evaluation");
    };
    assert_eq!(entry.blocked_by, "erin");
    assert!(entry.expires_at.is_none());
}

#[tokio::test]
async fn test_auto_block_replaces_inactive_manual_block() {
    let store = create_memory_store();
    let manager = manager(&store);
    manager
        .block_manually("198.51.100.76", "Old incident", "erin", None)
        .await
        .unwrap();
    manager.deactivate("198.51.100.76", "erin").await.unwrap();
    seed_security_events(&store, "198.51.100.76", 5, Severity::Critical, Duration::minutes(2)).await;

    let evaluation = manager.evaluate("198.51.100.76").await.unwrap();
    let Evaluation::Blocked(entry) = evaluation else {
        panic!("expected blocked evaluation");
    };
    assert!(entry.is_auto());
    assert_eq!(entry.violation_count, 5);
    assert!(entry.is_blocking());
}

#[tokio::test]
async fn test_manual_block_preserves_violation_count() {
    let store = create_memory_store();
    let manager = manager(&store);
    seed_security_events(&store, "198.51.100.77", 7, Severity::High, Duration::minutes(1)).await;
    manager.evaluate("198.51.100.77").await.unwrap();

    let entry = manager
        .block_manually("198.51.100.77", "Escalated by on-call", "frank", None)
        .await
        .unwrap();
    assert_eq!(entry.violation_count, 7);
    assert_eq!(entry.blocked_by, "frank");
}
