//! On-demand management tests.

mod common;

use std::sync::Arc;

use cardgate_devices::SubscriptionRecord;
use chrono::Utc;
use common::{device, manager, Call, RecordingBackend, EVENT_TO_HOST};

const HOST: &str = "192.168.178.42";

fn subscribed_device(dir: &std::path::Path, port: u16, id: &str) -> cardgate_devices::DeviceConfig {
    device(dir, HOST, port).with_record(SubscriptionRecord {
        subscription_id: Some(id.to_string()),
        subscription_time: Utc::now(),
        error: None,
    })
}

#[tokio::test]
async fn test_manage_resubscribe() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::new(Vec::new()));
    let (manager, registry) = manager(backend.clone(), vec![subscribed_device(dir.path(), 8585, "old")]);

    let statuses = manager.manage(Some(HOST), EVENT_TO_HOST, true, true).await;
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].starts_with("OK new-sub-1 "), "{}", statuses[0]);

    assert_eq!(
        backend.calls()[0],
        Call::Unsubscribe {
            subscription_id: Some("old".to_string()),
            event_to: Some("cetp://10.0.0.5:8585".to_string()),
            force: true,
        }
    );
    assert_eq!(backend.subscribe_count(), 1);

    let device = registry.all().remove(0);
    assert_eq!(device.subscription_id().as_deref(), Some("new-sub-1"));
}

#[tokio::test]
async fn test_manage_unsubscribe_only_clears_state() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::new(Vec::new()));
    let (manager, registry) = manager(backend.clone(), vec![subscribed_device(dir.path(), 8585, "old")]);
    let device = registry.all().remove(0);
    device.record_subscription("old", None, true);
    assert!(device.store().load().unwrap().is_some());

    let statuses = manager.manage(Some(HOST), EVENT_TO_HOST, false, false).await;
    assert_eq!(statuses, vec!["OK".to_string()]);
    assert_eq!(backend.subscribe_count(), 0);
    assert!(device.subscription_id().is_none());
    assert!(device.store().load().unwrap().is_none());
}

#[tokio::test]
async fn test_manage_failed_unsubscribe_marks_state() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::failing(Vec::new()));
    let (manager, registry) = manager(backend.clone(), vec![subscribed_device(dir.path(), 8585, "old")]);

    let statuses = manager.manage(Some(HOST), EVENT_TO_HOST, false, true).await;
    assert!(statuses[0].contains("Code=4203"));
    assert_eq!(backend.subscribe_count(), 0);

    let device = registry.all().remove(0);
    assert_eq!(
        device.subscription_id().as_deref(),
        Some("failed-unsubscription-old")
    );
    let record = device.store().load().unwrap().unwrap();
    assert_eq!(
        record.subscription_id.as_deref(),
        Some("failed-unsubscription-old")
    );
}

#[tokio::test]
async fn test_manage_unreachable_device_marks_state() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::unreachable(Vec::new()));
    let (manager, registry) = manager(backend.clone(), vec![subscribed_device(dir.path(), 8585, "old")]);

    let statuses = manager.manage(Some(HOST), EVENT_TO_HOST, false, true).await;
    assert!(statuses[0].contains("connection refused"), "{}", statuses[0]);
    assert_eq!(backend.subscribe_count(), 0);

    let device = registry.all().remove(0);
    assert_eq!(
        device.subscription_id().as_deref(),
        Some("failed-unsubscription-old")
    );
    assert!(!device.guard().is_busy());
}

#[tokio::test]
async fn test_manage_addresses_every_device_of_host() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::new(Vec::new()));
    let (manager, _registry) = manager(
        backend.clone(),
        vec![
            subscribed_device(dir.path(), 8585, "a"),
            subscribed_device(dir.path(), 8586, "b"),
        ],
    );

    let statuses = manager.manage(Some(HOST), EVENT_TO_HOST, false, true).await;
    assert_eq!(statuses.len(), 2);
    assert_eq!(backend.subscribe_count(), 2);

    let event_tos = backend
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Subscribe { event_to, .. } => Some(event_to),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(
        event_tos,
        vec!["cetp://10.0.0.5:8585".to_string(), "cetp://10.0.0.5:8586".to_string()]
    );
}

#[tokio::test]
async fn test_manage_busy_device() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::new(Vec::new()));
    let (manager, registry) = manager(backend.clone(), vec![subscribed_device(dir.path(), 8585, "old")]);
    let device = registry.all().remove(0);

    let _permit = device.guard().try_acquire().unwrap();
    let statuses = manager.manage(Some(HOST), EVENT_TO_HOST, false, true).await;
    assert_eq!(
        statuses,
        vec!["[192.168.178.42] Host subscription is in progress, try later".to_string()]
    );
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_manage_unknown_host() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::new(Vec::new()));
    let (manager, _registry) = manager(backend.clone(), vec![subscribed_device(dir.path(), 8585, "old")]);

    let statuses = manager.manage(Some("10.1.1.1"), EVENT_TO_HOST, false, false).await;
    assert_eq!(
        statuses,
        vec!["No configuration is found for the given host: 10.1.1.1".to_string()]
    );
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_cards() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::new(Vec::new()));
    let (manager, _registry) = manager(backend.clone(), vec![subscribed_device(dir.path(), 8585, "old")]);

    let result = manager.cards(Some(HOST), "SMC-B").await;
    assert_eq!(result.len(), 1);
    let cards = result[0].1.as_ref().unwrap();
    assert_eq!(cards[0].card_handle, "SMC-B-17");
    assert_eq!(backend.calls(), vec![Call::Cards("SMC-B".to_string())]);
}
