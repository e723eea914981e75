//! Service tests against in-memory backends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use super::{AgentService, UserDelta};
use crate::backends::{Backend, UserMeta, UsersMetaSource};
use crate::error_handling::types::{BackendError, ServiceError};
use crate::storage::types::{Inbound, User};
use crate::storage::{DeviceStorage, MemoryStorage, Storage};

/// Backend double serving fixed inbounds and canned stats.
#[derive(Default)]
struct MockBackend {
    inbounds: Vec<Inbound>,
    calls: Mutex<Vec<String>>,
    usages: HashMap<u32, u64>,
    meta: Option<HashMap<u32, UserMeta>>,
    failing: bool,
    restarts: Mutex<Vec<Option<String>>>,
    log_lines: Vec<String>,
}

impl MockBackend {
    fn with_tags(tags: &[&str]) -> Self {
        Self {
            inbounds: tags
                .iter()
                .map(|tag| Inbound::new(*tag, "vless", json!({"tag": tag, "port": 443})))
                .collect(),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn fail(&self) -> Result<(), BackendError> {
        if self.failing {
            Err(BackendError::Config("backend offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl UsersMetaSource for MockBackend {
    async fn get_users_meta(&self) -> Result<HashMap<u32, UserMeta>, BackendError> {
        self.fail()?;
        Ok(self.meta.clone().unwrap_or_default())
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn backend_type(&self) -> &'static str {
        "mock"
    }

    fn config_format(&self) -> u32 {
        1
    }

    async fn start(&self, _config: Option<String>) -> Result<(), BackendError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn restart(&self, config: Option<String>) -> Result<(), BackendError> {
        self.restarts.lock().unwrap().push(config);
        Ok(())
    }

    async fn add_user(&self, user: &User, inbound: &Inbound) -> Result<(), BackendError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("add {} {}", user.id, inbound.tag));
        Ok(())
    }

    async fn remove_user(&self, user: &User, inbound: &Inbound) -> Result<(), BackendError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("remove {} {}", user.id, inbound.tag));
        Ok(())
    }

    async fn get_usages(&self, _reset: bool) -> Result<HashMap<u32, u64>, BackendError> {
        self.fail()?;
        Ok(self.usages.clone())
    }

    async fn running(&self) -> bool {
        !self.failing
    }

    fn version(&self) -> Option<String> {
        Some("1.0.0".into())
    }

    fn contains_tag(&self, tag: &str) -> bool {
        self.inbounds.iter().any(|i| i.tag == tag)
    }

    fn list_inbounds(&self) -> Vec<Inbound> {
        self.inbounds.clone()
    }

    fn get_config(&self) -> Result<String, BackendError> {
        Ok("{}".into())
    }

    fn logs(&self, include_buffer: bool) -> (Vec<String>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        let _ = tx.try_send("live".to_string());
        let buffer = if include_buffer {
            self.log_lines.clone()
        } else {
            Vec::new()
        };
        (buffer, rx)
    }

    fn users_meta(&self) -> Option<&dyn UsersMetaSource> {
        self.meta.as_ref().map(|_| self as &dyn UsersMetaSource)
    }
}

fn user(id: u32) -> User {
    User {
        id,
        username: format!("user{}", id),
        key: format!("key-{}", id),
    }
}

fn meta(ip: &str, client: &str, up: u64, down: u64) -> UserMeta {
    UserMeta {
        uplink: up,
        downlink: down,
        remote_ip: ip.to_string(),
        client_name: client.to_string(),
        ..Default::default()
    }
}

fn service(backends: Vec<(&str, Arc<MockBackend>)>) -> (AgentService, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    for (_, backend) in &backends {
        for inbound in backend.list_inbounds() {
            storage.register_inbound(inbound);
        }
    }
    let devices = Arc::new(DeviceStorage::new(
        chrono::Duration::minutes(5),
        chrono::Duration::days(30),
    ));
    let backends = backends
        .into_iter()
        .map(|(name, b)| (name.to_string(), b as Arc<dyn Backend>))
        .collect();
    (AgentService::new(storage.clone(), backends, devices), storage)
}

fn stored_tags(storage: &MemoryStorage, uid: u32) -> Vec<String> {
    let mut tags: Vec<String> = storage
        .get_user(uid)
        .map(|r| r.tags().map(str::to_string).collect())
        .unwrap_or_default();
    tags.sort();
    tags
}

#[tokio::test]
async fn test_new_user_is_added_to_each_inbound() {
    let backend = Arc::new(MockBackend::with_tags(&["A", "B"]));
    let (service, storage) = service(vec![("xray", backend.clone())]);

    service
        .sync_user(UserDelta::new(user(1), &["A", "B"]))
        .await
        .unwrap();

    assert_eq!(backend.calls(), vec!["add 1 A", "add 1 B"]);
    assert_eq!(stored_tags(&storage, 1), vec!["A", "B"]);
}

#[tokio::test]
async fn test_membership_change_only_touches_the_difference() {
    let backend = Arc::new(MockBackend::with_tags(&["A", "B", "C"]));
    let (service, storage) = service(vec![("xray", backend.clone())]);

    service
        .sync_user(UserDelta::new(user(1), &["A", "B"]))
        .await
        .unwrap();
    backend.calls.lock().unwrap().clear();

    service
        .sync_user(UserDelta::new(user(1), &["B", "C"]))
        .await
        .unwrap();

    assert_eq!(backend.calls(), vec!["remove 1 A", "add 1 C"]);
    assert_eq!(stored_tags(&storage, 1), vec!["B", "C"]);
}

#[tokio::test]
async fn test_empty_delta_removes_user_everywhere() {
    let backend = Arc::new(MockBackend::with_tags(&["A", "B"]));
    let (service, storage) = service(vec![("xray", backend.clone())]);

    service
        .sync_user(UserDelta::new(user(1), &["A", "B"]))
        .await
        .unwrap();
    service.sync_user(UserDelta::new(user(1), &[])).await.unwrap();

    assert_eq!(
        backend.calls(),
        vec!["add 1 A", "add 1 B", "remove 1 A", "remove 1 B"]
    );
    assert!(storage.get_user(1).is_none());
}

#[tokio::test]
async fn test_unknown_user_without_inbounds_is_a_noop() {
    let backend = Arc::new(MockBackend::with_tags(&["A"]));
    let (service, storage) = service(vec![("xray", backend.clone())]);

    service.sync_user(UserDelta::new(user(9), &[])).await.unwrap();

    assert!(backend.calls().is_empty());
    assert!(storage.list_users().is_empty());
}

#[tokio::test]
async fn test_users_are_routed_to_the_backend_owning_the_tag() {
    let first = Arc::new(MockBackend::with_tags(&["A"]));
    let second = Arc::new(MockBackend::with_tags(&["B"]));
    let (service, _) = service(vec![("one", first.clone()), ("two", second.clone())]);

    service
        .sync_user(UserDelta::new(user(1), &["A", "B"]))
        .await
        .unwrap();

    assert_eq!(first.calls(), vec!["add 1 A"]);
    assert_eq!(second.calls(), vec!["add 1 B"]);
}

#[tokio::test]
async fn test_duplicate_tags_count_once() {
    let backend = Arc::new(MockBackend::with_tags(&["A", "B"]));
    let (service, storage) = service(vec![("xray", backend.clone())]);

    service
        .sync_user(UserDelta::new(user(2), &["A", "A"]))
        .await
        .unwrap();
    assert_eq!(backend.calls(), vec!["add 2 A"]);
    assert_eq!(stored_tags(&storage, 2), vec!["A"]);

    service
        .sync_user(UserDelta::new(user(1), &["B"]))
        .await
        .unwrap();
    service
        .sync_user(UserDelta::new(user(1), &["A", "A"]))
        .await
        .unwrap();
    assert_eq!(stored_tags(&storage, 1), vec!["A"]);

    backend.calls.lock().unwrap().clear();
    service.sync_user(UserDelta::new(user(1), &[])).await.unwrap();
    assert_eq!(backend.calls(), vec!["remove 1 A"]);
    assert!(storage.get_user(1).is_none());
}

#[tokio::test]
async fn test_sync_users_applies_stream_in_order() {
    let backend = Arc::new(MockBackend::with_tags(&["A"]));
    let (service, storage) = service(vec![("xray", backend.clone())]);

    let deltas = stream::iter(vec![
        UserDelta::new(user(1), &["A"]),
        UserDelta::new(user(2), &["A"]),
        UserDelta::new(user(1), &[]),
    ]);
    let applied = service.sync_users(deltas).await.unwrap();

    assert_eq!(applied, 3);
    assert_eq!(backend.calls(), vec!["add 1 A", "add 2 A", "remove 1 A"]);
    assert!(storage.get_user(1).is_none());
    assert_eq!(stored_tags(&storage, 2), vec!["A"]);
}

#[tokio::test]
async fn test_repopulate_drops_absent_users_and_is_idempotent() {
    let backend = Arc::new(MockBackend::with_tags(&["A", "B"]));
    let (service, storage) = service(vec![("xray", backend.clone())]);

    service
        .sync_user(UserDelta::new(user(1), &["A"]))
        .await
        .unwrap();
    service
        .sync_user(UserDelta::new(user(2), &["A"]))
        .await
        .unwrap();
    backend.calls.lock().unwrap().clear();

    let full = vec![
        UserDelta::new(user(2), &["A", "B"]),
        UserDelta::new(user(3), &["B"]),
    ];
    service.repopulate_users(full.clone()).await.unwrap();

    assert_eq!(backend.calls(), vec!["add 2 B", "add 3 B", "remove 1 A"]);
    assert!(storage.get_user(1).is_none());
    assert_eq!(stored_tags(&storage, 2), vec!["A", "B"]);
    assert_eq!(stored_tags(&storage, 3), vec!["B"]);

    backend.calls.lock().unwrap().clear();
    service.repopulate_users(full).await.unwrap();
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_tag_for_new_user_is_skipped() {
    let backend = Arc::new(MockBackend::with_tags(&["A"]));
    let (service, storage) = service(vec![("xray", backend.clone())]);

    service
        .sync_user(UserDelta::new(user(1), &["A", "missing"]))
        .await
        .unwrap();

    assert_eq!(backend.calls(), vec!["add 1 A"]);
    assert_eq!(stored_tags(&storage, 1), vec!["A"]);
}

#[tokio::test]
async fn test_stats_sum_usage_and_keep_first_descriptive_value() {
    let first = Arc::new(MockBackend {
        usages: HashMap::from([(1, 100), (2, 5)]),
        meta: Some(HashMap::from([(1, meta("1.1.1.1", "", 60, 40))])),
        ..MockBackend::with_tags(&["A"])
    });
    let second = Arc::new(MockBackend {
        usages: HashMap::from([(1, 50)]),
        meta: Some(HashMap::from([(1, meta("2.2.2.2", "sing", 30, 20))])),
        ..MockBackend::with_tags(&["B"])
    });
    let (service, _) = service(vec![("xray", first), ("singbox", second)]);

    let stats = service.fetch_users_stats().await;

    assert_eq!(stats.len(), 2);
    let one = &stats[0];
    assert_eq!(one.uid, 1);
    assert_eq!(one.usage, 150);
    assert_eq!(one.uplink, 90);
    assert_eq!(one.downlink, 60);
    assert_eq!(one.remote_ip, "1.1.1.1");
    // The first backend reported no client name, so its own name wins.
    assert_eq!(one.client_name, "xray");

    let two = &stats[1];
    assert_eq!(two.uid, 2);
    assert_eq!(two.usage, 5);
    assert!(two.remote_ip.is_empty());
    assert!(two.client_name.is_empty());
}

#[tokio::test]
async fn test_failing_backend_is_left_out_of_stats() {
    let healthy = Arc::new(MockBackend {
        usages: HashMap::from([(1, 10)]),
        meta: Some(HashMap::from([(1, meta("1.1.1.1", "xray", 6, 4))])),
        ..MockBackend::with_tags(&["A"])
    });
    let broken = Arc::new(MockBackend {
        usages: HashMap::from([(1, 999)]),
        meta: Some(HashMap::new()),
        failing: true,
        ..MockBackend::with_tags(&["B"])
    });
    let (service, _) = service(vec![("broken", broken), ("xray", healthy)]);

    let stats = service.fetch_users_stats().await;

    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].usage, 10);
    assert_eq!(stats[0].remote_ip, "1.1.1.1");
}

#[tokio::test]
async fn test_stats_feed_device_history() {
    let backend = Arc::new(MockBackend {
        usages: HashMap::from([(1, 100), (2, 7)]),
        meta: Some(HashMap::from([(1, meta("1.1.1.1", "xray", 60, 40))])),
        ..MockBackend::with_tags(&["A"])
    });
    let (service, _) = service(vec![("xray", backend)]);

    service.fetch_users_stats().await;

    let devices = service.fetch_user_devices(1, false);
    assert_eq!(devices.uid, 1);
    assert_eq!(devices.devices.len(), 1);
    assert_eq!(devices.devices[0].remote_ip, "1.1.1.1");
    assert!(devices.devices[0].is_active);

    // No IP for user 2, so nothing is recorded.
    assert!(service.fetch_user_devices(2, false).devices.is_empty());
    let all = service.fetch_all_devices();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].uid, 1);
}

#[tokio::test]
async fn test_sweep_forgets_lifetime_usage_of_purged_users() {
    let backend = Arc::new(MockBackend {
        usages: HashMap::from([(1, 100), (2, 5)]),
        meta: Some(HashMap::from([(1, meta("1.1.1.1", "xray", 60, 40))])),
        ..MockBackend::with_tags(&["A"])
    });
    let (service, _) = service(vec![("xray", backend)]);

    service.fetch_users_stats().await;
    service.fetch_users_stats().await;
    assert_eq!(service.lifetime_usage_of(1), Some(200));
    assert_eq!(service.fetch_user_devices(1, false).devices[0].total_usage, 200);

    let outcome = service.sweep_devices_at(chrono::Utc::now() + chrono::Duration::days(31));
    assert_eq!(outcome.forgotten_users, vec![1]);
    assert_eq!(service.lifetime_usage_of(1), None);
    // User 2 never had a device, so the sweep leaves it alone.
    assert_eq!(service.lifetime_usage_of(2), Some(10));

    service.fetch_users_stats().await;
    let devices = service.fetch_user_devices(1, false).devices;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].total_usage, 100);
}

#[tokio::test]
async fn test_removed_user_loses_lifetime_usage() {
    let backend = Arc::new(MockBackend {
        usages: HashMap::from([(1, 100), (2, 5)]),
        ..MockBackend::with_tags(&["A"])
    });
    let (service, _) = service(vec![("xray", backend)]);

    service.sync_user(UserDelta::new(user(1), &["A"])).await.unwrap();
    service.sync_user(UserDelta::new(user(2), &["A"])).await.unwrap();
    service.fetch_users_stats().await;
    assert_eq!(service.lifetime_usage_of(1), Some(100));
    assert_eq!(service.lifetime_usage_of(2), Some(5));

    service.sync_user(UserDelta::new(user(1), &[])).await.unwrap();
    assert_eq!(service.lifetime_usage_of(1), None);

    service
        .repopulate_users(vec![UserDelta::new(user(3), &["A"])])
        .await
        .unwrap();
    assert_eq!(service.lifetime_usage_of(2), None);
}

#[tokio::test]
async fn test_unknown_backend_is_not_found() {
    let backend = Arc::new(MockBackend::with_tags(&["A"]));
    let (service, _) = service(vec![("xray", backend)]);

    assert!(matches!(
        service.get_backend_stats("nope").await,
        Err(ServiceError::BackendNotFound(name)) if name == "nope"
    ));
    assert!(matches!(
        service.fetch_backend_config("nope"),
        Err(ServiceError::BackendNotFound(_))
    ));
    assert!(matches!(
        service.restart_backend("nope", None).await,
        Err(ServiceError::BackendNotFound(_))
    ));
    assert!(service.stream_backend_logs("nope", true).is_err());
}

#[tokio::test]
async fn test_backend_inspection() {
    let backend = Arc::new(MockBackend::with_tags(&["A"]));
    let (service, _) = service(vec![("xray", backend.clone())]);

    let backends = service.fetch_backends().await;
    assert_eq!(backends.len(), 1);
    assert_eq!(backends[0].name, "xray");
    assert_eq!(backends[0].backend_type, "mock");
    assert_eq!(backends[0].version.as_deref(), Some("1.0.0"));
    let config: serde_json::Value = serde_json::from_str(&backends[0].inbounds[0].config).unwrap();
    assert_eq!(config["tag"], "A");

    assert!(service.get_backend_stats("xray").await.unwrap().running);
    let reply = service.fetch_backend_config("xray").unwrap();
    assert_eq!(reply.configuration, "{}");
    assert_eq!(reply.config_format, 1);
}

#[tokio::test]
async fn test_restart_treats_blank_config_as_none() {
    let backend = Arc::new(MockBackend::with_tags(&["A"]));
    let (service, _) = service(vec![("xray", backend.clone())]);

    service
        .restart_backend("xray", Some("  ".into()))
        .await
        .unwrap();
    service
        .restart_backend("xray", Some("{\"inbounds\":[]}".into()))
        .await
        .unwrap();

    let restarts = backend.restarts.lock().unwrap().clone();
    assert_eq!(restarts, vec![None, Some("{\"inbounds\":[]}".to_string())]);
}

#[tokio::test]
async fn test_log_stream_replays_buffer_then_live_lines() {
    let backend = Arc::new(MockBackend {
        log_lines: vec!["old 1".into(), "old 2".into()],
        ..MockBackend::with_tags(&["A"])
    });
    let (service, _) = service(vec![("xray", backend)]);

    let lines: Vec<String> = service
        .stream_backend_logs("xray", true)
        .unwrap()
        .collect()
        .await;
    assert_eq!(lines, vec!["old 1", "old 2", "live"]);

    let lines: Vec<String> = service
        .stream_backend_logs("xray", false)
        .unwrap()
        .collect()
        .await;
    assert_eq!(lines, vec!["live"]);
}

#[tokio::test(start_paused = true)]
async fn test_device_sweeper_stops_on_cancel() {
    let backend = Arc::new(MockBackend::with_tags(&["A"]));
    let (service, _) = service(vec![("xray", backend)]);
    let service = Arc::new(service);
    let cancel = tokio_util::sync::CancellationToken::new();

    let task = tokio::spawn(
        service
            .clone()
            .run_device_sweeper(Duration::from_secs(30), cancel.clone()),
    );
    tokio::time::sleep(Duration::from_secs(95)).await;
    cancel.cancel();
    task.await.unwrap();
}
