//! End-to-end scenarios against an in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mesh_cache::{listener_fn, CacheConfig, CacheEvent, CacheManager, EventKind, ResourceCache};
use mesh_core::{Instance, MemoryStore, Namespace, Service, Timestamp};
use mesh_server::ControlPlane;

fn manager(store: &Arc<MemoryStore>) -> CacheManager {
    CacheManager::builder()
        .store(store.clone())
        .config(CacheConfig::default())
        .build()
        .expect("manager should build")
}

fn svc_a_instances(store: &MemoryStore, count: usize) {
    for i in 0..count {
        store.upsert_instance(Instance::new(
            format!("a-{i}"),
            "svc-A",
            format!("10.0.0.{i}"),
            8080,
        ));
    }
}

#[tokio::test]
async fn ten_instances_are_listed_and_counted() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_service(Service::new("svc-A", "default", "alpha"));
    svc_a_instances(&store, 10);
    let manager = manager(&store);

    manager.refresh_once().await.unwrap();

    let listed = manager.instance().get_instances_by_service_id("svc-A");
    assert_eq!(listed.len(), 10);
    let count = manager.instance().instance_count("svc-A");
    assert_eq!(count.total, 10);
    assert_eq!(count.healthy, 10);
    assert_eq!(
        manager.service().get_namespace_count("default").instance_count.total,
        10
    );
}

#[tokio::test]
async fn invalidated_instances_disappear() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_service(Service::new("svc-A", "default", "alpha"));
    svc_a_instances(&store, 10);
    let manager = manager(&store);
    manager.refresh_once().await.unwrap();
    let revision_before = manager.service().get_service_revision("svc-A").unwrap();

    for i in 0..5 {
        store.delete_instance(&format!("a-{i}"));
    }
    let outcome = manager.instance().update().await.unwrap();
    assert_eq!(outcome.deleted, 5);
    manager.drain_notifications();

    assert_eq!(manager.instance().instance_count("svc-A").total, 5);
    for i in 0..5 {
        assert!(manager.instance().get_instance(&format!("a-{i}")).is_none());
    }
    let remaining: Vec<_> = manager
        .instance()
        .get_instances_by_service_id("svc-A")
        .iter()
        .map(|i| i.id.clone())
        .collect();
    assert_eq!(remaining.len(), 5);
    assert!(remaining.iter().all(|id| id.as_str() >= "a-5"));

    assert_eq!(
        manager.service().get_namespace_count("default").instance_count.total,
        5
    );
    assert_ne!(
        manager.service().get_service_revision("svc-A").unwrap(),
        revision_before
    );
}

#[tokio::test]
async fn row_count_drift_forces_full_reload_from_zero() {
    let store = Arc::new(MemoryStore::new());
    svc_a_instances(&store, 10);
    let manager = manager(&store);
    manager.refresh_once().await.unwrap();
    let instances = manager.instance();

    // The store reports a row the cache never saw.
    store.override_instances_count(Some(11));
    instances.base().force_heal_check();
    let probe = instances.update().await.unwrap();
    assert!(probe.drift_detected);
    assert_eq!(instances.base().last_fetch_time(), Timestamp::ZERO);
    assert!(instances.base().is_full_reload_pending());
    store.override_instances_count(None);

    store.clear_queries();
    let reload = instances.update().await.unwrap();
    assert!(reload.full_reload);
    assert!(!reload.first_load);
    assert_eq!(reload.since, Timestamp::ZERO);

    let queries = store.queries_for("get_more_instances");
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].since, Timestamp::ZERO);
    assert!(!queries[0].first_load);
    assert!(reload.watermark > Timestamp::ZERO);
    assert_eq!(instances.base().stats().drift_resets(), 1);
}

#[tokio::test]
async fn full_reload_sweeps_rows_lost_without_tombstone() {
    let store = Arc::new(MemoryStore::new());
    svc_a_instances(&store, 4);
    let manager = manager(&store);
    manager.refresh_once().await.unwrap();

    store.purge_instance("a-2");
    manager.instance().update().await.unwrap();
    assert!(
        manager.instance().get_instance("a-2").is_some(),
        "a purge is invisible to deltas"
    );

    manager.instance().base().force_heal_check();
    assert!(manager.instance().update().await.unwrap().drift_detected);
    let reload = manager.instance().update().await.unwrap();
    assert_eq!(reload.deleted, 1);
    assert!(manager.instance().get_instance("a-2").is_none());
    assert_eq!(manager.instance().instance_count("svc-A").total, 3);
}

#[tokio::test]
async fn late_service_resolves_pending_instances() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_namespace(Namespace::new("default"));
    for i in 0..3 {
        store.upsert_instance(Instance::new(format!("b-{i}"), "svc-B", "10.0.1.1", 80));
    }
    let manager = manager(&store);

    manager.refresh_once().await.unwrap();
    assert_eq!(manager.instance().instance_count("svc-B").total, 3);
    assert!(manager.service().get_service_by_id("svc-B").is_none());
    assert_eq!(manager.service().pending_count(), 1);

    // The service record lands one cycle after its instances.
    store.upsert_service(Service::new("svc-B", "default", "beta"));
    manager.refresh_once().await.unwrap();
    let report = manager.drain_notifications();

    assert_eq!(report.pending, 0);
    assert_eq!(manager.service().pending_count(), 0);
    let service = manager.service().get_service_by_id("svc-B").unwrap();
    assert_eq!(
        manager.service().get_service_revision("svc-B"),
        Some(manager.service().compute_revision(&service))
    );
    let count = manager.service().get_namespace_count("default");
    assert_eq!(count.service_count, 1);
    assert_eq!(count.instance_count.total, 3);
}

#[tokio::test]
async fn alias_follows_source_instances() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_service(Service::new("svc-A", "default", "alpha"));
    store.upsert_service(Service::new("alias-A", "default", "alpha-alias").alias_of("svc-A"));
    svc_a_instances(&store, 2);
    let manager = manager(&store);
    manager.refresh_once().await.unwrap();
    let before = manager.service().get_service_revision("alias-A").unwrap();

    store.upsert_instance(Instance::new("a-9", "svc-A", "10.0.0.9", 8080));
    manager.refresh_once().await.unwrap();

    let after = manager.service().get_service_revision("alias-A").unwrap();
    assert_ne!(before, after);
    let alias = manager.service().get_service_by_id("alias-A").unwrap();
    assert_eq!(after, manager.service().compute_revision(&alias));
}

#[tokio::test]
async fn listeners_observe_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    svc_a_instances(&store, 3);
    let manager = manager(&store);

    let created = Arc::new(AtomicUsize::new(0));
    let deleted = Arc::new(AtomicUsize::new(0));
    let batches = Arc::new(AtomicUsize::new(0));
    {
        let (created, deleted, batches) =
            (Arc::clone(&created), Arc::clone(&deleted), Arc::clone(&batches));
        manager.instance().add_listener(listener_fn(
            "counter",
            move |event: &CacheEvent<Instance>| {
                match event.kind() {
                    EventKind::Created => created.fetch_add(1, Ordering::SeqCst),
                    EventKind::Deleted => deleted.fetch_add(1, Ordering::SeqCst),
                    EventKind::BatchUpdated | EventKind::BatchDeleted => {
                        batches.fetch_add(1, Ordering::SeqCst)
                    }
                    EventKind::Updated => 0,
                };
                Ok(())
            },
        ));
    }
    // A listener that always fails must not stop the others.
    manager.instance().add_listener(listener_fn("broken", |_: &CacheEvent<Instance>| {
        Err(mesh_core::MeshError::ListenerFailed {
            listener: "broken".into(),
            message: "always".into(),
        })
    }));

    manager.refresh_once().await.unwrap();
    store.delete_instance("a-0");
    manager.refresh_once().await.unwrap();

    assert_eq!(created.load(Ordering::SeqCst), 3);
    assert_eq!(deleted.load(Ordering::SeqCst), 1);
    assert_eq!(batches.load(Ordering::SeqCst), 2);
    assert!(manager.instance().base().stats().listener_errors() >= 4);
}

#[tokio::test]
async fn control_plane_converges_in_background() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_service(Service::new("svc-A", "default", "alpha"));
    svc_a_instances(&store, 2);
    let plane = ControlPlane::builder()
        .store(store.clone())
        .refresh_interval(Duration::from_millis(20))
        .grace_period(Duration::from_secs(5))
        .build()
        .unwrap();
    plane.start().await.unwrap();
    assert!(plane.readiness().is_ready());

    svc_a_instances(&store, 6);
    store.upsert_service(Service::new("svc-C", "default", "gamma"));
    store.upsert_instance(Instance::new("c-0", "svc-C", "10.0.2.1", 80));

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let count = plane.manager().service().get_namespace_count("default");
            if count.service_count == 2 && count.instance_count.total == 7 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("namespace aggregate never converged");

    assert!(plane.shutdown().await);
    assert!(!plane.readiness().is_ready());
}
