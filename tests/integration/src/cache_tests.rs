//! Cache integration tests.
//!
//! Properties that must hold for any sequence of store writes:
//! idempotent merges, a monotonic watermark, complete deletes, consistent
//! aggregates, and deduplicated concurrent refreshes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use mesh_cache::{CacheConfig, CacheManager, ResourceCache};
use mesh_core::{Instance, InstanceCount, MemoryStore, Namespace, Service, Timestamp};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn manager(store: &Arc<MemoryStore>) -> CacheManager {
    CacheManager::builder()
        .store(store.clone())
        .config(CacheConfig::default())
        .build()
        .expect("manager should build")
}

fn seed(store: &MemoryStore, services: usize, instances: usize) {
    store.upsert_namespace(Namespace::new("default"));
    for s in 0..services {
        let service_id = format!("svc-{s}");
        store.upsert_service(Service::new(&service_id, "default", format!("name-{s}")));
        for i in 0..instances {
            store.upsert_instance(Instance::new(
                format!("{service_id}-{i}"),
                &service_id,
                "10.0.0.1",
                8000 + i as u16,
            ));
        }
    }
}

/// Every observable index, flattened for equality checks.
fn snapshot(manager: &CacheManager) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    manager.instance().iterate_instances(|instance| {
        out.insert(
            format!("instance/{}", instance.id),
            format!("{}:{}", instance.service_id, instance.revision),
        );
        true
    });
    for service_id in manager.instance().service_ids() {
        out.insert(
            format!("count/{service_id}"),
            format!("{:?}", manager.instance().instance_count(&service_id)),
        );
    }
    manager.service().iterate_services(|service| {
        out.insert(
            format!("revision/{}", service.id),
            format!("{:?}", manager.service().get_service_revision(&service.id)),
        );
        true
    });
    for namespace in manager.service().namespaces() {
        out.insert(
            format!("namespace/{namespace}"),
            format!("{:?}", manager.service().get_namespace_count(&namespace)),
        );
    }
    out
}

#[tokio::test]
async fn merging_the_same_delta_twice_changes_nothing() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, 5, 4);
    let manager = manager(&store);
    manager.refresh_once().await.unwrap();
    let before = snapshot(&manager);

    // The rollback window makes the next cycle re-read recent rows.
    let outcome = manager.instance().update().await.unwrap();
    assert!(outcome.rows > 0, "rows within the rollback window are re-read");
    assert_eq!(outcome.created + outcome.updated + outcome.deleted, 0);
    manager.drain_notifications();

    assert_eq!(snapshot(&manager), before);
}

#[tokio::test]
async fn watermark_never_moves_backwards() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, 3, 3);
    let manager = manager(&store);
    manager.refresh_once().await.unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    let mut last = manager.instance().base().last_fetch_time();
    for _ in 0..25 {
        let s = rng.gen_range(0..3);
        let i = rng.gen_range(0..5);
        let id = format!("svc-{s}-{i}");
        if rng.gen_bool(0.3) {
            store.delete_instance(&id);
        } else {
            store.upsert_instance(
                Instance::new(&id, format!("svc-{s}"), "10.0.0.2", 9000)
                    .healthy(rng.gen_bool(0.5)),
            );
        }
        if rng.gen_bool(0.2) {
            // Late commit: a row stamped inside the rollback window.
            store.put_instance_raw(
                Instance::new(format!("late-{s}"), format!("svc-{s}"), "10.0.0.3", 9100)
                    .with_modify_time(last.saturating_sub(Duration::from_millis(100))),
            );
        }

        let outcome = manager.instance().update().await.unwrap();
        assert!(!outcome.drift_detected);
        assert!(outcome.watermark >= last, "{} < {}", outcome.watermark, last);
        last = outcome.watermark;
    }
}

#[tokio::test]
async fn late_commit_inside_rollback_window_is_picked_up() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, 1, 1);
    let manager = manager(&store);
    manager.refresh_once().await.unwrap();
    let watermark = manager.instance().base().last_fetch_time();

    store.put_instance_raw(
        Instance::new("late", "svc-0", "10.0.0.9", 9000)
            .with_modify_time(watermark.saturating_sub(Duration::from_millis(500))),
    );
    manager.instance().update().await.unwrap();
    assert!(manager.instance().get_instance("late").is_some());
    assert_eq!(manager.instance().base().last_fetch_time(), watermark);
}

#[tokio::test]
async fn deletes_leave_no_trace() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, 2, 3);
    let manager = manager(&store);
    manager.refresh_once().await.unwrap();

    store.delete_instance("svc-0-1");
    store.delete_service("svc-1");
    for i in 0..3 {
        store.delete_instance(&format!("svc-1-{i}"));
    }
    manager.refresh_once().await.unwrap();

    let instances = manager.instance();
    assert!(instances.get_instance("svc-0-1").is_none());
    assert!(instances
        .get_instances_by_service_id("svc-0")
        .iter()
        .all(|i| i.id != "svc-0-1"));
    assert_eq!(instances.instance_count("svc-0").total, 2);
    assert!(!instances.has_service("svc-1"));
    assert_eq!(instances.instance_count("svc-1"), InstanceCount::default());

    let services = manager.service();
    assert!(services.get_service_by_id("svc-1").is_none());
    assert!(services.get_service_by_name("default", "name-1").is_none());
    assert!(services.get_service_revision("svc-1").is_none());
    let count = services.get_namespace_count("default");
    assert_eq!(count.service_count, 1);
    assert_eq!(count.instance_count.total, 2);
    assert_eq!(services.pending_count(), 0);
}

#[tokio::test]
async fn aggregates_match_indices_after_drain() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_namespace(Namespace::new("default"));
    store.upsert_namespace(Namespace::new("prod"));
    let manager = manager(&store);

    let mut rng = StdRng::seed_from_u64(42);
    for round in 0..10 {
        for _ in 0..20 {
            let s = rng.gen_range(0..8);
            let service_id = format!("svc-{s}");
            match rng.gen_range(0..10) {
                0 => {
                    store.delete_service(&service_id);
                }
                1 => {
                    let namespace = if rng.gen_bool(0.5) { "default" } else { "prod" };
                    store.upsert_service(Service::new(&service_id, namespace, format!("n-{s}")));
                }
                2..=4 => {
                    store.delete_instance(&format!("{service_id}-{}", rng.gen_range(0..4)));
                }
                _ => {
                    store.upsert_instance(
                        Instance::new(
                            format!("{service_id}-{}", rng.gen_range(0..4)),
                            &service_id,
                            "10.0.0.1",
                            80,
                        )
                        .healthy(rng.gen_bool(0.7))
                        .isolated(rng.gen_bool(0.1)),
                    );
                }
            }
        }
        manager.refresh_once().await.unwrap();
        manager.drain_notifications();

        let services = manager.service();
        for namespace in ["default", "prod"] {
            assert_eq!(
                services.get_namespace_count(namespace),
                services.compute_namespace_count(namespace),
                "namespace {namespace} diverged in round {round}"
            );
        }
        services.iterate_services(|service| {
            assert_eq!(
                services.get_service_revision(&service.id),
                Some(services.compute_revision(service)),
                "revision of {} is stale in round {round}",
                service.id
            );
            true
        });
        for service_id in manager.instance().service_ids() {
            let listed = manager.instance().get_instances_by_service_id(&service_id);
            let expected: InstanceCount = listed.iter().map(|i| i.as_ref()).collect();
            assert_eq!(manager.instance().instance_count(&service_id), expected);
        }
    }
}

#[tokio::test]
async fn concurrent_updates_share_one_query() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, 2, 2);
    let manager = manager(&store);
    manager.refresh_once().await.unwrap();
    store.set_latency(Duration::from_millis(100));
    store.clear_queries();

    let outcomes = join_all((0..16).map(|_| manager.instance().update())).await;
    let queries = store.queries_for("get_more_instances").len();
    assert!(queries <= 2, "expected at most one extra query, saw {queries}");

    let outcomes: Vec<_> = outcomes.into_iter().map(Result::unwrap).collect();
    assert!(outcomes.iter().any(|o| o.deduplicated));
    assert!(outcomes.iter().any(|o| !o.deduplicated));
    assert!(manager.instance().base().stats().deduplicated() >= 1);
}

#[tokio::test]
async fn failed_cycle_keeps_watermark() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, 1, 2);
    let manager = manager(&store);
    manager.refresh_once().await.unwrap();
    let watermark = manager.instance().base().last_fetch_time();

    store.upsert_instance(Instance::new("svc-0-9", "svc-0", "10.0.0.1", 80));
    store.fail_next(1);
    assert!(manager.instance().update().await.is_err());
    assert_eq!(manager.instance().base().last_fetch_time(), watermark);
    assert_eq!(manager.instance().base().stats().failures(), 1);

    manager.instance().update().await.unwrap();
    assert!(manager.instance().get_instance("svc-0-9").is_some());
    assert!(manager.instance().base().last_fetch_time() > watermark);
}

#[tokio::test]
async fn clear_restarts_from_first_load() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, 1, 3);
    let manager = manager(&store);
    manager.refresh_once().await.unwrap();

    manager.instance().clear();
    assert_eq!(manager.instance().len(), 0);
    assert_eq!(manager.instance().base().last_fetch_time(), Timestamp::ZERO);

    store.clear_queries();
    let outcome = manager.instance().update().await.unwrap();
    assert!(outcome.first_load);
    assert_eq!(manager.instance().len(), 3);
    assert!(store.queries_for("get_more_instances")[0].first_load);
}
