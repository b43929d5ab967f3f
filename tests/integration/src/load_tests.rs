//! Load tests for mesh-cache with 10 000+ instances.
//!
//! These tests verify the engine under high load:
//! - Warm-up of a large store through a small notification queue
//! - Readers running while refresh tasks merge churn
//! - Convergence of aggregates once writes stop
//!
//! Run with: `cargo test --package integration-tests --test load_tests -- --nocapture`

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mesh_cache::{CacheConfig, CacheManager};
use mesh_core::{Instance, MemoryStore, Namespace, Service};
use rand::{rngs::StdRng, Rng, SeedableRng};

const SERVICES: usize = 1000;
const INSTANCES_PER_SERVICE: usize = 10;

fn populated_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for namespace in ["default", "prod", "staging"] {
        store.upsert_namespace(Namespace::new(namespace));
    }
    for s in 0..SERVICES {
        let service_id = format!("svc-{s}");
        let namespace = ["default", "prod", "staging"][s % 3];
        store.upsert_service(Service::new(&service_id, namespace, format!("name-{s}")));
        for i in 0..INSTANCES_PER_SERVICE {
            store.upsert_instance(Instance::new(
                format!("{service_id}-{i}"),
                &service_id,
                format!("10.{}.{}.{}", s / 256, s % 256, i),
                8080,
            ));
        }
    }
    store
}

/// Warm-up must not stall when far more services change than the queue holds.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_warm_up_through_small_queue() {
    let store = populated_store();
    let manager = CacheManager::builder()
        .store(store.clone())
        .config(CacheConfig {
            notify_queue_capacity: 16,
            ..Default::default()
        })
        .build()
        .unwrap();

    let start = Instant::now();
    tokio::time::timeout(Duration::from_secs(30), manager.start())
        .await
        .expect("warm-up stalled")
        .unwrap();
    println!(
        "Warmed up {} instances in {:?}",
        SERVICES * INSTANCES_PER_SERVICE,
        start.elapsed()
    );

    assert_eq!(manager.instance().instances_count(), SERVICES * INSTANCES_PER_SERVICE);
    assert_eq!(manager.service().services_count(), SERVICES);
    let total: u32 = ["default", "prod", "staging"]
        .iter()
        .map(|ns| manager.service().get_namespace_count(ns).instance_count.total)
        .sum();
    assert_eq!(total as usize, SERVICES * INSTANCES_PER_SERVICE);
    assert!(manager.queue().depth() <= manager.queue().capacity());

    manager.stop().await;
}

/// Readers keep seeing complete views while background refreshes merge churn.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_during_churn() {
    let store = populated_store();
    let manager = Arc::new(
        CacheManager::builder()
            .store(store.clone())
            .config(CacheConfig {
                refresh_interval: Duration::from_millis(10),
                pending_retry_interval: Duration::from_millis(10),
                ..Default::default()
            })
            .build()
            .unwrap(),
    );
    manager.start().await.unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicU64::new(0));

    let readers: Vec<_> = (0..8u64)
        .map(|r: u64| {
            let manager = Arc::clone(&manager);
            let stop = Arc::clone(&stop);
            let reads = Arc::clone(&reads);
            tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(r);
                while !stop.load(Ordering::Relaxed) {
                    let service_id = format!("svc-{}", rng.gen_range(0..SERVICES));
                    let listed = manager.instance().get_instances_by_service_id(&service_id);
                    assert!(listed.iter().all(|i| i.service_id == service_id));
                    let count = manager.instance().instance_count(&service_id);
                    assert!(count.healthy <= count.total);
                    reads.fetch_add(1, Ordering::Relaxed);
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(99);
            for _ in 0..2000 {
                let s = rng.gen_range(0..SERVICES);
                let id = format!("svc-{s}-{}", rng.gen_range(0..INSTANCES_PER_SERVICE));
                if rng.gen_bool(0.2) {
                    store.delete_instance(&id);
                } else {
                    store.upsert_instance(
                        Instance::new(&id, format!("svc-{s}"), "10.9.9.9", 8080)
                            .healthy(rng.gen_bool(0.8)),
                    );
                }
                if rng.gen_bool(0.05) {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        })
    };

    writer.await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.await.unwrap();
    }
    println!("Completed {} reads during churn", reads.load(Ordering::Relaxed));

    manager.stop().await;
    manager.refresh_once().await.unwrap();
    manager.drain_notifications();

    let services = manager.service();
    for namespace in ["default", "prod", "staging"] {
        assert_eq!(
            services.get_namespace_count(namespace),
            services.compute_namespace_count(namespace)
        );
    }
    let mut cached = 0;
    manager.instance().iterate_instances(|_| {
        cached += 1;
        true
    });
    assert_eq!(cached, manager.instance().instances_count());
}

/// Thousands of refresh cycles with nothing to merge stay cheap.
#[tokio::test]
async fn test_idle_cycles() {
    let store = populated_store();
    let manager = CacheManager::builder()
        .store(store.clone())
        .config(CacheConfig {
            rollback_window: Duration::from_millis(1),
            ..Default::default()
        })
        .build()
        .unwrap();
    manager.refresh_once().await.unwrap();

    let start = Instant::now();
    for _ in 0..1000 {
        manager.refresh_once().await.unwrap();
    }
    println!("1000 idle refresh rounds in {:?}", start.elapsed());
    assert_eq!(manager.instance().instances_count(), SERVICES * INSTANCES_PER_SERVICE);
}
