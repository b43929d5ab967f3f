//! Simple control plane demo.
//!
//! This demo runs the cache engine against an in-memory store:
//! - Seeds a few namespaces, services and instances
//! - Starts the control plane and waits for warm-up
//! - Churns instances in the background so refresh cycles have work
//! - Logs cache health periodically until Ctrl+C
//!
//! Run with:
//! ```bash
//! cargo run -p simple-control-plane -- --services 20 --instances 5
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nebucloud_mesh::prelude::*;
use nebucloud_mesh::server::telemetry;
use rand::Rng;
use tracing::{debug, info};

/// Command line options. Flags override values from `--config`.
#[derive(Debug, Parser)]
#[command(name = "simple-control-plane", version, about)]
struct Args {
    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of services to seed.
    #[arg(long, default_value_t = 10)]
    services: usize,
    /// Instances per service.
    #[arg(long, default_value_t = 3)]
    instances: usize,
    /// Milliseconds between background store writes. Zero disables churn.
    #[arg(long, default_value_t = 500)]
    churn_ms: u64,
    /// Cache refresh interval in milliseconds.
    #[arg(long)]
    refresh_ms: Option<u64>,
    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,
}

const NAMESPACES: [&str; 2] = ["default", "production"];

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init_tracing(&args.log);
    info!("{}", nebucloud_mesh::version::version_string());

    let mut config = match &args.config {
        Some(path) => ControlPlaneConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ControlPlaneConfig::default(),
    };
    if let Some(ms) = args.refresh_ms {
        config.cache.refresh_interval = Duration::from_millis(ms);
    }

    let store = Arc::new(MemoryStore::new());
    seed(&store, args.services, args.instances);

    let plane = Arc::new(
        ControlPlane::builder()
            .store(store.clone())
            .config(config)
            .build()
            .context("building control plane")?,
    );

    plane.manager().instance().add_listener(listener_fn(
        "demo-logger",
        |event: &CacheEvent<Instance>| {
            for instance in event.entities() {
                debug!(kind = event.kind().as_str(), instance = %instance.id, "instance event");
            }
            Ok(())
        },
    ));

    plane.start().await.context("warming up caches")?;

    if args.churn_ms > 0 {
        tokio::spawn(churn(
            store.clone(),
            args.services,
            args.instances,
            Duration::from_millis(args.churn_ms),
            plane.shutdown_controller().shutdown_signal(),
        ));
    }
    tokio::spawn(report(Arc::clone(&plane)));

    info!("press Ctrl+C to shut down");
    let graceful = plane.run_until_signal().await?;
    info!(graceful, "control plane exited");
    Ok(())
}

/// Populate the store before warm-up.
fn seed(store: &MemoryStore, services: usize, instances: usize) {
    for namespace in NAMESPACES {
        store.upsert_namespace(Namespace::new(namespace));
    }
    for s in 0..services {
        let service_id = format!("svc-{s}");
        let namespace = NAMESPACES[s % NAMESPACES.len()];
        store.upsert_service(Service::new(&service_id, namespace, format!("service-{s}")));
        for i in 0..instances {
            store.upsert_instance(Instance::new(
                format!("{service_id}-{i}"),
                &service_id,
                format!("10.1.{s}.{i}"),
                8080,
            ));
        }
    }
    info!(services, instances_per_service = instances, "seeded store");
}

/// Flip health, add and remove instances at random until shutdown.
async fn churn(
    store: Arc<MemoryStore>,
    services: usize,
    instances: usize,
    period: Duration,
    signal: ShutdownSignal,
) {
    if services == 0 || instances == 0 {
        return;
    }
    let mut ticker = tokio::time::interval(period);
    let stop = signal.wait();
    tokio::pin!(stop);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {
                let (s, i, action) = {
                    let mut rng = rand::thread_rng();
                    (rng.gen_range(0..services), rng.gen_range(0..instances), rng.gen_range(0..3))
                };
                let service_id = format!("svc-{s}");
                let id = format!("{service_id}-{i}");
                match action {
                    0 => {
                        let healthy = rand::thread_rng().gen_bool(0.5);
                        store.upsert_instance(
                            Instance::new(&id, &service_id, format!("10.1.{s}.{i}"), 8080)
                                .healthy(healthy),
                        );
                    }
                    1 => {
                        store.delete_instance(&id);
                    }
                    _ => {
                        store.upsert_instance(Instance::new(
                            &id,
                            &service_id,
                            format!("10.1.{s}.{i}"),
                            8080,
                        ));
                    }
                }
            }
        }
    }
}

/// Log a health summary every ten seconds.
async fn report(plane: Arc<ControlPlane>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        ticker.tick().await;
        let health = plane.health();
        if !health.ready {
            break;
        }
        for cache in &health.caches {
            info!(
                cache = %cache.kind,
                entities = cache.entities,
                watermark = cache.watermark,
                updates = cache.updates,
                failures = cache.failures,
                "cache health"
            );
        }
        for namespace in plane.manager().service().namespaces() {
            let count = plane.manager().service().get_namespace_count(&namespace);
            info!(
                namespace = %namespace,
                services = count.service_count,
                instances = count.instance_count.total,
                healthy = count.instance_count.healthy,
                "namespace aggregate"
            );
        }
    }
}
