//! Benchmark for registry mutation and placement ranking
//!
//! Target: thousands of placement decisions per second on a mid-size fleet.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use fleet_conductor::events::EventBus;
use fleet_conductor::persist::PersistHandle;
use fleet_conductor::placer::{self, PlacementConstraints};
use fleet_conductor::registry::FleetRegistry;
use fleet_conductor::{Node, NodeHealth, NodeKind, NodeLifecycle};

fn active_node(id: String, usable_mb: u64, allocated_mb: u64) -> Node {
    let mut node = Node::new(id, NodeKind::Cloud, "10.0.0.1", usable_mb, 0, 8, 0.12);
    node.health = NodeHealth::Healthy;
    node.lifecycle = NodeLifecycle::Active;
    node.allocated_ram_mb = allocated_mb;
    node
}

fn bench_register_nodes(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");
    group.throughput(Throughput::Elements(1));

    group.bench_function("register_single_node", |b| {
        let registry = FleetRegistry::new(EventBus::new(1024), PersistHandle::noop());
        let mut counter = 0u64;

        b.iter(|| {
            counter += 1;
            let _ = registry.register(black_box(active_node(
                format!("node-{}", counter),
                16384,
                0,
            )));
        });
    });

    group.finish();
}

fn bench_allocate_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");
    group.throughput(Throughput::Elements(1));

    let registry = FleetRegistry::new(EventBus::new(1024), PersistHandle::noop());
    for i in 0..100 {
        registry
            .register(active_node(format!("node-{:04}", i), 32768, 0))
            .unwrap();
    }

    group.bench_function("allocate_release_cycle", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let id = fleet_conductor::NodeId::new(format!("node-{:04}", counter % 100));
            registry.allocate(black_box(&id), 2048).unwrap();
            registry.release(&id, 2048).unwrap();
        });
    });

    group.finish();
}

fn bench_placement_ranking(c: &mut Criterion) {
    let mut group = c.benchmark_group("placer");
    group.throughput(Throughput::Elements(1));

    // A 200-node fleet with uneven load.
    let nodes: Vec<Node> = (0..200)
        .map(|i| active_node(format!("node-{:04}", i), 32768, (i % 7) * 4096))
        .collect();
    let mut workload = {
        fleet_conductor::Workload {
            id: fleet_conductor::WorkloadId::new("bench-w"),
            owner_id: "bench".into(),
            name: "bench".into(),
            image: "gameserver:latest".into(),
            requested_ram_mb: 4096,
            actual_ram_mb: 4096,
            storage_mb: 10240,
            tier: fleet_conductor::classify_tier(4096),
            plan: fleet_conductor::Plan::PayPerPlay,
            status: fleet_conductor::WorkloadStatus::Queued,
            phase: fleet_conductor::LifecyclePhase::Active,
            node_id: None,
            placement_active: false,
            container: None,
            port: None,
            idle_timeout_secs: 900,
            auto_shutdown: true,
            last_activity: None,
            last_started: None,
            last_stopped: None,
            player_count: 0,
            player_count_at: None,
            migration_mode: fleet_conductor::MigrationMode::Always,
            archive_backup_id: None,
            archive_location: None,
            error_reason: None,
            created_at: chrono::Utc::now(),
        }
    };

    group.bench_function("select_over_200_nodes", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            workload.actual_ram_mb = 2048 << (counter % 3);
            let _ = placer::select(
                black_box(nodes.iter()),
                black_box(&workload),
                &PlacementConstraints::default(),
            );
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_register_nodes,
    bench_allocate_release,
    bench_placement_ranking
);
criterion_main!(benches);
