use criterion::{Criterion, criterion_group, criterion_main};
use std::sync::Arc;

use rcluster::{AtomicOperationsManager, ClusterConfig, PageCache, PaginatedCluster};

fn bench_cluster(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("temp dir");
    let cache = Arc::new(PageCache::new(dir.path()).expect("page cache"));
    let atomic = Arc::new(AtomicOperationsManager::new(cache.clone()).expect("atomic manager"));
    let cluster = PaginatedCluster::new(cache, atomic, ClusterConfig::new(1, "bench"))
        .expect("cluster descriptor");
    cluster.create(0).expect("create cluster");

    let small = vec![0xABu8; 512];
    c.bench_function("create_record_512b", |b| {
        b.iter(|| cluster.create_record(&small, 1, 0, None).unwrap())
    });

    let position = cluster.create_record(&small, 1, 0, None).unwrap();
    c.bench_function("read_record_512b", |b| {
        b.iter(|| {
            cluster
                .read_record(position.cluster_position, 1)
                .unwrap()
                .unwrap()
        })
    });

    let large = vec![0xCDu8; 200_000];
    let spanning = cluster.create_record(&large, 1, 0, None).unwrap();
    c.bench_function("read_record_200kb_chain", |b| {
        b.iter(|| {
            cluster
                .read_record(spanning.cluster_position, 4)
                .unwrap()
                .unwrap()
        })
    });

    c.bench_function("update_record_512b", |b| {
        b.iter(|| {
            cluster
                .update_record(position.cluster_position, &small, 2, 0)
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_cluster);
criterion_main!(benches);
