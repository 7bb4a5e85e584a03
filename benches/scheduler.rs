//! Throughput of the scheduler's dedup + dispatch path under load, grounded
//! on the `scenario_4_duplicate_requests_dedup_to_one_fill` test in
//! `service::scheduler`: many concurrent requests for overlapping tile sets
//! against a single in-process data source.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use mapget::model::{DataSourceInfo, LayerInfo, LayerType, TileFeatureLayer, Version};
use mapget::service::{Cache, DataSource, MemCache, Request, Service};
use mapget::Result;
use mapget_tile_utils::TileId;

fn layer_info() -> LayerInfo {
    LayerInfo {
        layer_id: "WayLayer".to_string(),
        layer_type: LayerType::Features,
        feature_types: Vec::new(),
        zoom_levels: Vec::new(),
        coverage: None,
        can_read: true,
        can_write: false,
        version: Version::new(1, 0, 0),
    }
}

fn source_info() -> DataSourceInfo {
    DataSourceInfo {
        node_id: "node-a".to_string(),
        map_id: "Tropico".to_string(),
        layers: HashMap::from([("WayLayer".to_string(), layer_info())]),
        max_parallel_jobs: 4,
        is_add_on: false,
        protocol_version: None,
        extra_json_attachment: None,
    }
}

struct CountingSource {
    info: DataSourceInfo,
    fills: AtomicU32,
}

impl DataSource for CountingSource {
    fn info(&self) -> DataSourceInfo {
        self.info.clone()
    }

    fn fill(&self, tile: &mut TileFeatureLayer) -> Result<()> {
        self.fills.fetch_add(1, Ordering::SeqCst);
        tile.new_feature("Way", vec![]).map(|_| ()).or(Ok(()))
    }
}

fn dispatch_requests(num_requests: usize, tiles_per_request: usize) {
    let cache: Arc<dyn Cache> = Arc::new(MemCache::new(10_000));
    let service = Service::new(cache);
    let source = Arc::new(CountingSource {
        info: source_info(),
        fills: AtomicU32::new(0),
    });
    service.add(source);

    let tiles: Vec<TileId> = (0..tiles_per_request as u64).map(TileId::from_value).collect();
    let done = Arc::new(Mutex::new(0usize));

    let requests: Vec<_> = (0..num_requests)
        .map(|_| {
            let done = done.clone();
            let request = Request::new("Tropico", "WayLayer", tiles.clone(), move |_layer| {
                *done.lock().unwrap() += 1;
            });
            service.request(request.clone()).unwrap();
            request
        })
        .collect();

    for request in requests {
        request.wait();
    }
}

fn bench_scheduler_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_dispatch");
    for &requests in &[1usize, 8, 32] {
        group.bench_with_input(BenchmarkId::new("overlapping_tile", requests), &requests, |b, &requests| {
            b.iter(|| dispatch_requests(black_box(requests), black_box(4)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_scheduler_dispatch);
criterion_main!(benches);
