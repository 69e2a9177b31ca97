// Benchmarks for the registry hot paths
// Measures endpoint normalization, endpoint picking and record decoding

use std::hint::black_box;

use batata_registry::resolver::normalize_endpoints;
use batata_registry::{EndpointPicker, RoundRobinPicker, ServiceInstance};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn create_instances(n: usize) -> Vec<ServiceInstance> {
    (0..n)
        .map(|i| {
            ServiceInstance::new(format!("orders-{}", i), "orders")
                .with_version("1.0.0")
                .with_endpoint(format!("grpc://10.0.{}.{}:9000", i / 256, i % 256))
                .with_endpoint(format!("10.1.{}.{}:9000", i / 256, i % 256))
                .with_metadata("zone", if i % 2 == 0 { "a" } else { "b" })
        })
        .collect()
}

fn bench_normalize_endpoints(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize_endpoints");
    for size in [10, 100, 1000] {
        let instances = create_instances(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &instances, |b, instances| {
            b.iter(|| normalize_endpoints(black_box(instances.iter())))
        });
    }
    group.finish();
}

fn bench_round_robin_pick(c: &mut Criterion) {
    let picker = RoundRobinPicker::new();
    let instances = create_instances(100);

    c.bench_function("round_robin_pick_100_instances", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i += 1;
            picker.pick(black_box(&instances[i % instances.len()]))
        })
    });
}

fn bench_decode_instance(c: &mut Criterion) {
    let record = serde_json::to_vec(&create_instances(1)[0]).unwrap();

    c.bench_function("decode_instance", |b| {
        b.iter(|| serde_json::from_slice::<ServiceInstance>(black_box(&record)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_normalize_endpoints,
    bench_round_robin_pick,
    bench_decode_instance
);
criterion_main!(benches);
