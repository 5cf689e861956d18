use std::hint::black_box;
use std::time::Duration;

use criterion::{BatchSize, BenchmarkId, Criterion};

use hive::resources::{
    AllocationRequest, CPU_RESOURCE_ID, ResourceAmount, ResourceDescriptor, ResourcePool,
    ResourceRequest, ResourceRequestEntry,
};

use crate::utils::create_core;

fn cpu_request(policy: AllocationRequest) -> ResourceRequest {
    ResourceRequest::new(
        0,
        Duration::ZERO,
        smallvec::smallvec![ResourceRequestEntry {
            resource_id: CPU_RESOURCE_ID,
            request: policy,
        }],
    )
}

fn bench_allocate(c: &mut Criterion) {
    let core = create_core();
    let resource_map = core.create_resource_map();
    let policies = [
        ("compact", AllocationRequest::Compact(ResourceAmount::new(6))),
        (
            "force-compact",
            AllocationRequest::ForceCompact(ResourceAmount::new(8)),
        ),
        ("scatter", AllocationRequest::Scatter(ResourceAmount::new(6))),
    ];
    for (name, policy) in policies {
        let request = cpu_request(policy);
        c.bench_with_input(
            BenchmarkId::new("allocate cpus", name),
            &request,
            |b, request| {
                b.iter_batched_ref(
                    || ResourcePool::new(&ResourceDescriptor::sockets(4, 16), &resource_map),
                    |pool| {
                        while let Some(allocation) = pool.try_allocate(request) {
                            black_box(allocation);
                        }
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }
}

pub fn benchmark(c: &mut Criterion) {
    bench_allocate(c);
}
