use std::time::Instant;

use criterion::{BatchSize, BenchmarkId, Criterion};

use hive::internal::scheduler::state::SchedulerState;

use crate::utils::{NullComm, create_core};
use crate::{add_tasks, create_worker};

fn bench_schedule(c: &mut Criterion) {
    for task_count in [10, 1_000, 100_000] {
        for worker_count in [1, 8, 16, 32] {
            c.bench_with_input(
                BenchmarkId::new(
                    "schedule",
                    format!("tasks={task_count}, workers={worker_count}"),
                ),
                &(task_count, worker_count),
                |b, &(task_count, worker_count)| {
                    b.iter_batched_ref(
                        || {
                            let mut core = create_core();
                            add_tasks(&mut core, task_count);
                            for worker_id in 1..=worker_count {
                                let worker = create_worker(&core, worker_id, 64);
                                core.new_worker(worker);
                            }
                            (core, NullComm::default())
                        },
                        |(core, comm)| {
                            let mut scheduler = SchedulerState::new(Instant::now());
                            scheduler.run_scheduling(core, comm);
                        },
                        BatchSize::SmallInput,
                    );
                },
            );
        }
    }
}

pub fn benchmark(c: &mut Criterion) {
    bench_schedule(c);
}
