use std::hint::black_box;

use criterion::{BatchSize, BenchmarkId, Criterion};

use crate::utils::create_core;
use crate::{add_tasks, create_task};

fn bench_add_tasks(c: &mut Criterion) {
    for task_count in [10, 1_000, 100_000] {
        c.bench_with_input(
            BenchmarkId::new("add tasks", task_count),
            &task_count,
            |b, &task_count| {
                b.iter_batched_ref(
                    || {
                        let core = create_core();
                        let tasks: Vec<_> = (0..task_count).map(create_task).collect();
                        (core, tasks)
                    },
                    |(core, tasks)| {
                        for task in std::mem::take(tasks) {
                            core.add_task(task);
                        }
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }
}

fn bench_remove_single_task(c: &mut Criterion) {
    for task_count in [10, 1_000, 100_000] {
        c.bench_with_input(
            BenchmarkId::new("remove a single task", task_count),
            &task_count,
            |b, &task_count| {
                b.iter_batched_ref(
                    || {
                        let mut core = create_core();
                        let tasks = add_tasks(&mut core, task_count);
                        (core, tasks[0])
                    },
                    |(core, task_id)| {
                        black_box(core.remove_task(*task_id));
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }
}

fn bench_backlog_summary(c: &mut Criterion) {
    for task_count in [10, 1_000, 100_000] {
        c.bench_with_input(
            BenchmarkId::new("backlog summary", task_count),
            &task_count,
            |b, &task_count| {
                b.iter_batched_ref(
                    || {
                        let mut core = create_core();
                        add_tasks(&mut core, task_count);
                        core
                    },
                    |core| {
                        black_box(core.backlog_summary());
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }
}

pub fn benchmark(c: &mut Criterion) {
    bench_add_tasks(c);
    bench_remove_single_task(c);
    bench_backlog_summary(c);
}
