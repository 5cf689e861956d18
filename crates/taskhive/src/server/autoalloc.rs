//! Allocation hints: how many more workers the ready backlog would need.
//!
//! The server never talks to a batch system itself. It periodically computes a hint
//! from the backlog and hands it to an [`AllocationHintAdapter`] that is responsible for
//! turning it into allocations.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use hive::gateway::{BacklogSummary, ResourceRequest, WorkerInfo};
use hive::resources::CPU_RESOURCE_NAME;
use hive::server::ServerRef;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AllocationHint {
    /// Additional workers that would let the whole ready backlog start
    pub n_workers: u32,
    /// Largest number of nodes requested by a single ready task
    pub max_nodes_per_task: u32,
    pub n_ready_tasks: u32,
    /// Resource requests of the ready tasks, largest groups first
    pub shapes: Vec<ResourceRequest>,
}

/// Receiver of allocation hints, e.g. a bridge to a batch system.
pub trait AllocationHintAdapter {
    fn on_hint(&mut self, hint: &AllocationHint);
}

/// Only reports hints into the log; repeated hints are logged once.
#[derive(Default)]
pub struct LoggingHintAdapter {
    last: Option<AllocationHint>,
}

impl AllocationHintAdapter for LoggingHintAdapter {
    fn on_hint(&mut self, hint: &AllocationHint) {
        if self.last.as_ref() == Some(hint) {
            return;
        }
        log::info!(
            "Backlog of {} ready task(s) needs {} more worker(s) (largest task spans {} node(s))",
            hint.n_ready_tasks,
            hint.n_workers,
            hint.max_nodes_per_task.max(1)
        );
        self.last = Some(hint.clone());
    }
}

fn requested_cpus(request: &ResourceRequest) -> u64 {
    request
        .resources
        .iter()
        .find(|entry| entry.resource == CPU_RESOURCE_NAME)
        .map(|entry| entry.policy.min_amount().as_u64())
        .unwrap_or(0)
}

fn worker_cpus(worker: &WorkerInfo) -> u64 {
    worker
        .configuration
        .resources
        .resources
        .iter()
        .find(|item| item.name == CPU_RESOURCE_NAME)
        .map(|item| item.kind.size().as_u64())
        .unwrap_or(0)
}

/// Computes the number of extra workers for the ready backlog.
///
/// Ready tasks in the summary could not be assigned to any current worker, so every
/// one of them needs new capacity. Workers are assumed to look like the largest
/// connected worker; without any worker each single node task gets its own.
pub fn compute_hint(summary: &BacklogSummary, workers: &[WorkerInfo]) -> Option<AllocationHint> {
    if summary.n_ready == 0 {
        return None;
    }
    let max_cpus = workers.iter().map(worker_cpus).max().unwrap_or(0);

    let mut n_workers: u64 = 0;
    let mut max_nodes_per_task = 0;
    for shape in &summary.shapes {
        let n_tasks = shape.n_tasks as u64;
        if shape.request.n_nodes > 0 {
            n_workers += n_tasks * shape.request.n_nodes as u64;
            max_nodes_per_task = max_nodes_per_task.max(shape.request.n_nodes);
            continue;
        }
        let cpus = requested_cpus(&shape.request);
        let tasks_per_worker = match cpus {
            0 => 1,
            cpus => (max_cpus / cpus).max(1),
        };
        n_workers += n_tasks.div_ceil(tasks_per_worker);
    }
    if n_workers == 0 {
        return None;
    }
    Some(AllocationHint {
        n_workers: n_workers.min(u32::MAX as u64) as u32,
        max_nodes_per_task,
        n_ready_tasks: summary.n_ready,
        shapes: summary
            .shapes
            .iter()
            .map(|shape| shape.request.clone())
            .collect(),
    })
}

/// Periodically emits allocation hints until the server stops.
pub async fn allocation_hint_process(
    server_ref: ServerRef,
    interval: Duration,
    mut adapter: Box<dyn AllocationHintAdapter>,
) {
    let mut interval = tokio::time::interval(interval);
    loop {
        interval.tick().await;
        let summary = server_ref.backlog_summary();
        let workers = server_ref.worker_list();
        log::trace!(
            "Backlog: {} waiting, {} ready, {} assigned/running, {}/{} idle workers",
            summary.n_waiting,
            summary.n_ready,
            summary.n_assigned_or_running,
            summary.n_idle_workers,
            summary.n_workers
        );
        if let Some(hint) = compute_hint(&summary, &workers) {
            adapter.on_hint(&hint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::worker_info;
    use hive::gateway::{BacklogShape, ResourceRequestEntry};
    use hive::resources::{AllocationRequest, ResourceAmount};
    use smallvec::smallvec;

    fn cpu_request(cpus: u64) -> ResourceRequest {
        ResourceRequest {
            n_nodes: 0,
            resources: smallvec![ResourceRequestEntry {
                resource: CPU_RESOURCE_NAME.to_string(),
                policy: AllocationRequest::Compact(ResourceAmount::new(cpus)),
            }],
            min_time: Duration::ZERO,
        }
    }

    fn summary(shapes: Vec<BacklogShape>) -> BacklogSummary {
        BacklogSummary {
            n_ready: shapes.iter().map(|s| s.n_tasks).sum(),
            shapes,
            ..Default::default()
        }
    }

    #[test]
    fn test_no_hint_without_backlog() {
        assert!(compute_hint(&BacklogSummary::default(), &[]).is_none());
    }

    #[test]
    fn test_tasks_are_packed_by_largest_worker() {
        let summary = summary(vec![BacklogShape {
            request: cpu_request(2),
            n_tasks: 9,
        }]);
        let workers = vec![worker_info(1, 4), worker_info(2, 8)];
        let hint = compute_hint(&summary, &workers).unwrap();
        // 4 tasks fit into an 8 cpu worker
        assert_eq!(hint.n_workers, 3);
        assert_eq!(hint.n_ready_tasks, 9);
        assert_eq!(hint.max_nodes_per_task, 0);
    }

    #[test]
    fn test_without_workers_each_task_needs_worker() {
        let summary = summary(vec![BacklogShape {
            request: cpu_request(1),
            n_tasks: 5,
        }]);
        assert_eq!(compute_hint(&summary, &[]).unwrap().n_workers, 5);
    }

    #[test]
    fn test_multinode_tasks() {
        let summary = summary(vec![
            BacklogShape {
                request: ResourceRequest::multi_node(3),
                n_tasks: 2,
            },
            BacklogShape {
                request: cpu_request(16),
                n_tasks: 1,
            },
        ]);
        let hint = compute_hint(&summary, &[worker_info(1, 4)]).unwrap();
        assert_eq!(hint.n_workers, 7);
        assert_eq!(hint.max_nodes_per_task, 3);
        assert_eq!(hint.shapes.len(), 2);
    }

    struct Recorder(std::rc::Rc<std::cell::RefCell<Vec<AllocationHint>>>);

    impl AllocationHintAdapter for Recorder {
        fn on_hint(&mut self, hint: &AllocationHint) {
            self.0.borrow_mut().push(hint.clone());
        }
    }

    #[test]
    fn test_adapter_receives_hint() {
        let hints = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut adapter: Box<dyn AllocationHintAdapter> = Box::new(Recorder(hints.clone()));
        let summary = summary(vec![BacklogShape {
            request: cpu_request(1),
            n_tasks: 1,
        }]);
        if let Some(hint) = compute_hint(&summary, &[]) {
            adapter.on_hint(&hint);
        }
        assert_eq!(hints.borrow().len(), 1);

        let mut logging = LoggingHintAdapter::default();
        logging.on_hint(&hints.borrow()[0]);
        assert_eq!(logging.last.as_ref(), Some(&hints.borrow()[0]));
    }
}
