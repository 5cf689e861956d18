use crate::internal::common::Map;
use crate::internal::server::task::Task;
use crate::internal::server::worker::Worker;
use crate::internal::server::workergroup::WorkerGroup;
use crate::internal::server::workermap::WorkerMap;
use crate::{Priority, WorkerId};
use std::time::Instant;

/// Position of a task in the ready queue: higher priority first, then older submission
pub(crate) type QueueRank = (Priority, u64);

/// Workers that were held back in the current pass for a task that did not fit yet,
/// with the queue rank of that task.
pub(crate) type Reservations = Map<WorkerId, QueueRank>;

/// A held worker is closed to every task ranked behind its holder, including younger
/// tasks of the same priority.
#[inline]
pub(crate) fn is_reserved_against(
    reservations: &Reservations,
    worker_id: WorkerId,
    (priority, seq): QueueRank,
) -> bool {
    reservations
        .get(&worker_id)
        .is_some_and(|&(held_priority, held_seq)| {
            held_priority > priority || (held_priority == priority && held_seq < seq)
        })
}

pub(crate) fn queue_rank(task: &Task) -> QueueRank {
    (task.priority(), task.submit_seq)
}

fn sorted_groups(worker_groups: &Map<String, WorkerGroup>) -> Vec<(&str, &WorkerGroup)> {
    let mut groups: Vec<_> = worker_groups
        .iter()
        .map(|(name, group)| (name.as_str(), group))
        .collect();
    groups.sort_unstable_by_key(|(name, _)| *name);
    groups
}

/// Finds `n_nodes` completely free workers within a single group.
/// The first worker of the result becomes the root of the task.
pub(crate) fn find_workers_for_mn_task(
    task: &Task,
    worker_map: &WorkerMap,
    worker_groups: &Map<String, WorkerGroup>,
    reservations: &Reservations,
    now: Instant,
) -> Option<Vec<WorkerId>> {
    let rq = &task.configuration.resources;
    let n_nodes = rq.n_nodes() as usize;
    let rank = queue_rank(task);
    for (name, group) in sorted_groups(worker_groups) {
        if (group.size() as usize) < n_nodes {
            continue;
        }
        let mut free: Vec<WorkerId> = group
            .worker_ids()
            .filter(|worker_id| {
                let worker = worker_map.get_worker(*worker_id);
                worker.is_free()
                    && worker.has_time_to_run(rq.min_time(), now)
                    && !is_reserved_against(reservations, *worker_id, rank)
            })
            .collect();
        if free.len() >= n_nodes {
            free.sort_unstable();
            free.truncate(n_nodes);
            log::debug!(
                "Multi-node task {} fits into group '{}': {:?}",
                task.id,
                name,
                free
            );
            return Some(free);
        }
    }
    None
}

/// Picks workers that a multi-node task that does not fit now should get once
/// they drain, so that lower priority work does not keep them busy forever.
pub(crate) fn workers_to_hold_for_mn_task(
    task: &Task,
    worker_map: &WorkerMap,
    worker_groups: &Map<String, WorkerGroup>,
    reservations: &Reservations,
    now: Instant,
) -> Option<Vec<WorkerId>> {
    let rq = &task.configuration.resources;
    let n_nodes = rq.n_nodes() as usize;
    let usable = |worker: &Worker| {
        !worker.is_stopping()
            && worker.has_time_to_run(rq.min_time(), now)
            && !reservations.contains_key(&worker.id)
    };
    for (_, group) in sorted_groups(worker_groups) {
        let mut candidates: Vec<(usize, WorkerId)> = group
            .worker_ids()
            .map(|worker_id| worker_map.get_worker(worker_id))
            .filter(|worker| usable(worker))
            .map(|worker| (worker.assigned_task_ids().len(), worker.id))
            .collect();
        if candidates.len() < n_nodes {
            continue;
        }
        candidates.sort_unstable();
        let selected: Vec<WorkerId> = candidates
            .into_iter()
            .take(n_nodes)
            .map(|(_, worker_id)| worker_id)
            .collect();
        log::debug!(
            "Holding workers {:?} for multi-node task {} (priority {})",
            selected,
            task.id,
            task.priority()
        );
        return Some(selected);
    }
    None
}
