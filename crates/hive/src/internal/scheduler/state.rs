use std::rc::Rc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::time::sleep;

use crate::internal::common::Set;
use crate::internal::common::resources::ResourceRequest;
use crate::internal::messages::worker::{MnReservationMsg, ToWorkerMessage};
use crate::internal::scheduler::multinode::{
    Reservations, find_workers_for_mn_task, is_reserved_against, queue_rank,
    workers_to_hold_for_mn_task,
};
use crate::internal::server::comm::{Comm, CommSender, CommSenderRef};
use crate::internal::server::core::{Core, CoreRef, CoreSplitMut};
use crate::internal::server::task::{Assignment, Task, TaskRuntimeState};
use crate::internal::server::workermap::WorkerMap;
use crate::{JobId, Priority, TaskId, WorkerId};

pub(crate) async fn scheduler_loop(
    core_ref: CoreRef,
    comm_ref: CommSenderRef,
    scheduler_wakeup: Rc<Notify>,
    minimum_delay: Duration,
) {
    let mut last_schedule = Instant::now();
    loop {
        scheduler_wakeup.notified().await;
        if !comm_ref.get().get_scheduling_flag() {
            last_schedule = Instant::now();
            continue;
        }
        let mut now = Instant::now();
        let since_last_schedule = now - last_schedule;
        if minimum_delay > since_last_schedule {
            sleep(minimum_delay - since_last_schedule).await;
            now = Instant::now();
        }
        let mut comm = comm_ref.get_mut();
        if !comm.get_scheduling_flag() {
            last_schedule = now;
            continue;
        }
        let mut core = core_ref.get_mut();
        run_scheduling_now(&mut core, &mut comm, now);
        last_schedule = Instant::now();
    }
}

pub(crate) fn run_scheduling_now(core: &mut Core, comm: &mut CommSender, now: Instant) {
    comm.reset_scheduling_flag();
    let mut state = SchedulerState::new(now);
    trace_time!("scheduler", "schedule", state.run_scheduling(core, comm));
}

/// One dispatch pass over the ready queue.
///
/// Tasks are visited in the queue order (priority, then the equal-priority policy).
/// A task that does not fit stays Ready. If it could run on some worker once that
/// worker drains, the worker is held for it for the rest of the pass, so tasks
/// queued behind it (lower priority or younger with the same priority) cannot take it.
pub struct SchedulerState {
    now: Instant,
    reservations: Reservations,
    // Configurations (shared by many tasks) that already failed to match in this pass;
    // capacity only decreases during a pass, so they would fail again
    failed_configurations: Set<usize>,
    assigned: Vec<(TaskId, Priority, u64)>,
    served_jobs: Vec<(Priority, JobId)>,
}

impl SchedulerState {
    pub fn new(now: Instant) -> Self {
        SchedulerState {
            now,
            reservations: Default::default(),
            failed_configurations: Default::default(),
            assigned: Vec::new(),
            served_jobs: Vec::new(),
        }
    }

    pub fn run_scheduling(&mut self, core: &mut Core, comm: &mut impl Comm) {
        if core.is_dispatch_halted() || !core.has_workers() || core.ready_queue().is_empty() {
            return;
        }
        let CoreSplitMut {
            task_map,
            worker_map,
            ready_queue,
            worker_groups,
        } = core.split_mut();

        let worker_ids = worker_map.sorted_ids();
        let mut open_workers = worker_ids
            .iter()
            .filter(|w| worker_map.accepts_more(**w))
            .count();

        for (priority, task_id) in ready_queue.iter() {
            if open_workers == 0 {
                log::debug!("All workers are occupied, ending scheduling pass");
                break;
            }
            let task = task_map.get_task_mut(task_id);
            debug_assert!(task.is_ready());
            let config_key = Rc::as_ptr(&task.configuration) as usize;
            if self.failed_configurations.contains(&config_key) {
                continue;
            }

            let placed = if task.configuration.resources.is_multi_node() {
                match find_workers_for_mn_task(
                    task,
                    worker_map,
                    worker_groups,
                    &self.reservations,
                    self.now,
                ) {
                    Some(workers) => {
                        open_workers -= workers
                            .iter()
                            .filter(|w| worker_map.accepts_more(**w))
                            .count();
                        assign_mn_task(task, workers, worker_map, comm);
                        true
                    }
                    None => {
                        if let Some(held) = workers_to_hold_for_mn_task(
                            task,
                            worker_map,
                            worker_groups,
                            &self.reservations,
                            self.now,
                        ) {
                            for worker_id in held {
                                self.reservations.insert(worker_id, queue_rank(task));
                            }
                        }
                        false
                    }
                }
            } else {
                match self.choose_worker(task, &worker_ids, worker_map) {
                    Some(worker_id) => {
                        let was_open = worker_map.accepts_more(worker_id);
                        let assigned = assign_sn_task(task, worker_id, worker_map, comm);
                        if was_open && !worker_map.accepts_more(worker_id) {
                            open_workers -= 1;
                        }
                        assigned
                    }
                    None => {
                        if let Some(worker_id) = self.worker_to_hold(task, &worker_ids, worker_map) {
                            self.reservations.insert(worker_id, queue_rank(task));
                        }
                        false
                    }
                }
            };

            if placed {
                self.assigned.push((task_id, priority, task.submit_seq));
                self.served_jobs.push((priority, task_id.job_id()));
            } else {
                log::trace!("Task {task_id} does not fit any worker now");
                self.failed_configurations.insert(config_key);
            }
        }

        for (task_id, priority, seq) in self.assigned.drain(..) {
            assert!(ready_queue.remove(task_id, priority, seq));
        }
        for (priority, job_id) in self.served_jobs.drain(..) {
            ready_queue.job_served(priority, job_id);
        }
    }

    /// Best fit: the worker that is left with the least free units of the first
    /// requested kind; ties are broken by the lowest worker id.
    fn choose_worker(
        &self,
        task: &Task,
        worker_ids: &[WorkerId],
        worker_map: &WorkerMap,
    ) -> Option<WorkerId> {
        let rq = &task.configuration.resources;
        let key_kind = rq.entries().first()?.resource_id;
        let rank = queue_rank(task);
        let mut best: Option<(u64, WorkerId)> = None;
        for &worker_id in worker_ids {
            if is_reserved_against(&self.reservations, worker_id, rank) {
                continue;
            }
            let worker = worker_map.get_worker(worker_id);
            if !worker.is_capable_now(rq, self.now) {
                continue;
            }
            let key = (worker.pool().free_units_of(key_kind), worker_id);
            if best.is_none_or(|b| key < b) {
                best = Some(key);
            }
        }
        best.map(|(_, worker_id)| worker_id)
    }

    /// A worker that could run the task when its current tasks finish
    fn worker_to_hold(
        &self,
        task: &Task,
        worker_ids: &[WorkerId],
        worker_map: &WorkerMap,
    ) -> Option<WorkerId> {
        let rq: &ResourceRequest = &task.configuration.resources;
        let key_kind = rq.entries().first()?.resource_id;
        worker_ids
            .iter()
            .filter(|worker_id| !self.reservations.contains_key(*worker_id))
            .map(|worker_id| worker_map.get_worker(*worker_id))
            .filter(|worker| {
                worker.accepts_sn_tasks()
                    && worker.has_time_to_run(rq.min_time(), self.now)
                    && worker.pool().is_capable_to_run(rq)
            })
            .max_by_key(|worker| {
                (
                    worker.pool().free_units_of(key_kind),
                    std::cmp::Reverse(worker.id),
                )
            })
            .map(|worker| worker.id)
    }
}

fn assign_sn_task(
    task: &mut Task,
    worker_id: WorkerId,
    worker_map: &mut WorkerMap,
    comm: &mut impl Comm,
) -> bool {
    let worker = worker_map.get_worker_mut(worker_id);
    let Some(allocation) = worker.pool.try_allocate(&task.configuration.resources) else {
        return false;
    };
    worker.insert_sn_task(task.id, &allocation);
    log::debug!("Task {} assigned to worker {}", task.id, worker_id);
    let message = task.make_compute_message(allocation.clone(), Vec::new(), Vec::new());
    task.state = TaskRuntimeState::Assigned(Assignment::Single {
        worker_id,
        allocation: Box::new(allocation),
    });
    comm.send_worker_message(worker_id, &message);
    comm.client()
        .on_task_assigned(task.id, task.instance_id, &[worker_id]);
    true
}

fn assign_mn_task(
    task: &mut Task,
    workers: Vec<WorkerId>,
    worker_map: &mut WorkerMap,
    comm: &mut impl Comm,
) {
    let root = workers[0];
    let node_list: Vec<String> = workers
        .iter()
        .map(|worker_id| worker_map.get_worker(*worker_id).configuration.hostname.clone())
        .collect();
    for (i, worker_id) in workers.iter().enumerate() {
        worker_map
            .get_worker_mut(*worker_id)
            .set_mn_task(task.id, i != 0);
    }
    log::debug!("Multi-node task {} assigned to workers {:?}", task.id, workers);

    for worker_id in &workers[1..] {
        comm.send_worker_message(
            *worker_id,
            &ToWorkerMessage::ReserveForTask(MnReservationMsg {
                id: task.id,
                instance_id: task.instance_id,
                root,
            }),
        );
    }
    let message = task.make_compute_message(Default::default(), node_list, workers[1..].to_vec());
    comm.send_worker_message(root, &message);
    comm.client()
        .on_task_assigned(task.id, task.instance_id, &workers);
    task.state = TaskRuntimeState::Assigned(Assignment::Multi { workers });
}
