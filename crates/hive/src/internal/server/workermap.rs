use crate::WorkerId;
use crate::internal::common::Map;
use crate::internal::server::worker::Worker;

/// Connected workers by id
#[derive(Default, Debug)]
pub struct WorkerMap {
    workers: Map<WorkerId, Worker>,
}

impl WorkerMap {
    pub fn add(&mut self, worker: Worker) {
        let worker_id = worker.id;
        if self.workers.insert(worker_id, worker).is_some() {
            panic!("Worker {worker_id} connected twice");
        }
    }

    pub fn take(&mut self, worker_id: WorkerId) -> Worker {
        self.workers
            .remove(&worker_id)
            .unwrap_or_else(|| panic!("Worker {worker_id} cannot be removed, it is not connected"))
    }

    pub fn get_worker(&self, worker_id: WorkerId) -> &Worker {
        match self.workers.get(&worker_id) {
            Some(worker) => worker,
            None => panic!("Worker {worker_id} is not connected"),
        }
    }

    pub fn get_worker_mut(&mut self, worker_id: WorkerId) -> &mut Worker {
        match self.workers.get_mut(&worker_id) {
            Some(worker) => worker,
            None => panic!("Worker {worker_id} is not connected"),
        }
    }

    #[inline]
    pub fn find_worker(&self, worker_id: WorkerId) -> Option<&Worker> {
        self.workers.get(&worker_id)
    }

    #[inline]
    pub fn find_worker_mut(&mut self, worker_id: WorkerId) -> Option<&mut Worker> {
        self.workers.get_mut(&worker_id)
    }

    #[inline]
    pub fn is_connected(&self, worker_id: WorkerId) -> bool {
        self.workers.contains_key(&worker_id)
    }

    /// A worker that can still take a single-node task in the current scheduling pass
    pub fn accepts_more(&self, worker_id: WorkerId) -> bool {
        let worker = self.get_worker(worker_id);
        worker.accepts_sn_tasks() && !worker.pool().is_exhausted()
    }

    /// Worker ids in a stable order, scheduling and listings walk workers in this order
    pub fn sorted_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn n_idle(&self) -> usize {
        self.workers.values().filter(|worker| worker.is_free()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
