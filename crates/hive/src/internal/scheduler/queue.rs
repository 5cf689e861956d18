use crate::{JobId, Priority, TaskId};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, btree_set};

/// How tasks of the same priority are ordered.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum EqualPriorityPolicy {
    /// Submission order
    #[default]
    Fifo,
    /// Jobs take turns, each job in its submission order
    RoundRobinJobs,
}

type SeqKey = (u64, TaskId);

#[derive(Debug)]
enum LevelQueue {
    Fifo(BTreeSet<SeqKey>),
    RoundRobin {
        jobs: BTreeMap<JobId, BTreeSet<SeqKey>>,
        // The job that gets the first chance in the next pass
        cursor: JobId,
    },
}

impl LevelQueue {
    fn new(policy: EqualPriorityPolicy) -> Self {
        match policy {
            EqualPriorityPolicy::Fifo => LevelQueue::Fifo(Default::default()),
            EqualPriorityPolicy::RoundRobinJobs => LevelQueue::RoundRobin {
                jobs: Default::default(),
                cursor: JobId::new(0),
            },
        }
    }

    fn insert(&mut self, key: SeqKey) -> bool {
        match self {
            LevelQueue::Fifo(set) => set.insert(key),
            LevelQueue::RoundRobin { jobs, .. } => {
                jobs.entry(key.1.job_id()).or_default().insert(key)
            }
        }
    }

    fn remove(&mut self, key: &SeqKey) -> bool {
        match self {
            LevelQueue::Fifo(set) => set.remove(key),
            LevelQueue::RoundRobin { jobs, .. } => {
                let job_id = key.1.job_id();
                let Some(set) = jobs.get_mut(&job_id) else {
                    return false;
                };
                let removed = set.remove(key);
                if set.is_empty() {
                    jobs.remove(&job_id);
                }
                removed
            }
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            LevelQueue::Fifo(set) => set.is_empty(),
            LevelQueue::RoundRobin { jobs, .. } => jobs.is_empty(),
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = TaskId> + '_> {
        match self {
            LevelQueue::Fifo(set) => Box::new(set.iter().map(|(_, task_id)| *task_id)),
            LevelQueue::RoundRobin { jobs, cursor } => {
                let iters = jobs
                    .range(*cursor..)
                    .chain(jobs.range(..*cursor))
                    .map(|(_, set)| set.iter())
                    .collect();
                Box::new(Interleave { iters, pos: 0 })
            }
        }
    }
}

/// Takes one item from each iterator in turn until all of them are exhausted.
struct Interleave<'a> {
    iters: Vec<btree_set::Iter<'a, SeqKey>>,
    pos: usize,
}

impl Iterator for Interleave<'_> {
    type Item = TaskId;

    fn next(&mut self) -> Option<TaskId> {
        while !self.iters.is_empty() {
            let idx = self.pos % self.iters.len();
            match self.iters[idx].next() {
                Some((_, task_id)) => {
                    self.pos = idx + 1;
                    return Some(*task_id);
                }
                None => {
                    self.iters.remove(idx);
                    self.pos = idx;
                }
            }
        }
        None
    }
}

/// Queue of Ready tasks ordered by user priority (higher first) and then by the
/// equal-priority policy.
#[derive(Debug)]
pub struct ReadyQueue {
    policy: EqualPriorityPolicy,
    levels: BTreeMap<Reverse<Priority>, LevelQueue>,
    len: usize,
}

impl Default for ReadyQueue {
    fn default() -> Self {
        ReadyQueue::new(EqualPriorityPolicy::default())
    }
}

impl ReadyQueue {
    pub fn new(policy: EqualPriorityPolicy) -> Self {
        ReadyQueue {
            policy,
            levels: Default::default(),
            len: 0,
        }
    }

    pub fn policy(&self) -> EqualPriorityPolicy {
        self.policy
    }

    pub fn push(&mut self, task_id: TaskId, priority: Priority, seq: u64) {
        let policy = self.policy;
        let inserted = self
            .levels
            .entry(Reverse(priority))
            .or_insert_with(|| LevelQueue::new(policy))
            .insert((seq, task_id));
        assert!(inserted, "Task {task_id} is already in the ready queue");
        self.len += 1;
    }

    pub fn remove(&mut self, task_id: TaskId, priority: Priority, seq: u64) -> bool {
        let Some(level) = self.levels.get_mut(&Reverse(priority)) else {
            return false;
        };
        let removed = level.remove(&(seq, task_id));
        if level.is_empty() {
            self.levels.remove(&Reverse(priority));
        }
        if removed {
            self.len -= 1;
        }
        removed
    }

    /// Moves the round-robin cursor behind the job that was just served
    pub fn job_served(&mut self, priority: Priority, job_id: JobId) {
        if let Some(LevelQueue::RoundRobin { cursor, .. }) = self.levels.get_mut(&Reverse(priority))
        {
            *cursor = JobId::new(job_id.as_num() + 1);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Tasks in the order in which they are offered to workers
    pub fn iter(&self) -> impl Iterator<Item = (Priority, TaskId)> + '_ {
        self.levels
            .iter()
            .flat_map(|(priority, level)| level.iter().map(move |task_id| (priority.0, task_id)))
    }
}
