use std::time::Duration;

use crate::internal::common::Set;
use crate::internal::common::resources::Allocation;
use crate::internal::messages::worker::ComputeTaskMsg;
use crate::launcher::StopReason;
use crate::{InstanceId, Priority, TaskId, WorkerId};
use tokio::sync::oneshot;

pub enum TaskState {
    /// Root of a multi-node task waits until all its peers hold their reservation
    WaitingForPeers(Set<WorkerId>),
    Running(StopSignal),
}

/// Delivers the reason for stopping to the future of a running task.
/// Only the first request is delivered, a timeout after a cancel stays a cancel.
pub struct StopSignal {
    sender: Option<oneshot::Sender<StopReason>>,
    requested: Option<StopReason>,
}

impl StopSignal {
    pub fn new(sender: oneshot::Sender<StopReason>) -> Self {
        Self {
            sender: Some(sender),
            requested: None,
        }
    }

    pub fn request(&mut self, reason: StopReason) {
        let Some(sender) = self.sender.take() else {
            log::debug!(
                "Stop ({reason:?}) ignored, task is already stopping ({:?})",
                self.requested
            );
            return;
        };
        self.requested = Some(reason);
        if sender.send(reason).is_err() {
            log::debug!("Stop ({reason:?}) arrived after the task ended");
        }
    }

    pub fn requested(&self) -> Option<StopReason> {
        self.requested
    }
}

pub struct Task {
    pub id: TaskId,
    pub instance_id: InstanceId,
    pub state: TaskState,
    pub user_priority: Priority,
    pub allocation: Allocation,
    pub time_limit: Option<Duration>,
    pub body: Box<[u8]>,
    /// Hostnames of a multi-node task, rank 0 first; empty otherwise
    pub node_list: Vec<String>,
}

impl Task {
    pub fn new(message: ComputeTaskMsg) -> Self {
        Self {
            id: message.id,
            instance_id: message.instance_id,
            state: TaskState::WaitingForPeers(message.mn_peers.into_iter().collect()),
            user_priority: message.user_priority,
            allocation: message.allocation,
            time_limit: message.time_limit,
            body: message.body,
            node_list: message.node_list,
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        matches!(self.state, TaskState::Running(_))
    }

    /// All peers confirmed their reservation (trivially true for single-node tasks)
    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(&self.state, TaskState::WaitingForPeers(peers) if peers.is_empty())
    }

    /// Returns false when the task is not running, there is nothing to stop then
    pub fn request_stop(&mut self, reason: StopReason) -> bool {
        match &mut self.state {
            TaskState::Running(signal) => {
                signal.request(reason);
                true
            }
            TaskState::WaitingForPeers(_) => false,
        }
    }

    pub fn stop_requested(&self) -> Option<StopReason> {
        match &self.state {
            TaskState::Running(signal) => signal.requested(),
            TaskState::WaitingForPeers(_) => None,
        }
    }

    pub fn is_multi_node(&self) -> bool {
        !self.node_list.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_stop_reason_wins() {
        let (sender, mut receiver) = oneshot::channel();
        let mut signal = StopSignal::new(sender);
        assert_eq!(signal.requested(), None);
        signal.request(StopReason::Cancel);
        signal.request(StopReason::Timeout);
        assert_eq!(signal.requested(), Some(StopReason::Cancel));
        assert_eq!(receiver.try_recv().unwrap(), StopReason::Cancel);
    }

    #[test]
    fn test_stop_after_end_is_ignored() {
        let (sender, receiver) = oneshot::channel();
        drop(receiver);
        let mut signal = StopSignal::new(sender);
        signal.request(StopReason::Timeout);
        assert_eq!(signal.requested(), Some(StopReason::Timeout));
    }
}
