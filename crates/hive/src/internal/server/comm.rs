use std::rc::Rc;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedSender;

use crate::events::EventProcessor;
use crate::internal::common::{Map, WrappedRcRefCell};
use crate::internal::messages::worker::ToWorkerMessage;
use crate::internal::transfer::auth::serialize;
use crate::WorkerId;

pub trait Comm {
    fn send_worker_message(&mut self, worker_id: WorkerId, message: &ToWorkerMessage);
    fn broadcast_worker_message(&mut self, message: &ToWorkerMessage);
    fn ask_for_scheduling(&mut self);

    /// Closes the connection of a worker that the server has already removed
    fn disconnect_worker(&mut self, worker_id: WorkerId);

    fn client(&mut self) -> &mut dyn EventProcessor;
}

pub struct CommSender {
    workers: Map<WorkerId, UnboundedSender<Bytes>>,
    need_scheduling: bool,
    scheduler_wakeup: Rc<Notify>,
    client_events: Option<Box<dyn EventProcessor>>,
}

pub type CommSenderRef = WrappedRcRefCell<CommSender>;

impl CommSenderRef {
    pub fn new(scheduler_wakeup: Rc<Notify>) -> Self {
        WrappedRcRefCell::wrap(CommSender {
            workers: Default::default(),
            scheduler_wakeup,
            client_events: None,
            need_scheduling: false,
        })
    }

    pub fn set_client_events(&self, client_events: Box<dyn EventProcessor>) {
        self.get_mut().client_events = Some(client_events);
    }
}

impl CommSender {
    pub fn add_worker(&mut self, worker_id: WorkerId, sender: UnboundedSender<Bytes>) {
        assert!(self.workers.insert(worker_id, sender).is_none());
    }

    /// Dropping the sender ends the forwarding loop, which closes the connection
    pub fn remove_worker(&mut self, worker_id: WorkerId) -> bool {
        self.workers.remove(&worker_id).is_some()
    }

    pub fn reset_scheduling_flag(&mut self) {
        self.need_scheduling = false
    }

    pub fn get_scheduling_flag(&self) -> bool {
        self.need_scheduling
    }
}

impl Comm for CommSender {
    fn send_worker_message(&mut self, worker_id: WorkerId, message: &ToWorkerMessage) {
        let data = match serialize(&message) {
            Ok(data) => data,
            Err(e) => {
                log::error!("Cannot serialize message for worker {worker_id}: {e}");
                return;
            }
        };
        match self.workers.get(&worker_id) {
            Some(sender) => {
                if sender.send(data.into()).is_err() {
                    log::debug!("Connection to worker {worker_id} is already closed");
                }
            }
            None => log::debug!("Message for disconnected worker {worker_id} was dropped"),
        }
    }

    fn broadcast_worker_message(&mut self, message: &ToWorkerMessage) {
        if self.workers.is_empty() {
            return;
        }
        let data: Bytes = match serialize(&message) {
            Ok(data) => data.into(),
            Err(e) => {
                log::error!("Cannot serialize broadcast message: {e}");
                return;
            }
        };
        for sender in self.workers.values() {
            let _ = sender.send(data.clone());
        }
    }

    #[inline]
    fn ask_for_scheduling(&mut self) {
        if !self.need_scheduling {
            self.need_scheduling = true;
            self.scheduler_wakeup.notify_one();
        }
    }

    fn disconnect_worker(&mut self, worker_id: WorkerId) {
        if self.remove_worker(worker_id) {
            log::debug!("Connection of worker {worker_id} was closed by the server");
        }
    }

    #[inline]
    fn client(&mut self) -> &mut dyn EventProcessor {
        self.client_events
            .as_mut()
            .expect("Client event processor is not set")
            .as_mut()
    }
}
