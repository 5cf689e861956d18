use std::rc::Rc;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedSender;

use crate::internal::common::WrappedRcRefCell;
use crate::internal::messages::worker::FromWorkerMessage;
use crate::internal::transfer::auth::serialize;

pub struct RealWorkerComm {
    sender: Option<UnboundedSender<Bytes>>,
    worker_is_empty_notify: Option<Rc<Notify>>,
}

/// Outgoing side of the worker connection
pub enum WorkerComm {
    Real(RealWorkerComm),
    #[cfg(test)]
    Test(TestWorkerComm),
}

pub type WorkerCommRef = WrappedRcRefCell<WorkerComm>;

impl WorkerComm {
    pub fn new(sender: UnboundedSender<Bytes>) -> Self {
        WorkerComm::Real(RealWorkerComm {
            sender: Some(sender),
            worker_is_empty_notify: None,
        })
    }

    #[cfg(test)]
    pub fn new_test_comm() -> Self {
        WorkerComm::Test(TestWorkerComm::default())
    }

    #[cfg(test)]
    pub fn test(&mut self) -> &mut TestWorkerComm {
        match self {
            Self::Real(_) => panic!("Cannot get testing comm"),
            Self::Test(comm) => comm,
        }
    }

    pub fn send_message_to_server(&mut self, message: FromWorkerMessage) {
        match self {
            Self::Real(comm) => {
                let Some(sender) = comm.sender.as_ref() else {
                    log::debug!("Dropping message for the server, the connection is closed");
                    return;
                };
                match serialize(&message) {
                    Ok(data) => {
                        if sender.send(data.into()).is_err() {
                            log::debug!("Message could not be sent to server");
                        }
                    }
                    Err(e) => log::error!("Cannot serialize message for the server: {e}"),
                }
            }
            #[cfg(test)]
            Self::Test(comm) => comm.messages.push(message),
        }
    }

    pub fn notify_worker_is_empty(&mut self) {
        match self {
            Self::Real(comm) => {
                if let Some(notify) = &comm.worker_is_empty_notify {
                    log::debug!("Notifying that worker is empty");
                    notify.notify_one()
                }
            }
            #[cfg(test)]
            Self::Test(comm) => comm.empty_notifications += 1,
        }
    }

    pub fn set_idle_worker_notify(&mut self, notify: Rc<Notify>) {
        match self {
            Self::Real(comm) => comm.worker_is_empty_notify = Some(notify),
            #[cfg(test)]
            Self::Test(_) => {}
        }
    }

    /// Closes the outgoing queue; the send loop ends once the queue is drained
    pub fn drop_sender(&mut self) {
        match self {
            Self::Real(comm) => comm.sender = None,
            #[cfg(test)]
            Self::Test(_) => {}
        }
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct TestWorkerComm {
    pub messages: Vec<FromWorkerMessage>,
    pub empty_notifications: u32,
}

#[cfg(test)]
impl TestWorkerComm {
    pub fn take_messages(&mut self) -> Vec<FromWorkerMessage> {
        std::mem::take(&mut self.messages)
    }
}
