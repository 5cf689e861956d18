use hive::gateway::LostWorkerReason;
use hive::worker::WorkerConfiguration;
use smallvec::SmallVec;

use crate::common::serialization::Serialized;
use crate::server::event::Event;
use crate::server::event::journal::{EventStreamMessage, EventStreamSender};
use crate::server::event::payload::EventPayload;
use crate::transfer::messages::{JobSpec, SubmitRequest};
use crate::{InstanceId, JobId, JobTaskId, WorkerId};

/// Entry point of events that are persisted into the journal.
/// Without a journal, all events are dropped.
#[derive(Clone)]
pub struct EventStreamer {
    stream_sender: Option<EventStreamSender>,
}

impl EventStreamer {
    pub fn new(stream_sender: Option<EventStreamSender>) -> Self {
        Self { stream_sender }
    }

    pub fn on_server_start(&self, server_uid: &str) {
        self.send_event(EventPayload::ServerStart {
            server_uid: server_uid.to_string(),
        });
    }

    pub fn on_server_stop(&self) {
        self.send_event(EventPayload::ServerStop);
    }

    pub fn on_worker_added(&self, id: WorkerId, configuration: WorkerConfiguration) {
        self.send_event(EventPayload::WorkerConnected(id, Box::new(configuration)));
    }

    pub fn on_worker_lost(&self, id: WorkerId, reason: LostWorkerReason) {
        self.send_event(EventPayload::WorkerLost(id, reason));
    }

    pub fn on_job_submitted(
        &self,
        job_id: JobId,
        closed_job: bool,
        request: &SubmitRequest,
    ) -> crate::Result<()> {
        if self.stream_sender.is_none() {
            // Skip serialization if there is no streaming end
            return Ok(());
        }
        self.send_event(EventPayload::Submit {
            job_id,
            closed_job,
            serialized_desc: Serialized::new(request)?,
        });
        Ok(())
    }

    pub fn on_job_opened(&self, job_id: JobId, spec: JobSpec) {
        self.send_event(EventPayload::JobOpen(job_id, spec));
    }

    pub fn on_job_closed(&self, job_id: JobId) {
        self.send_event(EventPayload::JobClose(job_id));
    }

    #[inline]
    pub fn on_job_completed(&self, job_id: JobId) {
        self.send_event(EventPayload::JobCompleted(job_id));
    }

    pub fn on_job_forgotten(&self, job_id: JobId) {
        self.send_event(EventPayload::JobForgotten(job_id));
    }

    #[inline]
    pub fn on_task_started(
        &self,
        job_id: JobId,
        task_id: JobTaskId,
        instance_id: InstanceId,
        worker_ids: SmallVec<[WorkerId; 1]>,
    ) {
        self.send_event(EventPayload::TaskStarted {
            job_id,
            task_id,
            instance_id,
            workers: worker_ids,
        });
    }

    #[inline]
    pub fn on_task_finished(&self, job_id: JobId, task_id: JobTaskId) {
        self.send_event(EventPayload::TaskFinished { job_id, task_id });
    }

    pub fn on_task_canceled(&self, job_id: JobId, task_id: JobTaskId) {
        self.send_event(EventPayload::TaskCanceled { job_id, task_id });
    }

    #[inline]
    pub fn on_task_failed(&self, job_id: JobId, task_id: JobTaskId, error: String) {
        self.send_event(EventPayload::TaskFailed {
            job_id,
            task_id,
            error,
        });
    }

    fn send_event(&self, payload: EventPayload) {
        if let Some(ref streamer) = self.stream_sender {
            if streamer
                .send(EventStreamMessage::Event(Event::now(payload)))
                .is_err()
            {
                log::error!("Event streaming queue has been closed.");
            }
        }
    }

    /// Waits until all events sent so far are written and flushed.
    pub async fn flush(&self) {
        if let Some(ref streamer) = self.stream_sender {
            let (tx, rx) = tokio::sync::oneshot::channel();
            if streamer.send(EventStreamMessage::FlushJournal(tx)).is_ok() {
                let _ = rx.await;
            }
        }
    }
}
