use std::collections::VecDeque;

use hive::define_wrapped_type;
use hive::worker::ChannelId;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{Receiver, Sender, channel};

use crate::common::error::TaskhiveError;
use crate::transfer::messages::StreamEvent;
use crate::{InstanceId, JobId, Map, TaskId};

pub const DEFAULT_STREAM_RETENTION: usize = 1024 * 1024;

/// Events queued for one attached client before its data starts to be dropped
pub const SUBSCRIBER_QUEUE_LENGTH: usize = 256;

/// Slots kept free in a subscriber queue for the final gap marker and EOF
const RESERVED_SLOTS: usize = 2;

#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct StreamKey {
    pub task_id: TaskId,
    pub instance_id: InstanceId,
    pub channel: ChannelId,
}

struct Chunk {
    offset: u64,
    data: Vec<u8>,
}

/// Live feed of a client attached to a stream.
///
/// A client that does not keep up loses data instead of growing the queue;
/// the lost range is reported by a gap marker as soon as the queue has room again.
struct Subscriber {
    sender: Sender<StreamEvent>,
    /// Start of the range dropped since the last delivered event
    lost_from: Option<u64>,
}

impl Subscriber {
    fn has_room(&self) -> bool {
        self.sender.capacity() > RESERVED_SLOTS
    }

    /// Returns false when the client went away
    fn send(&mut self, event: StreamEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => false,
            Err(TrySendError::Full(_)) => unreachable!("Reserved slots of a subscriber were used"),
        }
    }

    fn flush_gap(&mut self, to: u64) -> bool {
        match self.lost_from.take() {
            Some(from) => self.send(StreamEvent::Gap { from, to }),
            None => true,
        }
    }

    fn send_data(&mut self, offset: u64, data: &[u8]) -> bool {
        if self.sender.is_closed() {
            return false;
        }
        if self.lost_from.is_some() {
            if !self.has_room() {
                return true;
            }
            if !self.flush_gap(offset) {
                return false;
            }
        }
        if !self.has_room() {
            log::debug!(
                "Client does not keep up with the stream, data from offset {offset} dropped"
            );
            self.lost_from = Some(offset);
            return true;
        }
        self.send(StreamEvent::Data {
            offset,
            data: data.to_vec(),
        })
    }

    fn send_eof(mut self, offset: u64) {
        if self.flush_gap(offset) {
            self.send(StreamEvent::Eof { offset });
        }
    }
}

/// Output of one channel of one task instance.
#[derive(Default)]
struct OutputStream {
    chunks: VecDeque<Chunk>,
    /// Offset of the first retained byte
    start_offset: u64,
    /// Total number of bytes received so far
    end_offset: u64,
    retained: usize,
    closed: bool,
    subscribers: Vec<Subscriber>,
}

impl OutputStream {
    fn push(&mut self, data: Vec<u8>, retention_limit: usize) {
        let offset = self.end_offset;
        self.end_offset += data.len() as u64;
        self.subscribers
            .retain_mut(|subscriber| subscriber.send_data(offset, &data));

        self.retained += data.len();
        self.chunks.push_back(Chunk { offset, data });
        while self.retained > retention_limit {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    self.retained -= chunk.data.len();
                    self.start_offset = chunk.offset + chunk.data.len() as u64;
                }
                None => break,
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for subscriber in self.subscribers.drain(..) {
            subscriber.send_eof(self.end_offset);
        }
    }

    /// Everything retained from `offset` on, preceded by a gap marker if a part
    /// of the requested range was already evicted.
    fn backlog(&self, offset: u64) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if offset < self.start_offset {
            events.push(StreamEvent::Gap {
                from: offset,
                to: self.start_offset,
            });
        }
        for chunk in &self.chunks {
            let chunk_end = chunk.offset + chunk.data.len() as u64;
            if chunk_end <= offset {
                continue;
            }
            let skip = offset.saturating_sub(chunk.offset) as usize;
            events.push(StreamEvent::Data {
                offset: chunk.offset + skip as u64,
                data: chunk.data[skip..].to_vec(),
            });
        }
        if self.closed {
            events.push(StreamEvent::Eof {
                offset: self.end_offset,
            });
        }
        events
    }
}

/// Output that a client receives after attaching to a stream.
pub struct AttachedStream {
    /// Retained data requested by the client
    pub backlog: Vec<StreamEvent>,
    /// Live data; missing when the stream is already closed
    pub receiver: Option<Receiver<StreamEvent>>,
}

/// Retention buffers of task outputs received from workers.
pub struct StreamHub {
    streams: Map<StreamKey, OutputStream>,
    latest_instance: Map<TaskId, InstanceId>,
    retention_limit: usize,
}

define_wrapped_type!(StreamHubRef, StreamHub, pub);

impl StreamHubRef {
    pub fn new(retention_limit: usize) -> Self {
        Self(hive::WrappedRcRefCell::wrap(StreamHub {
            streams: Default::default(),
            latest_instance: Default::default(),
            retention_limit,
        }))
    }
}

impl StreamHub {
    pub fn on_output(&mut self, key: StreamKey, data: Vec<u8>, eof: bool) {
        let latest = self
            .latest_instance
            .entry(key.task_id)
            .or_insert(key.instance_id);
        if *latest < key.instance_id {
            *latest = key.instance_id;
        }
        let stream = self.streams.entry(key).or_default();
        if stream.closed {
            log::debug!("Output for closed stream {key:?} ignored");
            return;
        }
        if !data.is_empty() {
            stream.push(data, self.retention_limit);
        }
        if eof {
            stream.close();
        }
    }

    /// Most recent instance of a task that produced any output
    pub fn latest_instance(&self, task_id: TaskId) -> Option<InstanceId> {
        self.latest_instance.get(&task_id).copied()
    }

    /// Subscribes to a stream starting at `offset`.
    /// Only streams that already received some output can be attached.
    pub fn attach(&mut self, key: StreamKey, offset: u64) -> crate::Result<AttachedStream> {
        match self.streams.get_mut(&key) {
            Some(stream) => Self::subscribe(stream, offset),
            None => Err(TaskhiveError::validation(format!(
                "Channel {} of task {} (instance {}) has no output",
                key.channel, key.task_id, key.instance_id
            ))),
        }
    }

    /// Subscribes to a stream of a task instance that may still produce output;
    /// the stream is created when it did not receive anything yet.
    pub fn attach_pending(&mut self, key: StreamKey, offset: u64) -> crate::Result<AttachedStream> {
        let stream = self.streams.entry(key).or_default();
        Self::subscribe(stream, offset)
    }

    fn subscribe(stream: &mut OutputStream, offset: u64) -> crate::Result<AttachedStream> {
        if offset > stream.end_offset {
            return Err(TaskhiveError::validation(format!(
                "Offset {offset} is beyond the end of the stream ({} bytes)",
                stream.end_offset
            )));
        }
        let backlog = stream.backlog(offset);
        let receiver = if stream.closed {
            None
        } else {
            let (sender, receiver) = channel(SUBSCRIBER_QUEUE_LENGTH);
            stream.subscribers.push(Subscriber {
                sender,
                lost_from: None,
            });
            Some(receiver)
        };
        Ok(AttachedStream { backlog, receiver })
    }

    /// Drops all streams of a job; attached clients see the end of their streams.
    pub fn remove_job(&mut self, job_id: JobId) {
        self.streams.retain(|key, _| key.task_id.job_id() != job_id);
        self.latest_instance
            .retain(|task_id, _| task_id.job_id() != job_id);
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}
