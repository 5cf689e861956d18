use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::server::event::Event;
use crate::server::event::journal::Journal;
use crate::server::event::payload::EventPayload;

pub enum EventStreamMessage {
    Event(Event),
    FlushJournal(oneshot::Sender<()>),
}

pub type EventStreamSender = mpsc::UnboundedSender<EventStreamMessage>;
pub type EventStreamReceiver = mpsc::UnboundedReceiver<EventStreamMessage>;

/// Start event streaming into a journal.
/// Streaming is running on another thread to reduce overhead and interference.
///
/// Returns the sender of events, a receiver that gets a message if writing into the
/// journal fails, and a future that resolves once the streaming thread finishes.
/// The thread finishes after `ServerStop` is written, on a write error or when all
/// senders are dropped.
pub fn start_event_streaming<J: Journal + Send + 'static>(
    journal: J,
    flush_period: Duration,
) -> (
    EventStreamSender,
    oneshot::Receiver<String>,
    impl Future<Output = ()>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (failure_sender, failure_receiver) = oneshot::channel();
    let handle = std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(error) => {
                let _ = failure_sender.send(format!("Cannot start journal runtime: {error}"));
                return;
            }
        };

        if let Err(error) = runtime.block_on(streaming_process(journal, rx, flush_period)) {
            log::error!("Event streaming has ended with an error: {error}");
            let _ = failure_sender.send(error.to_string());
        } else {
            log::debug!("Event streaming has finished successfully");
        }
    });
    let end_fut = async move {
        if handle.join().is_err() {
            log::error!("Event streaming thread has crashed");
        }
    };
    (tx, failure_receiver, end_fut)
}

async fn streaming_process<J: Journal>(
    mut journal: J,
    mut receiver: EventStreamReceiver,
    flush_period: Duration,
) -> crate::Result<()> {
    let mut flush_fut = tokio::time::interval(flush_period);
    let mut events: u64 = 0;
    loop {
        tokio::select! {
            _ = flush_fut.tick() => {
                journal.flush()?;
            }
            res = receiver.recv() => {
                match res {
                    Some(EventStreamMessage::Event(event)) => {
                        log::trace!("Event: {event:?}");
                        let end = matches!(event.payload, EventPayload::ServerStop);
                        journal.store(&event)?;
                        events += 1;
                        if end {
                            break
                        }
                    }
                    Some(EventStreamMessage::FlushJournal(callback)) => {
                        journal.flush()?;
                        let _ = callback.send(());
                    }
                    None => break
                }
            }
        }
    }
    journal.flush()?;

    log::debug!("Written {events} event(s) into the journal");
    Ok(())
}
