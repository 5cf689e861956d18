mod read;
mod stream;
mod write;

pub use read::JournalReader;
pub use stream::{EventStreamMessage, EventStreamSender, start_event_streaming};
pub use write::JournalWriter;

use crate::common::error::TaskhiveError;
use crate::server::event::Event;

const HIVE_JOURNAL_HEADER: &[u8] = b"hivejl01";

/// Durable sink of server events.
pub trait Journal {
    fn store(&mut self, event: &Event) -> crate::Result<()>;

    /// Makes all stored events durable
    fn flush(&mut self) -> crate::Result<()>;
}

fn journal_error(error: impl std::fmt::Display) -> TaskhiveError {
    TaskhiveError::journal(error)
}
