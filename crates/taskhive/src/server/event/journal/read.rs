use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::ops::Deref;
use std::path::Path;

use bincode::Options;

use crate::TASKHIVE_VERSION;
use crate::common::error::TaskhiveError;
use crate::common::serialization::bincode_config;
use crate::server::event::Event;
use crate::server::event::journal::{HIVE_JOURNAL_HEADER, journal_error};

/// Reads events from a journal in a streaming fashion.
///
/// A record cut short at the end of the file (the server crashed while writing it)
/// ends the iteration without an error.
pub struct JournalReader {
    source: BufReader<File>,
    /// End of the last complete record
    position: u64,
}

impl JournalReader {
    pub fn open(path: &Path) -> crate::Result<Self> {
        let mut file = BufReader::new(
            File::open(path)
                .map_err(|e| journal_error(format!("Cannot open {}: {e}", path.display())))?,
        );
        let mut header = [0u8; 8];
        file.read_exact(&mut header)
            .map_err(|_| journal_error("Invalid journal format"))?;
        if header != HIVE_JOURNAL_HEADER {
            return Err(journal_error("Invalid journal format"));
        }
        let version: String = bincode_config()
            .deserialize_from(&mut file)
            .map_err(|error| journal_error(format!("Cannot load journal header: {error}")))?;
        if version != TASKHIVE_VERSION {
            return Err(TaskhiveError::IncompatibleJournal {
                found: version,
                expected: TASKHIVE_VERSION.to_string(),
            });
        }
        let position = file.stream_position()?;
        Ok(Self {
            source: file,
            position,
        })
    }

    /// Position right after the last event that was read completely
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Iterator for JournalReader {
    type Item = crate::Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        match bincode_config().deserialize_from::<_, Event>(&mut self.source) {
            Ok(event) => match self.source.stream_position() {
                Ok(position) => {
                    self.position = position;
                    Some(Ok(event))
                }
                Err(error) => Some(Err(error.into())),
            },
            Err(error) => match error.deref() {
                bincode::ErrorKind::Io(e)
                    if matches!(e.kind(), std::io::ErrorKind::UnexpectedEof) =>
                {
                    None
                }
                _ => Some(Err(journal_error(error))),
            },
        }
    }
}
