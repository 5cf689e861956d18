use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use bincode::Options;

use crate::TASKHIVE_VERSION;
use crate::common::serialization::bincode_config;
use crate::server::event::Event;
use crate::server::event::journal::{HIVE_JOURNAL_HEADER, Journal, journal_error};

/// Streams server events into a file on disk.
pub struct JournalWriter {
    file: BufWriter<File>,
}

impl JournalWriter {
    /// Opens the journal for appending.
    /// When `truncate` is set, everything after that position is dropped first
    /// (used to remove a partially written record after a crash).
    pub fn create_or_append(path: &Path, truncate: Option<u64>) -> crate::Result<Self> {
        let mut raw_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| journal_error(format!("Cannot open {}: {e}", path.display())))?;

        let position = if let Some(size) = truncate {
            raw_file.set_len(size)?;
            size
        } else {
            raw_file.metadata()?.len()
        };

        raw_file.seek(SeekFrom::Start(position))?;
        let mut file = BufWriter::new(raw_file);

        if position == 0 && file.stream_position()? == 0 {
            Self::write_header(&mut file)?;
        };

        Ok(Self { file })
    }

    fn write_header(mut file: &mut BufWriter<File>) -> crate::Result<()> {
        file.write_all(HIVE_JOURNAL_HEADER)?;
        bincode_config()
            .serialize_into(&mut file, TASKHIVE_VERSION)
            .map_err(journal_error)?;
        file.flush()?;
        Ok(())
    }

    pub fn finish(mut self) -> crate::Result<()> {
        self.file.flush().map_err(journal_error)
    }
}

impl Journal for JournalWriter {
    fn store(&mut self, event: &Event) -> crate::Result<()> {
        bincode_config()
            .serialize_into(&mut self.file, event)
            .map_err(journal_error)
    }

    fn flush(&mut self) -> crate::Result<()> {
        self.file.flush().map_err(journal_error)
    }
}
