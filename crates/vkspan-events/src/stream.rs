//! JSON-lines event stream writer.
//!
//! One event per line, flushed per write so a consumer tailing the file sees
//! events promptly even if the traced application crashes.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::event::TraceEvent;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct EventWriter<W: Write> {
    out: W,
}

impl EventWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self, StreamError> {
        let file = File::create(path)?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }
}

impl<W: Write> EventWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn write(&mut self, event: &TraceEvent) -> Result<(), StreamError> {
        serde_json::to_writer(&mut self.out, event)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
