use log::info;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::connection::Connection;

/// Appends analyzed connections to a file, one JSON object per line.
pub struct ConnectionLog<W: Write = BufWriter<File>> {
    writer: W,
    written: u64,
}

impl ConnectionLog {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!("Writing connection records to {}", path.display());
        Ok(ConnectionLog::new(BufWriter::new(file)))
    }
}

impl<W: Write> ConnectionLog<W> {
    pub fn new(writer: W) -> Self {
        ConnectionLog { writer, written: 0 }
    }

    pub fn write(&mut self, conn: &Connection) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, conn)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
