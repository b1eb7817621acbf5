use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::recorder::{Emit, Recorder, Table};
use crate::stream::Timestamp;
use crate::value::Value;

/// One Paraver event line: `2:cpu:appl:task:thread:time:type:value`.
#[derive(Serialize, Copy, Clone)]
struct PrvRecord {
    kind: u8,
    cpu: u8,
    appl: u8,
    task: u8,
    row: usize,
    time: i64,
    type_id: u32,
    value: i64,
}

fn header(duration: i64, nrows: usize) -> String {
    // Fixed width, so it can be rewritten in place when the duration is known
    format!(
        "#Paraver (19/01/38 at 03:14):{:020}_ns:0:1:1({}:1)\n",
        duration, nrows
    )
}

/// Writes the events of one table into a `.prv` file.
pub struct PrvWriter {
    path: PathBuf,
    nrows: usize,
    writer: Option<csv::Writer<File>>,
    last: BTreeMap<(usize, u32), i64>,
}

impl PrvWriter {
    pub fn create<P: AsRef<Path>>(path: P, nrows: usize) -> Result<Self> {
        let path = path.as_ref().to_owned();
        println!("Generating trace file {:?}", path);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        file.write_all(header(0, nrows).as_bytes())
            .map_err(|e| Error::io(&path, e))?;
        let writer = csv::WriterBuilder::new()
            .delimiter(b':')
            .has_headers(false)
            .from_writer(file);
        Ok(PrvWriter {
            path,
            nrows,
            writer: Some(writer),
            last: BTreeMap::new(),
        })
    }

    pub fn emit(&mut self, time: Timestamp, emit: &Emit, value: Value) -> Result<()> {
        let writer = match &mut self.writer {
            Some(writer) => writer,
            None => return Err(Error::state(format!("{:?} already closed", self.path))),
        };
        if emit.row >= self.nrows {
            return Err(Error::state(format!(
                "{:?}: row {} out of range",
                self.path, emit.row
            )));
        }
        let value = value.to_row_value();
        let key = (emit.row, emit.type_id);
        if !emit.dup && self.last.get(&key) == Some(&value) {
            return Ok(());
        }
        self.last.insert(key, value);
        writer.serialize(PrvRecord {
            kind: 2,
            cpu: 0,
            appl: 1,
            task: 1,
            // Paraver rows start at 1
            row: emit.row + 1,
            time: time.0,
            type_id: emit.type_id,
            value,
        })?;
        Ok(())
    }

    /// Flushes the events and rewrites the header with the final duration.
    pub fn close(&mut self, last: Timestamp) -> Result<()> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => return Ok(()),
        };
        let mut file = writer
            .into_inner()
            .map_err(|e| Error::io(&self.path, e.into_error()))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| Error::io(&self.path, e))?;
        file.write_all(header(last.0, self.nrows).as_bytes())
            .map_err(|e| Error::io(&self.path, e))?;
        debug!("closed {:?} at {}", self.path, last);
        Ok(())
    }
}

/// Paraver recorder with one trace per table.
pub struct PrvRecorder {
    thread: PrvWriter,
    cpu: PrvWriter,
}

impl PrvRecorder {
    pub fn create<P: AsRef<Path>>(dir: P, nthreads: usize, ncpus: usize) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(PrvRecorder {
            thread: PrvWriter::create(dir.join("thread.prv"), nthreads)?,
            cpu: PrvWriter::create(dir.join("cpu.prv"), ncpus)?,
        })
    }
}

impl Recorder for PrvRecorder {
    fn emit(&mut self, time: Timestamp, emit: &Emit, value: Value) -> Result<()> {
        match emit.table {
            Table::Thread => self.thread.emit(time, emit, value),
            Table::Cpu => self.cpu.emit(time, emit, value),
        }
    }

    fn close(&mut self, last: Timestamp) -> Result<()> {
        self.thread.close(last)?;
        self.cpu.close(last)
    }
}
