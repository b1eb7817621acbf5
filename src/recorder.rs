use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;
use crate::stream::Timestamp;
use crate::value::Value;

/// Which output table a row belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Thread,
    Cpu,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Thread => "thread",
            Table::Cpu => "cpu",
        }
    }
}

/// Registration of a channel as a source of one (row, type) series.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Emit {
    pub table: Table,
    pub row: usize,
    pub type_id: u32,
    /// Emit a value even if it is the same as the previous one of the row.
    pub dup: bool,
}

impl Emit {
    pub fn thread(row: usize, type_id: u32) -> Self {
        Emit {
            table: Table::Thread,
            row,
            type_id,
            dup: true,
        }
    }

    pub fn cpu(row: usize, type_id: u32) -> Self {
        Emit {
            table: Table::Cpu,
            row,
            type_id,
            dup: true,
        }
    }

    pub fn skip_dup(mut self) -> Self {
        self.dup = false;
        self
    }
}

/// Sink of the flushed channel values. `time` is relative to the first event
/// of the replay.
pub trait Recorder {
    fn emit(&mut self, time: Timestamp, emit: &Emit, value: Value) -> Result<()>;

    fn close(&mut self, _last: Timestamp) -> Result<()> {
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullRecorder;

impl Recorder for NullRecorder {
    fn emit(&mut self, _time: Timestamp, _emit: &Emit, _value: Value) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Record {
    pub time: Timestamp,
    pub emit: Emit,
    pub value: Value,
}

/// Keeps every emission in memory. Clones share the same log, so a handle
/// can be kept to inspect what the emulator recorded.
#[derive(Debug, Default, Clone)]
pub struct MemRecorder {
    records: Rc<RefCell<Vec<Record>>>,
    closed: Rc<RefCell<Option<Timestamp>>>,
}

impl MemRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.borrow().clone()
    }

    /// Values emitted for one (table, row, type), in emission order.
    pub fn series(&self, table: Table, row: usize, type_id: u32) -> Vec<(Timestamp, Value)> {
        self.records
            .borrow()
            .iter()
            .filter(|r| r.emit.table == table && r.emit.row == row && r.emit.type_id == type_id)
            .map(|r| (r.time, r.value))
            .collect()
    }

    pub fn closed_at(&self) -> Option<Timestamp> {
        *self.closed.borrow()
    }
}

impl Recorder for MemRecorder {
    fn emit(&mut self, time: Timestamp, emit: &Emit, value: Value) -> Result<()> {
        self.records.borrow_mut().push(Record {
            time,
            emit: *emit,
            value,
        });
        Ok(())
    }

    fn close(&mut self, last: Timestamp) -> Result<()> {
        *self.closed.borrow_mut() = Some(last);
        Ok(())
    }
}
