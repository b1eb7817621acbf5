use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::error::{Error, Result};

const PCF_HEADER: &str = "\
DEFAULT_OPTIONS

LEVEL               THREAD
UNITS               NANOSEC
LOOK_BACK           100
SPEED               1
FLAG_ICONS          ENABLED
NUM_OF_STATE_COLORS 1000
YMAX_SCALE          37


DEFAULT_SEMANTIC

THREAD_FUNC          State As Is
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcfType {
    pub id: u32,
    pub label: String,
    values: BTreeMap<i64, String>,
}

impl PcfType {
    /// Adds a value label. Adding the same value again is only allowed with
    /// the same label.
    pub fn add_value(&mut self, value: i64, label: &str) -> Result<()> {
        match self.values.get(&value) {
            Some(old) if old == label => Ok(()),
            Some(old) => Err(Error::state(format!(
                "pcf type {}: value {} already has label '{}', cannot set '{}'",
                self.id, value, old, label
            ))),
            None => {
                self.values.insert(value, label.to_owned());
                Ok(())
            }
        }
    }

    pub fn value(&self, value: i64) -> Option<&str> {
        self.values.get(&value).map(String::as_str)
    }

    pub fn nvalues(&self) -> usize {
        self.values.len()
    }
}

/// Event types and value labels of one Paraver trace.
#[derive(Debug, Clone, Default)]
pub struct Pcf {
    types: BTreeMap<u32, PcfType>,
}

impl Pcf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_type(&mut self, id: u32, label: &str) -> Result<&mut PcfType> {
        if self.types.contains_key(&id) {
            return Err(Error::config(format!("pcf type {} already defined", id)));
        }
        Ok(self.types.entry(id).or_insert(PcfType {
            id,
            label: label.to_owned(),
            values: BTreeMap::new(),
        }))
    }

    /// Adds a type with the given value labels.
    pub fn add_type_values(&mut self, id: u32, label: &str, values: &[(i64, &str)]) -> Result<()> {
        let ty = self.add_type(id, label)?;
        for (value, label) in values {
            ty.add_value(*value, label)?;
        }
        Ok(())
    }

    pub fn find_type(&self, id: u32) -> Option<&PcfType> {
        self.types.get(&id)
    }

    pub fn find_type_mut(&mut self, id: u32) -> Option<&mut PcfType> {
        self.types.get_mut(&id)
    }

    pub fn write_to<W: Write>(&self, mut w: W) -> io::Result<()> {
        write!(w, "{}", PCF_HEADER)?;
        for ty in self.types.values() {
            writeln!(w)?;
            writeln!(w)?;
            writeln!(w, "EVENT_TYPE")?;
            writeln!(w, "0 {:<8} {}", ty.id, ty.label)?;
            if ty.values.is_empty() {
                continue;
            }
            writeln!(w, "VALUES")?;
            for (value, label) in &ty.values {
                writeln!(w, "{:<4} {}", value, label)?;
            }
        }
        Ok(())
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        println!("Writing {:?}", path);
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut w = BufWriter::new(file);
        self.write_to(&mut w).map_err(|e| Error::io(path, e))?;
        w.flush().map_err(|e| Error::io(path, e))
    }
}
