use derive_more::{Display, From};

use crate::chan::ChanId;
use crate::error::{Error, Result};
use crate::value::Value;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, From, Display)]
pub struct MuxId(pub usize);

/// Maps the current selector value to at most one input index.
pub type SelectFn = fn(&Mux, Value) -> Result<Option<usize>>;

/// Copies one of its inputs to the output channel, chosen by the value of the
/// selector channel. The bay recomputes it whenever the selector or any input
/// is flushed.
#[derive(Debug, Clone)]
pub struct Mux {
    name: String,
    select: ChanId,
    output: ChanId,
    inputs: Vec<Option<ChanId>>,
    select_fn: SelectFn,
}

impl Mux {
    pub(crate) fn new(
        name: String,
        select: ChanId,
        output: ChanId,
        select_fn: SelectFn,
        ninputs: usize,
    ) -> Self {
        Mux {
            name,
            select,
            output,
            inputs: vec![None; ninputs],
            select_fn,
        }
    }

    /// Name of the output channel, used in messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn select(&self) -> ChanId {
        self.select
    }

    pub fn output(&self) -> ChanId {
        self.output
    }

    pub fn ninputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, index: usize) -> Option<ChanId> {
        self.inputs.get(index).copied().flatten()
    }

    pub(crate) fn set_input(&mut self, index: usize, chan: ChanId) -> Result<()> {
        let ninputs = self.inputs.len();
        let slot = self.inputs.get_mut(index).ok_or_else(|| {
            Error::config(format!(
                "mux {}: input index {} out of range ({} inputs)",
                self.name, index, ninputs
            ))
        })?;
        if slot.is_some() {
            return Err(Error::config(format!(
                "mux {}: input {} already set",
                self.name, index
            )));
        }
        *slot = Some(chan);
        Ok(())
    }

    /// Runs the selection function and returns the selected input channel.
    pub(crate) fn choose(&self, selector: Value) -> Result<Option<ChanId>> {
        let index = match (self.select_fn)(self, selector)? {
            Some(index) => index,
            None => return Ok(None),
        };
        match self.input(index) {
            Some(chan) => Ok(Some(chan)),
            None => Err(Error::chan(
                &self.name,
                format!("selected input {} is not connected", index),
            )),
        }
    }
}

/// Selects the input whose index is the selector value. A null selector
/// selects nothing.
pub fn select_by_index(mux: &Mux, value: Value) -> Result<Option<usize>> {
    match value {
        Value::Null => Ok(None),
        Value::Int64(i) if i >= 0 && (i as usize) < mux.ninputs() => Ok(Some(i as usize)),
        Value::Int64(i) => Err(Error::chan(
            mux.name(),
            format!("selector index {} out of range", i),
        )),
        Value::Double(_) => Err(Error::chan(mux.name(), "selector must be an integer")),
    }
}
