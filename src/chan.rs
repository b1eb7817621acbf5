use derive_more::{Display, From};
use log::trace;

use crate::error::{Error, Result};
use crate::value::Value;

/// Deepest stack a channel can hold.
pub const MAX_CHAN_STACK: usize = 128;

/// Index of a channel inside the bay.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, From, Display)]
pub struct ChanId(pub usize);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChanMode {
    Single,
    Stack,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChanProp {
    /// Writing the value the channel already holds is allowed.
    Duplicates,
    /// A dirty channel can be written again before it is flushed.
    DirtyWrite,
}

/// A named cell of derived state. Writes mark the channel dirty until the bay
/// flushes it at the end of the event, and a dirty channel refuses a second
/// write unless a property allows it.
#[derive(Debug, Clone)]
pub struct Chan {
    name: String,
    mode: ChanMode,
    duplicates: bool,
    dirty_write: bool,
    dirty: bool,
    value: Value,
    stack: Vec<Value>,
}

impl Chan {
    pub fn new(mode: ChanMode, name: impl Into<String>) -> Self {
        Chan {
            name: name.into(),
            mode,
            duplicates: false,
            dirty_write: false,
            dirty: false,
            value: Value::Null,
            stack: Vec::new(),
        }
    }

    pub fn single(name: impl Into<String>) -> Self {
        Chan::new(ChanMode::Single, name)
    }

    pub fn stack(name: impl Into<String>) -> Self {
        Chan::new(ChanMode::Stack, name)
    }

    pub fn with_prop(mut self, prop: ChanProp, enabled: bool) -> Self {
        self.set_prop(prop, enabled);
        self
    }

    pub fn set_prop(&mut self, prop: ChanProp, enabled: bool) {
        match prop {
            ChanProp::Duplicates => self.duplicates = enabled,
            ChanProp::DirtyWrite => self.dirty_write = enabled,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ChanMode {
        self.mode
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn err(&self, msg: impl Into<String>) -> Error {
        Error::chan(&self.name, msg)
    }

    pub fn set(&mut self, value: Value) -> Result<()> {
        if self.mode != ChanMode::Single {
            return Err(self.err("cannot set a stack channel"));
        }

        if self.dirty {
            if self.dirty_write {
                self.value = value;
                return Ok(());
            }
            if self.duplicates && self.value == value {
                return Ok(());
            }
            return Err(self.err(format!(
                "already dirty with {}, cannot set {}",
                self.value, value
            )));
        }

        if !self.duplicates && self.value == value {
            return Err(self.err(format!("same value as last one: {}", value)));
        }

        trace!("{}: set {}", self.name, value);
        self.value = value;
        self.dirty = true;
        Ok(())
    }

    fn check_stack(&self, op: &str) -> Result<()> {
        if self.mode != ChanMode::Stack {
            return Err(self.err(format!("cannot {} on a single channel", op)));
        }
        if self.dirty && !self.dirty_write {
            return Err(self.err(format!("already dirty, cannot {}", op)));
        }
        Ok(())
    }

    pub fn push(&mut self, value: Value) -> Result<()> {
        self.check_stack("push")?;
        if self.stack.len() >= MAX_CHAN_STACK {
            return Err(self.err("stack full"));
        }

        trace!("{}: push {}", self.name, value);
        self.stack.push(value);
        self.dirty = true;
        Ok(())
    }

    /// Pops the top of the stack, which must be `expected`.
    pub fn pop(&mut self, expected: Value) -> Result<()> {
        self.check_stack("pop")?;
        let top = match self.stack.last() {
            Some(top) => *top,
            None => return Err(self.err("cannot pop an empty stack")),
        };
        if top != expected {
            return Err(self.err(format!(
                "unexpected top of stack {}, expected {}",
                top, expected
            )));
        }

        trace!("{}: pop {}", self.name, top);
        self.stack.pop();
        self.dirty = true;
        Ok(())
    }

    /// Current value: the single value, or the top of the stack (null when
    /// empty). Reading doesn't change the dirty flag.
    pub fn read(&self) -> Value {
        match self.mode {
            ChanMode::Single => self.value,
            ChanMode::Stack => self.stack.last().copied().unwrap_or(Value::Null),
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Err(self.err("cannot flush a clean channel"));
        }
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single() {
        let mut chan = Chan::single("testchan");
        assert!(chan.push(Value::Int64(1)).is_err());
        chan.set(Value::Int64(1)).unwrap();
        assert!(chan.is_dirty());
        assert!(chan.set(Value::Int64(2)).is_err());
        assert_eq!(chan.read(), Value::Int64(1));
        // Reading keeps the channel dirty
        assert!(chan.is_dirty());
    }

    #[test]
    fn test_dirty_write() {
        let mut chan = Chan::single("testchan");
        chan.set(Value::Int64(1)).unwrap();
        assert!(chan.set(Value::Int64(2)).is_err());
        chan.flush().unwrap();

        chan.set_prop(ChanProp::DirtyWrite, true);
        chan.set(Value::Int64(3)).unwrap();
        chan.set(Value::Int64(4)).unwrap();
        assert_eq!(chan.read(), Value::Int64(4));
        chan.flush().unwrap();
        assert!(chan.flush().is_err());
    }

    #[test]
    fn test_duplicates() {
        let mut chan = Chan::single("testchan");
        chan.set(Value::Int64(1)).unwrap();
        chan.flush().unwrap();
        assert!(chan.set(Value::Int64(1)).is_err());

        chan.set_prop(ChanProp::Duplicates, true);
        chan.set(Value::Int64(1)).unwrap();
        // Same value while dirty is fine, a different one is not
        chan.set(Value::Int64(1)).unwrap();
        assert!(chan.set(Value::Int64(2)).is_err());
    }

    #[test]
    fn test_stack() {
        let mut chan = Chan::stack("teststack");
        assert!(chan.set(Value::Int64(1)).is_err());
        assert_eq!(chan.read(), Value::Null);

        chan.push(Value::Int64(1)).unwrap();
        assert!(chan.push(Value::Int64(2)).is_err());
        chan.flush().unwrap();

        chan.push(Value::Int64(2)).unwrap();
        chan.flush().unwrap();
        assert_eq!(chan.read(), Value::Int64(2));

        assert!(chan.pop(Value::Int64(1)).is_err());
        chan.pop(Value::Int64(2)).unwrap();
        chan.flush().unwrap();
        assert_eq!(chan.read(), Value::Int64(1));
        assert_eq!(chan.depth(), 1);

        chan.pop(Value::Int64(1)).unwrap();
        chan.flush().unwrap();
        assert!(chan.pop(Value::Int64(1)).is_err());
    }

    #[test]
    fn test_stack_full() {
        let mut chan = Chan::stack("deep").with_prop(ChanProp::DirtyWrite, true);
        for i in 0..MAX_CHAN_STACK {
            chan.push(Value::Int64(i as i64)).unwrap();
        }
        assert!(chan.push(Value::Int64(0)).is_err());
    }
}
