use std::fmt;

/// Value carried by a channel. A null value means "nothing to show" and is
/// written as 0 by the Paraver backend.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Int64(i64),
    Double(f64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(i) => Some(*i),
            _ => None,
        }
    }

    /// Integer representation used by the row based backends.
    pub fn to_row_value(&self) -> i64 {
        match self {
            Value::Null => 0,
            Value::Int64(i) => *i,
            Value::Double(d) => *d as i64,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int64(i)
    }
}

impl From<Option<i64>> for Value {
    fn from(i: Option<i64>) -> Self {
        i.map_or(Value::Null, Value::Int64)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int64(i) => write!(f, "int64:{}", i),
            Value::Double(d) => write!(f, "double:{:e}", d),
        }
    }
}
