use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("stream '{stream}' at offset {offset}: {msg}")]
    Format {
        stream: String,
        offset: usize,
        msg: String,
    },

    #[error("stream '{stream}' at offset {offset}: clock goes backwards {last} -> {clock}")]
    ClockBackwards {
        stream: String,
        offset: usize,
        last: i64,
        clock: i64,
    },

    #[error("{0}")]
    State(String),

    #[error("channel '{chan}': {msg}")]
    Chan { chan: String, msg: String },

    #[error("configuration: {0}")]
    Config(String),

    #[error("metadata {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("event {mcv} at clock {clock} in stream '{stream}' (offset {offset}): {source}")]
    Event {
        stream: String,
        offset: usize,
        mcv: String,
        clock: i64,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }

    pub fn chan(chan: &str, msg: impl Into<String>) -> Self {
        Error::Chan {
            chan: chan.to_owned(),
            msg: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn format(stream: &str, offset: usize, msg: impl Into<String>) -> Self {
        Error::Format {
            stream: stream.to_owned(),
            offset,
            msg: msg.into(),
        }
    }
}
