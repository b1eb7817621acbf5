use std::fmt;
use std::fs::File;
use std::ops::Deref;
use std::path::Path;

use derive_more::{Add, Display, From, Sub};
use log::{debug, warn};
use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::serialize::{
    Event, STREAM_HEADER_SIZE, STREAM_VERSION, event_size, parse_event, parse_stream_header,
};

/// Corrected clock in nanoseconds: the raw event clock plus the clock offset
/// of the loom the stream belongs to.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Add, Sub, From, Display,
)]
pub struct Timestamp(pub i64 /* ns */);

enum StreamBuf {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for StreamBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            StreamBuf::Mapped(m) => m,
            StreamBuf::Owned(v) => v,
        }
    }
}

impl fmt::Debug for StreamBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamBuf::Mapped(m) => write!(f, "Mapped({} bytes)", m.len()),
            StreamBuf::Owned(v) => write!(f, "Owned({} bytes)", v.len()),
        }
    }
}

/// What to do when the corrected clock of a stream goes backwards.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ClockCheck {
    #[default]
    Fatal,
    Warn,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StepStatus {
    /// A new current event is available.
    Event,
    /// No more events, the stream is now inactive.
    Exhausted,
}

/// The events of one thread, read sequentially out of a mapped file.
#[derive(Debug)]
pub struct Stream {
    relpath: String,
    buf: StreamBuf,
    offset: usize,
    active: bool,
    cur: Option<Event>,
    clock_offset: i64,
    lastclock: Timestamp,
    clock_check: ClockCheck,
    nevents: u64,
}

impl Stream {
    /// Maps the stream file at `path`. `relpath` is the name used in
    /// messages, usually the path relative to the trace directory.
    pub fn load<P: AsRef<Path>>(path: P, relpath: &str) -> Result<Stream> {
        let path = path.as_ref();
        debug!("loading stream {}", relpath);
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let len = file.metadata().map_err(|e| Error::io(path, e))?.len();
        if len == 0 {
            return Err(Error::format(relpath, 0, "stream is empty"));
        }
        // SAFETY: stream files are written once by the tracing runtime and are
        // only read here; nothing truncates them during the replay.
        let map = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))?;
        Stream::from_buf(relpath, StreamBuf::Mapped(map))
    }

    /// Builds a stream from an in-memory buffer, header included.
    pub fn from_bytes(relpath: &str, bytes: Vec<u8>) -> Result<Stream> {
        Stream::from_buf(relpath, StreamBuf::Owned(bytes))
    }

    fn from_buf(relpath: &str, buf: StreamBuf) -> Result<Stream> {
        if buf.len() < STREAM_HEADER_SIZE {
            return Err(Error::format(relpath, 0, "incomplete stream header"));
        }
        let (_, version) = parse_stream_header(&buf)
            .map_err(|_| Error::format(relpath, 0, "wrong stream magic"))?;
        if version != STREAM_VERSION {
            return Err(Error::format(
                relpath,
                4,
                format!(
                    "stream version mismatch {} (expected {})",
                    version, STREAM_VERSION
                ),
            ));
        }

        let active = buf.len() > STREAM_HEADER_SIZE;
        if !active {
            warn!("stream '{}' has zero events", relpath);
        }

        Ok(Stream {
            relpath: relpath.to_owned(),
            buf,
            offset: STREAM_HEADER_SIZE,
            active,
            cur: None,
            clock_offset: 0,
            lastclock: Timestamp(0),
            clock_check: ClockCheck::default(),
            nevents: 0,
        })
    }

    pub fn relpath(&self) -> &str {
        &self.relpath
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Byte offset of the current event (or of the end of the stream).
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn event(&self) -> Option<&Event> {
        self.cur.as_ref()
    }

    /// Corrected clock of the current event.
    pub fn clock(&self) -> Option<Timestamp> {
        self.cur.as_ref().map(|_| self.lastclock)
    }

    pub fn lastclock(&self) -> Timestamp {
        self.lastclock
    }

    pub fn clock_offset(&self) -> i64 {
        self.clock_offset
    }

    pub fn nevents(&self) -> u64 {
        self.nevents
    }

    pub fn set_clock_check(&mut self, check: ClockCheck) {
        self.clock_check = check;
    }

    /// Sets the clock offset. Only allowed before the first step.
    pub fn set_clock_offset(&mut self, offset: i64) -> Result<()> {
        if self.nevents > 0 || self.offset != STREAM_HEADER_SIZE {
            return Err(Error::format(
                &self.relpath,
                self.offset,
                "cannot set the clock offset of a started stream",
            ));
        }
        self.clock_offset = offset;
        Ok(())
    }

    fn corrected(&self, ev: &Event) -> Result<Timestamp> {
        i64::try_from(ev.header.clock)
            .ok()
            .and_then(|clock| clock.checked_add(self.clock_offset))
            .map(Timestamp)
            .ok_or_else(|| {
                Error::format(
                    &self.relpath,
                    self.offset,
                    format!(
                        "clock {} with offset {} is out of range",
                        ev.header.clock, self.clock_offset
                    ),
                )
            })
    }

    /// Moves past the current event (if any) and decodes the next one.
    pub fn step(&mut self) -> Result<StepStatus> {
        if !self.active {
            return Err(Error::format(
                &self.relpath,
                self.offset,
                "stream is inactive, cannot step",
            ));
        }

        // Only move the offset if we have loaded an event
        if let Some(ev) = self.cur.take() {
            self.offset += ev.size();

            if self.offset > self.buf.len() {
                return Err(Error::format(
                    &self.relpath,
                    self.offset,
                    format!("offset exceeds stream size {}", self.buf.len()),
                ));
            }

            if self.offset == self.buf.len() {
                self.active = false;
                return Ok(StepStatus::Exhausted);
            }
        }

        let rest = &self.buf[self.offset..];
        let size = event_size(rest)
            .filter(|size| *size <= rest.len())
            .ok_or_else(|| {
                Error::format(&self.relpath, self.offset, "stream ends with incomplete event")
            })?;
        let (_, ev) = parse_event(&rest[..size]).map_err(|_| {
            Error::format(&self.relpath, self.offset, "cannot decode event")
        })?;

        let clock = self.corrected(&ev)?;
        // Negative offsets can move the first clock below zero
        if self.nevents > 0 && clock < self.lastclock {
            match self.clock_check {
                ClockCheck::Fatal => {
                    return Err(Error::ClockBackwards {
                        stream: self.relpath.clone(),
                        offset: self.offset,
                        last: self.lastclock.0,
                        clock: clock.0,
                    });
                }
                ClockCheck::Warn => warn!(
                    "clock goes backwards {} -> {} in stream '{}' at offset {}",
                    self.lastclock, clock, self.relpath, self.offset
                ),
            }
        }
        self.lastclock = clock;
        self.cur = Some(ev);
        self.nevents += 1;

        Ok(StepStatus::Event)
    }

    /// Fraction of the event bytes already consumed, in [0, 1].
    pub fn progress(&self) -> f64 {
        let total = self.buf.len() - STREAM_HEADER_SIZE;
        if total == 0 {
            return 1.0;
        }
        (self.offset - STREAM_HEADER_SIZE) as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::{encode_event, encode_stream_header, i32_payload};
    use proptest::prelude::*;

    fn build(clocks: &[u64]) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_stream_header(&mut buf);
        for (i, clock) in clocks.iter().enumerate() {
            if i % 2 == 0 {
                encode_event(&mut buf, b"OHp", *clock, &[]);
            } else {
                encode_event(&mut buf, b"OHx", *clock, &i32_payload(&[i as i32]));
            }
        }
        buf
    }

    #[test]
    fn test_step_to_exhaustion() {
        let mut stream = Stream::from_bytes("s", build(&[1, 2, 3])).unwrap();
        assert!(stream.is_active());
        assert!(stream.event().is_none());
        for clock in 1..=3 {
            assert_eq!(stream.step().unwrap(), StepStatus::Event);
            assert_eq!(stream.clock(), Some(Timestamp(clock)));
        }
        assert_eq!(stream.step().unwrap(), StepStatus::Exhausted);
        assert!(!stream.is_active());
        assert!(stream.event().is_none());
        assert!(stream.step().is_err());
    }

    #[test]
    fn test_zero_events() {
        let stream = Stream::from_bytes("s", build(&[])).unwrap();
        assert!(!stream.is_active());
        assert_eq!(stream.progress(), 1.0);
    }

    #[test]
    fn test_bad_header() {
        assert!(Stream::from_bytes("s", b"ovn".to_vec()).is_err());
        assert!(Stream::from_bytes("s", b"abcd\x01\x00\x00\x00".to_vec()).is_err());
        assert!(Stream::from_bytes("s", b"ovni\x02\x00\x00\x00".to_vec()).is_err());
    }

    #[test]
    fn test_truncated_event() {
        let mut buf = build(&[1, 2]);
        buf.pop();
        let mut stream = Stream::from_bytes("s", buf).unwrap();
        assert_eq!(stream.step().unwrap(), StepStatus::Event);
        assert!(matches!(stream.step(), Err(Error::Format { .. })));
    }

    #[test]
    fn test_clock_backwards() {
        let mut stream = Stream::from_bytes("s", build(&[5, 3])).unwrap();
        stream.step().unwrap();
        assert!(matches!(stream.step(), Err(Error::ClockBackwards { .. })));

        let mut stream = Stream::from_bytes("s", build(&[5, 3])).unwrap();
        stream.set_clock_check(ClockCheck::Warn);
        stream.step().unwrap();
        assert_eq!(stream.step().unwrap(), StepStatus::Event);
        assert_eq!(stream.clock(), Some(Timestamp(3)));
    }

    #[test]
    fn test_clock_offset() {
        let mut stream = Stream::from_bytes("s", build(&[100, 200])).unwrap();
        stream.set_clock_offset(-50).unwrap();
        stream.step().unwrap();
        assert_eq!(stream.clock(), Some(Timestamp(50)));
        assert!(stream.set_clock_offset(10).is_err());
    }

    #[test]
    fn test_clock_overflow() {
        let mut stream = Stream::from_bytes("s", build(&[1 << 63])).unwrap();
        assert!(matches!(stream.step(), Err(Error::Format { .. })));

        let mut stream = Stream::from_bytes("s", build(&[i64::MAX as u64])).unwrap();
        stream.set_clock_offset(1).unwrap();
        assert!(matches!(stream.step(), Err(Error::Format { .. })));

        let mut stream = Stream::from_bytes("s", build(&[i64::MAX as u64])).unwrap();
        stream.set_clock_offset(-1).unwrap();
        stream.step().unwrap();
        assert_eq!(stream.clock(), Some(Timestamp(i64::MAX - 1)));
    }

    proptest! {
        #[test]
        fn prop_step_is_monotonic(mut clocks in prop::collection::vec(0u64..1_000_000, 1..64),
                                  offset in -1_000_000i64..1_000_000) {
            clocks.sort();
            let mut stream = Stream::from_bytes("s", build(&clocks)).unwrap();
            stream.set_clock_offset(offset).unwrap();
            let mut last = None;
            let mut progress = stream.progress();
            while stream.step().unwrap() == StepStatus::Event {
                let clock = stream.clock().unwrap();
                if let Some(last) = last {
                    prop_assert!(clock >= last);
                }
                last = Some(clock);
                prop_assert!(stream.progress() >= progress);
                progress = stream.progress();
            }
            prop_assert_eq!(stream.progress(), 1.0);
            prop_assert_eq!(stream.nevents(), clocks.len() as u64);
        }

        #[test]
        fn prop_unsorted_clocks_fail(clocks in prop::collection::vec(0u64..1000, 2..32)) {
            let sorted = clocks.windows(2).all(|w| w[0] <= w[1]);
            let mut stream = Stream::from_bytes("s", build(&clocks)).unwrap();
            let mut result = Ok(StepStatus::Event);
            while let Ok(StepStatus::Event) = result {
                result = stream.step();
            }
            prop_assert_eq!(result.is_ok(), sorted);
        }
    }
}
