use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::{debug, info};

use crate::error::Result;
use crate::serialize::STREAM_HEADER_SIZE;
use crate::stream::{ClockCheck, StepStatus, Stream, Timestamp};

/// Merges all the streams into one sequence of events ordered by corrected
/// clock. Events with the same clock come in stream index order.
#[derive(Debug)]
pub struct Player {
    streams: Vec<Stream>,
    // Hack: This is a max heap so reverse the values as they go in.
    heap: BinaryHeap<Reverse<(Timestamp, usize)>>,
    started: bool,
    current: Option<usize>,
    first_clock: Option<Timestamp>,
    last_clock: Timestamp,
    nprocessed: u64,
}

impl Player {
    pub fn new(streams: Vec<Stream>) -> Self {
        Player {
            streams,
            heap: BinaryHeap::new(),
            started: false,
            current: None,
            first_clock: None,
            last_clock: Timestamp(0),
            nprocessed: 0,
        }
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn stream(&self, index: usize) -> &Stream {
        &self.streams[index]
    }

    /// Streams can only be modified before the first step.
    pub fn stream_mut(&mut self, index: usize) -> &mut Stream {
        &mut self.streams[index]
    }

    pub fn set_clock_check(&mut self, check: ClockCheck) {
        for stream in &mut self.streams {
            stream.set_clock_check(check);
        }
    }

    /// Loads the first event of every active stream.
    fn start(&mut self) -> Result<()> {
        for (i, stream) in self.streams.iter_mut().enumerate() {
            if !stream.is_active() {
                continue;
            }
            if let StepStatus::Event = stream.step()? {
                if let Some(clock) = stream.clock() {
                    self.heap.push(Reverse((clock, i)));
                }
            }
        }
        self.started = true;
        debug!("player: {} active streams", self.heap.len());
        Ok(())
    }

    /// Advances the stream of the previous event and selects the stream with
    /// the next event. Returns `None` when all streams are exhausted.
    pub fn step(&mut self) -> Result<Option<usize>> {
        if !self.started {
            self.start()?;
        }

        if let Some(i) = self.current.take() {
            let stream = &mut self.streams[i];
            if let StepStatus::Event = stream.step()? {
                if let Some(clock) = stream.clock() {
                    self.heap.push(Reverse((clock, i)));
                }
            }
        }

        let Some(Reverse((clock, i))) = self.heap.pop() else {
            info!("player: all streams exhausted");
            return Ok(None);
        };

        if self.first_clock.is_none() {
            self.first_clock = Some(clock);
        }
        self.last_clock = clock;
        self.current = Some(i);
        self.nprocessed += 1;
        Ok(Some(i))
    }

    /// Stream holding the current event.
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn first_clock(&self) -> Option<Timestamp> {
        self.first_clock
    }

    pub fn last_clock(&self) -> Timestamp {
        self.last_clock
    }

    /// Time of the current event relative to the first one.
    pub fn elapsed(&self) -> Timestamp {
        self.last_clock - self.first_clock.unwrap_or(self.last_clock)
    }

    pub fn nprocessed(&self) -> u64 {
        self.nprocessed
    }

    /// Fraction of the event bytes of all streams already consumed.
    pub fn progress(&self) -> f64 {
        let (done, total) = self.streams.iter().fold((0, 0), |(done, total), s| {
            (
                done + s.offset() - STREAM_HEADER_SIZE,
                total + s.size() - STREAM_HEADER_SIZE,
            )
        });
        if total == 0 {
            return 1.0;
        }
        done as f64 / total as f64
    }
}
