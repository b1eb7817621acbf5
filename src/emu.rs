use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};

use crate::backend::pcf::Pcf;
use crate::backend::prv::PrvRecorder;
use crate::backend::row::write_row;
use crate::bay::Bay;
use crate::clkoff;
use crate::error::{Error, Result};
use crate::model::{Model, ModelSet};
use crate::models::{nosv::NosvModel, ovni::OvniModel};
use crate::player::Player;
use crate::recorder::{NullRecorder, Recorder, Table};
use crate::serialize::Event;
use crate::stream::{ClockCheck, Timestamp};
use crate::system::{LoomId, ProcId, System, ThreadId};
use crate::trace::Trace;

const PROGRESS_EVERY: u64 = 1 << 20;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub tracedir: PathBuf,
    pub clock_offset_file: Option<PathBuf>,
    /// Turn advisory checks into errors.
    pub linter: bool,
    /// Only warn when the clock of a stream goes backwards.
    pub lenient_clock: bool,
    /// Directory of the Paraver output. Nothing is written if unset.
    pub output: Option<PathBuf>,
}

impl Config {
    pub fn clock_check(&self) -> ClockCheck {
        if self.lenient_clock && !self.linter {
            ClockCheck::Warn
        } else {
            ClockCheck::Fatal
        }
    }
}

/// The event being dispatched and where it comes from.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub stream: usize,
    pub thread: ThreadId,
    pub proc: ProcId,
    pub loom: LoomId,
    pub clock: Timestamp,
    pub offset: usize,
    pub event: Event,
}

/// State shared by all the models: the system, the channels and the output
/// tables.
pub struct Emu {
    pub config: Config,
    pub system: System,
    pub bay: Bay,
    pub player: Player,
    pub pcf_thread: Pcf,
    pub pcf_cpu: Pcf,
    recorder: Box<dyn Recorder>,
    cur: Option<EventContext>,
    complete: bool,
    nevents: BTreeMap<u8, u64>,
}

impl Emu {
    pub fn new(config: Config, trace: Trace, recorder: Box<dyn Recorder>) -> Result<Self> {
        let Trace { builder, streams } = trace;
        if builder.nthreads() != streams.len() {
            return Err(Error::config(format!(
                "{} threads but {} streams",
                builder.nthreads(),
                streams.len()
            )));
        }

        let mut bay = Bay::new();
        let mut system = builder.build(&mut bay)?;
        let mut player = Player::new(streams);
        player.set_clock_check(config.clock_check());

        if let Some(path) = &config.clock_offset_file {
            info!("loading clock offsets from {:?}", path);
            let rows = clkoff::load(path)?;
            clkoff::apply(&rows, &mut system, &mut player)?;
        }

        Ok(Emu {
            config,
            system,
            bay,
            player,
            pcf_thread: Pcf::new(),
            pcf_cpu: Pcf::new(),
            recorder,
            cur: None,
            complete: false,
            nevents: BTreeMap::new(),
        })
    }

    pub fn set_recorder(&mut self, recorder: Box<dyn Recorder>) {
        self.recorder = recorder;
    }

    pub fn cur(&self) -> Result<&EventContext> {
        self.cur
            .as_ref()
            .ok_or_else(|| Error::state("no event is being processed"))
    }

    pub fn pcf(&self, table: Table) -> &Pcf {
        match table {
            Table::Thread => &self.pcf_thread,
            Table::Cpu => &self.pcf_cpu,
        }
    }

    pub fn pcf_mut(&mut self, table: Table) -> &mut Pcf {
        match table {
            Table::Thread => &mut self.pcf_thread,
            Table::Cpu => &mut self.pcf_cpu,
        }
    }

    /// True once every stream has been replayed to the end.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Events processed so far, by model tag.
    pub fn nevents_by_model(&self) -> &BTreeMap<u8, u64> {
        &self.nevents
    }

    /// Reports a suspicious condition: an error in linter mode, a warning
    /// otherwise.
    pub fn check(&self, msg: impl Into<String>) -> Result<()> {
        let msg = msg.into();
        if self.config.linter {
            return Err(Error::state(msg));
        }
        warn!("{}", msg);
        Ok(())
    }

    /// Publishes the channels written since the last call.
    pub fn propagate(&mut self) -> Result<()> {
        let time = self.player.elapsed();
        self.bay.propagate(time, self.recorder.as_mut())
    }

    fn wrap(&self, err: Error) -> Error {
        match &self.cur {
            Some(ctx) => Error::Event {
                stream: self.player.stream(ctx.stream).relpath().to_owned(),
                offset: ctx.offset,
                mcv: ctx.event.mcv(),
                clock: ctx.clock.0,
                source: Box::new(err),
            },
            None => err,
        }
    }
}

/// Drives the replay: merges the streams and dispatches every event to the
/// models.
pub struct Emulator {
    emu: Emu,
    models: ModelSet,
    stop: Arc<AtomicBool>,
}

impl Emulator {
    pub fn new(config: Config, trace: Trace, recorder: Box<dyn Recorder>) -> Result<Self> {
        Ok(Emulator {
            emu: Emu::new(config, trace, recorder)?,
            models: ModelSet::new(),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Loads the trace of `config.tracedir` and opens the Paraver output if
    /// an output directory is set.
    pub fn from_dir(config: Config) -> Result<Self> {
        let trace = Trace::load(&config.tracedir)?;
        let output = config.output.clone();
        let mut emulator = Emulator::new(config, trace, Box::new(NullRecorder))?;
        if let Some(dir) = output {
            let sys = &emulator.emu.system;
            let rec = PrvRecorder::create(&dir, sys.threads.len(), sys.cpus.len())?;
            emulator.emu.set_recorder(Box::new(rec));
        }
        Ok(emulator)
    }

    pub fn emu(&self) -> &Emu {
        &self.emu
    }

    pub fn models(&self) -> &ModelSet {
        &self.models
    }

    /// Setting the flag stops the replay before the next event.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn register(&mut self, model: Box<dyn Model>) -> Result<()> {
        self.models.register(model)
    }

    pub fn register_default_models(&mut self) -> Result<()> {
        self.register(Box::new(OvniModel::new()))?;
        self.register(Box::new(NosvModel::new()))
    }

    /// Runs the model hooks that create and wire the channels.
    pub fn connect(&mut self) -> Result<()> {
        self.models.connect(&mut self.emu)?;
        self.emu.bay.validate()?;
        self.emu.propagate()
    }

    /// Processes one event. Returns false when all streams are exhausted.
    pub fn step(&mut self) -> Result<bool> {
        let Some(i) = self.emu.player.step()? else {
            self.emu.cur = None;
            self.emu.complete = true;
            return Ok(false);
        };

        let stream = self.emu.player.stream(i);
        let (Some(event), Some(clock)) = (stream.event().cloned(), stream.clock()) else {
            return Err(Error::state(format!(
                "stream '{}' has no current event",
                stream.relpath()
            )));
        };
        let th = self.emu.system.thread(ThreadId(i));
        let tag = event.header.model;
        self.emu.cur = Some(EventContext {
            stream: i,
            thread: th.id,
            proc: th.proc,
            loom: th.loom,
            clock,
            offset: stream.offset(),
            event,
        });
        *self.emu.nevents.entry(tag).or_default() += 1;

        self.dispatch(tag).map_err(|e| self.emu.wrap(e))?;
        Ok(true)
    }

    fn dispatch(&mut self, tag: u8) -> Result<()> {
        let ctx = self.emu.cur()?;
        debug!("{} {} {}", ctx.clock, ctx.event.mcv(), ctx.thread);
        if self.emu.config.linter && tag != b'O' {
            let th = self.emu.system.thread(ctx.thread);
            if !th.is_active() {
                return Err(Error::state(format!(
                    "thread {} is not active ({:?})",
                    th.tid,
                    th.state()
                )));
            }
        }
        self.models.event(&mut self.emu, tag)?;
        self.emu.propagate()
    }

    /// Replays events until all streams are exhausted or the stop flag is
    /// set.
    pub fn run(&mut self) -> Result<()> {
        let mut n = 0u64;
        while !self.stop.load(Ordering::Relaxed) {
            if !self.step()? {
                info!(
                    "emulation finished: {} events in {} ns of trace",
                    self.emu.player.nprocessed(),
                    self.emu.player.elapsed()
                );
                return Ok(());
            }
            n += 1;
            if n % PROGRESS_EVERY == 0 {
                info!("{:.1}% done", self.emu.player.progress() * 100.0);
            }
        }
        warn!(
            "emulation stopped after {} events, the output is partial",
            self.emu.player.nprocessed()
        );
        Ok(())
    }

    /// Runs the finish hooks, closes the recorder and writes the tables.
    /// Every step runs even if a previous one failed, and the first error
    /// is returned.
    pub fn finish(&mut self) -> Result<()> {
        self.emu.cur = None;
        let mut res = self.models.finish(&mut self.emu);
        let closed = self.emu.propagate().and_then(|()| {
            let last = self.emu.player.elapsed();
            self.emu.recorder.close(last)
        });
        res = res.and(closed);
        if let Some(dir) = self.emu.config.output.clone() {
            res = res.and(self.write_tables(&dir));
        }
        res
    }

    fn write_tables(&self, dir: &Path) -> Result<()> {
        let sys = &self.emu.system;
        self.emu.pcf_thread.write(dir.join("thread.pcf"))?;
        self.emu.pcf_cpu.write(dir.join("cpu.pcf"))?;

        let threads: Vec<String> = sys
            .threads
            .iter()
            .map(|th| {
                let proc = sys.proc(th.proc);
                let loom = sys.loom(th.loom);
                format!("{}.{}.{}", loom.hostname, proc.pid, th.tid)
            })
            .collect();
        write_row(dir.join("thread.row"), &threads)?;

        let cpus: Vec<String> = sys.cpus.iter().map(|cpu| cpu.name.clone()).collect();
        write_row(dir.join("cpu.row"), &cpus)
    }
}
