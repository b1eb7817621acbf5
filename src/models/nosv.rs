use log::debug;
use num_enum::IntoPrimitive;

use crate::chan::{Chan, ChanId};
use crate::emu::{Emu, EventContext};
use crate::error::{Error, Result};
use crate::model::{Model, ModelSpec};
use crate::models::{arg, unknown_event};
use crate::mux::select_by_index;
use crate::recorder::{Emit, Table};
use crate::system::ThreadId;
use crate::task::{TaskInfo, TaskStack, TaskState};
use crate::thread::{select_active, select_running};
use crate::value::Value;

pub const NOSV_TAG: u8 = b'V';

const SPEC: ModelSpec = ModelSpec {
    name: "nosv",
    version: "2.0.0",
    tag: NOSV_TAG,
    depends: &["ovni"],
};

/// Paraver types of the nosv channels, the same in both tables.
pub const NOSV_TYPE_TASKID: u32 = 10;
pub const NOSV_TYPE_TYPE: u32 = 11;
pub const NOSV_TYPE_APPID: u32 = 12;
pub const NOSV_TYPE_SUBSYSTEM: u32 = 13;
pub const NOSV_TYPE_RANK: u32 = 14;

const TASKID: usize = 0;
const TYPE: usize = 1;
const APPID: usize = 2;
const SUBSYSTEM: usize = 3;
const RANK: usize = 4;
const NCHANS: usize = 5;

const CHAN_NAME: [&str; NCHANS] = ["taskid", "task_type", "appid", "subsystem", "rank"];
const CHAN_TYPE: [u32; NCHANS] = [
    NOSV_TYPE_TASKID,
    NOSV_TYPE_TYPE,
    NOSV_TYPE_APPID,
    NOSV_TYPE_SUBSYSTEM,
    NOSV_TYPE_RANK,
];
const CHAN_LABEL: [&str; NCHANS] = [
    "nOS-V task ID",
    "nOS-V task type",
    "nOS-V task AppID",
    "nOS-V subsystem",
    "nOS-V task MPI rank",
];

/// Values of the subsystem channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive)]
#[repr(i64)]
pub enum Subsystem {
    SchedHungry = 6,
    SchedServing = 7,
    SchedSubmitting = 8,
    MemAllocating = 9,
    MemFreeing = 10,
    TaskRunning = 11,
    ApiSubmit = 12,
    ApiPause = 13,
    ApiYield = 14,
    ApiWaitfor = 15,
    ApiSchedpoint = 16,
    Attach = 17,
    Worker = 18,
    Delegate = 19,
}

impl Subsystem {
    const ALL: [Subsystem; 14] = [
        Subsystem::SchedHungry,
        Subsystem::SchedServing,
        Subsystem::SchedSubmitting,
        Subsystem::MemAllocating,
        Subsystem::MemFreeing,
        Subsystem::TaskRunning,
        Subsystem::ApiSubmit,
        Subsystem::ApiPause,
        Subsystem::ApiYield,
        Subsystem::ApiWaitfor,
        Subsystem::ApiSchedpoint,
        Subsystem::Attach,
        Subsystem::Worker,
        Subsystem::Delegate,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Subsystem::SchedHungry => "Scheduler: Hungry",
            Subsystem::SchedServing => "Scheduler: Serving",
            Subsystem::SchedSubmitting => "Scheduler: Submitting",
            Subsystem::MemAllocating => "Memory: Allocating",
            Subsystem::MemFreeing => "Memory: Freeing",
            Subsystem::TaskRunning => "Task: Running",
            Subsystem::ApiSubmit => "API: Submit",
            Subsystem::ApiPause => "API: Pause",
            Subsystem::ApiYield => "API: Yield",
            Subsystem::ApiWaitfor => "API: Waitfor",
            Subsystem::ApiSchedpoint => "API: Scheduling point",
            Subsystem::Attach => "Thread: Attached",
            Subsystem::Worker => "Thread: Worker",
            Subsystem::Delegate => "Thread: Delegate",
        }
    }

    fn value(self) -> Value {
        Value::Int64(self.into())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum StackOp {
    Push,
    Pop,
}

/// Subsystem transition of an event, if it has one.
fn subsystem_op(category: u8, value: u8) -> Option<(StackOp, Subsystem)> {
    use StackOp::*;
    use Subsystem::*;
    let op = match (category, value) {
        (b'S', b'h') => (Push, SchedHungry),
        (b'S', b'f') => (Pop, SchedHungry),
        (b'S', b'[') => (Push, SchedServing),
        (b'S', b']') => (Pop, SchedServing),
        (b'U', b'[') => (Push, SchedSubmitting),
        (b'U', b']') => (Pop, SchedSubmitting),
        (b'M', b'a') => (Push, MemAllocating),
        (b'M', b'A') => (Pop, MemAllocating),
        (b'M', b'f') => (Push, MemFreeing),
        (b'M', b'F') => (Pop, MemFreeing),
        (b'H', b'a') => (Push, Attach),
        (b'H', b'A') => (Pop, Attach),
        (b'H', b'w') => (Push, Worker),
        (b'H', b'W') => (Pop, Worker),
        (b'H', b'd') => (Push, Delegate),
        (b'H', b'D') => (Pop, Delegate),
        (b'A', b's') => (Push, ApiSubmit),
        (b'A', b'S') => (Pop, ApiSubmit),
        (b'A', b'p') => (Push, ApiPause),
        (b'A', b'P') => (Pop, ApiPause),
        (b'A', b'y') => (Push, ApiYield),
        (b'A', b'Y') => (Pop, ApiYield),
        (b'A', b'w') => (Push, ApiWaitfor),
        (b'A', b'W') => (Pop, ApiWaitfor),
        (b'A', b'c') => (Push, ApiSchedpoint),
        (b'A', b'C') => (Pop, ApiSchedpoint),
        _ => return None,
    };
    Some(op)
}

#[derive(Debug)]
struct ThreadData {
    /// Written by the events.
    raw: [ChanId; NCHANS],
    /// Raw values while the thread is running.
    run: [ChanId; NCHANS],
    /// Raw values while the thread is active.
    act: [ChanId; NCHANS],
    stack: TaskStack,
}

/// Tasks, task types and subsystems of the nOS-V runtime.
#[derive(Debug, Default)]
pub struct NosvModel {
    threads: Vec<ThreadData>,
    cpus: Vec<[ChanId; NCHANS]>,
    procs: Vec<TaskInfo>,
}

impl NosvModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks and task types of a process.
    pub fn task_info(&self, proc: usize) -> Option<&TaskInfo> {
        self.procs.get(proc)
    }

    fn set(&self, emu: &mut Emu, th: ThreadId, chan: usize, value: Value) -> Result<()> {
        emu.bay.set(self.threads[th.0].raw[chan], value)
    }

    fn task_running(&self, emu: &mut Emu, ctx: &EventContext, id: u32) -> Result<()> {
        if id == 0 {
            return Err(Error::state("running task id cannot be 0"));
        }
        let info = &self.procs[ctx.proc.0];
        let task = info
            .task(id)
            .ok_or_else(|| Error::state(format!("unknown task {}", id)))?;
        let gid = info
            .task_type(task.type_id)
            .map(|t| t.gid)
            .ok_or_else(|| Error::state(format!("task {} has unknown type", id)))?;
        let proc = emu.system.proc(ctx.proc);
        if proc.appid <= 0 {
            return Err(Error::state(format!(
                "process {} has app id {}, must be positive",
                proc.pid, proc.appid
            )));
        }
        let (appid, rank) = (proc.appid, proc.rank);

        let th = ctx.thread;
        self.set(emu, th, TASKID, Value::Int64(id as i64))?;
        self.set(emu, th, TYPE, Value::Int64(gid as i64))?;
        self.set(emu, th, APPID, Value::Int64(appid as i64))?;
        if let Some(rank) = rank {
            self.set(emu, th, RANK, Value::Int64(rank as i64 + 1))?;
        }
        emu.bay
            .push(self.threads[th.0].raw[SUBSYSTEM], Subsystem::TaskRunning.value())
    }

    fn task_not_running(&self, emu: &mut Emu, ctx: &EventContext, id: u32) -> Result<()> {
        let info = &self.procs[ctx.proc.0];
        if info.task(id).is_some_and(|t| t.state == TaskState::Running) {
            return Err(Error::state(format!("task {} is still running", id)));
        }
        let th = ctx.thread;
        self.set(emu, th, TASKID, Value::Null)?;
        self.set(emu, th, TYPE, Value::Null)?;
        self.set(emu, th, APPID, Value::Null)?;
        if emu.system.proc(ctx.proc).rank.is_some() {
            self.set(emu, th, RANK, Value::Null)?;
        }
        emu.bay
            .pop(self.threads[th.0].raw[SUBSYSTEM], Subsystem::TaskRunning.value())
    }

    /// Moves from `prev` to the nested task `next`, or back. Only the task
    /// id, and the type if it looks different, change.
    fn task_switch(
        &self,
        emu: &mut Emu,
        ctx: &EventContext,
        prev: u32,
        next: u32,
        nested: bool,
    ) -> Result<()> {
        let info = &self.procs[ctx.proc.0];
        let (Some(p), Some(n)) = (info.task(prev), info.task(next)) else {
            return Err(Error::state(format!(
                "cannot switch from task {} to task {}",
                prev, next
            )));
        };
        if prev == next {
            return Err(Error::state(format!("cannot switch to the same task {}", prev)));
        }
        if next == 0 {
            return Err(Error::state("next task id cannot be 0"));
        }
        let expected = if nested {
            TaskState::Running
        } else {
            TaskState::Dead
        };
        if p.state != expected {
            return Err(Error::state(format!(
                "previous task {} is {:?}, expected {:?}",
                prev, p.state, expected
            )));
        }
        if n.state != TaskState::Running {
            return Err(Error::state(format!("next task {} is not running", next)));
        }
        if p.thread != n.thread {
            return Err(Error::state(format!(
                "cannot switch from task {} to task {} of another thread",
                prev, next
            )));
        }
        let gid = |t: u32| info.task_type(t).map(|t| t.gid);
        let (prev_gid, next_gid) = (gid(p.type_id), gid(n.type_id));

        self.set(emu, ctx.thread, TASKID, Value::Int64(next as i64))?;
        if prev_gid != next_gid {
            self.set(emu, ctx.thread, TYPE, Value::from(next_gid.map(i64::from)))?;
        }
        Ok(())
    }

    fn task_event(&mut self, emu: &mut Emu, ctx: &EventContext) -> Result<()> {
        let th = ctx.thread;
        let th_state = emu.system.thread(th).state();
        let id = arg(&ctx.event, 0)? as u32;
        let info = &mut self.procs[ctx.proc.0];
        let stack = &mut self.threads[th.0].stack;
        let prev = info.running(stack).map(|t| t.id);

        // Update the task state first, the channels after
        match ctx.event.header.value {
            b'c' => {
                let type_id = arg(&ctx.event, 1)? as u32;
                return info.create(id, type_id);
            }
            b'x' => info.execute(stack, id, th, th_state)?,
            b'e' => info.end(stack, id, th, th_state)?,
            b'p' => info.pause(stack, id, th, th_state)?,
            b'r' => info.resume(stack, id, th, th_state)?,
            _ => return Err(unknown_event(&ctx.event)),
        }
        let next = info.running(stack).map(|t| t.id);

        match (ctx.event.header.value, prev, next) {
            (b'x', Some(prev), _) => self.task_switch(emu, ctx, prev, id, true),
            (b'x', None, _) => self.task_running(emu, ctx, id),
            (b'e', _, Some(next)) => self.task_switch(emu, ctx, id, next, false),
            (b'e', _, None) | (b'p', _, _) => self.task_not_running(emu, ctx, id),
            _ => self.task_running(emu, ctx, id),
        }
    }

    fn type_event(&mut self, ctx: &EventContext) -> Result<()> {
        if ctx.event.header.value != b'c' {
            debug!("ignoring event {}", ctx.event.mcv());
            return Ok(());
        }
        if !ctx.event.header.is_jumbo() {
            return Err(Error::state("task type creation must be a jumbo event"));
        }
        let data = ctx.event.payload();
        let (Some(id), Some(rest)) = (data.get(..4), data.get(4..)) else {
            return Err(Error::state("task type event is too short"));
        };
        let id = u32::from_le_bytes([id[0], id[1], id[2], id[3]]);
        let end = rest.iter().position(|b| *b == 0).ok_or_else(|| {
            Error::state(format!("label of task type {} is not terminated", id))
        })?;
        let label = String::from_utf8_lossy(&rest[..end]);
        self.procs[ctx.proc.0].create_type(id, &label)?;
        Ok(())
    }

    fn subsystem_event(&self, emu: &mut Emu, ctx: &EventContext) -> Result<()> {
        let header = ctx.event.header;
        let Some((op, ss)) = subsystem_op(header.category, header.value) else {
            if header.category == b'U' {
                return Err(unknown_event(&ctx.event));
            }
            debug!("ignoring event {}", ctx.event.mcv());
            return Ok(());
        };
        let chan = self.threads[ctx.thread.0].raw[SUBSYSTEM];
        match op {
            StackOp::Push => emu.bay.push(chan, ss.value()),
            StackOp::Pop => emu.bay.pop(chan, ss.value()),
        }
    }

    fn add_pcf_types(emu: &mut Emu) -> Result<()> {
        let subsystems: Vec<(i64, &str)> = Subsystem::ALL
            .iter()
            .map(|ss| (i64::from(*ss), ss.label()))
            .collect();
        for table in [Table::Thread, Table::Cpu] {
            let pcf = emu.pcf_mut(table);
            for i in 0..NCHANS {
                if i == SUBSYSTEM {
                    pcf.add_type_values(CHAN_TYPE[i], CHAN_LABEL[i], &subsystems)?;
                } else {
                    pcf.add_type(CHAN_TYPE[i], CHAN_LABEL[i])?;
                }
            }
        }
        Ok(())
    }
}

impl Model for NosvModel {
    fn spec(&self) -> ModelSpec {
        SPEC
    }

    fn create(&mut self, emu: &mut Emu) -> Result<()> {
        let bay = &mut emu.bay;
        for th in &emu.system.threads {
            let g = th.id.0;
            let mut raw = [ChanId(0); NCHANS];
            let mut run = [ChanId(0); NCHANS];
            let mut act = [ChanId(0); NCHANS];
            for i in 0..NCHANS {
                let name = format!("nosv.thread{}.{}", g, CHAN_NAME[i]);
                let chan = if i == SUBSYSTEM {
                    Chan::stack(name.clone())
                } else {
                    Chan::single(name.clone())
                };
                raw[i] = bay.add_chan(chan)?;
                run[i] = bay.add_chan(Chan::single(format!("{}.run", name)))?;
                act[i] = bay.add_chan(Chan::single(format!("{}.act", name)))?;
            }
            self.threads.push(ThreadData {
                raw,
                run,
                act,
                stack: TaskStack::default(),
            });
        }

        for cpu in &emu.system.cpus {
            let mut out = [ChanId(0); NCHANS];
            for (i, chan) in out.iter_mut().enumerate() {
                let name = format!("nosv.cpu{}.{}", cpu.id.0, CHAN_NAME[i]);
                *chan = bay.add_chan(Chan::single(name))?;
            }
            self.cpus.push(out);
        }

        self.procs = emu.system.procs.iter().map(|_| TaskInfo::default()).collect();
        Ok(())
    }

    fn connect(&mut self, emu: &mut Emu) -> Result<()> {
        let Emu { system, bay, .. } = emu;

        for (th, data) in system.threads.iter().zip(&self.threads) {
            let row = th.id.0;
            for i in 0..NCHANS {
                let run = bay.add_mux(th.chans.state, data.run[i], select_running, 1)?;
                bay.mux_set_input(run, 0, data.raw[i])?;
                let act = bay.add_mux(th.chans.state, data.act[i], select_active, 1)?;
                bay.mux_set_input(act, 0, data.raw[i])?;

                // Subsystems are also shown while cooling or warming
                let shown = if i == SUBSYSTEM { data.act[i] } else { data.run[i] };
                bay.add_emit(shown, Emit::thread(row, CHAN_TYPE[i]).skip_dup());
            }
        }

        let nthreads = system.threads.len();
        for (cpu, out) in system.cpus.iter().zip(&self.cpus) {
            let row = cpu.id.0;
            for i in 0..NCHANS {
                let mux = bay.add_mux(cpu.chans.th_running, out[i], select_by_index, nthreads)?;
                for (j, data) in self.threads.iter().enumerate() {
                    bay.mux_set_input(mux, j, data.run[i])?;
                }
                bay.add_emit(out[i], Emit::cpu(row, CHAN_TYPE[i]).skip_dup());
            }
        }

        NosvModel::add_pcf_types(emu)
    }

    fn event(&mut self, emu: &mut Emu) -> Result<()> {
        let ctx = emu.cur()?.clone();
        let th = emu.system.thread(ctx.thread);
        if !th.is_active() {
            return Err(Error::state(format!(
                "current thread {} is not active ({:?})",
                th.tid,
                th.state()
            )));
        }

        match ctx.event.header.category {
            b'T' => self.task_event(emu, &ctx)?,
            b'Y' => self.type_event(&ctx)?,
            b'S' | b'U' | b'M' | b'H' | b'A' => self.subsystem_event(emu, &ctx)?,
            _ => debug!("ignoring event {}", ctx.event.mcv()),
        }

        Ok(())
    }

    fn finish(&mut self, emu: &mut Emu) -> Result<()> {
        for table in [Table::Thread, Table::Cpu] {
            let pcf = emu.pcf_mut(table);
            let ty = pcf.find_type_mut(NOSV_TYPE_TYPE).ok_or_else(|| {
                Error::config(format!("missing {} pcf type {}", table.name(), NOSV_TYPE_TYPE))
            })?;
            for info in &self.procs {
                for t in info.types() {
                    ty.add_value(t.gid as i64, &t.label)?;
                }
            }
        }

        if !emu.is_complete() {
            return Ok(());
        }
        for (th, data) in emu.system.threads.iter().zip(&self.threads) {
            let depth = emu.bay.chan(data.raw[SUBSYSTEM]).depth();
            if depth > 0 {
                return Err(Error::state(format!(
                    "thread {} ends with {} subsystems in the stack",
                    th.tid, depth
                )));
            }
        }
        Ok(())
    }
}
