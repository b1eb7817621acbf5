use log::debug;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::bay::Bay;
use crate::chan::{Chan, ChanId, ChanProp};
use crate::error::{Error, Result};
use crate::mux::Mux;
use crate::system::{CpuId, LoomId, ProcId, ThreadId};
use crate::value::Value;

/// Paraver types of the thread channels.
pub const TH_TYPE_TID_ACTIVE: u32 = 2;
pub const TH_TYPE_STATE: u32 = 4;
pub const TH_TYPE_CPU: u32 = 6;
pub const TH_TYPE_FLUSH: u32 = 7;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(i64)]
pub enum ThreadState {
    #[default]
    Unknown = 0,
    Running = 1,
    Paused = 2,
    Dead = 3,
    Cooling = 4,
    Warming = 5,
}

impl ThreadState {
    pub fn is_running(self) -> bool {
        self == ThreadState::Running
    }

    /// Running, or about to enter or leave the running state.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ThreadState::Running | ThreadState::Cooling | ThreadState::Warming
        )
    }
}

#[derive(Debug, Copy, Clone)]
pub struct ThreadChans {
    pub state: ChanId,
    pub tid_active: ChanId,
    pub cpu_gindex: ChanId,
    pub flush: ChanId,
}

impl ThreadChans {
    fn create(bay: &mut Bay, gindex: usize) -> Result<Self> {
        let name = |s: &str| format!("thread{}.{}", gindex, s);
        Ok(ThreadChans {
            state: bay.add_chan(Chan::single(name("state")))?,
            tid_active: bay.add_chan(
                Chan::single(name("tid_active")).with_prop(ChanProp::Duplicates, true),
            )?,
            cpu_gindex: bay.add_chan(Chan::single(name("cpu_gindex")))?,
            flush: bay.add_chan(Chan::stack(name("flush")))?,
        })
    }
}

#[derive(Debug)]
pub struct Thread {
    pub id: ThreadId,
    pub tid: i32,
    pub proc: ProcId,
    pub loom: LoomId,
    /// Path of the stream relative to the trace directory.
    pub relpath: String,
    pub chans: ThreadChans,
    state: ThreadState,
    cpu: Option<CpuId>,
}

impl Thread {
    pub(crate) fn new(
        bay: &mut Bay,
        id: ThreadId,
        tid: i32,
        proc: ProcId,
        loom: LoomId,
        relpath: String,
    ) -> Result<Self> {
        let chans = ThreadChans::create(bay, id.0)?;
        Ok(Thread {
            id,
            tid,
            proc,
            loom,
            relpath,
            chans,
            state: ThreadState::Unknown,
            cpu: None,
        })
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn cpu(&self) -> Option<CpuId> {
        self.cpu
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn set_cpu(&mut self, bay: &mut Bay, cpu: CpuId) -> Result<()> {
        if let Some(old) = self.cpu {
            return Err(Error::state(format!(
                "thread {} already has CPU {}",
                self.tid, old
            )));
        }
        self.cpu = Some(cpu);
        bay.set(self.chans.cpu_gindex, Value::Int64(cpu.0 as i64))
    }

    pub fn unset_cpu(&mut self, bay: &mut Bay) -> Result<()> {
        if self.cpu.take().is_none() {
            return Err(Error::state(format!(
                "thread {} doesn't have a CPU",
                self.tid
            )));
        }
        bay.set(self.chans.cpu_gindex, Value::Null)
    }

    pub fn migrate_cpu(&mut self, bay: &mut Bay, cpu: CpuId) -> Result<()> {
        if self.cpu.is_none() {
            return Err(Error::state(format!(
                "thread {} doesn't have a CPU",
                self.tid
            )));
        }
        self.cpu = Some(cpu);
        bay.set(self.chans.cpu_gindex, Value::Int64(cpu.0 as i64))
    }

    fn set_state(&mut self, bay: &mut Bay, state: ThreadState) -> Result<()> {
        // The state must be updated when a cpu is set
        if self.cpu.is_none() {
            return Err(Error::state(format!(
                "thread {} doesn't have a CPU",
                self.tid
            )));
        }
        debug!("thread {}: {:?} -> {:?}", self.tid, self.state, state);
        self.state = state;
        bay.set(self.chans.state, Value::Int64(state.into()))?;

        let tid_active = if state.is_active() {
            Value::Int64(self.tid as i64)
        } else {
            Value::Null
        };
        bay.set(self.chans.tid_active, tid_active)
    }

    fn transition(
        &mut self,
        bay: &mut Bay,
        from: &[ThreadState],
        to: ThreadState,
        what: &str,
    ) -> Result<()> {
        if !from.contains(&self.state) {
            return Err(Error::state(format!(
                "thread {} cannot {} in state {:?}",
                self.tid, what, self.state
            )));
        }
        self.set_state(bay, to)
    }

    /// First run of the thread on `cpu`.
    pub fn execute(&mut self, bay: &mut Bay, cpu: CpuId) -> Result<()> {
        if self.state != ThreadState::Unknown {
            return Err(Error::state(format!(
                "thread {} cannot execute in state {:?}",
                self.tid, self.state
            )));
        }
        self.set_cpu(bay, cpu)?;
        self.set_state(bay, ThreadState::Running)
    }

    pub fn pause(&mut self, bay: &mut Bay) -> Result<()> {
        use ThreadState::*;
        self.transition(bay, &[Running, Cooling], Paused, "pause")
    }

    pub fn resume(&mut self, bay: &mut Bay) -> Result<()> {
        use ThreadState::*;
        self.transition(bay, &[Paused, Cooling, Warming], Running, "resume")
    }

    pub fn cool(&mut self, bay: &mut Bay) -> Result<()> {
        use ThreadState::*;
        self.transition(bay, &[Running], Cooling, "cool")
    }

    pub fn warm(&mut self, bay: &mut Bay) -> Result<()> {
        use ThreadState::*;
        self.transition(bay, &[Paused, Running], Warming, "warm")
    }

    /// Marks the thread dead. The CPU stays assigned so the caller can
    /// remove it from the CPU afterwards.
    pub fn end(&mut self, bay: &mut Bay) -> Result<()> {
        use ThreadState::*;
        self.transition(bay, &[Running, Paused, Cooling, Warming], Dead, "end")
    }
}

fn state_of(mux: &Mux, value: Value) -> Result<Option<ThreadState>> {
    if mux.ninputs() != 1 {
        return Err(Error::config(format!(
            "mux {} doesn't have one input but {}",
            mux.name(),
            mux.ninputs()
        )));
    }
    match value {
        Value::Null => Ok(None),
        Value::Int64(i) => ThreadState::try_from(i).map(Some).map_err(|_| {
            Error::chan(mux.name(), format!("invalid thread state {}", i))
        }),
        Value::Double(_) => Err(Error::chan(
            mux.name(),
            "expecting null or int64 thread state",
        )),
    }
}

/// Selects the only input while the thread state is running, cooling or
/// warming.
pub fn select_active(mux: &Mux, value: Value) -> Result<Option<usize>> {
    Ok(state_of(mux, value)?.filter(|s| s.is_active()).map(|_| 0))
}

/// Selects the only input while the thread is running.
pub fn select_running(mux: &Mux, value: Value) -> Result<Option<usize>> {
    Ok(state_of(mux, value)?.filter(|s| s.is_running()).map(|_| 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::MemRecorder;
    use crate::stream::Timestamp;

    fn thread(bay: &mut Bay) -> Thread {
        Thread::new(bay, ThreadId(0), 100, ProcId(0), LoomId(0), "t".into()).unwrap()
    }

    #[test]
    fn test_lifecycle() {
        let mut bay = Bay::new();
        let mut rec = MemRecorder::new();
        let mut th = thread(&mut bay);

        // Needs a CPU first
        assert!(th.pause(&mut bay).is_err());

        th.execute(&mut bay, CpuId(2)).unwrap();
        assert_eq!(bay.read(th.chans.state), Value::Int64(1));
        assert_eq!(bay.read(th.chans.tid_active), Value::Int64(100));
        assert_eq!(bay.read(th.chans.cpu_gindex), Value::Int64(2));
        bay.propagate(Timestamp(0), &mut rec).unwrap();

        th.pause(&mut bay).unwrap();
        assert_eq!(bay.read(th.chans.tid_active), Value::Null);
        bay.propagate(Timestamp(1), &mut rec).unwrap();

        assert!(th.cool(&mut bay).is_err());
        th.warm(&mut bay).unwrap();
        bay.propagate(Timestamp(2), &mut rec).unwrap();
        th.resume(&mut bay).unwrap();
        bay.propagate(Timestamp(3), &mut rec).unwrap();
        th.cool(&mut bay).unwrap();
        bay.propagate(Timestamp(4), &mut rec).unwrap();
        th.end(&mut bay).unwrap();
        th.unset_cpu(&mut bay).unwrap();
        bay.propagate(Timestamp(5), &mut rec).unwrap();

        assert_eq!(th.state(), ThreadState::Dead);
        assert!(th.resume(&mut bay).is_err());
        assert!(th.execute(&mut bay, CpuId(0)).is_err());
    }

    #[test]
    fn test_select() {
        let mut bay = Bay::new();
        let sel = bay.add_chan(Chan::single("sel")).unwrap();
        let out = bay.add_chan(Chan::single("out")).unwrap();
        let m = bay.add_mux(sel, out, select_running, 1).unwrap();
        let mux = bay.mux(m);

        let running = Value::Int64(ThreadState::Running.into());
        let cooling = Value::Int64(ThreadState::Cooling.into());
        assert_eq!(select_running(mux, running).unwrap(), Some(0));
        assert_eq!(select_running(mux, cooling).unwrap(), None);
        assert_eq!(select_active(mux, cooling).unwrap(), Some(0));
        assert_eq!(select_active(mux, Value::Null).unwrap(), None);
        assert!(select_active(mux, Value::Int64(42)).is_err());

        let out2 = bay.add_chan(Chan::single("out2")).unwrap();
        let m2 = bay.add_mux(sel, out2, select_running, 2).unwrap();
        assert!(select_running(bay.mux(m2), running).is_err());
    }
}
