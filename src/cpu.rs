use std::collections::BTreeSet;

use log::debug;

use crate::bay::Bay;
use crate::chan::{Chan, ChanId, ChanProp};
use crate::error::{Error, Result};
use crate::system::{CpuId, LoomId, Proc, ThreadId};
use crate::thread::{Thread, ThreadState};
use crate::value::Value;

/// Paraver types of the CPU channels.
pub const CPU_TYPE_PID: u32 = 1;
pub const CPU_TYPE_TID: u32 = 2;
pub const CPU_TYPE_NRUN: u32 = 3;
pub const CPU_TYPE_FLUSH: u32 = 7;

#[derive(Debug, Copy, Clone)]
pub struct CpuChans {
    pub nrunning: ChanId,
    pub pid_running: ChanId,
    pub tid_running: ChanId,
    /// Global index of the running thread, used to select thread channels.
    pub th_running: ChanId,
    pub th_active: ChanId,
    /// Flush state of the running thread, written by a mux.
    pub flush_running: ChanId,
}

impl CpuChans {
    fn create(bay: &mut Bay, gindex: usize) -> Result<Self> {
        let mut dup = |s: &str| {
            bay.add_chan(
                Chan::single(format!("cpu{}.{}", gindex, s)).with_prop(ChanProp::Duplicates, true),
            )
        };
        Ok(CpuChans {
            nrunning: dup("nrunning")?,
            pid_running: dup("pid_running")?,
            tid_running: dup("tid_running")?,
            th_running: dup("th_running")?,
            th_active: dup("th_active")?,
            flush_running: bay.add_chan(Chan::single(format!("cpu{}.flush_running", gindex)))?,
        })
    }
}

#[derive(Debug)]
pub struct Cpu {
    pub id: CpuId,
    pub loom: LoomId,
    /// Logical index inside the loom, -1 for the virtual CPU.
    pub index: i32,
    pub phyid: i32,
    pub is_virtual: bool,
    pub name: String,
    pub chans: CpuChans,
    threads: BTreeSet<ThreadId>,
    nrunning: usize,
    nactive: usize,
    running: Option<ThreadId>,
    active: Option<ThreadId>,
}

impl Cpu {
    pub(crate) fn new(
        bay: &mut Bay,
        id: CpuId,
        loom: LoomId,
        index: i32,
        phyid: i32,
        is_virtual: bool,
        name: String,
    ) -> Result<Self> {
        debug!("cpu init {} ({})", name, id);
        let chans = CpuChans::create(bay, id.0)?;
        Ok(Cpu {
            id,
            loom,
            index,
            phyid,
            is_virtual,
            name,
            chans,
            threads: BTreeSet::new(),
            nrunning: 0,
            nactive: 0,
            running: None,
            active: None,
        })
    }

    pub fn threads(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.threads.iter().copied()
    }

    pub fn nthreads(&self) -> usize {
        self.threads.len()
    }

    pub fn nrunning(&self) -> usize {
        self.nrunning
    }

    pub fn nactive(&self) -> usize {
        self.nactive
    }

    /// The running thread, if exactly one is running.
    pub fn running(&self) -> Option<ThreadId> {
        self.running
    }

    /// The active thread, if exactly one is active.
    pub fn active(&self) -> Option<ThreadId> {
        self.active
    }

    pub fn add_thread(&mut self, th: ThreadId) -> Result<()> {
        if !self.threads.insert(th) {
            return Err(Error::state(format!(
                "thread {} already assigned to cpu {}",
                th, self.name
            )));
        }
        Ok(())
    }

    pub fn remove_thread(&mut self, th: ThreadId) -> Result<()> {
        if !self.threads.remove(&th) {
            return Err(Error::state(format!(
                "cannot remove missing thread {} from cpu {}",
                th, self.name
            )));
        }
        Ok(())
    }

    /// Recomputes the running and active threads from the states of the
    /// assigned threads and updates the CPU channels.
    pub fn update(&mut self, threads: &[Thread], procs: &[Proc], bay: &mut Bay) -> Result<()> {
        let mut running = None;
        let mut active = None;
        let mut nrunning = 0;
        let mut nactive = 0;

        for id in &self.threads {
            let th = &threads[id.0];
            match th.state() {
                ThreadState::Running => {
                    running = Some(th);
                    nrunning += 1;
                    active = Some(th);
                    nactive += 1;
                }
                ThreadState::Cooling | ThreadState::Warming => {
                    active = Some(th);
                    nactive += 1;
                }
                _ => {}
            }
        }

        self.nrunning = nrunning;
        self.nactive = nactive;

        // Only virtual cpus can be oversubscribed
        if nrunning > 1 && !self.is_virtual {
            return Err(Error::state(format!(
                "physical cpu {} has {} threads running at the same time",
                self.name, nrunning
            )));
        }

        let running = running.filter(|_| nrunning == 1);
        self.running = running.map(|th| th.id);
        let (tid, pid, gid) = match running {
            Some(th) => (
                Value::Int64(th.tid as i64),
                Value::Int64(procs[th.proc.0].pid as i64),
                Value::Int64(th.id.0 as i64),
            ),
            None => (Value::Null, Value::Null, Value::Null),
        };
        bay.set(self.chans.tid_running, tid)?;
        bay.set(self.chans.pid_running, pid)?;
        bay.set(self.chans.th_running, gid)?;

        let active = active.filter(|_| nactive == 1);
        self.active = active.map(|th| th.id);
        let gid_active = Value::from(active.map(|th| th.id.0 as i64));

        bay.set(self.chans.nrunning, Value::Int64(nrunning as i64))?;
        bay.set(self.chans.th_active, gid_active)
    }
}
