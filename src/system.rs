use std::collections::BTreeMap;

use derive_more::{Display, From};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::bay::Bay;
use crate::cpu::Cpu;
use crate::error::{Error, Result};
use crate::num_util::Postincrement;
use crate::thread::Thread;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, From, Display)]
pub struct LoomId(pub usize);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, From, Display)]
pub struct ProcId(pub usize);

/// Global index of a thread, also the index of its stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, From, Display)]
pub struct ThreadId(pub usize);

/// Global index of a CPU.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, From, Display)]
pub struct CpuId(pub usize);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub index: i32,
    pub phyid: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcInfo {
    pub pid: i32,
    pub appid: i32,
    pub rank: Option<i32>,
    pub nranks: Option<i32>,
    /// Models the process was traced with, and their versions.
    pub models: Option<BTreeMap<String, String>>,
}

#[derive(Debug)]
pub struct Loom {
    pub id: LoomId,
    pub name: String,
    pub hostname: String,
    /// Physical CPUs in logical order.
    pub cpus: Vec<CpuId>,
    pub vcpu: CpuId,
    pub procs: Vec<ProcId>,
    pub clock_offset: i64,
    cpu_index: BTreeMap<i32, CpuId>,
}

#[derive(Debug)]
pub struct Proc {
    pub id: ProcId,
    pub loom: LoomId,
    pub pid: i32,
    pub appid: i32,
    pub rank: Option<i32>,
    pub nranks: Option<i32>,
    pub models: Option<BTreeMap<String, String>>,
    pub threads: Vec<ThreadId>,
}

/// All the looms, processes, threads and CPUs of the trace. The CPU keeps the
/// set of its threads and the thread only refers back to the CPU by id.
#[derive(Debug, Default)]
pub struct System {
    pub looms: Vec<Loom>,
    pub procs: Vec<Proc>,
    pub threads: Vec<Thread>,
    pub cpus: Vec<Cpu>,
}

impl System {
    pub fn thread(&self, id: ThreadId) -> &Thread {
        &self.threads[id.0]
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> &mut Thread {
        &mut self.threads[id.0]
    }

    pub fn cpu(&self, id: CpuId) -> &Cpu {
        &self.cpus[id.0]
    }

    pub fn proc(&self, id: ProcId) -> &Proc {
        &self.procs[id.0]
    }

    pub fn loom(&self, id: LoomId) -> &Loom {
        &self.looms[id.0]
    }

    /// Looks up a CPU by its logical index in the loom, where -1 is the
    /// virtual CPU.
    pub fn loom_cpu(&self, loom: LoomId, index: i32) -> Result<CpuId> {
        let loom = &self.looms[loom.0];
        if index == -1 {
            return Ok(loom.vcpu);
        }
        loom.cpu_index.get(&index).copied().ok_or_else(|| {
            Error::state(format!(
                "loom {} has no CPU with logical index {}",
                loom.name, index
            ))
        })
    }

    pub fn proc_thread(&self, proc: ProcId, tid: i32) -> Option<ThreadId> {
        self.procs[proc.0]
            .threads
            .iter()
            .copied()
            .find(|th| self.threads[th.0].tid == tid)
    }

    pub fn update_cpu(&mut self, cpu: CpuId, bay: &mut Bay) -> Result<()> {
        let System {
            cpus,
            threads,
            procs,
            ..
        } = self;
        cpus[cpu.0].update(threads, procs, bay)
    }

    pub fn cpu_add_thread(&mut self, cpu: CpuId, th: ThreadId, bay: &mut Bay) -> Result<()> {
        self.cpus[cpu.0].add_thread(th)?;
        self.update_cpu(cpu, bay)
    }

    pub fn cpu_remove_thread(&mut self, cpu: CpuId, th: ThreadId, bay: &mut Bay) -> Result<()> {
        self.cpus[cpu.0].remove_thread(th)?;
        self.update_cpu(cpu, bay)
    }

    /// Moves a thread with an assigned CPU to `newcpu`. Moving to the CPU it
    /// already has does nothing.
    pub fn migrate_thread(&mut self, th: ThreadId, newcpu: CpuId, bay: &mut Bay) -> Result<()> {
        let thread = &self.threads[th.0];
        let oldcpu = thread.cpu().ok_or_else(|| {
            Error::state(format!("thread {} doesn't have a CPU", thread.tid))
        })?;
        if oldcpu == newcpu {
            debug!("thread {} already in cpu {}", thread.tid, newcpu);
            return Ok(());
        }
        self.cpu_remove_thread(oldcpu, th, bay)?;
        self.cpu_add_thread(newcpu, th, bay)?;
        self.threads[th.0].migrate_cpu(bay, newcpu)
    }
}

#[derive(Debug)]
struct LoomDesc {
    name: String,
    cpus: Option<Vec<CpuInfo>>,
    procs: Vec<ProcId>,
}

#[derive(Debug)]
struct ThreadDesc {
    tid: i32,
    proc: ProcId,
    relpath: String,
}

/// Collects the topology in the order it is discovered and assigns the
/// global indices when built.
#[derive(Debug, Default)]
pub struct SystemBuilder {
    looms: Vec<LoomDesc>,
    procs: Vec<(LoomId, ProcInfo)>,
    threads: Vec<ThreadDesc>,
}

impl SystemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_loom(&mut self, name: &str) -> LoomId {
        let id = LoomId(self.looms.len());
        self.looms.push(LoomDesc {
            name: name.to_owned(),
            cpus: None,
            procs: Vec::new(),
        });
        id
    }

    /// Sets the CPU list of a loom. Every process of a loom that carries a
    /// CPU list must carry the same one.
    pub fn set_cpus(&mut self, loom: LoomId, cpus: Vec<CpuInfo>) -> Result<()> {
        let desc = &mut self.looms[loom.0];
        match &desc.cpus {
            Some(old) if *old != cpus => Err(Error::config(format!(
                "loom {} has inconsistent CPU lists",
                desc.name
            ))),
            Some(_) => Ok(()),
            None => {
                desc.cpus = Some(cpus);
                Ok(())
            }
        }
    }

    pub fn add_proc(&mut self, loom: LoomId, info: ProcInfo) -> ProcId {
        let id = ProcId(self.procs.len());
        self.looms[loom.0].procs.push(id);
        self.procs.push((loom, info));
        id
    }

    pub fn add_thread(&mut self, proc: ProcId, tid: i32, relpath: &str) -> ThreadId {
        let id = ThreadId(self.threads.len());
        self.threads.push(ThreadDesc {
            tid,
            proc,
            relpath: relpath.to_owned(),
        });
        id
    }

    pub fn nthreads(&self) -> usize {
        self.threads.len()
    }

    /// Creates the entities and their channels in `bay`. Physical CPUs get
    /// the first global indices, then one virtual CPU per loom.
    pub fn build(self, bay: &mut Bay) -> Result<System> {
        let mut sys = System::default();

        for (i, desc) in self.looms.iter().enumerate() {
            let hostname = desc.name.strip_prefix("loom.").unwrap_or(&desc.name);
            sys.looms.push(Loom {
                id: LoomId(i),
                name: desc.name.clone(),
                hostname: hostname.to_owned(),
                cpus: Vec::new(),
                vcpu: CpuId(0),
                procs: desc.procs.clone(),
                clock_offset: 0,
                cpu_index: BTreeMap::new(),
            });
        }

        let mut gindex = 0usize;
        for (i, desc) in self.looms.iter().enumerate() {
            let mut cpus = desc.cpus.clone().ok_or_else(|| {
                Error::config(format!("loom {} has no CPU information", desc.name))
            })?;
            cpus.sort_by_key(|c| c.index);
            let loom = &mut sys.looms[i];
            for info in cpus {
                if info.index < 0 {
                    return Err(Error::config(format!(
                        "loom {}: invalid CPU logical index {}",
                        desc.name, info.index
                    )));
                }
                let id = CpuId(gindex.postincrement());
                if loom.cpu_index.insert(info.index, id).is_some() {
                    return Err(Error::config(format!(
                        "loom {}: duplicated CPU logical index {}",
                        desc.name, info.index
                    )));
                }
                loom.cpus.push(id);
                let name = format!("{}.{}", desc.name, info.index);
                sys.cpus.push(Cpu::new(
                    bay,
                    id,
                    LoomId(i),
                    info.index,
                    info.phyid,
                    false,
                    name,
                )?);
            }
        }

        for (i, desc) in self.looms.iter().enumerate() {
            let id = CpuId(gindex.postincrement());
            sys.looms[i].vcpu = id;
            let name = format!("{}.*", desc.name);
            sys.cpus
                .push(Cpu::new(bay, id, LoomId(i), -1, -1, true, name)?);
        }

        for (i, (loom, info)) in self.procs.into_iter().enumerate() {
            sys.procs.push(Proc {
                id: ProcId(i),
                loom,
                pid: info.pid,
                appid: info.appid,
                rank: info.rank,
                nranks: info.nranks,
                models: info.models,
                threads: Vec::new(),
            });
        }

        for (i, desc) in self.threads.into_iter().enumerate() {
            let id = ThreadId(i);
            let proc = &mut sys.procs[desc.proc.0];
            proc.threads.push(id);
            let loom = proc.loom;
            sys.threads.push(Thread::new(
                bay,
                id,
                desc.tid,
                desc.proc,
                loom,
                desc.relpath,
            )?);
        }

        info!(
            "system: {} looms, {} processes, {} threads, {} cpus",
            sys.looms.len(),
            sys.procs.len(),
            sys.threads.len(),
            sys.cpus.len()
        );
        Ok(sys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::MemRecorder;
    use crate::stream::Timestamp;
    use crate::thread::ThreadState;
    use crate::value::Value;

    fn cpus(n: i32) -> Vec<CpuInfo> {
        (0..n).map(|i| CpuInfo { index: i, phyid: i }).collect()
    }

    fn system(bay: &mut Bay, nthreads: i32) -> System {
        let mut b = SystemBuilder::new();
        let l0 = b.add_loom("loom.a");
        let l1 = b.add_loom("loom.b");
        b.set_cpus(l0, cpus(2)).unwrap();
        b.set_cpus(l1, cpus(1)).unwrap();
        let p = b.add_proc(
            l0,
            ProcInfo {
                pid: 7,
                appid: 1,
                ..Default::default()
            },
        );
        for t in 0..nthreads {
            b.add_thread(p, 100 + t, &format!("loom.a/proc.7/thread.{}.obs", 100 + t));
        }
        b.build(bay).unwrap()
    }

    #[test]
    fn test_cpu_indices() {
        let mut bay = Bay::new();
        let sys = system(&mut bay, 1);
        // Physical first, then one virtual per loom
        assert_eq!(sys.cpus.len(), 5);
        assert_eq!(sys.looms[0].cpus, vec![CpuId(0), CpuId(1)]);
        assert_eq!(sys.looms[1].cpus, vec![CpuId(2)]);
        assert_eq!(sys.looms[0].vcpu, CpuId(3));
        assert_eq!(sys.looms[1].vcpu, CpuId(4));
        assert!(sys.cpus[3].is_virtual);
        assert_eq!(sys.loom_cpu(LoomId(0), -1).unwrap(), CpuId(3));
        assert_eq!(sys.loom_cpu(LoomId(0), 1).unwrap(), CpuId(1));
        assert!(sys.loom_cpu(LoomId(1), 1).is_err());
        assert_eq!(sys.looms[0].hostname, "a");
    }

    #[test]
    fn test_inconsistent_cpus() {
        let mut b = SystemBuilder::new();
        let l = b.add_loom("loom.a");
        b.set_cpus(l, cpus(2)).unwrap();
        b.set_cpus(l, cpus(2)).unwrap();
        assert!(b.set_cpus(l, cpus(3)).is_err());

        let mut b = SystemBuilder::new();
        b.add_loom("loom.a");
        assert!(b.build(&mut Bay::new()).is_err());
    }

    #[test]
    fn test_running_projection() {
        let mut bay = Bay::new();
        let mut rec = MemRecorder::new();
        let mut sys = system(&mut bay, 2);
        let cpu = CpuId(0);
        let (t0, t1) = (ThreadId(0), ThreadId(1));

        sys.threads[0].execute(&mut bay, cpu).unwrap();
        sys.cpu_add_thread(cpu, t0, &mut bay).unwrap();
        assert_eq!(bay.read(sys.cpu(cpu).chans.th_running), Value::Int64(0));
        bay.propagate(Timestamp(0), &mut rec).unwrap();

        // No running thread
        sys.threads[0].pause(&mut bay).unwrap();
        sys.update_cpu(cpu, &mut bay).unwrap();
        assert_eq!(sys.cpu(cpu).running(), None);
        assert_eq!(bay.read(sys.cpu(cpu).chans.th_running), Value::Null);
        bay.propagate(Timestamp(0), &mut rec).unwrap();

        // Exactly one running
        sys.threads[1].execute(&mut bay, cpu).unwrap();
        sys.cpu_add_thread(cpu, t1, &mut bay).unwrap();
        assert_eq!(sys.cpu(cpu).running(), Some(t1));
        assert_eq!(bay.read(sys.cpu(cpu).chans.th_running), Value::Int64(1));
        assert_eq!(bay.read(sys.cpu(cpu).chans.tid_running), Value::Int64(101));
        assert_eq!(bay.read(sys.cpu(cpu).chans.pid_running), Value::Int64(7));
        bay.propagate(Timestamp(1), &mut rec).unwrap();

        // Two running on a physical CPU is fatal
        sys.threads[0].resume(&mut bay).unwrap();
        assert_eq!(sys.thread(t0).state(), ThreadState::Running);
        assert!(sys.update_cpu(cpu, &mut bay).is_err());
    }

    #[test]
    fn test_virtual_oversubscription() {
        let mut bay = Bay::new();
        let mut sys = system(&mut bay, 2);
        let vcpu = sys.looms[0].vcpu;
        for t in 0..2 {
            sys.threads[t].execute(&mut bay, vcpu).unwrap();
            sys.cpus[vcpu.0].add_thread(ThreadId(t)).unwrap();
        }
        sys.update_cpu(vcpu, &mut bay).unwrap();
        assert_eq!(sys.cpu(vcpu).nrunning(), 2);
        assert_eq!(sys.cpu(vcpu).running(), None);
    }

    #[test]
    fn test_migrate() {
        let mut bay = Bay::new();
        let mut rec = MemRecorder::new();
        let mut sys = system(&mut bay, 1);
        let t0 = ThreadId(0);
        sys.threads[0].execute(&mut bay, CpuId(0)).unwrap();
        sys.cpu_add_thread(CpuId(0), t0, &mut bay).unwrap();
        bay.propagate(Timestamp(0), &mut rec).unwrap();

        // Same CPU does nothing
        sys.migrate_thread(t0, CpuId(0), &mut bay).unwrap();
        assert!(!bay.is_dirty(sys.thread(t0).chans.cpu_gindex));

        sys.migrate_thread(t0, CpuId(1), &mut bay).unwrap();
        assert_eq!(sys.thread(t0).cpu(), Some(CpuId(1)));
        assert_eq!(sys.cpu(CpuId(0)).nthreads(), 0);
        assert_eq!(sys.cpu(CpuId(1)).running(), Some(t0));
        assert_eq!(bay.read(sys.thread(t0).chans.cpu_gindex), Value::Int64(1));
    }
}
