use log::debug;

use crate::bay::Bay;
use crate::cpu::{CPU_TYPE_FLUSH, CPU_TYPE_NRUN, CPU_TYPE_PID, CPU_TYPE_TID};
use crate::emu::{Emu, EventContext};
use crate::error::{Error, Result};
use crate::model::{Model, ModelSpec};
use crate::models::{arg, unknown_event};
use crate::mux::select_by_index;
use crate::recorder::Emit;
use crate::system::{CpuId, System, ThreadId};
use crate::thread::{TH_TYPE_CPU, TH_TYPE_FLUSH, TH_TYPE_STATE, TH_TYPE_TID_ACTIVE, ThreadState};
use crate::value::Value;

pub const OVNI_TAG: u8 = b'O';

const FLUSHING: i64 = 1;

const SPEC: ModelSpec = ModelSpec {
    name: "ovni",
    version: "1.0.0",
    tag: OVNI_TAG,
    depends: &[],
};

/// Thread lifecycle, CPU affinity and flush regions of the tracing runtime.
#[derive(Debug, Default)]
pub struct OvniModel;

impl OvniModel {
    pub fn new() -> Self {
        OvniModel
    }
}

fn cpu_of(system: &System, th: ThreadId) -> Result<CpuId> {
    let thread = system.thread(th);
    thread
        .cpu()
        .ok_or_else(|| Error::state(format!("thread {} doesn't have a CPU", thread.tid)))
}

fn thread_event(system: &mut System, bay: &mut Bay, ctx: &EventContext) -> Result<()> {
    let th = ctx.thread;
    match ctx.event.header.value {
        b'C' => {
            let thread = system.thread(th);
            if thread.state() != ThreadState::Unknown {
                return Err(Error::state(format!(
                    "thread {} created in state {:?}",
                    thread.tid,
                    thread.state()
                )));
            }
            Ok(())
        }
        b'x' => {
            let cpu = system.loom_cpu(ctx.loom, arg(&ctx.event, 0)?)?;
            system.thread_mut(th).execute(bay, cpu)?;
            system.cpu_add_thread(cpu, th, bay)
        }
        b'e' => {
            let cpu = cpu_of(system, th)?;
            system.thread_mut(th).end(bay)?;
            system.cpu_remove_thread(cpu, th, bay)?;
            system.thread_mut(th).unset_cpu(bay)
        }
        v @ (b'p' | b'r' | b'c' | b'w') => {
            let cpu = cpu_of(system, th)?;
            let thread = system.thread_mut(th);
            match v {
                b'p' => thread.pause(bay)?,
                b'r' => thread.resume(bay)?,
                b'c' => thread.cool(bay)?,
                _ => thread.warm(bay)?,
            }
            system.update_cpu(cpu, bay)
        }
        _ => Err(unknown_event(&ctx.event)),
    }
}

fn affinity_event(system: &mut System, bay: &mut Bay, ctx: &EventContext) -> Result<()> {
    let cpu = system.loom_cpu(ctx.loom, arg(&ctx.event, 0)?)?;
    match ctx.event.header.value {
        b's' => {
            let thread = system.thread(ctx.thread);
            if !thread.is_running() {
                return Err(Error::state(format!(
                    "thread {} sets its affinity while {:?}",
                    thread.tid,
                    thread.state()
                )));
            }
            system.migrate_thread(ctx.thread, cpu, bay)
        }
        b'r' => {
            let tid = arg(&ctx.event, 1)?;
            let remote = system.proc_thread(ctx.proc, tid).ok_or_else(|| {
                Error::state(format!("remote affinity: no thread {} in the process", tid))
            })?;
            let state = system.thread(remote).state();
            if matches!(state, ThreadState::Dead | ThreadState::Unknown) {
                return Err(Error::state(format!(
                    "remote affinity: thread {} is {:?}",
                    tid, state
                )));
            }
            debug!("thread {} moves to cpu {}", tid, system.cpu(cpu).name);
            system.migrate_thread(remote, cpu, bay)
        }
        _ => Err(unknown_event(&ctx.event)),
    }
}

fn flush_event(system: &System, bay: &mut Bay, ctx: &EventContext) -> Result<()> {
    let chan = system.thread(ctx.thread).chans.flush;
    match ctx.event.header.value {
        b'[' => bay.push(chan, Value::Int64(FLUSHING)),
        b']' => bay.pop(chan, Value::Int64(FLUSHING)),
        _ => Err(unknown_event(&ctx.event)),
    }
}

impl OvniModel {
    fn add_pcf_types(emu: &mut Emu) -> Result<()> {
        let states = [
            (ThreadState::Running, "Running"),
            (ThreadState::Paused, "Paused"),
            (ThreadState::Dead, "Dead"),
            (ThreadState::Cooling, "Cooling"),
            (ThreadState::Warming, "Warming"),
        ]
        .map(|(s, label)| (i64::from(s), label));

        let cpu_labels: Vec<(i64, String)> = emu
            .system
            .cpus
            .iter()
            .map(|cpu| (cpu.id.0 as i64, format!("CPU {}", cpu.name)))
            .collect();

        let pcf = &mut emu.pcf_thread;
        pcf.add_type(TH_TYPE_TID_ACTIVE, "Thread: TID of the ACTIVE thread")?;
        pcf.add_type_values(TH_TYPE_STATE, "Thread: State", &states)?;
        let affinity = pcf.add_type(TH_TYPE_CPU, "Thread: CPU affinity")?;
        for (value, label) in &cpu_labels {
            affinity.add_value(*value, label)?;
        }
        pcf.add_type_values(TH_TYPE_FLUSH, "Thread: Flushing state", &[(FLUSHING, "Flushing")])?;

        let pcf = &mut emu.pcf_cpu;
        pcf.add_type(CPU_TYPE_PID, "CPU: PID of the RUNNING thread")?;
        pcf.add_type(CPU_TYPE_TID, "CPU: TID of the RUNNING thread")?;
        pcf.add_type(CPU_TYPE_NRUN, "CPU: Number of RUNNING threads")?;
        pcf.add_type_values(
            CPU_TYPE_FLUSH,
            "CPU: Flushing state of the RUNNING thread",
            &[(FLUSHING, "Flushing")],
        )?;
        Ok(())
    }
}

impl Model for OvniModel {
    fn spec(&self) -> ModelSpec {
        SPEC
    }

    fn connect(&mut self, emu: &mut Emu) -> Result<()> {
        let Emu { system, bay, .. } = emu;

        for th in &system.threads {
            let row = th.id.0;
            bay.add_emit(th.chans.tid_active, Emit::thread(row, TH_TYPE_TID_ACTIVE).skip_dup());
            bay.add_emit(th.chans.state, Emit::thread(row, TH_TYPE_STATE));
            bay.add_emit(th.chans.cpu_gindex, Emit::thread(row, TH_TYPE_CPU));
            bay.add_emit(th.chans.flush, Emit::thread(row, TH_TYPE_FLUSH));
        }

        let nthreads = system.threads.len();
        for cpu in &system.cpus {
            let row = cpu.id.0;
            let chans = cpu.chans;
            bay.add_emit(chans.nrunning, Emit::cpu(row, CPU_TYPE_NRUN).skip_dup());
            bay.add_emit(chans.pid_running, Emit::cpu(row, CPU_TYPE_PID).skip_dup());
            bay.add_emit(chans.tid_running, Emit::cpu(row, CPU_TYPE_TID).skip_dup());
            bay.add_emit(chans.flush_running, Emit::cpu(row, CPU_TYPE_FLUSH));

            // The flush state of whichever thread is running in the CPU
            let mux = bay.add_mux(chans.th_running, chans.flush_running, select_by_index, nthreads)?;
            for th in &system.threads {
                bay.mux_set_input(mux, th.id.0, th.chans.flush)?;
            }
        }

        OvniModel::add_pcf_types(emu)
    }

    fn event(&mut self, emu: &mut Emu) -> Result<()> {
        let ctx = emu.cur()?.clone();
        let Emu { system, bay, .. } = emu;
        match ctx.event.header.category {
            b'H' => thread_event(system, bay, &ctx),
            b'A' => affinity_event(system, bay, &ctx),
            b'F' => flush_event(system, bay, &ctx),
            // Legacy CPU count and unordered regions carry no state
            b'C' | b'U' => Ok(()),
            _ => Err(unknown_event(&ctx.event)),
        }
    }

    fn finish(&mut self, emu: &mut Emu) -> Result<()> {
        if !emu.is_complete() {
            return Ok(());
        }
        for th in &emu.system.threads {
            if th.state() != ThreadState::Dead {
                emu.check(format!(
                    "thread {} ({}) is {:?} at the end of the trace",
                    th.tid,
                    th.relpath,
                    th.state()
                ))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::{Config, Emulator};
    use crate::recorder::{MemRecorder, Table};
    use crate::serialize::{encode_event, encode_stream_header, i32_payload};
    use crate::stream::{Stream, Timestamp};
    use crate::system::{CpuInfo, ProcInfo, SystemBuilder};
    use crate::trace::Trace;

    struct Ev(u64, &'static [u8; 3], Vec<i32>);

    fn trace(threads: &[&[Ev]]) -> Trace {
        let mut builder = SystemBuilder::new();
        let loom = builder.add_loom("loom.node");
        builder
            .set_cpus(loom, (0..2).map(|i| CpuInfo { index: i, phyid: i }).collect())
            .unwrap();
        let proc = builder.add_proc(
            loom,
            ProcInfo {
                pid: 10,
                appid: 1,
                ..Default::default()
            },
        );
        let mut streams = Vec::new();
        for (i, events) in threads.iter().enumerate() {
            let tid = 100 + i as i32;
            let relpath = format!("loom.node/proc.10/thread.{}.obs", tid);
            builder.add_thread(proc, tid, &relpath);
            let mut buf = Vec::new();
            encode_stream_header(&mut buf);
            for Ev(clock, mcv, args) in events.iter() {
                encode_event(&mut buf, mcv, *clock, &i32_payload(args));
            }
            streams.push(Stream::from_bytes(&relpath, buf).unwrap());
        }
        Trace { builder, streams }
    }

    fn setup(config: Config, threads: &[&[Ev]]) -> (Emulator, MemRecorder) {
        let rec = MemRecorder::new();
        let mut emulator = Emulator::new(config, trace(threads), Box::new(rec.clone())).unwrap();
        emulator.register(Box::new(OvniModel::new())).unwrap();
        emulator.connect().unwrap();
        (emulator, rec)
    }

    #[test]
    fn test_thread_lifecycle() {
        let events = [
            Ev(100, b"OHC", vec![]),
            Ev(110, b"OHx", vec![0]),
            Ev(120, b"OHp", vec![]),
            Ev(130, b"OHr", vec![]),
            Ev(140, b"OF[", vec![]),
            Ev(150, b"OF]", vec![]),
            Ev(160, b"OHe", vec![]),
        ];
        let (mut emulator, rec) = setup(Config::default(), &[&events]);
        emulator.run().unwrap();
        emulator.finish().unwrap();

        let state = |v: ThreadState| Value::Int64(v.into());
        assert_eq!(
            rec.series(Table::Thread, 0, TH_TYPE_STATE),
            vec![
                (Timestamp(10), state(ThreadState::Running)),
                (Timestamp(20), state(ThreadState::Paused)),
                (Timestamp(30), state(ThreadState::Running)),
                (Timestamp(60), state(ThreadState::Dead)),
            ]
        );
        assert_eq!(
            rec.series(Table::Thread, 0, TH_TYPE_FLUSH),
            vec![
                (Timestamp(40), Value::Int64(FLUSHING)),
                (Timestamp(50), Value::Null)
            ]
        );
        // The CPU follows the flush state of its running thread
        assert_eq!(
            rec.series(Table::Cpu, 0, CPU_TYPE_FLUSH),
            vec![
                (Timestamp(40), Value::Int64(FLUSHING)),
                (Timestamp(50), Value::Null)
            ]
        );
        let tids: Vec<Value> = rec
            .series(Table::Cpu, 0, CPU_TYPE_TID)
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(tids.first(), Some(&Value::Int64(100)));
        assert_eq!(tids.last(), Some(&Value::Null));
        assert_eq!(rec.closed_at(), Some(Timestamp(60)));
        assert_eq!(emulator.emu().pcf_thread.find_type(TH_TYPE_STATE).unwrap().nvalues(), 5);
    }

    #[test]
    fn test_two_running_threads() {
        let a = [Ev(10, b"OHx", vec![1])];
        let b = [Ev(20, b"OHx", vec![1])];
        let (mut emulator, _) = setup(Config::default(), &[&a, &b]);
        let err = emulator.run().unwrap_err();
        assert!(matches!(err, Error::Event { ref mcv, .. } if mcv == "OHx"));
    }

    #[test]
    fn test_affinity() {
        let a = [
            Ev(10, b"OHx", vec![0]),
            Ev(20, b"OAs", vec![1]),
            // Moves the other thread to the virtual CPU
            Ev(40, b"OAr", vec![-1, 101]),
            Ev(50, b"OHe", vec![]),
        ];
        let b = [Ev(30, b"OHx", vec![0]), Ev(60, b"OHe", vec![])];
        let (mut emulator, _) = setup(Config::default(), &[&a, &b]);
        for _ in 0..3 {
            emulator.step().unwrap();
        }
        let sys = &emulator.emu().system;
        assert_eq!(sys.thread(ThreadId(0)).cpu(), Some(CpuId(1)));
        assert_eq!(sys.thread(ThreadId(1)).cpu(), Some(CpuId(0)));
        emulator.step().unwrap();
        let sys = &emulator.emu().system;
        let vcpu = sys.looms[0].vcpu;
        assert_eq!(sys.thread(ThreadId(1)).cpu(), Some(vcpu));
        assert_eq!(sys.cpu(vcpu).running(), Some(ThreadId(1)));
        emulator.run().unwrap();
        emulator.finish().unwrap();
    }

    #[test]
    fn test_bad_events() {
        // Pause without running first
        let (mut emulator, _) = setup(Config::default(), &[&[Ev(10, b"OHp", vec![])]]);
        assert!(emulator.step().is_err());

        // Missing argument
        let (mut emulator, _) = setup(Config::default(), &[&[Ev(10, b"OHx", vec![])]]);
        assert!(emulator.step().is_err());

        // Unknown category
        let (mut emulator, _) = setup(Config::default(), &[&[Ev(10, b"OZz", vec![])]]);
        assert!(emulator.step().is_err());

        // Closing a flush region that was never opened
        let events = [Ev(10, b"OHx", vec![0]), Ev(20, b"OF]", vec![])];
        let (mut emulator, _) = setup(Config::default(), &[&events]);
        emulator.step().unwrap();
        assert!(emulator.step().is_err());
    }

    #[test]
    fn test_alive_at_end() {
        let events = [Ev(10, b"OHx", vec![0])];
        let (mut emulator, _) = setup(Config::default(), &[&events]);
        emulator.run().unwrap();
        emulator.finish().unwrap();

        let config = Config {
            linter: true,
            ..Default::default()
        };
        let (mut emulator, _) = setup(config, &[&events]);
        emulator.run().unwrap();
        assert!(emulator.finish().is_err());
    }
}
