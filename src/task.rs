use std::collections::BTreeMap;

use log::debug;

use crate::error::{Error, Result};
use crate::system::ThreadId;
use crate::thread::ThreadState;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Paused,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskType {
    pub id: u32,
    /// Value shown in the traces, derived from the label so the same label
    /// gets the same color in every process.
    pub gid: u32,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: u32,
    pub type_id: u32,
    pub state: TaskState,
    /// Thread that executed the task. Kept after the task ends.
    pub thread: Option<ThreadId>,
}

fn jen_mix(mut a: u32, mut b: u32, mut c: u32) -> (u32, u32, u32) {
    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 13);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 8);
    c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 13);
    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 12);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 16);
    c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 5);
    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 3);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 10);
    c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 15);
    (a, b, c)
}

/// Bob Jenkins' lookup2 hash, the default hash of uthash, so the gids match
/// the ones of other ovni tools.
fn jenkins_hash(key: &[u8]) -> u32 {
    let word = |w: &[u8]| {
        w.iter()
            .enumerate()
            .fold(0u32, |acc, (i, b)| acc.wrapping_add((*b as u32) << (8 * i)))
    };
    let mut a: u32 = 0x9e37_79b9;
    let mut b: u32 = 0x9e37_79b9;
    let mut c: u32 = 0xfeed_beef;

    let mut chunks = key.chunks_exact(12);
    for chunk in &mut chunks {
        a = a.wrapping_add(word(&chunk[0..4]));
        b = b.wrapping_add(word(&chunk[4..8]));
        c = c.wrapping_add(word(&chunk[8..12]));
        (a, b, c) = jen_mix(a, b, c);
    }

    c = c.wrapping_add(key.len() as u32);
    // The low byte of c is reserved for the length
    let tail = chunks.remainder();
    a = a.wrapping_add(word(&tail[..tail.len().min(4)]));
    if tail.len() > 4 {
        b = b.wrapping_add(word(&tail[4..tail.len().min(8)]));
    }
    if tail.len() > 8 {
        c = c.wrapping_add(word(&tail[8..]) << 8);
    }
    let (_, _, c) = jen_mix(a, b, c);
    c
}

pub fn type_gid(label: &str) -> u32 {
    // Use non-negative values
    let mut gid = jenkins_hash(label.as_bytes()) & 0x7fff_ffff;
    // Avoid bad colors for the first values
    gid += 666;
    if gid == 0 {
        gid += 1;
    }
    gid
}

/// Tasks being executed by one thread; the last element is the innermost.
#[derive(Debug, Default, Clone)]
pub struct TaskStack {
    tasks: Vec<u32>,
}

impl TaskStack {
    pub fn top(&self) -> Option<u32> {
        self.tasks.last().copied()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Tasks and task types of one process.
#[derive(Debug, Default)]
pub struct TaskInfo {
    tasks: BTreeMap<u32, Task>,
    types: BTreeMap<u32, TaskType>,
}

impl TaskInfo {
    pub fn create_type(&mut self, id: u32, label: &str) -> Result<&TaskType> {
        if id == 0 {
            return Err(Error::state("invalid task type id 0"));
        }
        if self.types.contains_key(&id) {
            return Err(Error::state(format!(
                "a task type with id {} already exists",
                id
            )));
        }
        let gid = type_gid(label);
        debug!("new task type created id={} label={} gid={}", id, label, gid);
        Ok(self.types.entry(id).or_insert(TaskType {
            id,
            gid,
            label: label.to_owned(),
        }))
    }

    pub fn task_type(&self, id: u32) -> Option<&TaskType> {
        self.types.get(&id)
    }

    pub fn types(&self) -> impl Iterator<Item = &TaskType> {
        self.types.values()
    }

    pub fn task(&self, id: u32) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Creates a task. The id of a dead task can be reused.
    pub fn create(&mut self, id: u32, type_id: u32) -> Result<()> {
        // Zero is the idle value in the traces
        if id == 0 {
            return Err(Error::state("task id cannot be 0"));
        }
        if let Some(old) = self.tasks.get(&id) {
            if old.state != TaskState::Dead {
                return Err(Error::state(format!(
                    "cannot create task: task id {} already exists",
                    id
                )));
            }
        }
        if !self.types.contains_key(&type_id) {
            return Err(Error::state(format!(
                "cannot create task {}: unknown type id {}",
                id, type_id
            )));
        }
        self.tasks.insert(
            id,
            Task {
                id,
                type_id,
                state: TaskState::Created,
                thread: None,
            },
        );
        debug!("new task created id={}", id);
        Ok(())
    }

    /// The task at the top of the stack, if it is running.
    pub fn running(&self, stack: &TaskStack) -> Option<&Task> {
        stack
            .top()
            .and_then(|id| self.tasks.get(&id))
            .filter(|task| task.state == TaskState::Running)
    }

    fn get_mut(&mut self, id: u32, what: &str) -> Result<&mut Task> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| Error::state(format!("cannot {}: unknown task id {}", what, id)))
    }

    pub fn execute(
        &mut self,
        stack: &mut TaskStack,
        id: u32,
        th: ThreadId,
        th_state: ThreadState,
    ) -> Result<()> {
        let top_state = stack
            .top()
            .and_then(|top| self.tasks.get(&top))
            .map(|task| task.state);
        let task = self.get_mut(id, "execute")?;
        if task.state != TaskState::Created {
            return Err(Error::state(format!(
                "cannot execute task {}: state is not created",
                id
            )));
        }
        if task.thread.is_some() {
            return Err(Error::state(format!(
                "cannot execute task {}: already has a thread assigned",
                id
            )));
        }
        if th_state != ThreadState::Running {
            return Err(Error::state(format!(
                "cannot execute task {}: thread state is not running",
                id
            )));
        }
        if stack.top() == Some(id) {
            return Err(Error::state(format!(
                "thread already has assigned task {}",
                id
            )));
        }
        if top_state.is_some_and(|s| s != TaskState::Running) {
            return Err(Error::state(format!(
                "cannot execute task {}: nested task from a non-running task",
                id
            )));
        }

        task.state = TaskState::Running;
        task.thread = Some(th);
        stack.tasks.push(id);
        debug!("task id={} runs now", id);
        Ok(())
    }

    fn check_top(
        &mut self,
        stack: &TaskStack,
        id: u32,
        th: ThreadId,
        th_state: ThreadState,
        expected: TaskState,
        what: &str,
    ) -> Result<&mut Task> {
        let task = self.get_mut(id, what)?;
        if task.state != expected {
            return Err(Error::state(format!(
                "cannot {} task {}: state is {:?}, expected {:?}",
                what, id, task.state, expected
            )));
        }
        if task.thread.is_none() {
            return Err(Error::state(format!(
                "cannot {} task {}: no thread assigned",
                what, id
            )));
        }
        if th_state != ThreadState::Running {
            return Err(Error::state(format!(
                "cannot {} task {}: thread is not running",
                what, id
            )));
        }
        if stack.top() != Some(id) {
            return Err(Error::state(format!(
                "cannot {} task {}: thread has assigned a different task",
                what, id
            )));
        }
        if task.thread != Some(th) {
            return Err(Error::state(format!(
                "cannot {} task {}: assigned to a different thread",
                what, id
            )));
        }
        Ok(task)
    }

    pub fn pause(
        &mut self,
        stack: &mut TaskStack,
        id: u32,
        th: ThreadId,
        th_state: ThreadState,
    ) -> Result<()> {
        let task = self.check_top(stack, id, th, th_state, TaskState::Running, "pause")?;
        task.state = TaskState::Paused;
        debug!("task id={} pauses", id);
        Ok(())
    }

    pub fn resume(
        &mut self,
        stack: &mut TaskStack,
        id: u32,
        th: ThreadId,
        th_state: ThreadState,
    ) -> Result<()> {
        let task = self.check_top(stack, id, th, th_state, TaskState::Paused, "resume")?;
        task.state = TaskState::Running;
        debug!("task id={} resumes", id);
        Ok(())
    }

    /// Ends the task and removes it from the stack. The thread stays
    /// assigned to the task.
    pub fn end(
        &mut self,
        stack: &mut TaskStack,
        id: u32,
        th: ThreadId,
        th_state: ThreadState,
    ) -> Result<()> {
        let task = self.check_top(stack, id, th, th_state, TaskState::Running, "end")?;
        task.state = TaskState::Dead;
        stack.tasks.pop();
        debug!("task id={} ends", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TH: ThreadId = ThreadId(0);
    const RUN: ThreadState = ThreadState::Running;

    fn info() -> TaskInfo {
        let mut info = TaskInfo::default();
        info.create_type(7, "compute").unwrap();
        info
    }

    #[test]
    fn test_gid() {
        // Same values as the uthash based tools
        assert_eq!(type_gid("compute"), 999074775);
        assert_eq!(type_gid("main"), 1423278814);
        assert_eq!(type_gid("Unlabeled0"), 286559091);
        // Longer than one 12 byte block
        assert_eq!(type_gid("a long task label"), 1592954227);
        assert_eq!(type_gid(""), 249678660);
        assert_ne!(type_gid("compute"), type_gid("io"));
    }

    #[test]
    fn test_types() {
        let mut info = info();
        assert!(info.create_type(7, "other").is_err());
        assert!(info.create_type(0, "zero").is_err());
        assert_eq!(info.task_type(7).unwrap().label, "compute");
        assert!(info.create(1, 8).is_err());
        assert!(info.create(0, 7).is_err());
        assert!(info.task(0).is_none());
    }

    #[test]
    fn test_lifecycle() {
        let mut info = info();
        let mut stack = TaskStack::default();
        info.create(1, 7).unwrap();
        assert!(info.create(1, 7).is_err());

        // The thread must be running
        assert!(info.execute(&mut stack, 1, TH, ThreadState::Paused).is_err());
        info.execute(&mut stack, 1, TH, RUN).unwrap();
        assert!(info.execute(&mut stack, 1, TH, RUN).is_err());
        assert_eq!(info.running(&stack).map(|t| t.id), Some(1));

        info.pause(&mut stack, 1, TH, RUN).unwrap();
        assert!(info.running(&stack).is_none());
        assert!(info.pause(&mut stack, 1, TH, RUN).is_err());
        assert!(info.end(&mut stack, 1, TH, RUN).is_err());
        info.resume(&mut stack, 1, TH, RUN).unwrap();
        assert!(info.end(&mut stack, 1, ThreadId(1), RUN).is_err());
        info.end(&mut stack, 1, TH, RUN).unwrap();
        assert!(stack.is_empty());
        assert_eq!(info.task(1).unwrap().state, TaskState::Dead);

        // A dead task is not created, so it cannot run again...
        assert!(info.execute(&mut stack, 1, TH, RUN).is_err());
        // ...unless created again
        info.create(1, 7).unwrap();
        info.execute(&mut stack, 1, TH, RUN).unwrap();
    }

    #[test]
    fn test_nested() {
        let mut info = info();
        let mut stack = TaskStack::default();
        for id in 1..=3 {
            info.create(id, 7).unwrap();
        }
        info.execute(&mut stack, 1, TH, RUN).unwrap();
        info.execute(&mut stack, 2, TH, RUN).unwrap();
        assert_eq!(stack.len(), 2);

        // Only the top can change
        assert!(info.pause(&mut stack, 1, TH, RUN).is_err());
        info.pause(&mut stack, 2, TH, RUN).unwrap();
        // Nested execution from a paused task
        assert!(info.execute(&mut stack, 3, TH, RUN).is_err());
        info.resume(&mut stack, 2, TH, RUN).unwrap();
        info.end(&mut stack, 2, TH, RUN).unwrap();
        assert_eq!(info.running(&stack).map(|t| t.id), Some(1));
        info.end(&mut stack, 1, TH, RUN).unwrap();
        assert!(stack.is_empty());
    }
}
