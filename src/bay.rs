use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::chan::{Chan, ChanId};
use crate::error::{Error, Result};
use crate::mux::{Mux, MuxId, SelectFn};
use crate::recorder::{Emit, Recorder};
use crate::stream::Timestamp;
use crate::value::Value;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Node {
    Chan(ChanId),
    Mux(MuxId),
}

/// Owns every channel and mux of the emulator and propagates the values
/// written during one event through the dataflow graph:
///
/// ```text
///   input chans ──┐
///                 ├──> mux ──> output chan ──> ...
///   selector ─────┘
/// ```
///
/// Writes go through the bay so it can track which channels became dirty.
/// Nothing is visible to the muxes or the recorder until `propagate` runs.
#[derive(Debug, Default)]
pub struct Bay {
    chans: Vec<Chan>,
    names: BTreeMap<String, ChanId>,
    muxes: Vec<Mux>,
    emits: Vec<Vec<Emit>>,
    graph: DiGraph<Node, ()>,
    chan_nodes: Vec<NodeIndex>,
    mux_nodes: Vec<NodeIndex>,
    // Position of each node in topological order, indexed by node index
    rank: Vec<usize>,
    stale: bool,
    dirty: Vec<ChanId>,
}

impl Bay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel. Channel names must be unique.
    pub fn add_chan(&mut self, chan: Chan) -> Result<ChanId> {
        if self.names.contains_key(chan.name()) {
            return Err(Error::config(format!(
                "channel {} already registered",
                chan.name()
            )));
        }
        if chan.is_dirty() {
            return Err(Error::chan(chan.name(), "cannot register a dirty channel"));
        }
        let id = ChanId(self.chans.len());
        debug!("bay: registering channel {} as {}", chan.name(), id);
        self.names.insert(chan.name().to_owned(), id);
        self.chan_nodes.push(self.graph.add_node(Node::Chan(id)));
        self.chans.push(chan);
        self.emits.push(Vec::new());
        self.stale = true;
        Ok(id)
    }

    pub fn find(&self, name: &str) -> Option<ChanId> {
        self.names.get(name).copied()
    }

    pub fn chan(&self, id: ChanId) -> &Chan {
        &self.chans[id.0]
    }

    pub fn nchans(&self) -> usize {
        self.chans.len()
    }

    pub fn nmuxes(&self) -> usize {
        self.muxes.len()
    }

    /// Creates a mux writing into `output`. Each channel can be the output of
    /// only one mux.
    pub fn add_mux(
        &mut self,
        select: ChanId,
        output: ChanId,
        select_fn: SelectFn,
        ninputs: usize,
    ) -> Result<MuxId> {
        let out_node = self.chan_nodes[output.0];
        if self
            .graph
            .neighbors_directed(out_node, Direction::Incoming)
            .next()
            .is_some()
        {
            return Err(Error::config(format!(
                "channel {} is already the output of a mux",
                self.chans[output.0].name()
            )));
        }

        let id = MuxId(self.muxes.len());
        let name = self.chans[output.0].name().to_owned();
        let node = self.graph.add_node(Node::Mux(id));
        self.graph.add_edge(self.chan_nodes[select.0], node, ());
        self.graph.add_edge(node, out_node, ());
        self.mux_nodes.push(node);
        self.muxes
            .push(Mux::new(name, select, output, select_fn, ninputs));
        self.stale = true;
        Ok(id)
    }

    pub fn mux(&self, id: MuxId) -> &Mux {
        &self.muxes[id.0]
    }

    pub fn mux_set_input(&mut self, mux: MuxId, index: usize, chan: ChanId) -> Result<()> {
        self.muxes[mux.0].set_input(index, chan)?;
        self.graph
            .add_edge(self.chan_nodes[chan.0], self.mux_nodes[mux.0], ());
        self.stale = true;
        Ok(())
    }

    /// Registers `chan` as the source of an output row.
    pub fn add_emit(&mut self, chan: ChanId, emit: Emit) {
        self.emits[chan.0].push(emit);
    }

    fn track(&mut self, id: ChanId, was_dirty: bool) {
        if !was_dirty && self.chans[id.0].is_dirty() {
            self.dirty.push(id);
        }
    }

    pub fn set(&mut self, id: ChanId, value: Value) -> Result<()> {
        let was_dirty = self.chans[id.0].is_dirty();
        self.chans[id.0].set(value)?;
        self.track(id, was_dirty);
        Ok(())
    }

    pub fn push(&mut self, id: ChanId, value: Value) -> Result<()> {
        let was_dirty = self.chans[id.0].is_dirty();
        self.chans[id.0].push(value)?;
        self.track(id, was_dirty);
        Ok(())
    }

    pub fn pop(&mut self, id: ChanId, expected: Value) -> Result<()> {
        let was_dirty = self.chans[id.0].is_dirty();
        self.chans[id.0].pop(expected)?;
        self.track(id, was_dirty);
        Ok(())
    }

    pub fn read(&self, id: ChanId) -> Value {
        self.chans[id.0].read()
    }

    pub fn is_dirty(&self, id: ChanId) -> bool {
        self.chans[id.0].is_dirty()
    }

    /// Checks the whole graph once it is wired: every mux input must be
    /// connected and the graph must be acyclic.
    pub fn validate(&mut self) -> Result<()> {
        for mux in &self.muxes {
            if let Some(i) = (0..mux.ninputs()).find(|i| mux.input(*i).is_none()) {
                return Err(Error::config(format!(
                    "mux of {}: input {} is not connected",
                    mux.name(),
                    i
                )));
            }
        }
        self.stale = true;
        self.sort()
    }

    /// Recomputes the propagation order after the graph changed. A cycle is
    /// a configuration error.
    fn sort(&mut self) -> Result<()> {
        if !self.stale {
            return Ok(());
        }
        let order = toposort(&self.graph, None).map_err(|cycle| {
            let what = match self.graph[cycle.node_id()] {
                Node::Chan(id) => self.chans[id.0].name().to_owned(),
                Node::Mux(id) => format!("mux of {}", self.muxes[id.0].name()),
            };
            Error::config(format!("cycle in the channel graph at {}", what))
        })?;
        self.rank = vec![0; self.graph.node_count()];
        for (pos, node) in order.into_iter().enumerate() {
            self.rank[node.index()] = pos;
        }
        self.stale = false;
        Ok(())
    }

    /// Flushes every dirty channel in dependency order: each flushed channel
    /// is written to the recorder and its muxes are recomputed, which may
    /// dirty their outputs in turn. Every node is visited at most once.
    pub fn propagate(&mut self, time: Timestamp, rec: &mut dyn Recorder) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        self.sort()?;

        let mut pending = BTreeSet::new();
        for id in self.dirty.drain(..) {
            let node = self.chan_nodes[id.0];
            pending.insert((self.rank[node.index()], node));
        }

        while let Some((_, node)) = pending.pop_first() {
            match self.graph[node] {
                Node::Chan(id) => {
                    let value = self.chans[id.0].read();
                    for emit in &self.emits[id.0] {
                        rec.emit(time, emit, value)?;
                    }
                    self.chans[id.0].flush()?;
                    for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                        pending.insert((self.rank[next.index()], next));
                    }
                }
                Node::Mux(id) => {
                    let mux = &self.muxes[id.0];
                    let selector = self.chans[mux.select().0].read();
                    let value = match mux.choose(selector)? {
                        Some(input) => self.chans[input.0].read(),
                        None => Value::Null,
                    };
                    let output = mux.output();
                    let out = &mut self.chans[output.0];
                    if out.read() != value {
                        out.set(value)?;
                        let out_node = self.chan_nodes[output.0];
                        pending.insert((self.rank[out_node.index()], out_node));
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chan::ChanProp;
    use crate::mux::select_by_index;
    use crate::recorder::{MemRecorder, Table};

    #[test]
    fn test_duplicate_name() {
        let mut bay = Bay::new();
        bay.add_chan(Chan::single("a")).unwrap();
        assert!(bay.add_chan(Chan::single("a")).is_err());
        assert_eq!(bay.find("a"), Some(ChanId(0)));
    }

    #[test]
    fn test_flush_emits() {
        let mut bay = Bay::new();
        let mut rec = MemRecorder::new();
        let a = bay.add_chan(Chan::single("a")).unwrap();
        bay.add_emit(a, Emit::thread(0, 4));

        bay.set(a, Value::Int64(1)).unwrap();
        // Not flushed yet
        assert!(rec.records().is_empty());
        assert!(bay.set(a, Value::Int64(2)).is_err());
        bay.propagate(Timestamp(10), &mut rec).unwrap();
        assert!(!bay.is_dirty(a));

        bay.set(a, Value::Int64(2)).unwrap();
        bay.propagate(Timestamp(20), &mut rec).unwrap();
        // Nothing dirty, nothing emitted
        bay.propagate(Timestamp(30), &mut rec).unwrap();

        assert_eq!(
            rec.series(Table::Thread, 0, 4),
            vec![
                (Timestamp(10), Value::Int64(1)),
                (Timestamp(20), Value::Int64(2))
            ]
        );
    }

    #[test]
    fn test_mux_chain() {
        let mut bay = Bay::new();
        let mut rec = MemRecorder::new();
        let in0 = bay.add_chan(Chan::single("in0")).unwrap();
        let in1 = bay.add_chan(Chan::single("in1")).unwrap();
        let sel = bay
            .add_chan(Chan::single("sel").with_prop(ChanProp::Duplicates, true))
            .unwrap();
        let out = bay.add_chan(Chan::single("out")).unwrap();
        bay.add_emit(out, Emit::cpu(3, 1));

        let mux = bay.add_mux(sel, out, select_by_index, 2).unwrap();
        bay.mux_set_input(mux, 0, in0).unwrap();
        bay.mux_set_input(mux, 1, in1).unwrap();
        assert!(bay.add_mux(sel, out, select_by_index, 2).is_err());

        bay.set(in0, Value::Int64(100)).unwrap();
        bay.set(in1, Value::Int64(200)).unwrap();
        bay.propagate(Timestamp(1), &mut rec).unwrap();
        // Selector is null
        assert_eq!(bay.read(out), Value::Null);

        bay.set(sel, Value::Int64(1)).unwrap();
        bay.propagate(Timestamp(2), &mut rec).unwrap();
        assert_eq!(bay.read(out), Value::Int64(200));

        // Changing the selected input and the selector in the same step
        bay.set(sel, Value::Int64(0)).unwrap();
        bay.set(in0, Value::Int64(101)).unwrap();
        bay.propagate(Timestamp(3), &mut rec).unwrap();
        assert_eq!(bay.read(out), Value::Int64(101));

        // An unselected input doesn't change the output
        bay.set(in1, Value::Int64(201)).unwrap();
        bay.propagate(Timestamp(4), &mut rec).unwrap();

        bay.set(sel, Value::Null).unwrap();
        bay.propagate(Timestamp(5), &mut rec).unwrap();

        assert_eq!(
            rec.series(Table::Cpu, 3, 1),
            vec![
                (Timestamp(2), Value::Int64(200)),
                (Timestamp(3), Value::Int64(101)),
                (Timestamp(5), Value::Null)
            ]
        );
    }

    #[test]
    fn test_validate() {
        let mut bay = Bay::new();
        let sel = bay.add_chan(Chan::single("sel")).unwrap();
        let in0 = bay.add_chan(Chan::single("in0")).unwrap();
        let out = bay.add_chan(Chan::single("out")).unwrap();
        let mux = bay.add_mux(sel, out, select_by_index, 2).unwrap();
        bay.mux_set_input(mux, 0, in0).unwrap();
        assert!(matches!(bay.validate(), Err(Error::Config(_))));
        bay.mux_set_input(mux, 1, in0).unwrap();
        bay.validate().unwrap();

        // Caught before anything is written
        let m2 = bay.add_mux(out, in0, select_by_index, 1).unwrap();
        bay.mux_set_input(m2, 0, out).unwrap();
        assert!(matches!(bay.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_cycle() {
        let mut bay = Bay::new();
        let mut rec = MemRecorder::new();
        let a = bay.add_chan(Chan::single("a")).unwrap();
        let b = bay.add_chan(Chan::single("b")).unwrap();
        let m1 = bay.add_mux(a, b, select_by_index, 1).unwrap();
        bay.mux_set_input(m1, 0, a).unwrap();
        let m2 = bay.add_mux(b, a, select_by_index, 1).unwrap();
        bay.mux_set_input(m2, 0, b).unwrap();

        bay.set(a, Value::Int64(0)).unwrap();
        assert!(matches!(
            bay.propagate(Timestamp(0), &mut rec),
            Err(Error::Config(_))
        ));
    }
}
