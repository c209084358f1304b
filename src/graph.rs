//! Live graph state - mutated by the control thread under the graph lock.
//!
//! Everything here is the "live" half of the double-buffered topology. The
//! renderer never reads it while rendering; it copies the pieces listed in the
//! dirty sets into its own snapshots at quantum boundaries.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::{HashMap, HashSet};
use petgraph::algo::has_path_connecting;
use petgraph::graphmap::DiGraphMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::bus::MAX_CHANNELS;
use crate::error::{GraphError, PortKind, Result};
use crate::node::{ChannelConfig, InputInfo, NodeId, NodeShared, OutputChannels, OutputInfo, RefKind};
use crate::render::RenderNode;

/// Which junction of a node an edge lands on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) enum Port {
    Input(usize),
    Param(usize),
}

/// A summing junction: one node input or one parameter's modulation input.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct JunctionId {
    pub(crate) node: NodeId,
    pub(crate) port: Port,
}

impl JunctionId {
    pub(crate) fn input(node: NodeId, index: usize) -> Self {
        Self { node, port: Port::Input(index) }
    }

    pub(crate) fn param(node: NodeId, index: usize) -> Self {
        Self { node, port: Port::Param(index) }
    }
}

/// One output port of one node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct OutputRef {
    pub(crate) node: NodeId,
    pub(crate) output: usize,
}

impl OutputRef {
    pub(crate) fn new(node: NodeId, output: usize) -> Self {
        Self { node, output }
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct LiveJunction {
    pub(crate) connections: Vec<OutputRef>,
    pub(crate) channels: usize,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct LiveOutput {
    pub(crate) consumers: Vec<JunctionId>,
    pub(crate) channels: usize,
}

/// Control-side bookkeeping for one node.
pub(crate) struct NodeRecord {
    pub(crate) shared: Arc<NodeShared>,
    pub(crate) inputs: Vec<LiveJunction>,
    pub(crate) params: Vec<LiveJunction>,
    pub(crate) outputs: Vec<LiveOutput>,
    pub(crate) output_rules: Vec<OutputChannels>,
    pub(crate) config: ChannelConfig,
    /// Eligible for automatic pull when its output is unconsumed.
    pub(crate) auto_pull: bool,
}

impl NodeRecord {
    pub(crate) fn new(
        shared: Arc<NodeShared>,
        params: usize,
        output_rules: Vec<OutputChannels>,
        config: ChannelConfig,
    ) -> Self {
        Self {
            inputs: (0..shared.number_of_inputs).map(|_| LiveJunction::default()).collect(),
            params: (0..params)
                .map(|_| LiveJunction {
                    connections: Vec::new(),
                    channels: 1,
                })
                .collect(),
            outputs: (0..output_rules.len()).map(|_| LiveOutput::default()).collect(),
            shared,
            output_rules,
            config,
            auto_pull: false,
        }
    }

    pub(crate) fn with_auto_pull(mut self) -> Self {
        self.auto_pull = true;
        self
    }

    fn junction(&self, port: Port) -> Option<&LiveJunction> {
        match port {
            Port::Input(i) => self.inputs.get(i),
            Port::Param(i) => self.params.get(i),
        }
    }

    fn junction_mut(&mut self, port: Port) -> Option<&mut LiveJunction> {
        match port {
            Port::Input(i) => self.inputs.get_mut(i),
            Port::Param(i) => self.params.get_mut(i),
        }
    }

    fn wants_automatic_pull(&self) -> bool {
        self.auto_pull
            && self.inputs.iter().any(|j| !j.connections.is_empty())
            && self.outputs.iter().all(|o| o.consumers.is_empty())
    }
}

pub(crate) type EndedHandler = Box<dyn FnMut() + Send>;

/// The live graph. Only ever touched with the graph lock held.
pub(crate) struct Graph {
    pub(crate) nodes: HashMap<NodeId, NodeRecord>,
    topology: DiGraphMap<NodeId, u32>,
    /// Sources kept alive by the context while they play.
    pub(crate) referenced: HashSet<NodeId>,
    /// Render nodes created since the renderer last took the lock.
    pub(crate) admissions: Vec<Box<RenderNode>>,
    pub(crate) dirty_junctions: HashSet<JunctionId>,
    pub(crate) dirty_outputs: HashSet<OutputRef>,
    /// Nodes released since the last post-render pass.
    pub(crate) deletions: Vec<NodeId>,
    automatic_pull: HashSet<NodeId>,
    pub(crate) automatic_pull_dirty: bool,
    ended_handlers: HashMap<NodeId, EndedHandler>,
    /// Handlers of sources that have finished, waiting to be run on the
    /// control thread.
    pub(crate) ended_ready: Vec<(NodeId, EndedHandler)>,
    pub(crate) renderer_alive: bool,
    next_id: u64,
    max_channel_count: usize,
}

impl Graph {
    pub(crate) fn new(max_channel_count: usize) -> Self {
        Self {
            nodes: HashMap::with_capacity(64),
            topology: DiGraphMap::with_capacity(64, 64),
            referenced: HashSet::new(),
            admissions: Vec::new(),
            dirty_junctions: HashSet::with_capacity(64),
            dirty_outputs: HashSet::with_capacity(64),
            deletions: Vec::with_capacity(16),
            automatic_pull: HashSet::new(),
            automatic_pull_dirty: false,
            ended_handlers: HashMap::new(),
            ended_ready: Vec::new(),
            renderer_alive: true,
            next_id: 0,
            max_channel_count: max_channel_count.clamp(1, MAX_CHANNELS),
        }
    }

    pub(crate) fn allocate_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn max_channel_count(&self) -> usize {
        self.max_channel_count
    }

    /// Add a node. Its render half is handed to the renderer at the next
    /// quantum boundary, or dropped if the renderer is gone.
    pub(crate) fn insert(&mut self, record: NodeRecord, render: Box<RenderNode>) {
        let id = record.shared.id;
        debug!(?id, kind = ?record.shared.kind, "node created");

        self.topology.add_node(id);
        self.nodes.insert(id, record);
        if self.renderer_alive {
            self.admissions.push(render);
        }
        self.renegotiate(id);
        self.mark_node_dirty(id);
        self.automatic_pull_dirty = true;
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    fn live_record(&self, id: NodeId) -> Result<&NodeRecord> {
        self.nodes
            .get(&id)
            .filter(|r| !r.shared.is_marked_for_deletion())
            .ok_or(GraphError::NodeReleased(id))
    }

    pub(crate) fn connect(&mut self, from: OutputRef, to: JunctionId) -> Result<()> {
        let source = self.live_record(from.node)?;
        if from.output >= source.outputs.len() {
            return Err(GraphError::IndexOutOfRange {
                node: from.node,
                kind: PortKind::Output,
                index: from.output,
                count: source.outputs.len(),
            });
        }
        let target = self.live_record(to.node)?;
        let junction = target.junction(to.port).ok_or_else(|| {
            let (index, count) = match to.port {
                Port::Input(index) => (index, target.inputs.len()),
                Port::Param(index) => (index, target.params.len()),
            };
            GraphError::IndexOutOfRange {
                node: to.node,
                kind: PortKind::Input,
                index,
                count,
            }
        })?;

        if junction.connections.contains(&from) {
            trace!(?from, ?to, "already connected");
            return Ok(());
        }
        if from.node == to.node || has_path_connecting(&self.topology, to.node, from.node, None) {
            return Err(GraphError::CycleDetected {
                from: from.node,
                to: to.node,
            });
        }

        if let Some(junction) = self.nodes.get_mut(&to.node).and_then(|r| r.junction_mut(to.port)) {
            junction.connections.push(from);
        }
        if let Some(output) = self.nodes.get_mut(&from.node).and_then(|r| r.outputs.get_mut(from.output)) {
            output.consumers.push(to);
        }
        match self.topology.edge_weight_mut(from.node, to.node) {
            Some(weight) => *weight += 1,
            None => {
                self.topology.add_edge(from.node, to.node, 1);
            }
        }
        if let Some(target) = self.nodes.get(&to.node) {
            target.shared.add_ref(RefKind::Connection);
        }

        debug!(from = ?from.node, output = from.output, to = ?to.node, port = ?to.port, "connected");
        self.dirty_junctions.insert(to);
        self.dirty_outputs.insert(from);
        self.automatic_pull_dirty = true;
        self.renegotiate(to.node);
        Ok(())
    }

    /// Remove every edge leaving `from`.
    pub(crate) fn disconnect_output(&mut self, from: OutputRef) -> Result<()> {
        self.live_record(from.node)?;
        self.remove_consumers(from);
        Ok(())
    }

    /// Remove the single edge `from -> to`.
    pub(crate) fn disconnect_edge(&mut self, from: OutputRef, to: JunctionId) -> Result<()> {
        self.live_record(from.node)?;
        let connected = self
            .nodes
            .get(&from.node)
            .and_then(|r| r.outputs.get(from.output))
            .is_some_and(|o| o.consumers.contains(&to));
        if !connected {
            return Err(GraphError::NotConnected {
                from: from.node,
                to: to.node,
            });
        }

        if let Some(output) = self.nodes.get_mut(&from.node).and_then(|r| r.outputs.get_mut(from.output)) {
            output.consumers.retain(|c| *c != to);
        }
        self.unlink(from, to);
        Ok(())
    }

    fn remove_consumers(&mut self, from: OutputRef) {
        let consumers = match self.nodes.get_mut(&from.node).and_then(|r| r.outputs.get_mut(from.output)) {
            Some(output) => core::mem::take(&mut output.consumers),
            None => return,
        };
        for to in consumers {
            self.unlink(from, to);
        }
    }

    /// Drop `from` from `to`'s connections and release the connection ref it
    /// held. The caller has already removed `to` from the output's consumers.
    fn unlink(&mut self, from: OutputRef, to: JunctionId) {
        if let Some(junction) = self.nodes.get_mut(&to.node).and_then(|r| r.junction_mut(to.port)) {
            junction.connections.retain(|c| *c != from);
        }

        let remaining = match self.topology.edge_weight_mut(from.node, to.node) {
            Some(weight) => {
                *weight = weight.saturating_sub(1);
                *weight
            }
            None => 0,
        };
        if remaining == 0 {
            self.topology.remove_edge(from.node, to.node);
        }

        debug!(from = ?from.node, output = from.output, to = ?to.node, port = ?to.port, "disconnected");
        self.dirty_junctions.insert(to);
        self.dirty_outputs.insert(from);
        self.automatic_pull_dirty = true;
        self.renegotiate(to.node);
        self.release(to.node, RefKind::Connection);
    }

    /// Keep a playing source alive until it finishes.
    pub(crate) fn add_reference(&mut self, id: NodeId) {
        if let Some(record) = self.nodes.get(&id) {
            if self.referenced.insert(id) {
                record.shared.add_ref(RefKind::Connection);
                self.automatic_pull_dirty = true;
                trace!(?id, "source referenced");
            }
        }
    }

    pub(crate) fn release_reference(&mut self, id: NodeId) {
        if self.referenced.remove(&id) {
            self.automatic_pull_dirty = true;
            trace!(?id, "source released");
            self.release(id, RefKind::Connection);
        }
    }

    pub(crate) fn set_ended_handler(&mut self, id: NodeId, handler: EndedHandler) {
        if !self.contains(id) {
            return;
        }
        self.ended_handlers.insert(id, handler);
        // Keep room so the renderer never grows this list.
        self.ended_ready.reserve(self.ended_handlers.len());
    }

    /// A started source has finished playing: queue its ended handler and
    /// drop the reference that kept it alive.
    pub(crate) fn source_finished(&mut self, id: NodeId) {
        if let Some(handler) = self.ended_handlers.remove(&id) {
            self.ended_ready.push((id, handler));
        }
        self.release_reference(id);
    }

    /// Drop one reference of `kind` with the lock held, finishing the node
    /// when nothing references it any more.
    pub(crate) fn release(&mut self, id: NodeId, kind: RefKind) {
        let Some(record) = self.nodes.get(&id) else {
            return;
        };
        if record.shared.release(kind) {
            self.finish_deref(id);
        }
    }

    /// Tear down a node whose reference counts both reached zero.
    ///
    /// Disconnecting the node's outputs may release further nodes downstream.
    /// The render half is queued for deletion and freed by the renderer after
    /// its next render pass.
    pub(crate) fn finish_deref(&mut self, id: NodeId) {
        let Some(record) = self.nodes.get(&id) else {
            return;
        };
        if !record.shared.is_unreferenced() || !record.shared.mark_for_deletion() {
            return;
        }
        let outputs = record.outputs.len();
        debug!(?id, kind = ?record.shared.kind, "node released");

        for output in 0..outputs {
            self.remove_consumers(OutputRef::new(id, output));
        }

        self.nodes.remove(&id);
        self.topology.remove_node(id);
        self.referenced.remove(&id);
        self.dirty_junctions.retain(|j| j.node != id);
        self.dirty_outputs.retain(|o| o.node != id);
        if self.automatic_pull.remove(&id) {
            self.automatic_pull_dirty = true;
        }
        // May drop handles captured by the callback; those defer through the
        // context's pending-finish path since the lock is held here.
        self.ended_handlers.remove(&id);

        if let Some(pos) = self.admissions.iter().position(|n| n.id() == id) {
            self.admissions.swap_remove(pos);
            return;
        }
        if self.renderer_alive {
            self.deletions.push(id);
        }
    }

    pub(crate) fn channel_config(&self, id: NodeId) -> Option<ChannelConfig> {
        self.nodes.get(&id).map(|r| r.config)
    }

    pub(crate) fn set_channel_config(&mut self, id: NodeId, config: ChannelConfig) -> Result<()> {
        if config.count == 0 || config.count > self.max_channel_count {
            return Err(GraphError::InvalidChannelCount {
                count: config.count,
                max: self.max_channel_count,
            });
        }
        let record = self
            .nodes
            .get_mut(&id)
            .filter(|r| !r.shared.is_marked_for_deletion())
            .ok_or(GraphError::NodeReleased(id))?;
        if record.config == config {
            return Ok(());
        }
        record.config = config;
        debug!(?id, count = config.count, mode = ?config.mode, interpretation = ?config.interpretation, "channel config changed");

        self.mark_node_dirty(id);
        self.renegotiate(id);
        Ok(())
    }

    /// Change how an output's channel count is chosen, e.g. when a buffer with
    /// a different channel count is assigned.
    pub(crate) fn set_output_rule(&mut self, id: NodeId, output: usize, rule: OutputChannels) {
        if let Some(slot) = self.nodes.get_mut(&id).and_then(|r| r.output_rules.get_mut(output)) {
            if *slot != rule {
                *slot = rule;
                self.renegotiate(id);
            }
        }
    }

    pub(crate) fn input_info(&self, id: NodeId, index: usize) -> Result<InputInfo> {
        let record = self.live_record(id)?;
        let junction = record.inputs.get(index).ok_or(GraphError::IndexOutOfRange {
            node: id,
            kind: PortKind::Input,
            index,
            count: record.inputs.len(),
        })?;
        Ok(InputInfo {
            index,
            channel_count: junction.channels,
            connections: junction.connections.len(),
        })
    }

    pub(crate) fn output_info(&self, id: NodeId, index: usize) -> Result<OutputInfo> {
        let record = self.live_record(id)?;
        let output = record.outputs.get(index).ok_or(GraphError::IndexOutOfRange {
            node: id,
            kind: PortKind::Output,
            index,
            count: record.outputs.len(),
        })?;
        Ok(OutputInfo {
            index,
            channel_count: output.channels,
            fan_out: output.consumers.len(),
        })
    }

    /// Number of live edges, counting parameter connections.
    pub(crate) fn connection_count(&self) -> usize {
        self.nodes
            .values()
            .map(|r| {
                r.inputs.iter().chain(&r.params).map(|j| j.connections.len()).sum::<usize>()
            })
            .sum()
    }

    /// Recompute the automatic-pull set if topology changed since the last
    /// call, writing it into `out`. Returns whether `out` was rewritten.
    pub(crate) fn refresh_automatic_pull(&mut self, out: &mut Vec<NodeId>) -> bool {
        if !self.automatic_pull_dirty {
            return false;
        }
        self.automatic_pull_dirty = false;
        self.automatic_pull.clear();
        self.automatic_pull.extend(
            self.nodes
                .iter()
                .filter(|(id, r)| {
                    // Started sources must reach their stop time even when no
                    // path leads to the destination. Sources the destination
                    // already pulled are skipped by the once-per-quantum check.
                    r.wants_automatic_pull() || self.referenced.contains(*id)
                })
                .map(|(id, _)| *id),
        );
        out.clear();
        out.extend(self.automatic_pull.iter().copied());
        out.sort_unstable();
        true
    }

    pub(crate) fn is_automatic_pull(&self, id: NodeId) -> bool {
        self.automatic_pull.contains(&id)
    }

    fn mark_node_dirty(&mut self, id: NodeId) {
        let Some(record) = self.nodes.get(&id) else {
            return;
        };
        let junctions = (0..record.inputs.len())
            .map(|i| JunctionId::input(id, i))
            .chain((0..record.params.len()).map(|i| JunctionId::param(id, i)));
        self.dirty_junctions.extend(junctions);
        self.dirty_outputs
            .extend((0..record.outputs.len()).map(|o| OutputRef::new(id, o)));
    }

    /// Re-derive input and output channel counts starting at `start` and
    /// propagating downstream through every output whose count changed.
    fn renegotiate(&mut self, start: NodeId) {
        let mut work: SmallVec<[NodeId; 8]> = SmallVec::new();
        work.push(start);

        while let Some(id) = work.pop() {
            let Some(record) = self.nodes.get(&id) else {
                continue;
            };
            let input_counts: SmallVec<[usize; 4]> = record
                .inputs
                .iter()
                .map(|junction| {
                    let widest = junction
                        .connections
                        .iter()
                        .filter_map(|c| self.nodes.get(&c.node)?.outputs.get(c.output))
                        .map(|o| o.channels)
                        .max();
                    record.config.resolve(widest)
                })
                .collect();

            let Some(record) = self.nodes.get_mut(&id) else {
                continue;
            };
            for (index, (junction, count)) in record.inputs.iter_mut().zip(input_counts).enumerate() {
                if junction.channels != count {
                    junction.channels = count;
                    self.dirty_junctions.insert(JunctionId::input(id, index));
                }
            }

            for index in 0..record.outputs.len() {
                let count = match record.output_rules[index] {
                    OutputChannels::Fixed(n) => n,
                    OutputChannels::FollowInput(i) => record.inputs.get(i).map_or(1, |j| j.channels),
                }
                .max(1);
                let output = &mut record.outputs[index];
                if output.channels != count {
                    trace!(?id, output = index, channels = count, "output channels changed");
                    output.channels = count;
                    self.dirty_outputs.insert(OutputRef::new(id, index));
                    work.extend(output.consumers.iter().map(|c| c.node));
                }
            }
        }
    }
}

impl core::fmt::Debug for Graph {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes.len())
            .field("referenced", &self.referenced.len())
            .field("deletions", &self.deletions.len())
            .finish()
    }
}
