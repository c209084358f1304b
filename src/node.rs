//! Core node trait, shared node state and the control-thread node handle.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::bus::{AudioBus, ChannelInterpretation, RENDER_QUANTUM_FRAMES};
use crate::context::{AudioContext, ContextShared};
use crate::error::{GraphError, PortKind, Result};
use crate::graph::{JunctionId, OutputRef};
use crate::param::AudioParam;

/// Unique identifier for a node within a context.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct NodeId(pub(crate) u64);

/// What a node is. Used for logging and introspection only; behaviour lives
/// in the node's [`AudioProcessor`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeKind {
    Destination,
    Gain,
    Oscillator,
    BufferSource,
    Tap,
    LiveInput,
    Custom,
}

/// The two independent reasons a node is kept alive.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RefKind {
    /// Held by control-side handles.
    Normal,
    /// Held by incoming graph edges, and by the context while a source plays.
    Connection,
}

/// How an input's channel count is derived from its connections.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum ChannelCountMode {
    /// The widest connection wins.
    #[default]
    Max,
    /// The widest connection wins, capped at the node's channel count.
    ClampedMax,
    /// The node's channel count, regardless of connections.
    Explicit,
}

/// Channel settings shared by all inputs of a node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChannelConfig {
    pub count: usize,
    pub mode: ChannelCountMode,
    pub interpretation: ChannelInterpretation,
}

impl ChannelConfig {
    pub const fn new(count: usize, mode: ChannelCountMode) -> Self {
        Self {
            count,
            mode,
            interpretation: ChannelInterpretation::Speakers,
        }
    }

    /// Channel count an input sees given the widest upstream output.
    pub(crate) fn resolve(&self, widest_upstream: Option<usize>) -> usize {
        match self.mode {
            ChannelCountMode::Explicit => self.count,
            ChannelCountMode::Max => widest_upstream.unwrap_or(1).max(1),
            ChannelCountMode::ClampedMax => widest_upstream.unwrap_or(1).max(1).min(self.count),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new(2, ChannelCountMode::Max)
    }
}

/// How an output's channel count is chosen.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OutputChannels {
    /// Always this many channels.
    Fixed(usize),
    /// As many channels as the given input currently has.
    FollowInput(usize),
}

/// Information available during audio processing.
///
/// Passed to every [`AudioProcessor::process`] call.
#[derive(Clone, Copy, Debug)]
pub struct RenderScope<'a> {
    /// Context frame at the start of this quantum.
    pub frame: u64,
    /// Sample rate of the context in Hz.
    pub sample_rate: f32,
    pub(crate) live_input: Option<&'a AudioBus>,
}

impl<'a> RenderScope<'a> {
    /// Number of frames in this quantum (always [`RENDER_QUANTUM_FRAMES`]).
    #[inline]
    pub fn frames(&self) -> usize {
        RENDER_QUANTUM_FRAMES
    }

    /// Context time in seconds at the start of this quantum.
    #[inline]
    pub fn current_time(&self) -> f64 {
        self.frame as f64 / self.sample_rate as f64
    }

    /// The live-input bus handed to this quantum's render call, if any.
    #[inline]
    pub fn live_input(&self) -> Option<&'a AudioBus> {
        self.live_input
    }
}

/// Per-kind DSP behind a node.
///
/// The renderer owns processors and only calls them from the audio thread.
/// `inputs` holds one bus per node input, already summed and mixed to the
/// input's channel count. `params` holds one value per frame for each of the
/// node's parameters, in declaration order. `outputs` are sized by the graph's
/// channel negotiation and must not be resized.
pub trait AudioProcessor: Send + 'static {
    fn process(
        &mut self,
        scope: &RenderScope<'_>,
        inputs: &[&AudioBus],
        params: &[&[f32]],
        outputs: &mut [AudioBus],
    );

    /// Seconds of output the node can produce after its input goes silent.
    fn tail_time(&self) -> f64 {
        0.0
    }

    /// Seconds between input and corresponding output.
    fn latency_time(&self) -> f64 {
        0.0
    }

    /// Whether silent inputs let the renderer skip `process` and emit silence.
    ///
    /// The default keeps processing for `latency_time + tail_time` seconds
    /// after the last non-silent input. A node with no inputs counts as
    /// never silent, so generators run under the default; sources override
    /// this to go quiet while they are not playing.
    fn propagates_silence(&self, last_non_silent_time: f64, now: f64) -> bool {
        last_non_silent_time + self.latency_time() + self.tail_time() < now
    }

    /// Drop internal state such as delay lines or filter memory.
    fn reset(&mut self) {}
}

/// Reference counts and flags shared between handles, the live graph and the
/// renderer.
#[derive(Debug)]
pub(crate) struct NodeShared {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) number_of_inputs: usize,
    pub(crate) number_of_outputs: usize,
    normal_refs: AtomicUsize,
    connection_refs: AtomicUsize,
    marked_for_deletion: AtomicBool,
    finish_pending: AtomicBool,
}

impl NodeShared {
    pub(crate) fn new(id: NodeId, kind: NodeKind, inputs: usize, outputs: usize) -> Self {
        Self {
            id,
            kind,
            number_of_inputs: inputs,
            number_of_outputs: outputs,
            normal_refs: AtomicUsize::new(1),
            connection_refs: AtomicUsize::new(0),
            marked_for_deletion: AtomicBool::new(false),
            finish_pending: AtomicBool::new(false),
        }
    }

    fn counter(&self, kind: RefKind) -> &AtomicUsize {
        match kind {
            RefKind::Normal => &self.normal_refs,
            RefKind::Connection => &self.connection_refs,
        }
    }

    pub(crate) fn ref_count(&self, kind: RefKind) -> usize {
        self.counter(kind).load(Ordering::Acquire)
    }

    pub(crate) fn add_ref(&self, kind: RefKind) {
        self.counter(kind).fetch_add(1, Ordering::AcqRel);
    }

    /// Returns `true` when both counts are now zero.
    pub(crate) fn release(&self, kind: RefKind) -> bool {
        let previous = self.counter(kind).fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "{:?} ref count underflow on {:?}", kind, self.id);
        self.is_unreferenced()
    }

    pub(crate) fn is_unreferenced(&self) -> bool {
        self.ref_count(RefKind::Normal) == 0 && self.ref_count(RefKind::Connection) == 0
    }

    pub(crate) fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.load(Ordering::Acquire)
    }

    /// Returns `false` if the node was already marked.
    pub(crate) fn mark_for_deletion(&self) -> bool {
        !self.marked_for_deletion.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_finish_pending(&self) {
        self.finish_pending.store(true, Ordering::Release);
    }

    pub(crate) fn take_finish_pending(&self) -> bool {
        self.finish_pending.swap(false, Ordering::AcqRel)
    }
}

/// Snapshot of one node input as seen by the control thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputInfo {
    pub index: usize,
    pub channel_count: usize,
    pub connections: usize,
}

/// Snapshot of one node output as seen by the control thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputInfo {
    pub index: usize,
    pub channel_count: usize,
    pub fan_out: usize,
}

/// A control-thread handle to a node in an [`AudioContext`].
///
/// Each handle holds one normal reference: cloning adds one, dropping releases
/// one. A node is removed from the graph once it has no handles and nothing
/// connected into it.
pub struct AudioNode {
    pub(crate) context: Arc<ContextShared>,
    pub(crate) shared: Arc<NodeShared>,
}

impl AudioNode {
    /// Wrap freshly created shared state, taking over its initial normal ref.
    pub(crate) fn adopt(context: Arc<ContextShared>, shared: Arc<NodeShared>) -> Self {
        Self { context, shared }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.shared.kind
    }

    #[inline]
    pub fn number_of_inputs(&self) -> usize {
        self.shared.number_of_inputs
    }

    #[inline]
    pub fn number_of_outputs(&self) -> usize {
        self.shared.number_of_outputs
    }

    /// The context this node belongs to.
    pub fn context(&self) -> AudioContext {
        AudioContext::from_shared(Arc::clone(&self.context))
    }

    /// Current value of one of the node's reference counts.
    pub fn ref_count(&self, kind: RefKind) -> usize {
        self.shared.ref_count(kind)
    }

    /// Connect output `output` of this node to input `input` of `destination`.
    pub fn connect(&self, destination: &impl AsRef<AudioNode>, output: usize, input: usize) -> Result<()> {
        let destination = destination.as_ref();
        self.check_same_context(&destination.context)?;
        self.check_output(output)?;
        destination.check_input(input)?;

        let from = OutputRef::new(self.id(), output);
        let to = JunctionId::input(destination.id(), input);
        self.context.lock_graph().graph.connect(from, to)
    }

    /// Connect output `output` of this node to an audio-rate parameter.
    pub fn connect_param(&self, param: &AudioParam, output: usize) -> Result<()> {
        self.check_same_context(&param.context)?;
        self.check_output(output)?;

        let from = OutputRef::new(self.id(), output);
        let to = JunctionId::param(param.owner, param.index);
        self.context.lock_graph().graph.connect(from, to)
    }

    /// Remove every connection leaving output `output`.
    pub fn disconnect(&self, output: usize) -> Result<()> {
        self.check_output(output)?;
        self.context.lock_graph().graph.disconnect_output(OutputRef::new(self.id(), output))
    }

    /// Remove the single connection from `output` to `destination`'s `input`.
    pub fn disconnect_from(
        &self,
        destination: &impl AsRef<AudioNode>,
        output: usize,
        input: usize,
    ) -> Result<()> {
        let destination = destination.as_ref();
        self.check_same_context(&destination.context)?;
        self.check_output(output)?;
        destination.check_input(input)?;

        let from = OutputRef::new(self.id(), output);
        let to = JunctionId::input(destination.id(), input);
        self.context.lock_graph().graph.disconnect_edge(from, to)
    }

    pub fn channel_count(&self) -> usize {
        self.channel_config().count
    }

    pub fn channel_count_mode(&self) -> ChannelCountMode {
        self.channel_config().mode
    }

    pub fn channel_interpretation(&self) -> ChannelInterpretation {
        self.channel_config().interpretation
    }

    pub fn set_channel_count(&self, count: usize) -> Result<()> {
        self.update_channel_config(|config| config.count = count)
    }

    pub fn set_channel_count_mode(&self, mode: ChannelCountMode) -> Result<()> {
        self.update_channel_config(|config| config.mode = mode)
    }

    pub fn set_channel_interpretation(&self, interpretation: ChannelInterpretation) -> Result<()> {
        self.update_channel_config(|config| config.interpretation = interpretation)
    }

    /// Live state of input `index`.
    pub fn input(&self, index: usize) -> Result<InputInfo> {
        self.check_input(index)?;
        self.context.lock_graph().graph.input_info(self.id(), index)
    }

    /// Live state of output `index`.
    pub fn output(&self, index: usize) -> Result<OutputInfo> {
        self.check_output(index)?;
        self.context.lock_graph().graph.output_info(self.id(), index)
    }

    fn channel_config(&self) -> ChannelConfig {
        self.context
            .lock_graph()
            .graph
            .channel_config(self.id())
            .unwrap_or_default()
    }

    fn update_channel_config(&self, update: impl FnOnce(&mut ChannelConfig)) -> Result<()> {
        let mut guard = self.context.lock_graph();
        let mut config = guard.graph.channel_config(self.id()).ok_or(GraphError::NodeReleased(self.id()))?;
        update(&mut config);
        guard.graph.set_channel_config(self.id(), config)
    }

    fn check_same_context(&self, other: &Arc<ContextShared>) -> Result<()> {
        if Arc::ptr_eq(&self.context, other) {
            Ok(())
        } else {
            Err(GraphError::ContextMismatch)
        }
    }

    fn check_output(&self, index: usize) -> Result<()> {
        check_index(self.id(), PortKind::Output, index, self.number_of_outputs())
    }

    fn check_input(&self, index: usize) -> Result<()> {
        check_index(self.id(), PortKind::Input, index, self.number_of_inputs())
    }
}

fn check_index(node: NodeId, kind: PortKind, index: usize, count: usize) -> Result<()> {
    if index < count {
        Ok(())
    } else {
        Err(GraphError::IndexOutOfRange { node, kind, index, count })
    }
}

impl Clone for AudioNode {
    fn clone(&self) -> Self {
        self.shared.add_ref(RefKind::Normal);
        Self {
            context: Arc::clone(&self.context),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for AudioNode {
    fn drop(&mut self) {
        self.context.deref_node(&self.shared, RefKind::Normal);
    }
}

impl AsRef<AudioNode> for AudioNode {
    fn as_ref(&self) -> &AudioNode {
        self
    }
}

impl core::fmt::Debug for AudioNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AudioNode")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("normal_refs", &self.shared.ref_count(RefKind::Normal))
            .field("connection_refs", &self.shared.ref_count(RefKind::Connection))
            .finish()
    }
}
