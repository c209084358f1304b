//! The audio context - control-thread entry point to a graph.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};
use rtrb::{Consumer, RingBuffer};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::bus::{MAX_CHANNELS, RENDER_QUANTUM_FRAMES};
use crate::graph::{Graph, NodeRecord};
use crate::node::{
    AudioNode, AudioProcessor, ChannelConfig, ChannelCountMode, NodeId, NodeKind, NodeShared, OutputChannels, RefKind,
};
use crate::nodes::{
    AudioBufferSourceNode, BufferSource, Destination, Gain, GainNode, LiveInput, LiveInputNode, Oscillator,
    OscillatorNode, Tap, TapNode,
};
use crate::param::{AudioParam, ParamDescriptor, ParamShared};
use crate::render::{GraphRenderer, RenderNode};
use crate::scheduled::{Schedule, ScheduledNode};

/// Default capacity of the audio-to-control event ring.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;
/// Default capacity of a node's message queue.
pub const DEFAULT_MESSAGE_CAPACITY: usize = 64;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Small non-zero integer unique to the calling thread.
pub(crate) fn thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// Notifications sent from the audio thread to the control thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum RenderEvent {
    /// A scheduled source reached its end time.
    SourceEnded(NodeId),
}

/// Counters kept by the renderer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderStats {
    /// Quanta rendered so far.
    pub quanta: u64,
    /// Housekeeping passes skipped because the graph lock was contended.
    pub contended: u64,
    /// Node panics contained while rendering. The panicking node is silent
    /// for that quantum; the rest of the graph plays on.
    pub panics: u64,
}

/// State shared by every handle of one context and by its renderer.
pub(crate) struct ContextShared {
    graph: Mutex<Graph>,
    lock_owner: AtomicU64,
    audio_thread: AtomicU64,
    pending_finish: AtomicBool,

    pub(crate) sample_rate: f32,
    pub(crate) channels: usize,
    pub(crate) current_frame: AtomicU64,
    pub(crate) active_sources: Arc<AtomicUsize>,
    pub(crate) destination: Arc<NodeShared>,
    events: Mutex<Consumer<RenderEvent>>,

    pub(crate) quanta: AtomicU64,
    pub(crate) contended: AtomicU64,
    pub(crate) panics: AtomicU64,
}

/// The graph lock, held. Dropping it finishes any dereferences that were
/// deferred while it was held.
pub(crate) struct GraphGuard<'a> {
    pub(crate) graph: MutexGuard<'a, Graph>,
    context: &'a ContextShared,
}

impl GraphGuard<'_> {
    /// Finish every node whose last reference was dropped while the lock was
    /// unavailable to the dropping thread.
    pub(crate) fn finish_pending(&mut self) {
        while self.context.pending_finish.swap(false, Ordering::AcqRel) {
            let pending: SmallVec<[NodeId; 8]> = self
                .graph
                .nodes
                .values()
                .filter(|r| r.shared.take_finish_pending())
                .map(|r| r.shared.id)
                .collect();
            for id in pending {
                self.graph.finish_deref(id);
            }
        }
    }
}

impl Deref for GraphGuard<'_> {
    type Target = Graph;

    fn deref(&self) -> &Graph {
        &self.graph
    }
}

impl DerefMut for GraphGuard<'_> {
    fn deref_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }
}

impl Drop for GraphGuard<'_> {
    fn drop(&mut self) {
        self.finish_pending();
        self.context.lock_owner.store(0, Ordering::Release);
    }
}

impl ContextShared {
    /// Take the graph lock, blocking. Control thread only.
    pub(crate) fn lock_graph(&self) -> GraphGuard<'_> {
        let graph = self.graph.lock();
        self.lock_owner.store(thread_token(), Ordering::Release);
        GraphGuard { graph, context: self }
    }

    /// Take the graph lock if it is free. Never blocks.
    pub(crate) fn try_lock_graph(&self) -> Option<GraphGuard<'_>> {
        let graph = self.graph.try_lock()?;
        self.lock_owner.store(thread_token(), Ordering::Release);
        Some(GraphGuard { graph, context: self })
    }

    pub(crate) fn mark_audio_thread(&self) {
        self.audio_thread.store(thread_token(), Ordering::Release);
    }

    pub(crate) fn is_audio_thread(&self) -> bool {
        self.audio_thread.load(Ordering::Acquire) == thread_token()
    }

    fn holds_lock(&self) -> bool {
        self.lock_owner.load(Ordering::Acquire) == thread_token()
    }

    /// Drop one reference of `kind` from a node, from any thread.
    ///
    /// When both counts reach zero the node is finished right away if that is
    /// safe from here: the control thread takes the lock, the audio thread
    /// tries to. Otherwise the finish is deferred to the next point that holds
    /// the lock.
    pub(crate) fn deref_node(&self, shared: &NodeShared, kind: RefKind) {
        if !shared.release(kind) {
            return;
        }
        if self.holds_lock() {
            self.defer_finish(shared);
        } else if self.is_audio_thread() {
            match self.try_lock_graph() {
                Some(mut guard) => guard.graph.finish_deref(shared.id),
                None => self.defer_finish(shared),
            }
        } else {
            self.lock_graph().graph.finish_deref(shared.id);
        }
    }

    fn defer_finish(&self, shared: &NodeShared) {
        trace!(id = ?shared.id, "finish deferred");
        shared.set_finish_pending();
        self.pending_finish.store(true, Ordering::Release);
    }
}

/// Configuration for a new [`AudioContext`].
///
/// ```
/// # use klingt_context::ContextBuilder;
/// let (context, mut renderer) = ContextBuilder::new(48_000)
///     .with_channels(2)
///     .with_event_capacity(512)
///     .build();
/// ```
#[derive(Clone, Debug)]
pub struct ContextBuilder {
    sample_rate: u32,
    channels: usize,
    event_capacity: usize,
    max_channel_count: usize,
}

impl ContextBuilder {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 2,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_channel_count: MAX_CHANNELS,
        }
    }

    /// Number of channels the destination renders.
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    /// Capacity of the ring carrying [`RenderEvent`]s to the control thread.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Largest channel count any node may be configured with.
    pub fn with_max_channel_count(mut self, max: usize) -> Self {
        self.max_channel_count = max;
        self
    }

    /// Create the context and the renderer that drives it.
    ///
    /// The renderer belongs on the audio thread; the context stays with the
    /// control thread and may be cloned freely.
    pub fn build(self) -> (AudioContext, GraphRenderer) {
        let mut graph = Graph::new(self.max_channel_count);
        let channels = self.channels.clamp(1, graph.max_channel_count());

        let id = graph.allocate_id();
        let destination = Arc::new(NodeShared::new(id, NodeKind::Destination, 1, 0));
        let config = ChannelConfig::new(channels, ChannelCountMode::Explicit);
        let record = NodeRecord::new(Arc::clone(&destination), 0, Vec::new(), config);
        graph.insert(
            record,
            Box::new(RenderNode::new(Arc::clone(&destination), Box::new(Destination), Vec::new(), None)),
        );

        let (producer, consumer) = RingBuffer::new(self.event_capacity.max(1));
        let shared = Arc::new(ContextShared {
            graph: Mutex::new(graph),
            lock_owner: AtomicU64::new(0),
            audio_thread: AtomicU64::new(0),
            pending_finish: AtomicBool::new(false),
            sample_rate: self.sample_rate as f32,
            channels,
            current_frame: AtomicU64::new(0),
            active_sources: Arc::new(AtomicUsize::new(0)),
            destination,
            events: Mutex::new(consumer),
            quanta: AtomicU64::new(0),
            contended: AtomicU64::new(0),
            panics: AtomicU64::new(0),
        });

        debug!(sample_rate = self.sample_rate, channels, "context created");
        let renderer = GraphRenderer::new(Arc::clone(&shared), producer);
        (AudioContext { shared }, renderer)
    }
}

/// Control-thread handle to an audio graph.
///
/// Create one with [`AudioContext::new`] or a [`ContextBuilder`], hand the
/// returned [`GraphRenderer`] to the audio callback, and build the graph from
/// here:
///
/// ```
/// # use klingt_context::AudioContext;
/// let (context, mut renderer) = AudioContext::new(48_000);
///
/// let osc = context.create_oscillator();
/// let gain = context.create_gain();
/// osc.connect(&gain, 0, 0).unwrap();
/// gain.connect(&context.destination(), 0, 0).unwrap();
/// gain.gain().set_value(0.25);
/// osc.start(0.0).unwrap();
///
/// let mut out = vec![0.0; 2 * 64];
/// renderer.render_quantum(&mut out, None, 64);
/// ```
#[derive(Clone)]
pub struct AudioContext {
    shared: Arc<ContextShared>,
}

impl AudioContext {
    /// A stereo context at `sample_rate`.
    pub fn new(sample_rate: u32) -> (AudioContext, GraphRenderer) {
        ContextBuilder::new(sample_rate).build()
    }

    pub(crate) fn from_shared(shared: Arc<ContextShared>) -> Self {
        Self { shared }
    }

    pub fn sample_rate(&self) -> f32 {
        self.shared.sample_rate
    }

    /// Number of channels the destination renders.
    pub fn channels(&self) -> usize {
        self.shared.channels
    }

    /// Frames rendered so far.
    pub fn current_frame(&self) -> u64 {
        self.shared.current_frame.load(Ordering::Acquire)
    }

    /// Seconds rendered so far.
    pub fn current_time(&self) -> f64 {
        self.current_frame() as f64 / self.shared.sample_rate as f64
    }

    /// Frames per render quantum.
    pub fn quantum_frames(&self) -> usize {
        RENDER_QUANTUM_FRAMES
    }

    /// Scheduled sources currently playing.
    pub fn active_source_count(&self) -> usize {
        self.shared.active_sources.load(Ordering::Acquire)
    }

    /// The node whose input is rendered to the output.
    pub fn destination(&self) -> AudioNode {
        self.shared.destination.add_ref(RefKind::Normal);
        AudioNode::adopt(Arc::clone(&self.shared), Arc::clone(&self.shared.destination))
    }

    /// Nodes alive in the graph, including the destination.
    pub fn node_count(&self) -> usize {
        self.shared.lock_graph().nodes.len()
    }

    /// Whether the node has not been released yet.
    pub fn contains(&self, id: NodeId) -> bool {
        self.shared.lock_graph().contains(id)
    }

    /// Live edges in the graph, counting parameter connections.
    pub fn connection_count(&self) -> usize {
        self.shared.lock_graph().connection_count()
    }

    /// Whether the renderer pulls the node every quantum on its own: taps with
    /// no consumers, and sources that have started and not yet finished.
    pub fn is_automatic_pull(&self, id: NodeId) -> bool {
        self.shared.lock_graph().is_automatic_pull(id)
    }

    pub fn render_stats(&self) -> RenderStats {
        RenderStats {
            quanta: self.shared.quanta.load(Ordering::Acquire),
            contended: self.shared.contended.load(Ordering::Acquire),
            panics: self.shared.panics.load(Ordering::Acquire),
        }
    }

    pub fn create_gain(&self) -> GainNode {
        let (node, params) = self.create_builtin(
            NodeKind::Gain,
            NodeOptions::new(1, vec![OutputChannels::FollowInput(0)]),
            Gain::PARAMS,
            Box::new(Gain),
            None,
            false,
        );
        GainNode::new(node, params)
    }

    /// A mono sine oscillator at 440 Hz. Silent until started.
    pub fn create_oscillator(&self) -> OscillatorNode {
        let (producer, consumer) = RingBuffer::new(DEFAULT_MESSAGE_CAPACITY);
        let schedule = self.new_schedule();
        let (node, params) = self.create_builtin(
            NodeKind::Oscillator,
            NodeOptions::new(0, vec![OutputChannels::Fixed(1)]),
            Oscillator::PARAMS,
            Box::new(Oscillator::new(Arc::clone(&schedule), consumer)),
            Some(Arc::clone(&schedule)),
            false,
        );
        OscillatorNode::new(ScheduledNode::new(node, schedule), params, producer)
    }

    /// A buffer player with no buffer assigned. Its output is mono until
    /// [`set_buffer`](AudioBufferSourceNode::set_buffer) is called.
    pub fn create_buffer_source(&self) -> AudioBufferSourceNode {
        let (producer, consumer) = RingBuffer::new(DEFAULT_MESSAGE_CAPACITY);
        let schedule = self.new_schedule();
        let (node, params) = self.create_builtin(
            NodeKind::BufferSource,
            NodeOptions::new(0, vec![OutputChannels::Fixed(1)]),
            BufferSource::PARAMS,
            Box::new(BufferSource::new(Arc::clone(&schedule), consumer)),
            Some(Arc::clone(&schedule)),
            false,
        );
        AudioBufferSourceNode::new(ScheduledNode::new(node, schedule), params, producer)
    }

    /// A pass-through node that copies what it hears into a ring of
    /// `capacity` mono samples (channel 0).
    ///
    /// Taps are rendered even when nothing consumes their output.
    pub fn create_tap(&self, capacity: usize) -> TapNode {
        let (producer, consumer) = RingBuffer::new(capacity.max(RENDER_QUANTUM_FRAMES));
        let dropped = Arc::new(AtomicUsize::new(0));
        let (node, []) = self.create_builtin(
            NodeKind::Tap,
            NodeOptions::new(1, vec![OutputChannels::FollowInput(0)]),
            [],
            Box::new(Tap::new(producer, Arc::clone(&dropped))),
            None,
            true,
        );
        TapNode::new(node, consumer, dropped)
    }

    /// A source that plays the live-input bus passed to the renderer.
    pub fn create_live_input(&self) -> LiveInputNode {
        let (node, []) = self.create_builtin(
            NodeKind::LiveInput,
            NodeOptions::new(0, vec![OutputChannels::Fixed(self.shared.channels)]),
            [],
            Box::new(LiveInput),
            None,
            false,
        );
        LiveInputNode::new(node)
    }

    /// Add a node backed by a custom [`AudioProcessor`].
    ///
    /// Returns the node and one handle per parameter in `options`, in order.
    pub fn add_processor(
        &self,
        options: NodeOptions,
        processor: impl AudioProcessor,
    ) -> (AudioNode, Vec<AudioParam>) {
        self.create_node(NodeKind::Custom, options, Box::new(processor), None, false)
    }

    /// Deliver events sent by the renderer since the last call and run the
    /// `on_ended` callbacks of sources that finished. Callbacks run on this
    /// thread with the graph unlocked, even if the source's handles are gone.
    /// Returns the events delivered.
    pub fn dispatch_events(&self) -> Vec<RenderEvent> {
        let mut events = Vec::new();
        {
            let mut consumer = self.shared.events.lock();
            while let Ok(event) = consumer.pop() {
                events.push(event);
            }
        }

        let ready: Vec<_> = self.shared.lock_graph().graph.ended_ready.drain(..).collect();
        for (id, mut handler) in ready {
            trace!(?id, "running ended handler");
            handler();
        }
        events
    }

    fn create_builtin<const N: usize>(
        &self,
        kind: NodeKind,
        options: NodeOptions,
        params: [ParamDescriptor; N],
        processor: Box<dyn AudioProcessor>,
        schedule: Option<Arc<Schedule>>,
        auto_pull: bool,
    ) -> (AudioNode, [AudioParam; N]) {
        let (node, handles) = self.create_node(kind, options.with_params(&params), processor, schedule, auto_pull);
        (node, core::array::from_fn(|i| handles[i].clone()))
    }

    fn new_schedule(&self) -> Arc<Schedule> {
        Arc::new(Schedule::new(Arc::clone(&self.shared.active_sources)))
    }

    fn create_node(
        &self,
        kind: NodeKind,
        options: NodeOptions,
        processor: Box<dyn AudioProcessor>,
        schedule: Option<Arc<Schedule>>,
        auto_pull: bool,
    ) -> (AudioNode, Vec<AudioParam>) {
        let params: Vec<Arc<ParamShared>> = options
            .params
            .iter()
            .map(|d| Arc::new(ParamShared::new(*d)))
            .collect();

        let mut guard = self.shared.lock_graph();
        let id = guard.allocate_id();
        let shared = Arc::new(NodeShared::new(id, kind, options.inputs, options.outputs.len()));
        let mut record = NodeRecord::new(Arc::clone(&shared), params.len(), options.outputs, options.channel_config);
        if auto_pull {
            record = record.with_auto_pull();
        }
        let render = Box::new(RenderNode::new(Arc::clone(&shared), processor, params.clone(), schedule));
        guard.insert(record, render);
        drop(guard);

        let params = params
            .into_iter()
            .enumerate()
            .map(|(index, p)| AudioParam::new(Arc::clone(&self.shared), id, index, p))
            .collect();
        (AudioNode::adopt(Arc::clone(&self.shared), shared), params)
    }
}

impl core::fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AudioContext")
            .field("sample_rate", &self.shared.sample_rate)
            .field("channels", &self.shared.channels)
            .field("current_frame", &self.current_frame())
            .finish()
    }
}

/// Port layout of a node added with [`AudioContext::add_processor`].
#[derive(Clone, Debug)]
pub struct NodeOptions {
    pub inputs: usize,
    pub outputs: Vec<OutputChannels>,
    pub channel_config: ChannelConfig,
    pub params: Vec<ParamDescriptor>,
}

impl NodeOptions {
    pub fn new(inputs: usize, outputs: Vec<OutputChannels>) -> Self {
        Self {
            inputs,
            outputs,
            channel_config: ChannelConfig::default(),
            params: Vec::new(),
        }
    }

    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        self
    }

    pub fn with_params(mut self, params: &[ParamDescriptor]) -> Self {
        self.params.extend_from_slice(params);
        self
    }
}
