//! The audio-thread half of a context.
//!
//! [`GraphRenderer`] owns every node's processor and buffers. Each quantum it
//! pulls the graph from the destination backwards, processing every node at
//! most once, reading the topology only from its own rendering snapshots.
//! Those snapshots are refreshed from the live graph at quantum boundaries,
//! and only when the graph lock can be taken without waiting.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use std::panic::{catch_unwind, AssertUnwindSafe};

use dasp_graph::Buffer;
use hashbrown::HashMap;
use rtrb::Producer;
use smallvec::SmallVec;
use tracing::error;

use crate::bus::{AudioBus, ChannelInterpretation, RENDER_QUANTUM_FRAMES};
use crate::context::{ContextShared, GraphGuard, RenderEvent};
use crate::graph::{Graph, LiveJunction, OutputRef, Port};
use crate::node::{AudioProcessor, ChannelConfig, ChannelCountMode, NodeId, NodeShared, RenderScope};
use crate::param::ParamShared;
use crate::scheduled::Schedule;

/// Render-side nodes. A slot is `None` while its node is being processed.
type Arena = HashMap<NodeId, Option<Box<RenderNode>>>;

const PARAM_JUNCTION: ChannelConfig = ChannelConfig::new(1, ChannelCountMode::Explicit);

/// Rendering snapshot of one summing junction.
#[derive(Debug)]
pub(crate) struct RenderJunction {
    rendering: Vec<OutputRef>,
    channels: usize,
    mode: ChannelCountMode,
    interpretation: ChannelInterpretation,
    summing: AudioBus,
    passthrough: Option<OutputRef>,
}

impl RenderJunction {
    fn new(channels: usize) -> Self {
        Self {
            rendering: Vec::new(),
            channels,
            mode: ChannelCountMode::Max,
            interpretation: ChannelInterpretation::Speakers,
            summing: AudioBus::new(channels),
            passthrough: None,
        }
    }

    /// Copy the live connection set into the rendering snapshot.
    fn update_rendering_state(&mut self, live: &LiveJunction, config: &ChannelConfig) {
        self.rendering.clone_from(&live.connections);
        self.channels = live.channels.max(1);
        self.mode = config.mode;
        self.interpretation = config.interpretation;
        self.summing.set_number_of_channels(self.channels);
    }

    /// Prepare this quantum's bus. Upstream nodes must already be processed.
    ///
    /// A single connection in `Max` mode with a matching channel count is read
    /// straight from the upstream output; anything else is summed.
    fn pull(&mut self, arena: &Arena) {
        self.passthrough = None;
        if let [only] = *self.rendering.as_slice() {
            if self.mode == ChannelCountMode::Max
                && output_bus(arena, only).is_some_and(|bus| bus.number_of_channels() == self.channels)
            {
                self.passthrough = Some(only);
                return;
            }
        }

        self.summing.zero();
        for connection in &self.rendering {
            if let Some(bus) = output_bus(arena, *connection) {
                self.summing.sum_from(bus, self.interpretation);
            }
        }
    }

    fn bus<'a>(&'a self, arena: &'a Arena) -> &'a AudioBus {
        self.passthrough
            .and_then(|c| output_bus(arena, c))
            .unwrap_or(&self.summing)
    }
}

fn output_bus(arena: &Arena, output: OutputRef) -> Option<&AudioBus> {
    arena.get(&output.node)?.as_deref()?.outputs.get(output.output)
}

/// Render side of one parameter.
pub(crate) struct RenderParam {
    shared: Arc<ParamShared>,
    junction: RenderJunction,
    values: Buffer,
}

impl RenderParam {
    fn new(shared: Arc<ParamShared>) -> Self {
        Self {
            shared,
            junction: RenderJunction::new(1),
            values: Buffer::SILENT,
        }
    }

    /// Intrinsic values plus channel 0 of any connected modulation.
    fn render(&mut self, scope: &RenderScope<'_>, arena: &Arena) {
        let modulated = !self.junction.rendering.is_empty();
        self.shared.render(scope, &mut self.values, modulated);
        if modulated {
            let bus = self.junction.bus(arena);
            if !bus.is_silent() {
                for (value, m) in self.values.iter_mut().zip(bus.channel(0)) {
                    *value += *m;
                }
            }
        }
    }
}

/// Render side of one node.
pub(crate) struct RenderNode {
    shared: Arc<NodeShared>,
    processor: Box<dyn AudioProcessor>,
    inputs: Vec<RenderJunction>,
    params: Vec<RenderParam>,
    outputs: Vec<AudioBus>,
    fan_out: Vec<usize>,
    last_processed: Option<u64>,
    last_non_silent: f64,
    schedule: Option<Arc<Schedule>>,
}

impl RenderNode {
    pub(crate) fn new(
        shared: Arc<NodeShared>,
        processor: Box<dyn AudioProcessor>,
        params: Vec<Arc<ParamShared>>,
        schedule: Option<Arc<Schedule>>,
    ) -> Self {
        Self {
            inputs: (0..shared.number_of_inputs).map(|_| RenderJunction::new(1)).collect(),
            params: params.into_iter().map(RenderParam::new).collect(),
            outputs: (0..shared.number_of_outputs).map(|_| AudioBus::new(1)).collect(),
            fan_out: vec![0; shared.number_of_outputs],
            shared,
            processor,
            last_processed: None,
            last_non_silent: f64::NEG_INFINITY,
            schedule,
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.shared.id
    }

    fn inputs_are_silent(&self, arena: &Arena) -> bool {
        self.inputs.iter().all(|j| j.bus(arena).is_silent())
    }

    fn render(&mut self, scope: &RenderScope<'_>, arena: &Arena) {
        let now = scope.current_time();
        let silent = self.inputs_are_silent(arena);
        // Nodes without inputs only go quiet when their processor says so.
        if !silent || self.inputs.is_empty() {
            self.last_non_silent = now;
        }

        if silent && self.processor.propagates_silence(self.last_non_silent, now) {
            for output in &mut self.outputs {
                output.zero();
            }
            return;
        }

        for param in &mut self.params {
            param.render(scope, arena);
        }
        for output in &mut self.outputs {
            output.clear_silent_flag();
        }

        let inputs: SmallVec<[&AudioBus; 4]> = self.inputs.iter().map(|j| j.bus(arena)).collect();
        let params: SmallVec<[&[f32]; 4]> = self.params.iter().map(|p| &p.values[..]).collect();
        self.processor.process(scope, &inputs, &params, &mut self.outputs);
    }
}

impl core::fmt::Debug for RenderNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RenderNode")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

/// Per-quantum state threaded through the pull recursion.
struct Pass<'a> {
    scope: RenderScope<'a>,
    ended: &'a mut Vec<NodeId>,
    panics: u64,
}

/// Process `id` for this quantum unless that already happened, pulling its
/// upstream nodes first.
fn process_if_necessary(arena: &mut Arena, id: NodeId, pass: &mut Pass<'_>) {
    let Some(mut node) = arena.get_mut(&id).and_then(Option::take) else {
        return;
    };

    if node.last_processed != Some(pass.scope.frame) {
        node.last_processed = Some(pass.scope.frame);

        let junctions = node.inputs.iter().chain(node.params.iter().map(|p| &p.junction));
        for junction in junctions {
            for upstream in &junction.rendering {
                process_if_necessary(arena, upstream.node, pass);
            }
        }
        for junction in node.inputs.iter_mut().chain(node.params.iter_mut().map(|p| &mut p.junction)) {
            junction.pull(arena);
        }

        let scope = pass.scope;
        if catch_unwind(AssertUnwindSafe(|| node.render(&scope, arena))).is_err() {
            error!(?id, kind = ?node.shared.kind, frame = scope.frame, "node panicked while rendering");
            node.processor.reset();
            for output in &mut node.outputs {
                output.clear_silent_flag();
                output.zero();
            }
            pass.panics += 1;
        }

        if node.schedule.as_ref().is_some_and(|s| s.take_finished()) {
            pass.ended.push(id);
        }
    }

    if let Some(slot) = arena.get_mut(&id) {
        *slot = Some(node);
    }
}

/// Drives a context's graph from the audio thread.
///
/// Call [`render_quantum`](Self::render_quantum) from the platform audio
/// callback, or [`fill_interleaved`](Self::fill_interleaved) when the callback
/// size is not a multiple of the quantum. Rendering never blocks: if the
/// control thread holds the graph lock the quantum is rendered from the
/// previous topology snapshot and housekeeping waits for the next quantum.
pub struct GraphRenderer {
    context: Arc<ContextShared>,
    nodes: Arena,
    destination: NodeId,
    automatic_pull: Vec<NodeId>,
    ended: Vec<NodeId>,
    finished_sources: Vec<NodeId>,
    events: Producer<RenderEvent>,
    frame: u64,
    live_input: AudioBus,
    output: AudioBus,
    scratch: Vec<f32>,
    scratch_pos: usize,
}

impl GraphRenderer {
    pub(crate) fn new(context: Arc<ContextShared>, events: Producer<RenderEvent>) -> Self {
        let channels = context.channels;
        Self {
            destination: context.destination.id,
            nodes: HashMap::with_capacity(64),
            automatic_pull: Vec::with_capacity(16),
            ended: Vec::with_capacity(16),
            finished_sources: Vec::with_capacity(16),
            events,
            frame: 0,
            live_input: AudioBus::new(channels),
            output: AudioBus::new(channels),
            scratch: vec![0.0; channels * RENDER_QUANTUM_FRAMES],
            scratch_pos: channels * RENDER_QUANTUM_FRAMES,
            context,
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.context.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.context.channels
    }

    /// Frames rendered so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Render one quantum into `output`, interleaved with [`channels`]
    /// channels. `live_input`, if given, is interleaved the same way and is
    /// what live-input nodes play.
    ///
    /// `frames` must equal [`RENDER_QUANTUM_FRAMES`]; any other size, or an
    /// `output` too short to hold it, renders silence.
    ///
    /// [`channels`]: Self::channels
    pub fn render_quantum(&mut self, output: &mut [f32], live_input: Option<&[f32]>, frames: usize) {
        let context = Arc::clone(&self.context);
        context.mark_audio_thread();

        let channels = context.channels;
        let len = frames * channels;
        if frames != RENDER_QUANTUM_FRAMES || output.len() < len {
            output.fill(0.0);
            return;
        }

        let has_live_input = live_input.is_some_and(|live| self.load_live_input(live));

        match context.try_lock_graph() {
            Some(mut guard) => self.sync(&mut guard),
            None => {
                context.contended.fetch_add(1, Ordering::Relaxed);
            }
        }

        let panics = self.render_pass(has_live_input);
        if panics > 0 {
            context.panics.fetch_add(panics, Ordering::Relaxed);
        }
        interleave(&self.output, &mut output[..len]);

        self.post_render(&context);
    }

    /// Fill an interleaved buffer of any length, rendering quanta as needed.
    pub fn fill_interleaved(&mut self, output: &mut [f32]) {
        let mut scratch = core::mem::take(&mut self.scratch);
        let mut written = 0;
        while written < output.len() {
            if self.scratch_pos >= scratch.len() {
                self.render_quantum(&mut scratch, None, RENDER_QUANTUM_FRAMES);
                self.scratch_pos = 0;
            }
            let n = (scratch.len() - self.scratch_pos).min(output.len() - written);
            output[written..written + n].copy_from_slice(&scratch[self.scratch_pos..self.scratch_pos + n]);
            self.scratch_pos += n;
            written += n;
        }
        self.scratch = scratch;
    }

    /// Render `frames` frames without a device, interleaved. Useful for tests
    /// and bouncing.
    pub fn render_offline(&mut self, frames: usize) -> Vec<f32> {
        let channels = self.context.channels;
        let mut output = vec![0.0; frames * channels];
        self.fill_interleaved(&mut output);
        output
    }

    /// Edges in the rendering snapshot, counting parameter connections.
    pub fn rendering_connection_count(&self) -> usize {
        self.nodes
            .values()
            .filter_map(|n| n.as_deref())
            .map(|n| {
                n.inputs.iter().map(|j| j.rendering.len()).sum::<usize>()
                    + n.params.iter().map(|p| p.junction.rendering.len()).sum::<usize>()
            })
            .sum()
    }

    /// Consumers of an output in the rendering snapshot.
    pub fn rendering_fan_out(&self, node: NodeId, output: usize) -> Option<usize> {
        self.nodes.get(&node)?.as_deref()?.fan_out.get(output).copied()
    }

    /// Nodes the renderer currently owns.
    pub fn rendering_node_count(&self) -> usize {
        self.nodes.len()
    }

    fn load_live_input(&mut self, live: &[f32]) -> bool {
        let channels = self.live_input.number_of_channels();
        if live.len() < channels * RENDER_QUANTUM_FRAMES {
            return false;
        }
        for (c, channel) in self.live_input.channels_mut().enumerate() {
            for (i, sample) in channel.iter_mut().enumerate() {
                *sample = live[i * channels + c];
            }
        }
        true
    }

    /// Admit new nodes, finish deferred derefs and refresh snapshots.
    /// Admission comes first so no dirty entry is applied before its node is
    /// in the arena.
    fn sync(&mut self, guard: &mut GraphGuard<'_>) {
        for node in guard.graph.admissions.drain(..) {
            self.nodes.insert(node.id(), Some(node));
        }
        guard.finish_pending();
        self.housekeeping(&mut guard.graph);
    }

    /// Pull the destination and the automatic-pull nodes. Returns the number
    /// of nodes that panicked; their outputs are silent for this quantum.
    fn render_pass(&mut self, has_live_input: bool) -> u64 {
        let Self {
            context,
            nodes,
            destination,
            automatic_pull,
            ended,
            finished_sources,
            events,
            frame,
            live_input,
            output,
            ..
        } = self;

        let mut pass = Pass {
            scope: RenderScope {
                frame: *frame,
                sample_rate: context.sample_rate,
                live_input: has_live_input.then_some(&*live_input),
            },
            ended,
            panics: 0,
        };

        process_if_necessary(nodes, *destination, &mut pass);
        match nodes.get(destination).and_then(|n| n.as_deref()).and_then(|n| n.inputs.first()) {
            Some(input) => output.copy_from(input.bus(nodes), ChannelInterpretation::Speakers),
            None => output.zero(),
        }

        for id in automatic_pull.iter() {
            process_if_necessary(nodes, *id, &mut pass);
        }

        let panics = pass.panics;
        for id in pass.ended.drain(..) {
            // A full ring only loses the notification; the reference is
            // still released.
            let _ = events.push(RenderEvent::SourceEnded(id));
            finished_sources.push(id);
        }
        panics
    }

    fn post_render(&mut self, context: &ContextShared) {
        self.frame += RENDER_QUANTUM_FRAMES as u64;
        context.current_frame.store(self.frame, Ordering::Release);
        context.quanta.fetch_add(1, Ordering::Relaxed);

        let Some(mut guard) = context.try_lock_graph() else {
            context.contended.fetch_add(1, Ordering::Relaxed);
            return;
        };
        for id in self.finished_sources.drain(..) {
            guard.graph.source_finished(id);
        }
        self.sync(&mut guard);

        for id in guard.graph.deletions.drain(..) {
            self.nodes.remove(&id);
        }
    }

    /// Copy dirty junctions and outputs into the rendering snapshots and
    /// refresh the automatic-pull list.
    fn housekeeping(&mut self, graph: &mut Graph) {
        for junction in graph.dirty_junctions.drain() {
            let (Some(record), Some(Some(node))) = (graph.nodes.get(&junction.node), self.nodes.get_mut(&junction.node))
            else {
                continue;
            };
            match junction.port {
                Port::Input(i) => {
                    if let (Some(live), Some(rendering)) = (record.inputs.get(i), node.inputs.get_mut(i)) {
                        rendering.update_rendering_state(live, &record.config);
                    }
                }
                Port::Param(i) => {
                    if let (Some(live), Some(rendering)) = (record.params.get(i), node.params.get_mut(i)) {
                        rendering.junction.update_rendering_state(live, &PARAM_JUNCTION);
                    }
                }
            }
        }

        for output in graph.dirty_outputs.drain() {
            let (Some(record), Some(Some(node))) = (graph.nodes.get(&output.node), self.nodes.get_mut(&output.node))
            else {
                continue;
            };
            if let (Some(live), Some(bus)) = (record.outputs.get(output.output), node.outputs.get_mut(output.output)) {
                bus.set_number_of_channels(live.channels.max(1));
                node.fan_out[output.output] = live.consumers.len();
            }
        }

        graph.refresh_automatic_pull(&mut self.automatic_pull);
    }
}

impl Drop for GraphRenderer {
    fn drop(&mut self) {
        let mut guard = self.context.lock_graph();
        guard.graph.renderer_alive = false;
        let playing: SmallVec<[NodeId; 8]> = guard.graph.referenced.iter().copied().collect();
        for id in playing {
            guard.graph.release_reference(id);
        }
        guard.graph.deletions.clear();
        guard.graph.admissions.clear();
    }
}

impl core::fmt::Debug for GraphRenderer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GraphRenderer")
            .field("frame", &self.frame)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

fn interleave(bus: &AudioBus, output: &mut [f32]) {
    let channels = bus.number_of_channels();
    if bus.is_silent() || channels == 0 {
        output.fill(0.0);
        return;
    }
    for (c, channel) in bus.channels().enumerate() {
        for (i, sample) in channel.iter().enumerate() {
            output[i * channels + c] = *sample;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AudioContext, NodeOptions};
    use crate::node::OutputChannels;

    struct Dc(f32);

    impl AudioProcessor for Dc {
        fn process(&mut self, _: &RenderScope<'_>, _: &[&AudioBus], _: &[&[f32]], outputs: &mut [AudioBus]) {
            for channel in outputs[0].channels_mut() {
                channel.fill(self.0);
            }
        }
    }

    fn quantum(renderer: &mut GraphRenderer) -> Vec<f32> {
        let mut out = vec![0.0; renderer.channels() * RENDER_QUANTUM_FRAMES];
        renderer.render_quantum(&mut out, None, RENDER_QUANTUM_FRAMES);
        out
    }

    #[test]
    fn disconnect_is_invisible_until_next_snapshot() {
        let (context, mut renderer) = AudioContext::new(48_000);
        let (dc, _) = context.add_processor(NodeOptions::new(0, vec![OutputChannels::Fixed(1)]), Dc(1.0));
        dc.connect(&context.destination(), 0, 0).unwrap();

        assert!(quantum(&mut renderer).iter().all(|s| *s == 1.0));

        dc.disconnect(0).unwrap();
        {
            // Lock held: the renderer keeps its previous snapshot.
            let shared = Arc::clone(&renderer.context);
            let held = shared.lock_graph();
            assert!(quantum(&mut renderer).iter().all(|s| *s == 1.0));
            drop(held);
        }
        assert!(context.render_stats().contended >= 2);

        assert!(quantum(&mut renderer).iter().all(|s| *s == 0.0));
    }

    #[test]
    fn wrong_quantum_size_renders_silence() {
        let (context, mut renderer) = AudioContext::new(48_000);
        let (dc, _) = context.add_processor(NodeOptions::new(0, vec![OutputChannels::Fixed(1)]), Dc(1.0));
        dc.connect(&context.destination(), 0, 0).unwrap();

        let mut out = vec![1.0; 2 * 128];
        renderer.render_quantum(&mut out, None, 128);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(renderer.frame(), 0);
    }

    #[test]
    fn panicking_node_is_silenced_alone() {
        struct Boom;
        impl AudioProcessor for Boom {
            fn process(&mut self, _: &RenderScope<'_>, _: &[&AudioBus], _: &[&[f32]], _: &mut [AudioBus]) {
                panic!("boom");
            }
        }

        let (context, mut renderer) = AudioContext::new(48_000);
        let (boom, _) = context.add_processor(NodeOptions::new(0, vec![OutputChannels::Fixed(1)]), Boom);
        let (dc, _) = context.add_processor(NodeOptions::new(0, vec![OutputChannels::Fixed(1)]), Dc(0.5));
        boom.connect(&context.destination(), 0, 0).unwrap();
        dc.connect(&context.destination(), 0, 0).unwrap();

        for quanta in 1..=3 {
            let out = quantum(&mut renderer);
            assert!(out.iter().all(|s| *s == 0.5), "healthy nodes keep playing");
            assert_eq!(context.render_stats().panics, quanta);
        }
        assert_eq!(renderer.frame(), 3 * RENDER_QUANTUM_FRAMES as u64);
    }

    #[test]
    fn stop_waits_for_the_graph_lock() {
        let (context, renderer) = AudioContext::new(48_000);
        let osc = context.create_oscillator();
        osc.start(0.0).unwrap();

        let shared = Arc::clone(&renderer.context);
        let held = shared.lock_graph();
        let stopper = std::thread::spawn(move || {
            osc.stop(1.0).unwrap();
            osc
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!stopper.is_finished());

        drop(held);
        let osc = stopper.join().unwrap();
        assert_eq!(osc.playback_state(), crate::scheduled::PlaybackState::Scheduled);
    }

    #[test]
    fn nodes_created_without_a_renderer_are_not_queued() {
        let (context, renderer) = AudioContext::new(48_000);
        let shared = Arc::clone(&renderer.context);
        drop(renderer);

        let gain = context.create_gain();
        assert!(context.contains(gain.id()));
        assert!(shared.lock_graph().graph.admissions.is_empty());

        drop(gain);
        assert_eq!(context.node_count(), 1);
    }
}
