mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use common::{channel, context, quantum, Counting, Dc, QUANTUM_SECS, RATE};
use klingt_context::{
    AudioBus, AudioProcessor, ChannelInterpretation, ContextBuilder, NodeOptions, OutputChannels, RenderScope,
    RENDER_QUANTUM_FRAMES,
};

fn dc(context: &klingt_context::AudioContext, value: f32) -> klingt_context::AudioNode {
    let (node, _) = context.add_processor(NodeOptions::new(0, vec![OutputChannels::Fixed(1)]), Dc(value));
    node
}

#[test]
fn empty_graph_renders_silence() {
    let (context, mut renderer) = context();
    let out = quantum(&mut renderer);
    assert_eq!(out.len(), 2 * RENDER_QUANTUM_FRAMES);
    assert!(out.iter().all(|s| *s == 0.0));
    assert_eq!(context.current_frame(), RENDER_QUANTUM_FRAMES as u64);
    assert!((context.current_time() - QUANTUM_SECS).abs() < 1e-12);
    assert_eq!(context.render_stats().quanta, 1);
}

#[test]
fn mono_sources_are_upmixed_to_the_destination() {
    let (context, mut renderer) = context();
    let source = dc(&context, 0.5);
    source.connect(&context.destination(), 0, 0).unwrap();

    let out = quantum(&mut renderer);
    assert!(out.iter().all(|s| *s == 0.5));
}

#[test]
fn connections_into_one_input_are_summed() {
    let (context, mut renderer) = context();
    let a = dc(&context, 0.25);
    let b = dc(&context, 0.5);
    a.connect(&context.destination(), 0, 0).unwrap();
    b.connect(&context.destination(), 0, 0).unwrap();

    let out = quantum(&mut renderer);
    assert!(out.iter().all(|s| (*s - 0.75).abs() < 1e-6));
}

#[test]
fn gain_scales_its_input() {
    let (context, mut renderer) = context();
    let source = dc(&context, 1.0);
    let gain = context.create_gain();
    source.connect(&gain, 0, 0).unwrap();
    gain.connect(&context.destination(), 0, 0).unwrap();
    gain.gain().set_value_at_time(0.5, 0.0).unwrap();

    let out = quantum(&mut renderer);
    assert!(out.iter().all(|s| (*s - 0.5).abs() < 1e-6));
}

#[test]
fn plain_value_changes_are_smoothed() {
    let (context, mut renderer) = context();
    let source = dc(&context, 1.0);
    let gain = context.create_gain();
    source.connect(&gain, 0, 0).unwrap();
    gain.connect(&context.destination(), 0, 0).unwrap();

    gain.gain().set_value(0.0);
    assert_eq!(gain.gain().value(), 0.0);

    let first = quantum(&mut renderer)[0];
    assert!(first < 1.0 && first > 0.9, "one smoothing step, got {first}");

    let mut last = first;
    for _ in 0..400 {
        last = quantum(&mut renderer)[0];
    }
    assert_eq!(last, 0.0, "snaps to the target once close enough");
}

#[test]
fn linear_ramps_are_sample_accurate() {
    let (context, mut renderer) = context();
    let source = dc(&context, 1.0);
    let gain = context.create_gain();
    source.connect(&gain, 0, 0).unwrap();
    gain.connect(&context.destination(), 0, 0).unwrap();

    gain.gain()
        .set_value_at_time(0.0, 0.0)
        .unwrap()
        .linear_ramp_to_value_at_time(1.0, QUANTUM_SECS)
        .unwrap();

    let left = channel(&quantum(&mut renderer), 2, 0);
    for (i, sample) in left.iter().enumerate() {
        let expected = i as f32 / RENDER_QUANTUM_FRAMES as f32;
        assert!((sample - expected).abs() < 1e-4, "frame {i}: {sample} != {expected}");
    }

    let after = quantum(&mut renderer);
    assert!(after.iter().all(|s| (*s - 1.0).abs() < 1e-6));
    assert!((gain.gain().value() - 1.0).abs() < 1e-6);
}

#[test]
fn exponential_ramps_pass_the_geometric_midpoint() {
    let (context, mut renderer) = context();
    let source = dc(&context, 1.0);
    let gain = context.create_gain();
    source.connect(&gain, 0, 0).unwrap();
    gain.connect(&context.destination(), 0, 0).unwrap();

    gain.gain()
        .set_value_at_time(1.0, 0.0)
        .unwrap()
        .exponential_ramp_to_value_at_time(4.0, 2.0 * QUANTUM_SECS)
        .unwrap();

    let first = channel(&quantum(&mut renderer), 2, 0);
    assert_eq!(first[0], 1.0);
    let second = channel(&quantum(&mut renderer), 2, 0);
    assert!((second[0] - 2.0).abs() < 1e-4, "midpoint {}", second[0]);

    quantum(&mut renderer);
    assert!(quantum(&mut renderer).iter().all(|s| (*s - 4.0).abs() < 1e-6));
}

#[test]
fn set_target_follows_its_time_constant() {
    let (context, mut renderer) = context();
    let source = dc(&context, 1.0);
    let gain = context.create_gain();
    source.connect(&gain, 0, 0).unwrap();
    gain.connect(&context.destination(), 0, 0).unwrap();

    gain.gain()
        .set_value_at_time(0.0, 0.0)
        .unwrap()
        .set_target_at_time(1.0, 0.0, 0.1)
        .unwrap();

    // Ten quanta make one time constant.
    let mut last = 0.0;
    for _ in 0..10 {
        last = channel(&quantum(&mut renderer), 2, 0)[RENDER_QUANTUM_FRAMES - 1];
    }
    let expected = 1.0 - (-1.0f32).exp();
    assert!((last - expected).abs() < 0.01, "got {last}, expected {expected}");
}

#[test]
fn cancelled_automation_stops_applying() {
    let (context, mut renderer) = context();
    let source = dc(&context, 1.0);
    let gain = context.create_gain();
    source.connect(&gain, 0, 0).unwrap();
    gain.connect(&context.destination(), 0, 0).unwrap();

    gain.gain().set_value_at_time(0.25, 2.0 * QUANTUM_SECS).unwrap();
    assert_eq!(gain.gain().scheduled_event_count(), 1);
    gain.gain().cancel_scheduled_values(0.0).unwrap();
    assert_eq!(gain.gain().scheduled_event_count(), 0);

    for _ in 0..3 {
        quantum(&mut renderer);
    }
    assert!(quantum(&mut renderer).iter().all(|s| *s == 1.0));
}

#[test]
fn audio_rate_modulation_adds_to_the_param() {
    let (context, mut renderer) = context();
    let source = dc(&context, 1.0);
    let modulator = dc(&context, 0.25);
    let gain = context.create_gain();
    source.connect(&gain, 0, 0).unwrap();
    gain.connect(&context.destination(), 0, 0).unwrap();

    gain.gain().set_value_at_time(0.5, 0.0).unwrap();
    modulator.connect_param(gain.gain(), 0).unwrap();

    let out = quantum(&mut renderer);
    assert!(out.iter().all(|s| (*s - 0.75).abs() < 1e-6));
}

#[test]
fn shared_nodes_are_processed_once_per_quantum() {
    let (context, mut renderer) = context();
    let calls = Arc::new(AtomicUsize::new(0));
    let (shared, _) = context.add_processor(
        NodeOptions::new(0, vec![OutputChannels::Fixed(1)]),
        Counting {
            value: 0.5,
            calls: Arc::clone(&calls),
        },
    );
    let left = context.create_gain();
    let right = context.create_gain();
    shared.connect(&left, 0, 0).unwrap();
    shared.connect(&right, 0, 0).unwrap();
    left.connect(&context.destination(), 0, 0).unwrap();
    right.connect(&context.destination(), 0, 0).unwrap();

    let out = quantum(&mut renderer);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(renderer.rendering_fan_out(shared.id(), 0), Some(2));
    assert!(out.iter().all(|s| (*s - 1.0).abs() < 1e-6));

    quantum(&mut renderer);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn unconnected_nodes_are_not_rendered() {
    let (context, mut renderer) = context();
    let calls = Arc::new(AtomicUsize::new(0));
    let (_node, _) = context.add_processor(
        NodeOptions::new(0, vec![OutputChannels::Fixed(1)]),
        Counting {
            value: 1.0,
            calls: Arc::clone(&calls),
        },
    );

    quantum(&mut renderer);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// Plays a full-scale block for the given number of quanta, then silence.
struct Burst(usize);

impl AudioProcessor for Burst {
    fn process(&mut self, _: &RenderScope<'_>, _: &[&AudioBus], _: &[&[f32]], outputs: &mut [AudioBus]) {
        if self.0 == 0 {
            outputs[0].zero();
            return;
        }
        self.0 -= 1;
        for channel in outputs[0].channels_mut() {
            channel.fill(1.0);
        }
    }
}

struct Ringing {
    tail: f64,
    calls: Arc<AtomicUsize>,
}

impl AudioProcessor for Ringing {
    fn process(&mut self, _: &RenderScope<'_>, inputs: &[&AudioBus], _: &[&[f32]], outputs: &mut [AudioBus]) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        outputs[0].copy_from(inputs[0], ChannelInterpretation::Speakers);
    }

    fn tail_time(&self) -> f64 {
        self.tail
    }
}

#[test]
fn tails_keep_nodes_running_after_their_input_goes_silent() {
    for (tail, expected_calls) in [(0.0, 1), (1.5 * QUANTUM_SECS, 2), (3.5 * QUANTUM_SECS, 4)] {
        let (context, mut renderer) = context();
        let calls = Arc::new(AtomicUsize::new(0));
        let (burst, _) = context.add_processor(NodeOptions::new(0, vec![OutputChannels::Fixed(1)]), Burst(1));
        let (ringing, _) = context.add_processor(
            NodeOptions::new(1, vec![OutputChannels::FollowInput(0)]),
            Ringing {
                tail,
                calls: Arc::clone(&calls),
            },
        );
        burst.connect(&ringing, 0, 0).unwrap();
        ringing.connect(&context.destination(), 0, 0).unwrap();

        assert!(quantum(&mut renderer).iter().all(|s| *s == 1.0));
        for _ in 0..8 {
            assert!(quantum(&mut renderer).iter().all(|s| *s == 0.0));
        }
        assert_eq!(calls.load(Ordering::SeqCst), expected_calls, "tail of {tail} s");
    }
}

#[test]
fn live_input_is_played_through() {
    let (context, mut renderer) = context();
    let input = context.create_live_input();
    input.connect(&context.destination(), 0, 0).unwrap();

    let live: Vec<f32> = (0..RENDER_QUANTUM_FRAMES).flat_map(|_| [0.25, -0.5]).collect();
    let mut out = vec![0.0; 2 * RENDER_QUANTUM_FRAMES];
    renderer.render_quantum(&mut out, Some(&live), RENDER_QUANTUM_FRAMES);
    assert_eq!(out, live);

    // No input this quantum: silence.
    renderer.render_quantum(&mut out, None, RENDER_QUANTUM_FRAMES);
    assert!(out.iter().all(|s| *s == 0.0));
}

#[test]
fn offline_rendering_spans_partial_quanta() {
    let (context, mut renderer) = ContextBuilder::new(RATE).with_channels(1).build();
    assert_eq!(context.channels(), 1);
    let source = dc(&context, 0.5);
    source.connect(&context.destination(), 0, 0).unwrap();

    let first = renderer.render_offline(100);
    assert_eq!(first.len(), 100);
    assert!(first.iter().all(|s| *s == 0.5));
    assert_eq!(context.current_frame(), 2 * RENDER_QUANTUM_FRAMES as u64);

    // The remainder of the second quantum is used before a third is rendered.
    renderer.render_offline(2 * RENDER_QUANTUM_FRAMES - 100);
    assert_eq!(context.current_frame(), 2 * RENDER_QUANTUM_FRAMES as u64);
}

#[test]
fn graph_edits_race_rendering_safely() {
    let (context, renderer) = context();
    let keep = context.create_oscillator();
    keep.connect(&context.destination(), 0, 0).unwrap();
    keep.start(0.0).unwrap();

    let audio = thread::spawn(move || {
        let mut renderer = renderer;
        let mut out = vec![0.0; 2 * RENDER_QUANTUM_FRAMES];
        for _ in 0..500 {
            renderer.render_quantum(&mut out, None, RENDER_QUANTUM_FRAMES);
        }
        renderer
    });

    for i in 0..200 {
        let osc = context.create_oscillator();
        let gain = context.create_gain();
        osc.connect(&gain, 0, 0).unwrap();
        gain.connect(&context.destination(), 0, 0).unwrap();
        if i % 2 == 0 {
            osc.start(0.0).unwrap();
            osc.stop(0.0).unwrap();
        }
    }

    let mut renderer = audio.join().unwrap();
    assert_eq!(context.render_stats().quanta, 500);
    assert_eq!(context.render_stats().panics, 0);

    // Let the renderer drain whatever the race left over.
    for _ in 0..2 {
        quantum(&mut renderer);
    }
    context.dispatch_events();
    assert_eq!(context.node_count(), 2);
    assert_eq!(renderer.rendering_node_count(), 2);
}
