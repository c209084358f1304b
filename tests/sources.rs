mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{channel, context, quantum, QUANTUM_SECS, RATE};
use klingt_context::{
    AudioBuffer, ErrorCategory, GraphError, OscillatorType, PlaybackState, RenderEvent, RENDER_QUANTUM_FRAMES,
};

fn ramp_buffer(frames: usize) -> Arc<AudioBuffer> {
    let samples = (0..frames).map(|i| i as f32).collect();
    Arc::new(AudioBuffer::new(RATE as f32, vec![samples]).unwrap())
}

#[test]
fn oscillators_are_silent_until_started() {
    let (context, mut renderer) = context();
    let osc = context.create_oscillator();
    osc.connect(&context.destination(), 0, 0).unwrap();

    assert_eq!(osc.playback_state(), PlaybackState::Unscheduled);
    assert!(quantum(&mut renderer).iter().all(|s| *s == 0.0));

    osc.start(0.0).unwrap();
    assert_eq!(osc.playback_state(), PlaybackState::Scheduled);
    assert_eq!(context.active_source_count(), 0);

    let out = quantum(&mut renderer);
    assert!(out.iter().any(|s| s.abs() > 0.5));
    assert_eq!(osc.playback_state(), PlaybackState::Playing);
    assert_eq!(context.active_source_count(), 1);
}

#[test]
fn start_times_are_sample_accurate() {
    let (context, mut renderer) = context();
    let mut osc = context.create_oscillator();
    osc.set_type(OscillatorType::Square).unwrap();
    osc.connect(&context.destination(), 0, 0).unwrap();
    assert_eq!(osc.oscillator_type(), OscillatorType::Square);

    // Start half-way into the second quantum.
    osc.start(1.5 * QUANTUM_SECS).unwrap();
    assert!(quantum(&mut renderer).iter().all(|s| *s == 0.0));

    let left = channel(&quantum(&mut renderer), 2, 0);
    let half = RENDER_QUANTUM_FRAMES / 2;
    assert!(left[..half].iter().all(|s| *s == 0.0));
    assert_eq!(left[half], 1.0, "square starts high at phase zero");
}

#[test]
fn starting_twice_is_an_invalid_state() {
    let (context, _renderer) = context();
    let osc = context.create_oscillator();
    osc.start(0.0).unwrap();

    let err = osc.start(1.0).unwrap_err();
    assert!(matches!(err, GraphError::InvalidState(_)));
    assert_eq!(err.category(), ErrorCategory::InvalidState);

    assert!(matches!(context.create_oscillator().stop(1.0), Err(GraphError::InvalidState(_))));
    assert!(matches!(osc.start(-1.0), Err(GraphError::InvalidValue(_))));
}

#[test]
fn stopping_finishes_and_reports_once() {
    let (context, mut renderer) = context();
    let osc = context.create_oscillator();
    osc.connect(&context.destination(), 0, 0).unwrap();

    let ended = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ended);
    osc.set_on_ended(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    osc.start(0.0).unwrap();
    osc.stop(1.5 * QUANTUM_SECS).unwrap();

    quantum(&mut renderer);
    let second = channel(&quantum(&mut renderer), 2, 0);
    let half = RENDER_QUANTUM_FRAMES / 2;
    assert!(second[half..].iter().all(|s| *s == 0.0));
    assert!(second[..half].iter().any(|s| *s != 0.0));
    assert_eq!(osc.playback_state(), PlaybackState::Finished);
    assert_eq!(context.active_source_count(), 0);

    let events = context.dispatch_events();
    assert_eq!(events, vec![RenderEvent::SourceEnded(osc.id())]);
    assert_eq!(ended.load(Ordering::SeqCst), 1);

    quantum(&mut renderer);
    assert!(context.dispatch_events().is_empty());
    assert_eq!(ended.load(Ordering::SeqCst), 1);
    assert!(matches!(osc.start(0.0), Err(GraphError::InvalidState(_))));
}

#[test]
fn playing_sources_outlive_their_handles() {
    let (context, mut renderer) = context();
    let osc = context.create_oscillator();
    let id = osc.id();
    osc.connect(&context.destination(), 0, 0).unwrap();

    let ended = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ended);
    osc.set_on_ended(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    osc.start(0.0).unwrap();
    osc.stop(2.0 * QUANTUM_SECS).unwrap();
    drop(osc);

    assert!(context.contains(id));
    assert!(quantum(&mut renderer).iter().any(|s| *s != 0.0));
    assert!(quantum(&mut renderer).iter().any(|s| *s != 0.0));
    assert!(context.contains(id));

    // The third quantum starts at the stop time.
    assert!(quantum(&mut renderer).iter().all(|s| *s == 0.0));
    assert!(!context.contains(id));
    assert_eq!(context.node_count(), 1);

    context.dispatch_events();
    assert_eq!(ended.load(Ordering::SeqCst), 1);
}

#[test]
fn unstarted_sources_are_released_with_their_handles() {
    let (context, _renderer) = context();
    let osc = context.create_oscillator();
    let id = osc.id();
    osc.connect(&context.destination(), 0, 0).unwrap();
    drop(osc);
    assert!(!context.contains(id));
}

#[test]
fn detune_shifts_frequency_by_cents() {
    let (context, mut renderer) = context();
    let mut osc = context.create_oscillator();
    let mut tap = context.create_tap(RENDER_QUANTUM_FRAMES);
    osc.connect(&tap, 0, 0).unwrap();

    // 100 Hz plus one octave: one full cycle every 32 frames at 6400 Hz.
    osc.frequency().set_value_at_time(100.0, 0.0).unwrap();
    osc.detune().set_value_at_time(1200.0, 0.0).unwrap();
    osc.set_type(OscillatorType::Sawtooth).unwrap();
    osc.start(0.0).unwrap();

    quantum(&mut renderer);
    let mut captured = vec![0.0; RENDER_QUANTUM_FRAMES];
    assert_eq!(tap.read(&mut captured), RENDER_QUANTUM_FRAMES);
    assert_eq!(captured[0], -1.0);
    assert!((captured[16] - 0.0).abs() < 1e-4);
    assert!((captured[32] + 1.0).abs() < 1e-4);
}

#[test]
fn buffer_sources_play_their_buffer_once() {
    let (context, mut renderer) = context();
    let mut player = context.create_buffer_source();
    player.set_buffer(ramp_buffer(RENDER_QUANTUM_FRAMES)).unwrap();
    player.connect(&context.destination(), 0, 0).unwrap();
    player.start(0.0).unwrap();

    let left = channel(&quantum(&mut renderer), 2, 0);
    for (i, sample) in left.iter().enumerate() {
        assert_eq!(*sample, i as f32);
    }
    assert_eq!(player.playback_state(), PlaybackState::Playing);

    assert!(quantum(&mut renderer).iter().all(|s| *s == 0.0));
    assert_eq!(player.playback_state(), PlaybackState::Finished);
    assert_eq!(context.dispatch_events(), vec![RenderEvent::SourceEnded(player.id())]);
}

#[test]
fn looping_buffers_wrap_around() {
    let (context, mut renderer) = context();
    let mut player = context.create_buffer_source();
    player.set_buffer(ramp_buffer(16)).unwrap();
    player.set_loop(true).unwrap();
    assert!(player.loop_enabled());
    player.connect(&context.destination(), 0, 0).unwrap();
    player.start(0.0).unwrap();

    for _ in 0..3 {
        let left = channel(&quantum(&mut renderer), 2, 0);
        for (i, sample) in left.iter().enumerate() {
            assert_eq!(*sample, (i % 16) as f32);
        }
    }
    assert_eq!(player.playback_state(), PlaybackState::Playing);
}

#[test]
fn loop_points_restrict_the_loop() {
    let (context, mut renderer) = context();
    let mut player = context.create_buffer_source();
    player.set_buffer(ramp_buffer(128)).unwrap();
    player.set_loop(true).unwrap();
    // Frames 50 and 100 at 6400 Hz.
    player.set_loop_points(1.0 / 128.0, 1.0 / 64.0).unwrap();
    assert_eq!(player.loop_points(), (1.0 / 128.0, 1.0 / 64.0));
    player.connect(&context.destination(), 0, 0).unwrap();
    player.start(0.0).unwrap();

    let mut left = channel(&quantum(&mut renderer), 2, 0);
    left.extend(channel(&quantum(&mut renderer), 2, 0));
    let expected = (0..100).chain(50..78).map(|v| v as f32);
    for (i, (sample, expected)) in left.iter().zip(expected).enumerate() {
        assert!((sample - expected).abs() < 1e-3, "frame {i}: {sample} != {expected}");
    }
    assert!(player.set_loop_points(-1.0, 0.5).is_err());
}

#[test]
fn playback_rate_changes_speed() {
    let (context, mut renderer) = context();
    let mut player = context.create_buffer_source();
    player.set_buffer(ramp_buffer(256)).unwrap();
    player.playback_rate().set_value_at_time(0.5, 0.0).unwrap();
    player.connect(&context.destination(), 0, 0).unwrap();
    player.start(0.0).unwrap();

    let left = channel(&quantum(&mut renderer), 2, 0);
    for (i, sample) in left.iter().enumerate() {
        assert!((sample - i as f32 * 0.5).abs() < 1e-4, "frame {i}: {sample}");
    }
}

#[test]
fn grains_play_a_slice_of_the_buffer() {
    let (context, mut renderer) = context();
    let mut player = context.create_buffer_source();
    player.set_buffer(ramp_buffer(256)).unwrap();
    player.connect(&context.destination(), 0, 0).unwrap();
    player
        .start_with_offset(0.0, 100.0 / RATE as f64, Some(10.0 / RATE as f64))
        .unwrap();

    let left = channel(&quantum(&mut renderer), 2, 0);
    for i in 0..10 {
        assert_eq!(left[i], 100.0 + i as f32);
    }
    assert!(left[10..].iter().all(|s| *s == 0.0));
    assert_eq!(player.playback_state(), PlaybackState::Finished);
    assert!(player.start_with_offset(0.0, 0.0, None).is_err());
}

#[test]
fn buffer_channel_count_sets_the_output_width() {
    let (context, mut renderer) = context();
    let mut player = context.create_buffer_source();
    assert_eq!(player.node().output(0).unwrap().channel_count, 1);

    let stereo = AudioBuffer::from_interleaved(RATE as f32, &[0.5, -0.5].repeat(RENDER_QUANTUM_FRAMES), 2).unwrap();
    player.set_buffer(Arc::new(stereo)).unwrap();
    assert_eq!(player.node().output(0).unwrap().channel_count, 2);
    assert_eq!(player.buffer().map(|b| b.number_of_channels()), Some(2));

    player.connect(&context.destination(), 0, 0).unwrap();
    player.start(0.0).unwrap();
    let out = quantum(&mut renderer);
    assert_eq!(channel(&out, 2, 0), vec![0.5; RENDER_QUANTUM_FRAMES]);
    assert_eq!(channel(&out, 2, 1), vec![-0.5; RENDER_QUANTUM_FRAMES]);
}

#[test]
fn buffer_sources_without_a_buffer_are_silent() {
    let (context, mut renderer) = context();
    let player = context.create_buffer_source();
    player.connect(&context.destination(), 0, 0).unwrap();
    player.start(0.0).unwrap();

    assert!(quantum(&mut renderer).iter().all(|s| *s == 0.0));
    assert_eq!(player.playback_state(), PlaybackState::Playing);
}

#[test]
fn buffers_are_resampled_to_the_context_rate() {
    let (context, mut renderer) = context();
    let mut player = context.create_buffer_source();
    // At half the context rate every buffer frame spans two output frames.
    let samples = (0..RENDER_QUANTUM_FRAMES).map(|i| i as f32).collect();
    let buffer = AudioBuffer::new(RATE as f32 / 2.0, vec![samples]).unwrap();
    assert_eq!(buffer.duration(), 2.0 * QUANTUM_SECS);
    player.set_buffer(Arc::new(buffer)).unwrap();
    player.connect(&context.destination(), 0, 0).unwrap();
    player.start(0.0).unwrap();

    let mut left = channel(&quantum(&mut renderer), 2, 0);
    left.extend(channel(&quantum(&mut renderer), 2, 0));
    for (i, sample) in left.iter().take(2 * RENDER_QUANTUM_FRAMES - 1).enumerate() {
        assert!((sample - i as f32 * 0.5).abs() < 1e-4, "frame {i}: {sample}");
    }

    assert!(quantum(&mut renderer).iter().all(|s| *s == 0.0));
    assert_eq!(player.playback_state(), PlaybackState::Finished);
}

#[test]
fn reverse_loops_wrap_from_past_the_buffer_end() {
    let (context, mut renderer) = context();
    let mut player = context.create_buffer_source();
    player.set_buffer(ramp_buffer(16)).unwrap();
    player.set_loop(true).unwrap();
    player.playback_rate().set_value_at_time(-1.0, 0.0).unwrap();
    player.connect(&context.destination(), 0, 0).unwrap();
    player.start_with_offset(0.0, 100.0 / RATE as f64, None).unwrap();

    for q in 0..3 {
        let left = channel(&quantum(&mut renderer), 2, 0);
        for (i, sample) in left.iter().enumerate() {
            let frame = (q * RENDER_QUANTUM_FRAMES + i) as i64;
            assert_eq!(*sample, (4 - frame).rem_euclid(16) as f32, "frame {frame}");
        }
    }
    assert_eq!(context.render_stats().panics, 0);
    assert_eq!(player.playback_state(), PlaybackState::Playing);
}

#[test]
fn disconnected_sources_still_run_to_their_stop_time() {
    let (context, mut renderer) = context();
    let osc = context.create_oscillator();
    let id = osc.id();
    osc.connect(&context.destination(), 0, 0).unwrap();

    let ended = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ended);
    osc.set_on_ended(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    osc.start(0.0).unwrap();
    osc.stop(2.0 * QUANTUM_SECS).unwrap();

    quantum(&mut renderer);
    osc.disconnect(0).unwrap();
    drop(osc);

    assert!(quantum(&mut renderer).iter().all(|s| *s == 0.0));
    assert!(context.is_automatic_pull(id));
    assert_eq!(context.active_source_count(), 1);

    quantum(&mut renderer);
    assert!(!context.contains(id));
    assert_eq!(context.active_source_count(), 0);
    assert_eq!(context.node_count(), 1);

    context.dispatch_events();
    assert_eq!(ended.load(Ordering::SeqCst), 1);
}

#[test]
fn sources_in_dead_end_chains_are_released() {
    let (context, mut renderer) = context();
    let osc = context.create_oscillator();
    let gain = context.create_gain();
    osc.connect(&gain, 0, 0).unwrap();
    osc.start(0.0).unwrap();
    osc.stop(QUANTUM_SECS).unwrap();
    drop(osc);
    drop(gain);
    assert_eq!(context.node_count(), 3);

    for _ in 0..2 {
        assert!(quantum(&mut renderer).iter().all(|s| *s == 0.0));
    }
    assert_eq!(context.active_source_count(), 0);
    assert_eq!(context.node_count(), 1);
    assert_eq!(renderer.rendering_node_count(), 1);
}
