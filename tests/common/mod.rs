#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use klingt_context::{AudioBus, AudioContext, AudioProcessor, GraphRenderer, RenderScope, RENDER_QUANTUM_FRAMES};

/// One quantum at this rate lasts exactly 10 ms.
pub const RATE: u32 = 6400;
pub const QUANTUM_SECS: f64 = RENDER_QUANTUM_FRAMES as f64 / RATE as f64;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

pub fn context() -> (AudioContext, GraphRenderer) {
    init_tracing();
    AudioContext::new(RATE)
}

/// Render one quantum and return it interleaved.
pub fn quantum(renderer: &mut GraphRenderer) -> Vec<f32> {
    let mut out = vec![0.0; renderer.channels() * RENDER_QUANTUM_FRAMES];
    renderer.render_quantum(&mut out, None, RENDER_QUANTUM_FRAMES);
    out
}

/// Channel `channel` of an interleaved block.
pub fn channel(block: &[f32], channels: usize, channel: usize) -> Vec<f32> {
    block.iter().skip(channel).step_by(channels).copied().collect()
}

/// Writes a constant to every output channel.
pub struct Dc(pub f32);

impl AudioProcessor for Dc {
    fn process(&mut self, _: &RenderScope<'_>, _: &[&AudioBus], _: &[&[f32]], outputs: &mut [AudioBus]) {
        for channel in outputs[0].channels_mut() {
            channel.fill(self.0);
        }
    }
}

/// A [`Dc`] that counts how often it is processed.
pub struct Counting {
    pub value: f32,
    pub calls: Arc<AtomicUsize>,
}

impl AudioProcessor for Counting {
    fn process(&mut self, _: &RenderScope<'_>, _: &[&AudioBus], _: &[&[f32]], outputs: &mut [AudioBus]) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for channel in outputs[0].channels_mut() {
            channel.fill(self.value);
        }
    }
}
