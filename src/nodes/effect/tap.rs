//! Analysis tap - passes audio through and copies it to the control thread.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use rtrb::{Consumer, Producer};

use crate::bus::{AudioBus, ChannelInterpretation};
use crate::node::{AudioNode, AudioProcessor, RenderScope};

/// Copies its input to its output, and channel 0 of every quantum into a ring
/// buffer.
///
/// While its input is connected and nothing consumes its output, the tap is
/// rendered automatically each quantum so analysis keeps running.
pub(crate) struct Tap {
    ring: Producer<f32>,
    dropped: Arc<AtomicUsize>,
}

impl Tap {
    pub(crate) fn new(ring: Producer<f32>, dropped: Arc<AtomicUsize>) -> Self {
        Self { ring, dropped }
    }
}

impl AudioProcessor for Tap {
    fn process(
        &mut self,
        scope: &RenderScope<'_>,
        inputs: &[&AudioBus],
        _params: &[&[f32]],
        outputs: &mut [AudioBus],
    ) {
        let (Some(input), Some(output)) = (inputs.first(), outputs.first_mut()) else {
            return;
        };
        output.copy_from(input, ChannelInterpretation::Discrete);

        // Skip the block rather than partially write it
        if self.ring.slots() < scope.frames() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if input.number_of_channels() == 0 || input.is_silent() {
            for _ in 0..scope.frames() {
                let _ = self.ring.push(0.0);
            }
        } else {
            for sample in input.channel(0) {
                let _ = self.ring.push(*sample);
            }
        }
    }

    /// A tap records silence too.
    fn propagates_silence(&self, _last_non_silent_time: f64, _now: f64) -> bool {
        false
    }
}

/// Handle to a tap node. Created by [`AudioContext::create_tap`](crate::AudioContext::create_tap).
#[derive(Debug)]
pub struct TapNode {
    node: AudioNode,
    ring: Consumer<f32>,
    dropped: Arc<AtomicUsize>,
}

impl TapNode {
    pub(crate) fn new(node: AudioNode, ring: Consumer<f32>, dropped: Arc<AtomicUsize>) -> Self {
        Self { node, ring, dropped }
    }

    /// Samples waiting to be read.
    pub fn available(&self) -> usize {
        self.ring.slots()
    }

    /// Read captured samples into `out`, returning how many were written.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let mut n = 0;
        for slot in out.iter_mut() {
            match self.ring.pop() {
                Ok(sample) => *slot = sample,
                Err(_) => break,
            }
            n += 1;
        }
        n
    }

    /// Quanta that could not be captured because the ring was full.
    pub fn dropped_blocks(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

node_handle!(TapNode => node);
