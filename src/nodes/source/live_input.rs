//! Live input from the audio device

use crate::bus::{AudioBus, ChannelInterpretation};
use crate::node::{AudioNode, AudioProcessor, RenderScope};

/// Copies the device input supplied to the current quantum to its output.
/// Renders silence when the driver has no input.
pub(crate) struct LiveInput;

impl AudioProcessor for LiveInput {
    fn process(
        &mut self,
        scope: &RenderScope<'_>,
        _inputs: &[&AudioBus],
        _params: &[&[f32]],
        outputs: &mut [AudioBus],
    ) {
        let Some(output) = outputs.first_mut() else {
            return;
        };
        match scope.live_input() {
            Some(input) => output.copy_from(input, ChannelInterpretation::Speakers),
            None => output.zero(),
        }
    }
}

/// Handle to the live input node. Created by
/// [`AudioContext::create_live_input`](crate::AudioContext::create_live_input).
#[derive(Clone, Debug)]
pub struct LiveInputNode {
    node: AudioNode,
}

impl LiveInputNode {
    pub(crate) fn new(node: AudioNode) -> Self {
        Self { node }
    }
}

node_handle!(LiveInputNode => node);
