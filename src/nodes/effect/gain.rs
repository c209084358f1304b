//! Gain/volume control effect

use crate::bus::AudioBus;
use crate::node::{AudioNode, AudioProcessor, RenderScope};
use crate::param::{AudioParam, ParamDescriptor};

/// Multiplies its input by the `gain` parameter, sample by sample.
///
/// Output has as many channels as the input.
pub(crate) struct Gain;

impl Gain {
    pub(crate) const PARAMS: [ParamDescriptor; 1] = [ParamDescriptor::new("gain", 1.0, f32::MIN, f32::MAX)];
}

impl AudioProcessor for Gain {
    fn process(
        &mut self,
        _scope: &RenderScope<'_>,
        inputs: &[&AudioBus],
        params: &[&[f32]],
        outputs: &mut [AudioBus],
    ) {
        let (Some(input), Some(gain), Some(output)) = (inputs.first(), params.first(), outputs.first_mut()) else {
            return;
        };
        output.copy_with_sample_gains_from(input, gain);
    }
}

/// Handle to a gain node. Created by [`AudioContext::create_gain`](crate::AudioContext::create_gain).
#[derive(Clone, Debug)]
pub struct GainNode {
    node: AudioNode,
    gain: AudioParam,
}

impl GainNode {
    pub(crate) fn new(node: AudioNode, [gain]: [AudioParam; 1]) -> Self {
        Self { node, gain }
    }

    /// Linear gain applied to the input. Defaults to 1.
    pub fn gain(&self) -> &AudioParam {
        &self.gain
    }
}

node_handle!(GainNode => node);
