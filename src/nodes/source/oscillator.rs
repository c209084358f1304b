//! Periodic waveform oscillator

use alloc::sync::Arc;
use core::f32::consts::TAU;

use rtrb::{Consumer, Producer};

use crate::bus::AudioBus;
use crate::error::{GraphError, Result};
use crate::node::{AudioProcessor, RenderScope};
use crate::param::{AudioParam, ParamDescriptor};
use crate::scheduled::{Schedule, ScheduledNode};

/// Waveform an oscillator produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OscillatorType {
    #[default]
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

impl OscillatorType {
    /// One sample at `phase` in `[0, 1)`.
    #[inline]
    fn sample(self, phase: f32) -> f32 {
        match self {
            OscillatorType::Sine => (phase * TAU).sin(),
            OscillatorType::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            OscillatorType::Sawtooth => 2.0 * phase - 1.0,
            OscillatorType::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
        }
    }
}

/// Messages to control an oscillator
#[derive(Clone, Copy, Debug)]
pub(crate) enum OscillatorMessage {
    SetType(OscillatorType),
}

/// A mono oscillator with audio-rate `frequency` (Hz) and `detune` (cents).
pub(crate) struct Oscillator {
    kind: OscillatorType,
    phase: f32,
    schedule: Arc<Schedule>,
    messages: Consumer<OscillatorMessage>,
}

impl Oscillator {
    pub(crate) const PARAMS: [ParamDescriptor; 2] = [
        ParamDescriptor::new("frequency", 440.0, f32::MIN, f32::MAX),
        ParamDescriptor::new("detune", 0.0, -153_600.0, 153_600.0),
    ];

    pub(crate) fn new(schedule: Arc<Schedule>, messages: Consumer<OscillatorMessage>) -> Self {
        Self {
            kind: OscillatorType::Sine,
            phase: 0.0,
            schedule,
            messages,
        }
    }
}

impl AudioProcessor for Oscillator {
    fn process(
        &mut self,
        scope: &RenderScope<'_>,
        _inputs: &[&AudioBus],
        params: &[&[f32]],
        outputs: &mut [AudioBus],
    ) {
        while let Ok(message) = self.messages.pop() {
            match message {
                OscillatorMessage::SetType(kind) => self.kind = kind,
            }
        }

        let Some(window) = self.schedule.update(scope, outputs) else {
            return;
        };
        let (Some(output), [frequency, detune, ..]) = (outputs.first_mut(), params) else {
            return;
        };

        let inv_rate = 1.0 / scope.sample_rate;
        let range = window.offset..window.offset + window.frames;
        let out = output.channel_mut(0);
        for i in range {
            let hz = frequency[i] * (detune[i] / 1200.0).exp2();
            out[i] = self.kind.sample(self.phase);

            self.phase += hz * inv_rate;
            self.phase -= self.phase.floor();
        }
    }

    /// Silent whenever it is not scheduled or playing.
    fn propagates_silence(&self, _last_non_silent_time: f64, _now: f64) -> bool {
        !self.schedule.is_active()
    }

    fn reset(&mut self) {
        self.phase = 0.0;
    }
}

/// Handle to an oscillator. Created by
/// [`AudioContext::create_oscillator`](crate::AudioContext::create_oscillator).
///
/// Silent until [`start`](Self::start) is called.
#[derive(Debug)]
pub struct OscillatorNode {
    source: ScheduledNode,
    frequency: AudioParam,
    detune: AudioParam,
    kind: OscillatorType,
    messages: Producer<OscillatorMessage>,
}

impl OscillatorNode {
    pub(crate) fn new(
        source: ScheduledNode,
        [frequency, detune]: [AudioParam; 2],
        messages: Producer<OscillatorMessage>,
    ) -> Self {
        Self {
            source,
            frequency,
            detune,
            kind: OscillatorType::Sine,
            messages,
        }
    }

    /// Frequency in Hz. Defaults to 440.
    pub fn frequency(&self) -> &AudioParam {
        &self.frequency
    }

    /// Detune in cents. Defaults to 0.
    pub fn detune(&self) -> &AudioParam {
        &self.detune
    }

    pub fn oscillator_type(&self) -> OscillatorType {
        self.kind
    }

    /// Change the waveform, from the next quantum on.
    pub fn set_type(&mut self, kind: OscillatorType) -> Result<()> {
        self.messages
            .push(OscillatorMessage::SetType(kind))
            .map_err(|_| GraphError::QueueFull(self.source.node.id()))?;
        self.kind = kind;
        Ok(())
    }

    /// The scheduling half of this handle.
    pub fn scheduled(&self) -> &ScheduledNode {
        &self.source
    }

    delegate::delegate! {
        to self.source {
            pub fn start(&self, when: f64) -> Result<()>;
            pub fn stop(&self, when: f64) -> Result<()>;
            pub fn playback_state(&self) -> crate::scheduled::PlaybackState;
            pub fn set_on_ended(&self, callback: impl FnMut() + Send + 'static);
        }
    }
}

node_handle!(OscillatorNode => source.node);
