//! In-memory buffer playback

use alloc::sync::Arc;
use alloc::vec::Vec;

use rtrb::{Consumer, Producer};
use tracing::debug;

use crate::bus::{AudioBus, MAX_CHANNELS};
use crate::error::{GraphError, Result};
use crate::node::{AudioProcessor, OutputChannels, RenderScope};
use crate::param::{AudioParam, ParamDescriptor};
use crate::scheduled::{PlaybackState, Schedule, ScheduledNode};

/// Decoded audio held in memory: planar f32 samples at a native sample rate.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBuffer {
    sample_rate: f32,
    length: usize,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Build a buffer from one sample vector per channel. Every channel must
    /// have the same length.
    pub fn new(sample_rate: f32, channels: Vec<Vec<f32>>) -> Result<Self> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(GraphError::InvalidValue("sample rate must be positive"));
        }
        if channels.is_empty() || channels.len() > MAX_CHANNELS {
            return Err(GraphError::InvalidChannelCount {
                count: channels.len(),
                max: MAX_CHANNELS,
            });
        }
        let length = channels[0].len();
        if channels.iter().any(|c| c.len() != length) {
            return Err(GraphError::InvalidValue("channels differ in length"));
        }
        Ok(Self {
            sample_rate,
            length,
            channels,
        })
    }

    /// Build a buffer from interleaved samples.
    pub fn from_interleaved(sample_rate: f32, samples: &[f32], channels: usize) -> Result<Self> {
        if channels == 0 {
            return Err(GraphError::InvalidChannelCount {
                count: 0,
                max: MAX_CHANNELS,
            });
        }
        let planar = (0..channels)
            .map(|c| samples.iter().skip(c).step_by(channels).copied().collect())
            .collect();
        Self::new(sample_rate, planar)
    }

    #[inline]
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    #[inline]
    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }

    /// Length in frames.
    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Length in seconds.
    #[inline]
    pub fn duration(&self) -> f64 {
        self.length as f64 / self.sample_rate as f64
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }
}

/// Messages to control a buffer source
#[derive(Clone, Debug)]
pub(crate) enum BufferSourceMessage {
    SetBuffer(Arc<AudioBuffer>),
    SetLoop(bool),
    SetLoopPoints { start: f64, end: f64 },
    SetGrain { offset: f64, duration: Option<f64> },
}

/// Plays an [`AudioBuffer`], resampling by linear interpolation.
pub(crate) struct BufferSource {
    buffer: Option<Arc<AudioBuffer>>,
    /// Read position in buffer frames; `None` until playback begins.
    position: Option<f64>,
    looping: bool,
    loop_start: f64,
    loop_end: f64,
    grain_offset: f64,
    grain_duration: Option<f64>,
    schedule: Arc<Schedule>,
    messages: Consumer<BufferSourceMessage>,
}

impl BufferSource {
    pub(crate) const PARAMS: [ParamDescriptor; 1] =
        [ParamDescriptor::new("playbackRate", 1.0, f32::MIN, f32::MAX)];

    pub(crate) fn new(schedule: Arc<Schedule>, messages: Consumer<BufferSourceMessage>) -> Self {
        Self {
            buffer: None,
            position: None,
            looping: false,
            loop_start: 0.0,
            loop_end: 0.0,
            grain_offset: 0.0,
            grain_duration: None,
            schedule,
            messages,
        }
    }

    fn apply_messages(&mut self) {
        while let Ok(message) = self.messages.pop() {
            match message {
                BufferSourceMessage::SetBuffer(buffer) => self.buffer = Some(buffer),
                BufferSourceMessage::SetLoop(looping) => self.looping = looping,
                BufferSourceMessage::SetLoopPoints { start, end } => {
                    self.loop_start = start;
                    self.loop_end = end;
                }
                BufferSourceMessage::SetGrain { offset, duration } => {
                    self.grain_offset = offset;
                    self.grain_duration = duration;
                }
            }
        }
    }

    /// Loop region in buffer frames. Invalid loop points loop the whole buffer.
    fn loop_bounds(&self, buffer: &AudioBuffer) -> (f64, f64) {
        let rate = buffer.sample_rate() as f64;
        let length = buffer.length() as f64;
        let start = (self.loop_start * rate).max(0.0);
        let end = self.loop_end * rate;
        if self.loop_end > 0.0 && start < end && end <= length {
            (start, end)
        } else {
            (0.0, length)
        }
    }
}

impl AudioProcessor for BufferSource {
    fn process(
        &mut self,
        scope: &RenderScope<'_>,
        _inputs: &[&AudioBus],
        params: &[&[f32]],
        outputs: &mut [AudioBus],
    ) {
        self.apply_messages();

        let Some(window) = self.schedule.update(scope, outputs) else {
            return;
        };
        let (Some(output), [playback_rate, ..]) = (outputs.first_mut(), params) else {
            return;
        };
        let Some(buffer) = self.buffer.clone() else {
            output.zero();
            return;
        };
        // The output is resized at the next quantum boundary after a buffer
        // with a different channel count is assigned.
        if buffer.length() == 0 || output.number_of_channels() != buffer.number_of_channels() {
            output.zero();
            return;
        }

        let native_rate = buffer.sample_rate() as f64;
        let length = buffer.length() as f64;
        let ratio = native_rate / scope.sample_rate as f64;
        let (loop_start, loop_end) = self.loop_bounds(&buffer);
        // Grain bounds snap to whole buffer frames.
        let grain_end = self
            .grain_duration
            .map_or(length, |d| ((self.grain_offset + d) * native_rate).round().min(length));
        let mut position = *self.position.get_or_insert((self.grain_offset * native_rate).round());

        let upper = if self.looping { loop_end } else { length };
        let last = buffer.length() - 1;
        let end = window.offset + window.frames;
        for i in window.offset..end {
            if self.looping {
                // Playback may begin before the loop start and run into the
                // loop. Anything past the loop end, or behind the loop start
                // while playing backwards, wraps into the loop region.
                let forward = playback_rate[i] >= 0.0;
                if position >= loop_end || position < 0.0 || (!forward && position < loop_start) {
                    position = loop_start + (position - loop_start).rem_euclid(loop_end - loop_start);
                }
            } else if position < 0.0 || position >= grain_end {
                output.zero_range(i, end - i);
                self.schedule.finish();
                break;
            }

            let index = (position as usize).min(last);
            let frac = (position - index as f64) as f32;
            let next = if ((index + 1) as f64) < upper {
                index + 1
            } else if self.looping {
                loop_start as usize
            } else {
                index
            };
            let next = next.min(last);

            for c in 0..buffer.number_of_channels() {
                let samples = buffer.channel(c);
                let a = samples[index];
                let b = samples[next];
                output.channel_mut(c)[i] = a + frac * (b - a);
            }

            position += playback_rate[i] as f64 * ratio;
        }

        self.position = Some(position);
    }

    /// Silent whenever it is not scheduled or playing.
    fn propagates_silence(&self, _last_non_silent_time: f64, _now: f64) -> bool {
        !self.schedule.is_active()
    }

    fn reset(&mut self) {
        self.position = None;
    }
}

/// Handle to a buffer source. Created by
/// [`AudioContext::create_buffer_source`](crate::AudioContext::create_buffer_source).
///
/// Each source plays once: after it finishes it cannot be restarted.
#[derive(Debug)]
pub struct AudioBufferSourceNode {
    source: ScheduledNode,
    playback_rate: AudioParam,
    buffer: Option<Arc<AudioBuffer>>,
    looping: bool,
    loop_start: f64,
    loop_end: f64,
    messages: Producer<BufferSourceMessage>,
}

impl AudioBufferSourceNode {
    pub(crate) fn new(
        source: ScheduledNode,
        [playback_rate]: [AudioParam; 1],
        messages: Producer<BufferSourceMessage>,
    ) -> Self {
        Self {
            source,
            playback_rate,
            buffer: None,
            looping: false,
            loop_start: 0.0,
            loop_end: 0.0,
            messages,
        }
    }

    /// Playback speed; 1 plays at the buffer's native rate.
    pub fn playback_rate(&self) -> &AudioParam {
        &self.playback_rate
    }

    pub fn buffer(&self) -> Option<&Arc<AudioBuffer>> {
        self.buffer.as_ref()
    }

    /// Assign the buffer to play. The output takes the buffer's channel count.
    pub fn set_buffer(&mut self, buffer: Arc<AudioBuffer>) -> Result<()> {
        let channels = buffer.number_of_channels();
        self.send(BufferSourceMessage::SetBuffer(Arc::clone(&buffer)))?;

        let id = self.source.node.id();
        self.source
            .node
            .context
            .lock_graph()
            .graph
            .set_output_rule(id, 0, OutputChannels::Fixed(channels));
        debug!(?id, channels, frames = buffer.length(), "buffer assigned");
        self.buffer = Some(buffer);
        Ok(())
    }

    pub fn loop_enabled(&self) -> bool {
        self.looping
    }

    pub fn set_loop(&mut self, looping: bool) -> Result<()> {
        self.send(BufferSourceMessage::SetLoop(looping))?;
        self.looping = looping;
        Ok(())
    }

    /// Loop region in seconds. Points outside the buffer loop the whole buffer.
    pub fn loop_points(&self) -> (f64, f64) {
        (self.loop_start, self.loop_end)
    }

    pub fn set_loop_points(&mut self, start: f64, end: f64) -> Result<()> {
        check_seconds(start)?;
        check_seconds(end)?;
        self.send(BufferSourceMessage::SetLoopPoints { start, end })?;
        self.loop_start = start;
        self.loop_end = end;
        Ok(())
    }

    /// Start at `when`, playing from `offset` seconds into the buffer for at
    /// most `duration` seconds of buffer time.
    pub fn start_with_offset(&mut self, when: f64, offset: f64, duration: Option<f64>) -> Result<()> {
        check_seconds(offset)?;
        if let Some(duration) = duration {
            if !(duration.is_finite() && duration > 0.0) {
                return Err(GraphError::InvalidValue("grain duration must be finite and positive"));
            }
        }
        if self.source.playback_state() != PlaybackState::Unscheduled {
            return Err(GraphError::InvalidState("source has already been started"));
        }
        self.send(BufferSourceMessage::SetGrain { offset, duration })?;
        self.source.start(when)
    }

    /// The scheduling half of this handle.
    pub fn scheduled(&self) -> &ScheduledNode {
        &self.source
    }

    fn send(&mut self, message: BufferSourceMessage) -> Result<()> {
        self.messages
            .push(message)
            .map_err(|_| GraphError::QueueFull(self.source.node.id()))
    }

    delegate::delegate! {
        to self.source {
            pub fn start(&self, when: f64) -> Result<()>;
            pub fn stop(&self, when: f64) -> Result<()>;
            pub fn playback_state(&self) -> PlaybackState;
            pub fn set_on_ended(&self, callback: impl FnMut() + Send + 'static);
        }
    }
}

node_handle!(AudioBufferSourceNode => source.node);

fn check_seconds(value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(GraphError::InvalidValue("time must be finite and non-negative"))
    }
}
