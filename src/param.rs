//! Automatable node parameters.
//!
//! A parameter has a plain value set from the control thread, an automation
//! [`AudioParamTimeline`], and a modulation input that audio-rate signals can
//! be connected to. Without automation or modulation the rendered value follows
//! the plain value through a one-pole smoother, once per quantum.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::context::ContextShared;
use crate::error::{GraphError, Result};
use crate::node::{NodeId, RenderScope};
use crate::timeline::{AudioParamTimeline, ParamEvent};

/// Fraction of the remaining distance the smoothed value covers per quantum.
pub const SMOOTHING_CONSTANT: f32 = 0.05;
/// The smoothed value jumps to the target once closer than this.
pub const SNAP_THRESHOLD: f32 = 0.001;

/// Static description of a parameter, supplied by the node that owns it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamDescriptor {
    pub name: &'static str,
    pub default: f32,
    pub min: f32,
    pub max: f32,
}

impl ParamDescriptor {
    pub const fn new(name: &'static str, default: f32, min: f32, max: f32) -> Self {
        Self { name, default, min, max }
    }
}

pub(crate) struct ParamShared {
    pub(crate) descriptor: ParamDescriptor,
    value: AtomicU32,
    smoothed: AtomicU32,
    timeline: Mutex<AudioParamTimeline>,
    has_events: AtomicBool,
}

impl ParamShared {
    pub(crate) fn new(descriptor: ParamDescriptor) -> Self {
        Self {
            descriptor,
            value: AtomicU32::new(descriptor.default.to_bits()),
            smoothed: AtomicU32::new(descriptor.default.to_bits()),
            timeline: Mutex::new(AudioParamTimeline::new()),
            has_events: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn value(&self) -> f32 {
        f32::from_bits(self.value.load(Ordering::Relaxed))
    }

    #[inline]
    fn store_value(&self, value: f32) {
        self.value.store(value.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn smoothed_value(&self) -> f32 {
        f32::from_bits(self.smoothed.load(Ordering::Relaxed))
    }

    /// Move the smoothed value one step towards the plain value.
    pub(crate) fn smooth(&self) -> f32 {
        let target = self.value();
        let mut smoothed = self.smoothed_value();
        if smoothed != target {
            smoothed += (target - smoothed) * SMOOTHING_CONSTANT;
            if (target - smoothed).abs() < SNAP_THRESHOLD {
                smoothed = target;
            }
            self.smoothed.store(smoothed.to_bits(), Ordering::Relaxed);
        }
        smoothed
    }

    pub(crate) fn has_automation(&self) -> bool {
        self.has_events.load(Ordering::Acquire)
    }

    /// Fill `values` with this quantum's intrinsic values, excluding
    /// modulation. Audio thread only.
    ///
    /// `sample_accurate` is set when the parameter has modulation connected.
    /// The timeline is only try-locked; if the control thread holds it the
    /// whole block uses the plain value.
    pub(crate) fn render(&self, scope: &RenderScope<'_>, values: &mut [f32], sample_accurate: bool) {
        if !(sample_accurate || self.has_automation()) {
            values.fill(self.smooth());
            return;
        }

        let Some(timeline) = self.timeline.try_lock() else {
            values.fill(self.value());
            return;
        };

        let sample_rate = scope.sample_rate as f64;
        let start = scope.current_time();
        let end = start + values.len() as f64 / sample_rate;
        let last = timeline.values_for_range(start, end, self.value(), values, sample_rate);
        drop(timeline);

        self.store_value(last);
        self.smoothed.store(last.to_bits(), Ordering::Relaxed);
    }

    fn edit_timeline(&self, edit: impl FnOnce(&mut AudioParamTimeline)) {
        let mut timeline = self.timeline.lock();
        edit(&mut timeline);
        self.has_events.store(!timeline.is_empty(), Ordering::Release);
    }
}

impl core::fmt::Debug for ParamShared {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ParamShared")
            .field("descriptor", &self.descriptor)
            .field("value", &self.value())
            .finish()
    }
}

/// Control-thread handle to one parameter of a node.
///
/// Parameter handles do not keep their node alive. Edits made after the node
/// has been released are accepted and have no audible effect.
#[derive(Clone)]
pub struct AudioParam {
    pub(crate) context: Arc<ContextShared>,
    pub(crate) owner: NodeId,
    pub(crate) index: usize,
    pub(crate) shared: Arc<ParamShared>,
}

impl AudioParam {
    pub(crate) fn new(context: Arc<ContextShared>, owner: NodeId, index: usize, shared: Arc<ParamShared>) -> Self {
        Self { context, owner, index, shared }
    }

    pub fn name(&self) -> &'static str {
        self.shared.descriptor.name
    }

    /// Id of the node this parameter belongs to.
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn default_value(&self) -> f32 {
        self.shared.descriptor.default
    }

    pub fn min_value(&self) -> f32 {
        self.shared.descriptor.min
    }

    pub fn max_value(&self) -> f32 {
        self.shared.descriptor.max
    }

    /// The plain value, or the last value automation rendered.
    pub fn value(&self) -> f32 {
        self.shared.value()
    }

    /// Set the plain value. Non-finite values are ignored.
    pub fn set_value(&self, value: f32) {
        if value.is_finite() {
            self.shared.store_value(value);
        }
    }

    /// Jump to `value` at `time`.
    pub fn set_value_at_time(&self, value: f32, time: f64) -> Result<&Self> {
        check_value(value)?;
        check_time(time)?;
        self.insert(ParamEvent::set_value(value, time))
    }

    /// Ramp linearly from the previous event to `value`, arriving at `end_time`.
    pub fn linear_ramp_to_value_at_time(&self, value: f32, end_time: f64) -> Result<&Self> {
        check_value(value)?;
        check_time(end_time)?;
        self.insert(ParamEvent::linear_ramp(value, end_time))
    }

    /// Ramp geometrically from the previous event to `value`, arriving at
    /// `end_time`. `value` must not be zero.
    pub fn exponential_ramp_to_value_at_time(&self, value: f32, end_time: f64) -> Result<&Self> {
        check_value(value)?;
        check_time(end_time)?;
        if value == 0.0 {
            return Err(GraphError::InvalidValue("exponential ramp target must be non-zero"));
        }
        self.insert(ParamEvent::exponential_ramp(value, end_time))
    }

    /// Approach `target` exponentially from `start_time` with `time_constant`
    /// seconds.
    pub fn set_target_at_time(&self, target: f32, start_time: f64, time_constant: f64) -> Result<&Self> {
        check_value(target)?;
        check_time(start_time)?;
        if !(time_constant.is_finite() && time_constant >= 0.0) {
            return Err(GraphError::InvalidValue("time constant must be finite and non-negative"));
        }
        self.insert(ParamEvent::set_target(target, start_time, time_constant))
    }

    /// Play `curve` stretched over `duration` seconds from `start_time`.
    pub fn set_value_curve_at_time(&self, curve: &[f32], start_time: f64, duration: f64) -> Result<&Self> {
        if curve.len() < 2 {
            return Err(GraphError::InvalidValue("value curve needs at least two points"));
        }
        if !curve.iter().all(|v| v.is_finite()) {
            return Err(GraphError::InvalidValue("value curve contains non-finite values"));
        }
        check_time(start_time)?;
        if !(duration.is_finite() && duration > 0.0) {
            return Err(GraphError::InvalidValue("curve duration must be finite and positive"));
        }
        self.insert(ParamEvent::value_curve(Arc::from(curve), start_time, duration))
    }

    /// Remove every event at or after `start_time`.
    pub fn cancel_scheduled_values(&self, start_time: f64) -> Result<&Self> {
        check_time(start_time)?;
        trace!(node = ?self.owner, param = self.name(), start_time, "cancel scheduled values");
        self.shared.edit_timeline(|timeline| timeline.cancel_from(start_time));
        Ok(self)
    }

    /// Number of events currently on the timeline.
    pub fn scheduled_event_count(&self) -> usize {
        self.shared.timeline.lock().len()
    }

    fn insert(&self, event: ParamEvent) -> Result<&Self> {
        trace!(node = ?self.owner, param = self.name(), kind = ?event.kind(), time = event.time(), "automation event");
        self.shared.edit_timeline(|timeline| timeline.insert(event));
        Ok(self)
    }
}

impl core::fmt::Debug for AudioParam {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AudioParam")
            .field("owner", &self.owner)
            .field("name", &self.name())
            .field("value", &self.value())
            .finish()
    }
}

fn check_value(value: f32) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(GraphError::InvalidValue("automation value must be finite"))
    }
}

fn check_time(time: f64) -> Result<()> {
    if time.is_finite() && time >= 0.0 {
        Ok(())
    } else {
        Err(GraphError::InvalidValue("time must be finite and non-negative"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::RENDER_QUANTUM_FRAMES;

    const RATE: f32 = 6400.0;

    fn scope(frame: u64) -> RenderScope<'static> {
        RenderScope {
            frame,
            sample_rate: RATE,
            live_input: None,
        }
    }

    fn shared() -> ParamShared {
        ParamShared::new(ParamDescriptor::new("test", 1.0, 0.0, 10.0))
    }

    #[test]
    fn smoothing_approaches_then_snaps() {
        let param = shared();
        param.store_value(0.0);

        let first = param.smooth();
        assert!((first - 0.95).abs() < 1e-6);

        let mut last = first;
        for _ in 0..200 {
            last = param.smooth();
        }
        assert_eq!(last, 0.0);
    }

    #[test]
    fn unautomated_render_fills_smoothed_value() {
        let param = shared();
        let mut values = [0.0; RENDER_QUANTUM_FRAMES];
        param.render(&scope(0), &mut values, false);
        assert!(values.iter().all(|v| *v == 1.0));
    }

    #[test]
    fn timeline_render_is_sample_accurate() {
        let param = shared();
        param.edit_timeline(|t| {
            t.insert(ParamEvent::set_value(0.0, 0.0));
            t.insert(ParamEvent::linear_ramp(1.0, RENDER_QUANTUM_FRAMES as f64 / RATE as f64));
        });
        let mut values = [0.0; RENDER_QUANTUM_FRAMES];
        param.render(&scope(0), &mut values, false);

        assert_eq!(values[0], 0.0);
        assert!((values[32] - 0.5).abs() < 1e-5);
        assert!(values.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn contended_timeline_falls_back_to_plain_value() {
        let param = shared();
        param.edit_timeline(|t| t.insert(ParamEvent::set_value(5.0, 0.0)));

        let held = param.timeline.lock();
        let mut values = [0.0; RENDER_QUANTUM_FRAMES];
        param.render(&scope(0), &mut values, false);
        drop(held);

        assert!(values.iter().all(|v| *v == 1.0));
    }

    #[test]
    fn render_records_last_automated_value() {
        let param = shared();
        param.edit_timeline(|t| t.insert(ParamEvent::set_value(3.0, 0.0)));
        let mut values = [0.0; RENDER_QUANTUM_FRAMES];
        param.render(&scope(0), &mut values, false);
        assert_eq!(param.value(), 3.0);
    }
}
