//! Automation timelines for [`AudioParam`](crate::AudioParam)s.
//!
//! A timeline is a time-ordered list of events. Rendering a block asks the
//! timeline for one value per frame over `[start, end)`; the shape between two
//! events is decided by the kind of the *later* event:
//!
//! | later event        | shape between the two events                     |
//! |--------------------|--------------------------------------------------|
//! | `SetValue`         | hold the earlier value                           |
//! | `LinearRamp`       | straight line between the two values             |
//! | `ExponentialRamp`  | geometric interpolation (hold if a value is ≤ 0) |
//!
//! `SetTarget` and `ValueCurve` events shape the time *after* themselves: an
//! exponential approach towards the target, or the curve stretched over the
//! event's duration and sampled by nearest neighbour. Before the first event the
//! caller's default value is held; after the last event the last computed value
//! is held.

use alloc::sync::Arc;

/// The shape an automation event describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    SetValue,
    LinearRamp,
    ExponentialRamp,
    SetTarget,
    ValueCurve,
}

/// One scheduled automation event.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamEvent {
    kind: EventKind,
    time: f64,
    value: f32,
    time_constant: f64,
    duration: f64,
    curve: Option<Arc<[f32]>>,
}

impl ParamEvent {
    pub fn set_value(value: f32, time: f64) -> Self {
        Self::new(EventKind::SetValue, value, time)
    }

    pub fn linear_ramp(value: f32, time: f64) -> Self {
        Self::new(EventKind::LinearRamp, value, time)
    }

    pub fn exponential_ramp(value: f32, time: f64) -> Self {
        Self::new(EventKind::ExponentialRamp, value, time)
    }

    pub fn set_target(target: f32, time: f64, time_constant: f64) -> Self {
        Self {
            time_constant,
            ..Self::new(EventKind::SetTarget, target, time)
        }
    }

    pub fn value_curve(curve: Arc<[f32]>, time: f64, duration: f64) -> Self {
        Self {
            duration,
            curve: Some(curve),
            ..Self::new(EventKind::ValueCurve, 0.0, time)
        }
    }

    fn new(kind: EventKind, value: f32, time: f64) -> Self {
        Self {
            kind,
            time,
            value,
            time_constant: 0.0,
            duration: 0.0,
            curve: None,
        }
    }

    #[inline]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    #[inline]
    pub fn time(&self) -> f64 {
        self.time
    }

    #[inline]
    pub fn value(&self) -> f32 {
        self.value
    }
}

/// A time-ordered list of [`ParamEvent`]s.
#[derive(Clone, Debug, Default)]
pub struct AudioParamTimeline {
    events: Vec<ParamEvent>,
}

impl AudioParamTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn events(&self) -> &[ParamEvent] {
        &self.events
    }

    /// Insert keeping time order. An event with the same time and kind as an
    /// existing one replaces it.
    pub fn insert(&mut self, event: ParamEvent) {
        if let Some(existing) = self
            .events
            .iter_mut()
            .find(|e| e.kind == event.kind && e.time == event.time)
        {
            *existing = event;
            return;
        }
        let at = self
            .events
            .iter()
            .position(|e| e.time > event.time)
            .unwrap_or(self.events.len());
        self.events.insert(at, event);
    }

    /// Remove every event at or after `start_time`.
    pub fn cancel_from(&mut self, start_time: f64) {
        self.events.retain(|e| e.time < start_time);
    }

    /// The value one frame at `time` would take, or `None` when no event has
    /// started yet.
    pub fn value_at(&self, time: f64, default: f32, sample_rate: f64) -> Option<f32> {
        match self.events.first() {
            Some(first) if time >= first.time => {
                let mut value = [default];
                let end = time + 1.1 / sample_rate;
                self.values_for_range(time, end, default, &mut value, sample_rate);
                Some(value[0])
            }
            _ => None,
        }
    }

    /// Fill `values` with one value per frame starting at `start`, and return
    /// the running value at the end of the block.
    pub fn values_for_range(
        &self,
        start: f64,
        end: f64,
        default: f32,
        values: &mut [f32],
        sample_rate: f64,
    ) -> f32 {
        let n = values.len();
        if n == 0 {
            return default;
        }

        let first_time = match self.events.first() {
            Some(first) if end > first.time => first.time,
            _ => {
                values.fill(default);
                return default;
            }
        };

        let incr = 1.0 / sample_rate;
        let mut current = start;
        let mut write = 0;

        if first_time > start {
            let fill_to = time_to_frame(end.min(first_time) - start, sample_rate).min(n);
            fill(values, &mut write, fill_to, default);
            current += fill_to as f64 / sample_rate;
        }

        let mut value = default;

        for (i, event) in self.events.iter().enumerate() {
            if write >= n {
                break;
            }
            let next = self.events.get(i + 1);
            if matches!(next, Some(next) if next.time < current) {
                continue;
            }

            let (value1, time1) = (event.value, event.time);
            let value2 = next.map_or(value1, |e| e.value);
            let time2 = next.map_or(end + 1.0, |e| e.time);
            let delta = time2 - time1;
            let k = if delta > 0.0 { 1.0 / delta } else { 0.0 };

            let fill_to_time = end.min(time2);
            let fill_to = time_to_frame(fill_to_time - start, sample_rate).min(n);

            match next.map(|e| e.kind) {
                Some(EventKind::LinearRamp) => {
                    while write < fill_to {
                        let x = ((current - time1) * k) as f32;
                        value = (1.0 - x) * value1 + x * value2;
                        values[write] = value;
                        write += 1;
                        current += incr;
                    }
                }
                Some(EventKind::ExponentialRamp) if value1 <= 0.0 || value2 <= 0.0 => {
                    fill(values, &mut write, fill_to, value);
                    current = fill_to_time;
                }
                Some(EventKind::ExponentialRamp) => {
                    let frames = delta * sample_rate;
                    let ratio = value2 / value1;
                    let multiplier = ratio.powf((1.0 / frames) as f32);
                    let offset = time_to_frame(current - time1, sample_rate) as f64;
                    value = value1 * ratio.powf((offset / frames) as f32);
                    while write < fill_to {
                        values[write] = value;
                        value *= multiplier;
                        write += 1;
                        current += incr;
                    }
                }
                _ => match event.kind {
                    EventKind::SetValue | EventKind::LinearRamp | EventKind::ExponentialRamp => {
                        value = event.value;
                        fill(values, &mut write, fill_to, value);
                        current = fill_to_time;
                    }
                    EventKind::SetTarget => {
                        let target = event.value;
                        let discrete = discrete_time_constant(event.time_constant, sample_rate);
                        while write < fill_to {
                            values[write] = value;
                            value += (target - value) * discrete;
                            write += 1;
                        }
                        current = fill_to_time;
                    }
                    EventKind::ValueCurve => {
                        let curve = event.curve.as_deref().unwrap_or(&[]);
                        let duration = event.duration;
                        if curve.is_empty() || duration <= 0.0 || sample_rate <= 0.0 {
                            fill(values, &mut write, fill_to, value);
                            current = fill_to_time;
                            continue;
                        }

                        let points_per_frame = curve.len() as f64 / duration / sample_rate;
                        let curve_end = end.min(time1 + duration);
                        let curve_fill_to = time_to_frame(curve_end - start, sample_rate)
                            .min(n)
                            .min(fill_to);

                        let mut virtual_index = if time1 < current {
                            (current - time1) * sample_rate * points_per_frame
                        } else {
                            0.0
                        };

                        while write < curve_fill_to {
                            let index = virtual_index as usize;
                            virtual_index += points_per_frame;
                            if let Some(v) = curve.get(index) {
                                value = *v;
                            }
                            values[write] = value;
                            write += 1;
                        }

                        // the curve ended before the next event: hold its last value
                        fill(values, &mut write, fill_to, value);
                        current = fill_to_time;
                    }
                },
            }
        }

        fill(values, &mut write, n, value);
        value
    }
}

#[inline]
fn fill(values: &mut [f32], write: &mut usize, to: usize, value: f32) {
    if *write < to {
        values[*write..to].fill(value);
        *write = to;
    }
}

#[inline]
fn time_to_frame(time: f64, sample_rate: f64) -> usize {
    (time * sample_rate).round().max(0.0) as usize
}

/// Per-step coefficient for an exponential approach with `time_constant`
/// seconds, stepping at `rate` Hz.
#[inline]
pub(crate) fn discrete_time_constant(time_constant: f64, rate: f64) -> f32 {
    (1.0 - (-1.0 / (rate * time_constant)).exp()) as f32
}
