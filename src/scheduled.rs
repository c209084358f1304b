//! Start/stop scheduling for time-bounded sources.
//!
//! A source moves through `Unscheduled -> Scheduled -> Playing -> Finished`
//! and never goes back. The control thread only ever performs the first step
//! and sets times; the audio thread performs the rest while rendering.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use tracing::debug;

use crate::bus::{AudioBus, RENDER_QUANTUM_FRAMES};
use crate::error::{GraphError, Result};
use crate::node::{AudioNode, RenderScope};

/// Playback state of a scheduled source.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum PlaybackState {
    Unscheduled = 0,
    Scheduled = 1,
    Playing = 2,
    Finished = 3,
}

impl PlaybackState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PlaybackState::Unscheduled,
            1 => PlaybackState::Scheduled,
            2 => PlaybackState::Playing,
            _ => PlaybackState::Finished,
        }
    }
}

/// The part of a quantum a source should render into.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ScheduleWindow {
    /// First frame of the quantum to render.
    pub offset: usize,
    /// Number of frames to render from `offset`.
    pub frames: usize,
}

/// Shared scheduling state, read and written from both threads.
#[derive(Debug)]
pub struct Schedule {
    state: AtomicU8,
    start_time: AtomicU64,
    end_time: AtomicU64,
    finish_reported: AtomicBool,
    active_sources: Arc<AtomicUsize>,
}

impl Schedule {
    pub(crate) fn new(active_sources: Arc<AtomicUsize>) -> Self {
        Self {
            state: AtomicU8::new(PlaybackState::Unscheduled as u8),
            start_time: AtomicU64::new(0f64.to_bits()),
            end_time: AtomicU64::new(f64::INFINITY.to_bits()),
            finish_reported: AtomicBool::new(false),
            active_sources,
        }
    }

    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn start_time(&self) -> f64 {
        f64::from_bits(self.start_time.load(Ordering::Acquire))
    }

    /// `f64::INFINITY` until `stop` is called.
    pub fn end_time(&self) -> f64 {
        f64::from_bits(self.end_time.load(Ordering::Acquire))
    }

    /// Whether the source may still produce sound.
    pub fn is_active(&self) -> bool {
        matches!(self.state(), PlaybackState::Scheduled | PlaybackState::Playing)
    }

    pub(crate) fn start(&self, when: f64) -> Result<()> {
        check_time(when)?;
        if self.state() != PlaybackState::Unscheduled {
            return Err(GraphError::InvalidState("source has already been started"));
        }
        self.start_time.store(when.to_bits(), Ordering::Release);
        self.state
            .compare_exchange(
                PlaybackState::Unscheduled as u8,
                PlaybackState::Scheduled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| GraphError::InvalidState("source has already been started"))
    }

    pub(crate) fn stop(&self, when: f64) -> Result<()> {
        check_time(when)?;
        if !self.is_active() {
            return Err(GraphError::InvalidState("source is not scheduled or playing"));
        }
        self.end_time.store(when.to_bits(), Ordering::Release);
        Ok(())
    }

    /// Work out which frames of this quantum the source renders, zeroing the
    /// rest of `outputs`. Returns `None` if nothing should be rendered.
    ///
    /// Crossing the start time moves the source to `Playing`; reaching the end
    /// time moves it to `Finished`.
    pub fn update(&self, scope: &RenderScope<'_>, outputs: &mut [AudioBus]) -> Option<ScheduleWindow> {
        let quantum_start = scope.frame;
        let quantum_end = quantum_start + RENDER_QUANTUM_FRAMES as u64;
        let sample_rate = scope.sample_rate as f64;
        let start_frame = time_to_frame(self.start_time(), sample_rate);
        let end_time = self.end_time();
        let end_frame = end_time.is_finite().then(|| time_to_frame(end_time, sample_rate));

        let state = self.state();
        if matches!(state, PlaybackState::Unscheduled | PlaybackState::Finished) || start_frame >= quantum_end {
            silence(outputs);
            return None;
        }

        if state == PlaybackState::Scheduled
            && self
                .state
                .compare_exchange(
                    PlaybackState::Scheduled as u8,
                    PlaybackState::Playing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            self.active_sources.fetch_add(1, Ordering::AcqRel);
        }

        let offset = start_frame.saturating_sub(quantum_start).min(RENDER_QUANTUM_FRAMES as u64) as usize;
        let mut frames = RENDER_QUANTUM_FRAMES - offset;

        if let Some(end_frame) = end_frame {
            if end_frame <= quantum_start.max(start_frame) {
                silence(outputs);
                self.finish();
                return None;
            }
            if end_frame < quantum_end {
                let zero_from = (end_frame - quantum_start) as usize;
                frames = zero_from - offset;
                for bus in outputs.iter_mut() {
                    bus.zero_range(zero_from, RENDER_QUANTUM_FRAMES - zero_from);
                }
                self.finish();
            }
        }

        if offset > 0 {
            for bus in outputs.iter_mut() {
                bus.zero_range(0, offset);
            }
        }

        Some(ScheduleWindow { offset, frames })
    }

    /// Move to `Finished`. Only the transition out of `Playing` releases an
    /// active-source slot.
    pub fn finish(&self) {
        let previous = self.state.swap(PlaybackState::Finished as u8, Ordering::AcqRel);
        if previous == PlaybackState::Playing as u8 {
            self.active_sources.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Returns `true` exactly once, for the first caller after finishing.
    pub(crate) fn take_finished(&self) -> bool {
        self.state() == PlaybackState::Finished && !self.finish_reported.swap(true, Ordering::AcqRel)
    }
}

fn silence(outputs: &mut [AudioBus]) {
    for bus in outputs {
        bus.zero();
    }
}

fn time_to_frame(time: f64, sample_rate: f64) -> u64 {
    (time * sample_rate).round().max(0.0) as u64
}

fn check_time(when: f64) -> Result<()> {
    if when.is_finite() && when >= 0.0 {
        Ok(())
    } else {
        Err(GraphError::InvalidValue("time must be finite and non-negative"))
    }
}

/// A node handle with start/stop controls.
///
/// Starting a source makes the context hold a connection reference to it
/// until it finishes, so a playing source keeps sounding after every handle
/// has been dropped.
#[derive(Clone, Debug)]
pub struct ScheduledNode {
    pub(crate) node: AudioNode,
    pub(crate) schedule: Arc<Schedule>,
}

impl ScheduledNode {
    pub(crate) fn new(node: AudioNode, schedule: Arc<Schedule>) -> Self {
        Self { node, schedule }
    }

    /// Start playback at context time `when` (seconds). Times in the past
    /// start at the next quantum.
    pub fn start(&self, when: f64) -> Result<()> {
        let id = self.node.id();
        let mut guard = self.node.context.lock_graph();
        if !guard.graph.contains(id) {
            return Err(GraphError::NodeReleased(id));
        }
        self.schedule.start(when)?;
        guard.graph.add_reference(id);
        debug!(?id, when, "source started");
        Ok(())
    }

    /// Stop playback at context time `when`. May be called again to move the
    /// end time while the source is still scheduled or playing.
    pub fn stop(&self, when: f64) -> Result<()> {
        let id = self.node.id();
        let guard = self.node.context.lock_graph();
        if !guard.graph.contains(id) {
            return Err(GraphError::NodeReleased(id));
        }
        self.schedule.stop(when)?;
        drop(guard);
        debug!(?id, when, "source stop scheduled");
        Ok(())
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.schedule.state()
    }

    /// Register a callback run by [`AudioContext::dispatch_events`] once the
    /// source has finished. Replaces any earlier callback.
    ///
    /// [`AudioContext::dispatch_events`]: crate::AudioContext::dispatch_events
    pub fn set_on_ended(&self, callback: impl FnMut() + Send + 'static) {
        let id = self.node.id();
        self.node
            .context
            .lock_graph()
            .graph
            .set_ended_handler(id, Box::new(callback));
    }
}

impl AsRef<AudioNode> for ScheduledNode {
    fn as_ref(&self) -> &AudioNode {
        &self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f32 = 6400.0;

    fn scope(frame: u64) -> RenderScope<'static> {
        RenderScope {
            frame,
            sample_rate: RATE,
            live_input: None,
        }
    }

    fn filled_output() -> [AudioBus; 1] {
        [AudioBus::from_channels(&[&[1.0; RENDER_QUANTUM_FRAMES]])]
    }

    #[test]
    fn state_sequence_and_active_count() {
        let active = Arc::new(AtomicUsize::new(0));
        let schedule = Schedule::new(Arc::clone(&active));
        assert_eq!(schedule.state(), PlaybackState::Unscheduled);

        schedule.start(0.0).unwrap();
        assert_eq!(schedule.state(), PlaybackState::Scheduled);
        assert!(schedule.start(0.0).is_err());

        let mut out = filled_output();
        let window = schedule.update(&scope(0), &mut out).unwrap();
        assert_eq!(window, ScheduleWindow { offset: 0, frames: 64 });
        assert_eq!(schedule.state(), PlaybackState::Playing);
        assert_eq!(active.load(Ordering::Acquire), 1);

        // 100 frames in: inside the second quantum.
        schedule.stop(100.0 / RATE as f64).unwrap();
        let mut out = filled_output();
        let window = schedule.update(&scope(64), &mut out).unwrap();
        assert_eq!(window, ScheduleWindow { offset: 0, frames: 36 });
        assert_eq!(out[0].channel(0)[35], 1.0);
        assert_eq!(out[0].channel(0)[36], 0.0);
        assert_eq!(schedule.state(), PlaybackState::Finished);
        assert_eq!(active.load(Ordering::Acquire), 0);

        schedule.finish();
        assert_eq!(active.load(Ordering::Acquire), 0);
        assert!(schedule.stop(1.0).is_err());
        assert!(schedule.take_finished());
        assert!(!schedule.take_finished());
    }

    #[test]
    fn late_start_zeroes_leading_frames() {
        let schedule = Schedule::new(Arc::new(AtomicUsize::new(0)));
        schedule.start(80.0 / RATE as f64).unwrap();

        let mut out = filled_output();
        assert!(schedule.update(&scope(0), &mut out).is_none());
        assert!(out[0].is_silent());
        assert_eq!(schedule.state(), PlaybackState::Scheduled);

        let mut out = filled_output();
        let window = schedule.update(&scope(64), &mut out).unwrap();
        assert_eq!(window, ScheduleWindow { offset: 16, frames: 48 });
        assert_eq!(out[0].channel(0)[15], 0.0);
        assert_eq!(out[0].channel(0)[16], 1.0);
    }

    #[test]
    fn stop_at_start_time_finishes_immediately() {
        let active = Arc::new(AtomicUsize::new(0));
        let schedule = Schedule::new(Arc::clone(&active));
        schedule.start(0.0).unwrap();
        schedule.stop(0.0).unwrap();

        let mut out = filled_output();
        assert!(schedule.update(&scope(0), &mut out).is_none());
        assert_eq!(schedule.state(), PlaybackState::Finished);
        assert_eq!(active.load(Ordering::Acquire), 0);
    }

    #[test]
    fn rejects_bad_times() {
        let schedule = Schedule::new(Arc::new(AtomicUsize::new(0)));
        assert!(matches!(schedule.start(-1.0), Err(GraphError::InvalidValue(_))));
        assert!(matches!(schedule.start(f64::NAN), Err(GraphError::InvalidValue(_))));
        assert!(matches!(schedule.stop(0.0), Err(GraphError::InvalidState(_))));
    }
}
