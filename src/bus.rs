//! Multichannel sample buses for one render quantum.
//!
//! An [`AudioBus`] is a list of [`dasp_graph::Buffer`]s, one per channel, so the
//! render quantum is fixed at [`RENDER_QUANTUM_FRAMES`]. Buses carry a `silent`
//! hint that lets the renderer skip work for nodes whose inputs are quiet.
//!
//! Mixing between buses of different widths follows a [`ChannelInterpretation`]:
//! `Speakers` applies the usual mono/stereo/quad/5.1 up- and down-mix matrices,
//! `Discrete` maps channels one to one and drops or zero-fills the rest.

use dasp_graph::Buffer;
use itertools::izip;

/// Number of frames in one render quantum.
pub const RENDER_QUANTUM_FRAMES: usize = Buffer::LEN;

/// Largest channel count a bus may be configured with.
pub const MAX_CHANNELS: usize = 32;

const SQRT_HALF: f32 = core::f32::consts::FRAC_1_SQRT_2;

/// How channels are matched up when buses of different widths are mixed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChannelInterpretation {
    /// Treat channels as speaker positions and apply mixing matrices.
    #[default]
    Speakers,
    /// Map channels by index, dropping or zero-filling the excess.
    Discrete,
}

/// A block of samples with a fixed channel count.
#[derive(Clone, Debug)]
pub struct AudioBus {
    channels: Vec<Buffer>,
    silent: bool,
}

impl AudioBus {
    /// A silent bus with `channels` channels.
    pub fn new(channels: usize) -> Self {
        Self {
            channels: vec![Buffer::default(); channels],
            silent: true,
        }
    }

    /// Build a bus from per-channel sample slices, zero padding short slices.
    pub fn from_channels(data: &[&[f32]]) -> Self {
        let mut bus = Self::new(data.len());
        for (dst, src) in bus.channels.iter_mut().zip(data) {
            let n = src.len().min(RENDER_QUANTUM_FRAMES);
            dst[..n].copy_from_slice(&src[..n]);
        }
        bus.silent = false;
        bus
    }

    #[inline]
    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        RENDER_QUANTUM_FRAMES
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Whether the bus is known to hold only zeros.
    #[inline]
    pub fn is_silent(&self) -> bool {
        self.silent
    }

    #[inline]
    pub(crate) fn clear_silent_flag(&mut self) {
        self.silent = false;
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    /// Mutable access to one channel. Clears the silent flag.
    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        self.silent = false;
        &mut self.channels[index]
    }

    pub fn channels(&self) -> impl Iterator<Item = &[f32]> {
        self.channels.iter().map(|b| &b[..])
    }

    /// Mutable access to every channel. Clears the silent flag.
    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        self.silent = false;
        self.channels.iter_mut().map(|b| &mut b[..])
    }

    /// Change the channel count. New channels start silent.
    pub(crate) fn set_number_of_channels(&mut self, channels: usize) {
        if channels != self.channels.len() {
            self.channels.resize(channels, Buffer::default());
        }
    }

    /// Zero every channel and mark the bus silent.
    pub fn zero(&mut self) {
        if self.silent {
            return;
        }
        for ch in &mut self.channels {
            ch.fill(0.0);
        }
        self.silent = true;
    }

    /// Zero `len` frames starting at `start` in every channel.
    pub fn zero_range(&mut self, start: usize, len: usize) {
        let end = (start + len).min(RENDER_QUANTUM_FRAMES);
        if start >= end {
            return;
        }
        for ch in &mut self.channels {
            ch[start..end].fill(0.0);
        }
    }

    /// Multiply every sample by `gain`.
    pub fn scale(&mut self, gain: f32) {
        if self.silent {
            return;
        }
        for ch in &mut self.channels {
            ch.iter_mut().for_each(|s| *s *= gain);
        }
    }

    /// Overwrite this bus with `source`, mixed per `interpretation`.
    pub fn copy_from(&mut self, source: &AudioBus, interpretation: ChannelInterpretation) {
        if source.silent {
            self.zero();
            return;
        }
        if source.number_of_channels() == self.number_of_channels() {
            for (dst, src) in self.channels.iter_mut().zip(&source.channels) {
                dst.copy_from_slice(src);
            }
            self.silent = false;
            return;
        }
        self.silent = false;
        for ch in &mut self.channels {
            ch.fill(0.0);
        }
        self.mix_from(source, interpretation);
    }

    /// Overwrite this bus with `source` scaled by `gain`.
    pub fn copy_with_gain_from(&mut self, source: &AudioBus, gain: f32) {
        if source.silent || gain == 0.0 {
            self.zero();
            return;
        }
        self.silent = false;
        let n = self.channels.len().min(source.channels.len());
        for (dst, src) in self.channels[..n].iter_mut().zip(&source.channels[..n]) {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d = *s * gain;
            }
        }
        for ch in &mut self.channels[n..] {
            ch.fill(0.0);
        }
    }

    /// Overwrite this bus with `source` multiplied sample by sample with
    /// `gains`, which holds one value per frame.
    pub fn copy_with_sample_gains_from(&mut self, source: &AudioBus, gains: &[f32]) {
        if source.silent {
            self.zero();
            return;
        }
        self.silent = false;
        let n = self.channels.len().min(source.channels.len());
        for (dst, src) in self.channels[..n].iter_mut().zip(&source.channels[..n]) {
            for (d, s, g) in izip!(dst.iter_mut(), src.iter(), gains.iter()) {
                *d = *s * *g;
            }
        }
        for ch in &mut self.channels[n..] {
            ch.fill(0.0);
        }
    }

    /// Add `source` into this bus with unity gain, mixed per `interpretation`.
    pub fn sum_from(&mut self, source: &AudioBus, interpretation: ChannelInterpretation) {
        if source.silent {
            return;
        }
        if self.silent {
            for ch in &mut self.channels {
                ch.fill(0.0);
            }
            self.silent = false;
        }
        self.mix_from(source, interpretation);
    }

    /// Accumulate `source` into `self` without touching the silent flag.
    fn mix_from(&mut self, source: &AudioBus, interpretation: ChannelInterpretation) {
        let src_n = source.number_of_channels();
        let dst_n = self.number_of_channels();

        if src_n == dst_n || interpretation == ChannelInterpretation::Discrete {
            self.sum_discrete(source);
            return;
        }

        let src = &source.channels;
        match (src_n, dst_n) {
            // up-mix
            (1, 2) | (1, 4) => {
                add(&mut self.channels[0], &src[0], 1.0);
                add(&mut self.channels[1], &src[0], 1.0);
            }
            (1, 6) => add(&mut self.channels[2], &src[0], 1.0),
            (2, 4) | (2, 6) => {
                add(&mut self.channels[0], &src[0], 1.0);
                add(&mut self.channels[1], &src[1], 1.0);
            }
            (4, 6) => {
                add(&mut self.channels[0], &src[0], 1.0);
                add(&mut self.channels[1], &src[1], 1.0);
                add(&mut self.channels[4], &src[2], 1.0);
                add(&mut self.channels[5], &src[3], 1.0);
            }
            // down-mix
            (2, 1) => {
                add(&mut self.channels[0], &src[0], 0.5);
                add(&mut self.channels[0], &src[1], 0.5);
            }
            (4, 1) => {
                for ch in src.iter().take(4) {
                    add(&mut self.channels[0], ch, 0.25);
                }
            }
            (4, 2) => {
                let (left, right) = self.channels.split_at_mut(1);
                add(&mut left[0], &src[0], 0.5);
                add(&mut left[0], &src[2], 0.5);
                add(&mut right[0], &src[1], 0.5);
                add(&mut right[0], &src[3], 0.5);
            }
            (6, 1) => {
                let out = &mut self.channels[0];
                add(out, &src[0], SQRT_HALF);
                add(out, &src[1], SQRT_HALF);
                add(out, &src[2], 1.0);
                add(out, &src[4], 0.5);
                add(out, &src[5], 0.5);
            }
            (6, 2) => {
                let (left, right) = self.channels.split_at_mut(1);
                add(&mut left[0], &src[0], 1.0);
                add(&mut left[0], &src[2], SQRT_HALF);
                add(&mut left[0], &src[4], SQRT_HALF);
                add(&mut right[0], &src[1], 1.0);
                add(&mut right[0], &src[2], SQRT_HALF);
                add(&mut right[0], &src[5], SQRT_HALF);
            }
            (6, 4) => {
                add(&mut self.channels[0], &src[0], 1.0);
                add(&mut self.channels[0], &src[2], SQRT_HALF);
                add(&mut self.channels[1], &src[1], 1.0);
                add(&mut self.channels[1], &src[2], SQRT_HALF);
                add(&mut self.channels[2], &src[4], 1.0);
                add(&mut self.channels[3], &src[5], 1.0);
            }
            // no matrix for this layout pair
            _ => self.sum_discrete(source),
        }
    }

    fn sum_discrete(&mut self, source: &AudioBus) {
        for (dst, src) in self.channels.iter_mut().zip(&source.channels) {
            add(dst, src, 1.0);
        }
    }

    /// Largest absolute sample value over all channels.
    pub fn peak(&self) -> f32 {
        self.channels
            .iter()
            .flat_map(|ch| ch.iter())
            .fold(0.0f32, |acc, s| acc.max(s.abs()))
    }
}

#[inline]
fn add(dst: &mut [f32], src: &[f32], gain: f32) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d += *s * gain;
    }
}
