//! CPAL output driver.
//!
//! [`CpalDevice`] discovers output devices and runs a [`GraphRenderer`] inside
//! the device's stream callback.
//!
//! ```no_run
//! use klingt_context::{AudioContext, CpalDevice};
//!
//! let device = CpalDevice::default_output().expect("no output device");
//! let (context, renderer) = AudioContext::new(device.sample_rate());
//! let _stream = device.start(renderer).expect("failed to start stream");
//!
//! let osc = context.create_oscillator();
//! osc.connect(&context.destination(), 0, 0).unwrap();
//! osc.start(0.0).unwrap();
//! ```

use alloc::string::String;
use alloc::vec::Vec;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, SupportedStreamConfig};
use tracing::{debug, error};

use crate::error::DeviceError;
use crate::render::GraphRenderer;

/// A discovered audio output device.
pub struct CpalDevice {
    device: cpal::Device,
    config: SupportedStreamConfig,
    name: String,
}

impl CpalDevice {
    /// The system's default output device, if there is one.
    pub fn default_output() -> Option<Self> {
        let device = cpal::default_host().default_output_device()?;
        Self::from_device(device).ok()
    }

    /// Every output device that reports a usable default configuration.
    pub fn list_outputs() -> Vec<Self> {
        cpal::default_host()
            .output_devices()
            .map(|devices| devices.filter_map(|d| Self::from_device(d).ok()).collect())
            .unwrap_or_default()
    }

    fn from_device(device: cpal::Device) -> Result<Self, DeviceError> {
        let config = device.default_output_config()?;
        let name = device.name().unwrap_or_else(|_| "Unknown".into());
        Ok(Self { device, config, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sample rate in Hz. Build the context at this rate.
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate().0
    }

    pub fn channels(&self) -> u16 {
        self.config.channels()
    }

    /// Move `renderer` onto the device's audio thread and start playing.
    ///
    /// The returned stream plays for as long as it is kept alive. Context and
    /// device channel counts may differ: extra device channels are zeroed and
    /// extra context channels dropped.
    pub fn start(&self, renderer: GraphRenderer) -> Result<OutputStream, DeviceError> {
        let context_rate = renderer.sample_rate() as u32;
        if context_rate != self.sample_rate() {
            return Err(DeviceError::SampleRateMismatch {
                device: self.sample_rate(),
                context: context_rate,
            });
        }

        let stream = match self.config.sample_format() {
            SampleFormat::F32 => self.build::<f32>(renderer)?,
            SampleFormat::I16 => self.build::<i16>(renderer)?,
            SampleFormat::U16 => self.build::<u16>(renderer)?,
            SampleFormat::I32 => self.build::<i32>(renderer)?,
            other => return Err(DeviceError::UnsupportedFormat(other)),
        };
        stream.play()?;
        debug!(device = %self.name, rate = self.sample_rate(), channels = self.channels(), "output stream started");
        Ok(OutputStream { stream })
    }

    fn build<T>(&self, mut renderer: GraphRenderer) -> Result<cpal::Stream, DeviceError>
    where
        T: SizedSample + FromSample<f32>,
    {
        let device_channels = self.channels() as usize;
        let context_channels = renderer.channels();
        // Sized for a generous device period so the callback rarely allocates.
        let mut scratch: Vec<f32> = Vec::with_capacity(8192 * context_channels);

        let stream = self.device.build_output_stream(
            &self.config.config(),
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / device_channels;
                scratch.resize(frames * context_channels, 0.0);
                renderer.fill_interleaved(&mut scratch);

                for (out, rendered) in data
                    .chunks_exact_mut(device_channels)
                    .zip(scratch.chunks_exact(context_channels))
                {
                    for (c, sample) in out.iter_mut().enumerate() {
                        let value = rendered.get(c).copied().unwrap_or(0.0);
                        *sample = T::from_sample(value);
                    }
                }
            },
            |err| error!(%err, "output stream error"),
            None,
        )?;
        Ok(stream)
    }
}

impl core::fmt::Debug for CpalDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CpalDevice")
            .field("name", &self.name)
            .field("sample_rate", &self.sample_rate())
            .field("channels", &self.channels())
            .finish()
    }
}

/// A running output stream. Dropping it stops playback and the renderer.
pub struct OutputStream {
    stream: cpal::Stream,
}

impl OutputStream {
    pub fn pause(&self) -> Result<(), DeviceError> {
        Ok(self.stream.pause()?)
    }

    pub fn resume(&self) -> Result<(), DeviceError> {
        Ok(self.stream.play()?)
    }
}
