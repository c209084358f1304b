//! Klingt context - a real-time audio graph driven from two threads
//!
//! Design principles:
//! - An [`AudioContext`] owns the graph on the control thread; a
//!   [`GraphRenderer`] renders it on the audio thread, one quantum at a time
//! - Graph edits take a lock; the audio thread only ever `try_lock`s it, and
//!   renders from its own snapshot of the connections
//! - Nodes live while a handle, a connection, or playback still needs them,
//!   and are torn down off the audio thread's hot path
//! - Parameters are atomics plus a timeline of sample-accurate automation
//! - Sources are scheduled against the context clock and report when they end
//!
//! ```
//! use klingt_context::AudioContext;
//!
//! let (context, mut renderer) = AudioContext::new(48_000);
//! let osc = context.create_oscillator();
//! osc.connect(&context.destination(), 0, 0).unwrap();
//! osc.frequency().linear_ramp_to_value_at_time(880.0, 0.5).unwrap();
//! osc.start(0.0).unwrap();
//!
//! let rendered = renderer.render_offline(48_000);
//! assert_eq!(rendered.len(), 2 * 48_000);
//! ```

extern crate alloc;

mod bus;
mod context;
mod error;
mod graph;
mod node;
mod param;
mod render;
mod scheduled;
mod timeline;

#[cfg(feature = "cpal_sink")]
mod device;

pub mod nodes;

pub use bus::{AudioBus, ChannelInterpretation, MAX_CHANNELS, RENDER_QUANTUM_FRAMES};
pub use context::{
    AudioContext, ContextBuilder, NodeOptions, RenderEvent, RenderStats, DEFAULT_EVENT_CAPACITY,
    DEFAULT_MESSAGE_CAPACITY,
};
pub use error::{ErrorCategory, GraphError, PortKind, Result};
pub use node::{
    AudioNode, AudioProcessor, ChannelConfig, ChannelCountMode, InputInfo, NodeId, NodeKind, OutputChannels,
    OutputInfo, RefKind, RenderScope,
};
pub use nodes::{
    AudioBuffer, AudioBufferSourceNode, GainNode, LiveInputNode, OscillatorNode, OscillatorType, TapNode,
};
pub use param::{AudioParam, ParamDescriptor, SMOOTHING_CONSTANT, SNAP_THRESHOLD};
pub use render::GraphRenderer;
pub use scheduled::{PlaybackState, Schedule, ScheduleWindow, ScheduledNode};
pub use timeline::{AudioParamTimeline, EventKind, ParamEvent};

#[cfg(feature = "cpal_sink")]
pub use device::{CpalDevice, OutputStream};
#[cfg(feature = "cpal_sink")]
pub use error::DeviceError;
