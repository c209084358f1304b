//! Audio source nodes (no audio inputs)

mod buffer_source;
mod live_input;
mod oscillator;

pub use buffer_source::{AudioBuffer, AudioBufferSourceNode};
pub use live_input::LiveInputNode;
pub use oscillator::{OscillatorNode, OscillatorType};

pub(crate) use buffer_source::BufferSource;
pub(crate) use live_input::LiveInput;
pub(crate) use oscillator::Oscillator;
