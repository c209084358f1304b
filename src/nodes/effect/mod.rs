//! Audio effect nodes (process inputs to outputs)

mod gain;
mod tap;

pub use gain::GainNode;
pub use tap::TapNode;

pub(crate) use gain::Gain;
pub(crate) use tap::Tap;
