//! Built-in audio nodes
//!
//! Nodes are organized into three categories:
//! - `source`: Generate audio (no audio inputs) - oscillators, buffer playback, live input
//! - `effect`: Process audio (inputs → outputs) - gain, analysis taps
//! - `sink`: Consume audio (no audio outputs) - the context destination
//!
//! Each node comes as a pair: a processor the renderer owns, and a handle
//! returned by the [`AudioContext`](crate::AudioContext) factory.

/// Implement the common node-handle surface for a typed handle by forwarding
/// to the [`AudioNode`](crate::AudioNode) reachable at `$($node).+`.
macro_rules! node_handle {
    ($handle:ty => $($node:ident).+) => {
        impl AsRef<$crate::node::AudioNode> for $handle {
            fn as_ref(&self) -> &$crate::node::AudioNode {
                &self.$($node).+
            }
        }

        impl $handle {
            delegate::delegate! {
                to self.$($node).+ {
                    pub fn id(&self) -> $crate::node::NodeId;
                    pub fn connect(
                        &self,
                        destination: &impl AsRef<$crate::node::AudioNode>,
                        output: usize,
                        input: usize,
                    ) -> $crate::error::Result<()>;
                    pub fn connect_param(&self, param: &$crate::param::AudioParam, output: usize) -> $crate::error::Result<()>;
                    pub fn disconnect(&self, output: usize) -> $crate::error::Result<()>;
                    pub fn disconnect_from(
                        &self,
                        destination: &impl AsRef<$crate::node::AudioNode>,
                        output: usize,
                        input: usize,
                    ) -> $crate::error::Result<()>;
                    pub fn ref_count(&self, kind: $crate::node::RefKind) -> usize;
                }
            }

            /// The untyped node behind this handle.
            pub fn node(&self) -> &$crate::node::AudioNode {
                &self.$($node).+
            }
        }
    };
}

pub mod effect;
mod sink;
pub mod source;

pub use effect::{GainNode, TapNode};
pub use source::{
    AudioBuffer, AudioBufferSourceNode, LiveInputNode, OscillatorNode, OscillatorType,
};

pub(crate) use effect::{Gain, Tap};
pub(crate) use sink::Destination;
pub(crate) use source::{BufferSource, LiveInput, Oscillator};
