//! Error types for graph mutation and scheduling.
//!
//! Every fallible control-thread operation returns [`GraphError`]. Errors are
//! reported synchronously and leave the graph untouched. The render path never
//! produces errors: contention and inconsistencies there degrade to silence.

use thiserror::Error;

use crate::node::NodeId;

/// Result alias used throughout the crate.
pub type Result<T, E = GraphError> = core::result::Result<T, E>;

/// Broad classification of a [`GraphError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A bad index, a foreign node, a malformed automation value.
    InvalidArgument,
    /// The operation is not valid in the object's current state.
    InvalidState,
    /// A platform or engine limit was exceeded.
    Resource,
}

/// Which kind of port an index referred to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortKind {
    Input,
    Output,
}

impl core::fmt::Display for PortKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PortKind::Input => f.write_str("input"),
            PortKind::Output => f.write_str("output"),
        }
    }
}

/// Errors reported by graph, parameter and scheduling operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    /// A port index was outside the node's port range.
    #[error("{kind} index {index} out of range for node {node:?} with {count} {kind}s")]
    IndexOutOfRange {
        node: NodeId,
        kind: PortKind,
        index: usize,
        count: usize,
    },

    /// The two ends of a connection belong to different contexts.
    #[error("nodes belong to different audio contexts")]
    ContextMismatch,

    /// The connection would close a feedback loop.
    #[error("connecting {from:?} to {to:?} would create a cycle")]
    CycleDetected { from: NodeId, to: NodeId },

    /// `disconnect_from` named an edge that does not exist.
    #[error("node {from:?} is not connected to node {to:?}")]
    NotConnected { from: NodeId, to: NodeId },

    /// A non-finite or out-of-domain value was supplied.
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),

    /// The object is not in a state that allows the operation.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The node has been released and removed from its graph.
    #[error("node {0:?} has been released")]
    NodeReleased(NodeId),

    /// Channel count of zero or above the engine maximum.
    #[error("channel count {count} is not supported (maximum {max})")]
    InvalidChannelCount { count: usize, max: usize },

    /// A node's message queue is full; the audio thread has not caught up.
    #[error("message queue for node {0:?} is full")]
    QueueFull(NodeId),
}

impl GraphError {
    /// The category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            GraphError::IndexOutOfRange { .. }
            | GraphError::ContextMismatch
            | GraphError::CycleDetected { .. }
            | GraphError::NotConnected { .. }
            | GraphError::InvalidValue(_) => ErrorCategory::InvalidArgument,
            GraphError::InvalidState(_) | GraphError::NodeReleased(_) => {
                ErrorCategory::InvalidState
            }
            GraphError::InvalidChannelCount { .. } | GraphError::QueueFull(_) => ErrorCategory::Resource,
        }
    }
}

/// Errors from the optional output device driver.
#[cfg(feature = "cpal_sink")]
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no output device available")]
    NoDevice,
    #[error("device sample rate {device} Hz does not match context rate {context} Hz")]
    SampleRateMismatch { device: u32, context: u32 },
    #[error("unsupported sample format {0:?}")]
    UnsupportedFormat(cpal::SampleFormat),
    #[error(transparent)]
    Config(#[from] cpal::DefaultStreamConfigError),
    #[error(transparent)]
    Build(#[from] cpal::BuildStreamError),
    #[error(transparent)]
    Play(#[from] cpal::PlayStreamError),
    #[error(transparent)]
    Pause(#[from] cpal::PauseStreamError),
}
