//! Audio sink nodes (no audio outputs)

mod destination;

pub(crate) use destination::Destination;
