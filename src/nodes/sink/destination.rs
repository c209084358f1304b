//! The context destination

use crate::bus::AudioBus;
use crate::node::{AudioProcessor, RenderScope};

/// Terminal node of every graph. The renderer reads its summed input directly,
/// so processing has nothing left to do.
pub(crate) struct Destination;

impl AudioProcessor for Destination {
    fn process(&mut self, _: &RenderScope<'_>, _: &[&AudioBus], _: &[&[f32]], _: &mut [AudioBus]) {}
}
