//! Hardware abstraction layer.
//!
//! The acquisition core never talks to vendor protocols directly; it drives
//! the capability traits in [`capabilities`] and is tested against the
//! simulated devices in [`mock`]. Real drivers live outside this crate and
//! implement the same traits.

pub mod capabilities;
pub mod mock;

pub use capabilities::{Shutter, SourceMeter, SourceMode, Stage, SwitchMatrix};

use std::sync::Arc;

/// The four hardware sessions an acquisition run owns exclusively.
///
/// Sessions are acquired in struct-field order at run start and released in
/// reverse order on teardown. While a run is active no other component may
/// hold references to these drivers, which is what makes per-instrument
/// locking unnecessary.
#[derive(Clone)]
pub struct InstrumentRack {
    /// Motorized XY substrate stage.
    pub stage: Arc<dyn Stage>,
    /// Relay matrix selecting one device at a time.
    pub switch: Arc<dyn SwitchMatrix>,
    /// Programmable source/measure unit.
    pub smu: Arc<dyn SourceMeter>,
    /// Illumination shutter.
    pub shutter: Arc<dyn Shutter>,
}
