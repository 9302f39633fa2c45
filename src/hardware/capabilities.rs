//! Atomic hardware capabilities.
//!
//! Fine-grained capability traits for the instruments the sequencer drives.
//! Instead of one monolithic instrument trait, each driver kind gets a small
//! focused contract:
//!
//! - [`Stage`]: motorized XY substrate positioning
//! - [`SwitchMatrix`]: relay selection of a single device
//! - [`SourceMeter`]: programmable voltage/current source with readback
//! - [`Shutter`]: illumination gating
//!
//! Each capability trait:
//! - is async (uses `#[async_trait]`)
//! - is thread-safe (requires `Send + Sync`)
//! - uses `anyhow::Result` for errors
//! - focuses on one driver kind
//!
//! Drivers take `&self`; implementations use interior mutability for any
//! connection state. These calls are the only suspension points of the
//! acquisition loop besides explicit timing sleeps, and the sequencer treats
//! every failure as fatal to the current run.

use crate::addressing::ChannelId;
use anyhow::Result;
use async_trait::async_trait;

/// Source/measure operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    /// Source voltage, measure current.
    Voltage,
    /// Source current, measure voltage.
    Current,
}

/// Capability: substrate stage motion.
///
/// Positions are resolved by the driver from the physical substrate number
/// produced by the coordinate mapper; the sequencer never computes raw
/// stage coordinates for substrate or device targets.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Move to the loading position of a physical substrate number.
    async fn move_to_substrate(&self, substrate: u32) -> Result<()>;

    /// Move to the probe sub-position of one device on a substrate.
    async fn move_to_device(&self, substrate: u32, device: usize) -> Result<()>;

    /// Move to absolute stage coordinates in millimetres.
    async fn move_absolute(&self, x: f64, y: f64) -> Result<()>;

    /// Home both axes; the homed position doubles as the park position.
    async fn home(&self) -> Result<()>;

    /// Current stage coordinates in millimetres.
    async fn current_position(&self) -> Result<(f64, f64)>;

    /// Release the motion controller session.
    async fn shutdown(&self) -> Result<()>;
}

/// Capability: device selection through the relay matrix.
///
/// At most one channel is closed at a time; `connect` implies release of any
/// previously closed channel.
#[async_trait]
pub trait SwitchMatrix: Send + Sync {
    /// Close the relays for one physical channel.
    async fn connect(&self, channel: ChannelId) -> Result<()>;

    /// Open all relays.
    async fn disconnect_all(&self) -> Result<()>;
}

/// Capability: programmable source/measure unit.
#[async_trait]
pub trait SourceMeter: Send + Sync {
    /// Select the source mode for subsequent output commands.
    async fn set_mode(&self, mode: SourceMode) -> Result<()>;

    /// Command the output level in the active mode (volts or amperes).
    async fn set_output(&self, value: f64) -> Result<()>;

    /// Sample the instrument, returning `(voltage, current)`.
    async fn read(&self) -> Result<(f64, f64)>;

    /// Set compliance limits (volts, amperes).
    async fn set_limits(&self, voltage: f64, current: f64) -> Result<()>;

    /// Switch the output relay on or off.
    async fn enable(&self, on: bool) -> Result<()>;
}

/// Capability: illumination shutter.
#[async_trait]
pub trait Shutter: Send + Sync {
    /// Open the shutter (device illuminated).
    async fn open(&self) -> Result<()>;

    /// Close the shutter (dark).
    async fn close(&self) -> Result<()>;
}
