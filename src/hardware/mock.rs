//! Mock hardware implementations.
//!
//! Simulated drivers for every capability the sequencer needs, used by the
//! test suite and by the CLI's simulation mode. All mocks are async-safe and
//! keep call counters for teardown assertions. They perform no real waiting;
//! timing in an acquisition comes from the sequencer's explicit sleeps, not
//! from the drivers.
//!
//! The mock source meter evaluates a pluggable current-vs-voltage model, so
//! a test can present any device: a linear photodiode, a dark resistor, or a
//! curve with a known interior power minimum for tracker tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};

use crate::addressing::ChannelId;
use crate::hardware::capabilities::{Shutter, SourceMeter, SourceMode, Stage, SwitchMatrix};

// =============================================================================
// MockStage
// =============================================================================

/// Simulated XY stage with instantaneous motion.
///
/// Substrate and device targets are mapped onto a simple rectangular layout
/// so `current_position` stays self-consistent.
pub struct MockStage {
    position: RwLock<(f64, f64)>,
    substrate_pitch_mm: f64,
    device_pitch_mm: f64,
    move_substrate_count: AtomicU64,
    move_device_count: AtomicU64,
    home_count: AtomicU64,
    shutdown_count: AtomicU64,
}

impl MockStage {
    /// Create a stage parked at the origin.
    pub fn new() -> Self {
        Self {
            position: RwLock::new((0.0, 0.0)),
            substrate_pitch_mm: 30.0,
            device_pitch_mm: 4.5,
            move_substrate_count: AtomicU64::new(0),
            move_device_count: AtomicU64::new(0),
            home_count: AtomicU64::new(0),
            shutdown_count: AtomicU64::new(0),
        }
    }

    /// Number of substrate-level moves commanded.
    pub fn move_substrate_count(&self) -> u64 {
        self.move_substrate_count.load(Ordering::SeqCst)
    }

    /// Number of device-level moves commanded.
    pub fn move_device_count(&self) -> u64 {
        self.move_device_count.load(Ordering::SeqCst)
    }

    /// Number of homing commands received.
    pub fn home_count(&self) -> u64 {
        self.home_count.load(Ordering::SeqCst)
    }

    /// Number of shutdown commands received.
    pub fn shutdown_count(&self) -> u64 {
        self.shutdown_count.load(Ordering::SeqCst)
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for MockStage {
    async fn move_to_substrate(&self, substrate: u32) -> Result<()> {
        self.move_substrate_count.fetch_add(1, Ordering::SeqCst);
        let x = f64::from(substrate) * self.substrate_pitch_mm;
        *self.position.write().await = (x, 0.0);
        tracing::debug!(substrate, x_mm = x, "mock stage at substrate");
        Ok(())
    }

    async fn move_to_device(&self, substrate: u32, device: usize) -> Result<()> {
        self.move_device_count.fetch_add(1, Ordering::SeqCst);
        let x = f64::from(substrate) * self.substrate_pitch_mm;
        let y = device as f64 * self.device_pitch_mm;
        *self.position.write().await = (x, y);
        tracing::debug!(substrate, device, "mock stage at device");
        Ok(())
    }

    async fn move_absolute(&self, x: f64, y: f64) -> Result<()> {
        *self.position.write().await = (x, y);
        Ok(())
    }

    async fn home(&self) -> Result<()> {
        self.home_count.fetch_add(1, Ordering::SeqCst);
        *self.position.write().await = (0.0, 0.0);
        Ok(())
    }

    async fn current_position(&self) -> Result<(f64, f64)> {
        Ok(*self.position.read().await)
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdown_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// MockSwitchMatrix
// =============================================================================

/// Simulated relay matrix holding at most one closed channel.
pub struct MockSwitchMatrix {
    connected: Mutex<Option<ChannelId>>,
    connect_count: AtomicU64,
    disconnect_count: AtomicU64,
}

impl MockSwitchMatrix {
    /// Create a matrix with all relays open.
    pub fn new() -> Self {
        Self {
            connected: Mutex::new(None),
            connect_count: AtomicU64::new(0),
            disconnect_count: AtomicU64::new(0),
        }
    }

    /// Currently closed channel, if any.
    pub async fn connected(&self) -> Option<ChannelId> {
        *self.connected.lock().await
    }

    /// Number of connect commands received.
    pub fn connect_count(&self) -> u64 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Number of disconnect-all commands received.
    pub fn disconnect_count(&self) -> u64 {
        self.disconnect_count.load(Ordering::SeqCst)
    }
}

impl Default for MockSwitchMatrix {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SwitchMatrix for MockSwitchMatrix {
    async fn connect(&self, channel: ChannelId) -> Result<()> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        *self.connected.lock().await = Some(channel);
        tracing::debug!(%channel, "mock matrix connected");
        Ok(())
    }

    async fn disconnect_all(&self) -> Result<()> {
        self.disconnect_count.fetch_add(1, Ordering::SeqCst);
        *self.connected.lock().await = None;
        Ok(())
    }
}

// =============================================================================
// MockShutter
// =============================================================================

/// Simulated illumination shutter.
pub struct MockShutter {
    open: AtomicBool,
    open_count: AtomicU64,
    close_count: AtomicU64,
}

impl MockShutter {
    /// Create a closed shutter.
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(false),
            open_count: AtomicU64::new(0),
            close_count: AtomicU64::new(0),
        }
    }

    /// Whether the shutter is currently open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Number of open commands received.
    pub fn open_count(&self) -> u64 {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Number of close commands received.
    pub fn close_count(&self) -> u64 {
        self.close_count.load(Ordering::SeqCst)
    }
}

impl Default for MockShutter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Shutter for MockShutter {
    async fn open(&self) -> Result<()> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// MockSourceMeter
// =============================================================================

/// Current-vs-applied-voltage model evaluated by [`MockSourceMeter::read`].
pub type DeviceModel = Box<dyn Fn(f64) -> f64 + Send + Sync>;

/// Simulated source/measure unit with a pluggable device model.
///
/// # Example
///
/// ```rust,ignore
/// // The linear photodiode used in the end-to-end scenario.
/// let smu = MockSourceMeter::linear_photodiode(-0.02, 0.6);
/// smu.enable(true).await?;
/// smu.set_output(0.0).await?;
/// let (_v, i) = smu.read().await?; // i == -0.02
/// ```
pub struct MockSourceMeter {
    model: DeviceModel,
    output: RwLock<f64>,
    mode: Mutex<SourceMode>,
    enabled: AtomicBool,
    noise_amplitude: f64,
    fail_reads_after: Option<u64>,
    fail_set_limits: bool,
    read_count: AtomicU64,
    set_limits_count: AtomicU64,
    enable_off_count: AtomicU64,
}

impl MockSourceMeter {
    /// Create a source meter measuring an open circuit (zero current).
    pub fn new() -> Self {
        Self::with_model(Box::new(|_| 0.0))
    }

    /// Create a source meter with an arbitrary current-vs-voltage model.
    pub fn with_model(model: DeviceModel) -> Self {
        Self {
            model,
            output: RwLock::new(0.0),
            mode: Mutex::new(SourceMode::Voltage),
            enabled: AtomicBool::new(false),
            noise_amplitude: 0.0,
            fail_reads_after: None,
            fail_set_limits: false,
            read_count: AtomicU64::new(0),
            set_limits_count: AtomicU64::new(0),
            enable_off_count: AtomicU64::new(0),
        }
    }

    /// Ideal illuminated photodiode: `I(V) = isc * (1 - V/voc)`.
    ///
    /// `isc` carries the sourcing sign convention, so an illuminated device
    /// is constructed with a negative short-circuit current.
    pub fn linear_photodiode(isc: f64, voc: f64) -> Self {
        Self::with_model(Box::new(move |v| isc * (1.0 - v / voc)))
    }

    /// Add uniform read noise of the given amplitude in amperes.
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise_amplitude = amplitude;
        self
    }

    /// Make every read after the first `n` fail, for mid-run fault tests.
    pub fn fail_reads_after(mut self, n: u64) -> Self {
        self.fail_reads_after = Some(n);
        self
    }

    /// Make `set_limits` fail, for session-acquisition fault tests.
    pub fn fail_on_set_limits(mut self) -> Self {
        self.fail_set_limits = true;
        self
    }

    /// Number of reads performed.
    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::SeqCst)
    }

    /// Number of `set_limits` calls received.
    pub fn set_limits_count(&self) -> u64 {
        self.set_limits_count.load(Ordering::SeqCst)
    }

    /// Number of `enable(false)` calls received.
    pub fn disable_count(&self) -> u64 {
        self.enable_off_count.load(Ordering::SeqCst)
    }

    /// Whether the output relay is on.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl Default for MockSourceMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceMeter for MockSourceMeter {
    async fn set_mode(&self, mode: SourceMode) -> Result<()> {
        *self.mode.lock().await = mode;
        Ok(())
    }

    async fn set_output(&self, value: f64) -> Result<()> {
        *self.output.write().await = value;
        Ok(())
    }

    async fn read(&self) -> Result<(f64, f64)> {
        let n = self.read_count.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_reads_after {
            if n >= limit {
                bail!("simulated sourcemeter read failure after {limit} reads");
            }
        }
        let v = *self.output.read().await;
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok((v, 0.0));
        }
        let mut i = (self.model)(v);
        if self.noise_amplitude > 0.0 {
            i += rand::thread_rng().gen_range(-self.noise_amplitude..=self.noise_amplitude);
        }
        Ok((v, i))
    }

    async fn set_limits(&self, voltage: f64, current: f64) -> Result<()> {
        self.set_limits_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_set_limits {
            bail!("simulated compliance programming failure");
        }
        tracing::debug!(voltage, current, "mock sourcemeter limits set");
        Ok(())
    }

    async fn enable(&self, on: bool) -> Result<()> {
        if !on {
            self.enable_off_count.fetch_add(1, Ordering::SeqCst);
        }
        self.enabled.store(on, Ordering::SeqCst);
        Ok(())
    }
}
