//! Measurement data model and protocols.
//!
//! Types shared by the sweep engine, metrics extractor, and MPP tracker,
//! plus the submodules implementing each stage:
//!
//! - [`sweep`]: bidirectional JV sweep protocol
//! - [`metrics`]: figure-of-merit extraction
//! - [`tracking`]: perturb-and-observe maximum-power-point tracking
//!
//! # Units and sign convention
//!
//! Voltages are volts in the logical device frame, current densities are
//! A/cm², incident power is W/cm². The instrument's sourcing convention
//! makes the power `V*J` of an illuminated device most negative at the
//! maximum power point; rankings and the tracker therefore minimize signed
//! power. Downstream consumers rely on this convention and it is preserved
//! as-is.

pub mod metrics;
pub mod sweep;
pub mod tracking;

use crate::error::SequencerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One device under test, fixed once acquisition of it begins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    /// Operator label of the substrate carrying the device.
    pub substrate_label: String,
    /// Physical substrate number from the coordinate mapper.
    pub substrate_number: u32,
    /// Device position on the substrate, 1..=6.
    pub device_index: usize,
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.substrate_label, self.device_index)
    }
}

/// Which pass of the bidirectional sweep is performed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepDirection {
    /// Sweep from reverse voltage up to forward voltage first.
    ReverseToForward,
    /// Sweep from forward voltage down to reverse voltage first.
    ForwardToReverse,
}

fn default_soak_voltage() -> f64 {
    0.0
}
fn default_soak_time() -> f64 {
    1.0
}
fn default_hold_time() -> f64 {
    0.05
}
fn default_step_voltage() -> f64 {
    0.02
}
fn default_reverse_voltage() -> f64 {
    -0.2
}
fn default_forward_voltage() -> f64 {
    1.2
}
fn default_direction() -> SweepDirection {
    SweepDirection::ReverseToForward
}
fn default_polarity() -> i8 {
    1
}
fn default_device_area() -> f64 {
    0.1575
}
fn default_compliance_current() -> f64 {
    0.05
}

/// Parameters of one bidirectional JV sweep.
///
/// Validated at the boundary via [`SweepParameters::validate`]; the sweep
/// engine assumes parameters it receives are valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepParameters {
    /// Bias applied before the first pass, in the logical frame.
    #[serde(default = "default_soak_voltage")]
    pub soak_voltage: f64,
    /// Time spent at the soak bias, seconds.
    #[serde(default = "default_soak_time")]
    pub soak_time_s: f64,
    /// Settling time at each voltage point before sampling, seconds.
    /// Zero is allowed and samples with no settling.
    #[serde(default = "default_hold_time")]
    pub hold_time_s: f64,
    /// Voltage increment between points, volts. Must be positive.
    #[serde(default = "default_step_voltage")]
    pub step_voltage: f64,
    /// Most negative point of the sweep, volts.
    #[serde(default = "default_reverse_voltage")]
    pub reverse_voltage: f64,
    /// Most positive point of the sweep, volts.
    #[serde(default = "default_forward_voltage")]
    pub forward_voltage: f64,
    /// Which pass runs first.
    #[serde(default = "default_direction")]
    pub direction: SweepDirection,
    /// Device architecture sign: +1 (n-i-p) or -1 (p-i-n).
    #[serde(default = "default_polarity")]
    pub polarity: i8,
    /// Active device area in cm², for current-density conversion.
    #[serde(default = "default_device_area")]
    pub device_area_cm2: f64,
    /// Source meter current compliance, amperes.
    #[serde(default = "default_compliance_current")]
    pub compliance_current_a: f64,
}

impl Default for SweepParameters {
    fn default() -> Self {
        Self {
            soak_voltage: default_soak_voltage(),
            soak_time_s: default_soak_time(),
            hold_time_s: default_hold_time(),
            step_voltage: default_step_voltage(),
            reverse_voltage: default_reverse_voltage(),
            forward_voltage: default_forward_voltage(),
            direction: default_direction(),
            polarity: default_polarity(),
            device_area_cm2: default_device_area(),
            compliance_current_a: default_compliance_current(),
        }
    }
}

impl SweepParameters {
    /// Reject semantically invalid parameters before any session is acquired.
    pub fn validate(&self) -> Result<(), SequencerError> {
        if self.reverse_voltage >= self.forward_voltage {
            return Err(SequencerError::Configuration(format!(
                "reverse voltage {} must be below forward voltage {}",
                self.reverse_voltage, self.forward_voltage
            )));
        }
        if self.step_voltage <= 0.0 {
            return Err(SequencerError::Configuration(format!(
                "step voltage must be positive, got {}",
                self.step_voltage
            )));
        }
        if self.device_area_cm2 <= 0.0 {
            return Err(SequencerError::Configuration(format!(
                "device area must be positive, got {} cm^2",
                self.device_area_cm2
            )));
        }
        if self.polarity != 1 && self.polarity != -1 {
            return Err(SequencerError::Configuration(format!(
                "polarity must be +1 or -1, got {}",
                self.polarity
            )));
        }
        if self.soak_time_s < 0.0 || self.hold_time_s < 0.0 {
            return Err(SequencerError::Configuration(
                "soak and hold times must be non-negative".into(),
            ));
        }
        if self.compliance_current_a <= 0.0 {
            return Err(SequencerError::Configuration(format!(
                "compliance current must be positive, got {} A",
                self.compliance_current_a
            )));
        }
        Ok(())
    }

    /// Voltage compliance needed to cover every point of this sweep.
    pub fn voltage_limit(&self) -> f64 {
        self.reverse_voltage
            .abs()
            .max(self.forward_voltage.abs())
            .max(self.soak_voltage.abs())
    }
}

/// One sampled point of a sweep pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SweepPoint {
    /// Applied voltage in the logical device frame, volts.
    pub voltage: f64,
    /// Measured current density, A/cm².
    pub current_density: f64,
}

/// Ordered samples of one direction of a JV sweep.
///
/// Immutable once produced; a full acquisition is a `(forward, reverse)`
/// pair returned together by the sweep engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResult {
    /// Samples in the order they were taken.
    pub points: Vec<SweepPoint>,
}

impl SweepResult {
    /// Signed power `V*J` of each sample, W/cm².
    pub fn powers(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|p| p.voltage * p.current_density)
    }
}

/// Illumination condition of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Illumination {
    /// Shutter open, device illuminated.
    Light,
    /// Shutter closed.
    Dark,
}

/// Figures of merit derived from one sweep direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceRecord {
    /// Open-circuit voltage, volts. Zero if the sweep never crosses J=0.
    pub voc: f64,
    /// Short-circuit current density, A/cm². Zero if V=0 is not bracketed.
    pub jsc: f64,
    /// Voltage of the sampled maximum power point, volts.
    pub v_mp: f64,
    /// Signed power at the maximum power point, W/cm² (most negative).
    pub p_mp: f64,
    /// Fill factor, dimensionless. Zero when Voc or Jsc is zero.
    pub fill_factor: f64,
    /// Power conversion efficiency in percent. Zero when Voc or Jsc is zero.
    pub efficiency: f64,
    /// Illumination condition during the sweep.
    pub illumination: Illumination,
    /// When the record was extracted.
    pub timestamp: DateTime<Utc>,
}

/// One sample of the MPP tracking loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrackingSample {
    /// Seconds since tracking started.
    pub elapsed_s: f64,
    /// Operating voltage selected by the stencil, volts.
    pub voltage: f64,
    /// Instantaneous power `polarity * V * I` at that voltage, watts.
    pub power: f64,
}

/// Accumulated tracking samples for one device, in elapsed-time order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingSeries {
    /// Samples in strictly increasing elapsed time.
    pub samples: Vec<TrackingSample>,
}
