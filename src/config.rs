//! Configuration management.
//!
//! Settings are loaded once at startup from a TOML profile and frozen into
//! an [`AcquisitionConfig`] snapshot before a run starts. The sequencer
//! never reads configuration globally; it receives the snapshot at
//! construction and treats it as immutable for the run's duration.

use crate::addressing::{ConnectionMap, SubstrateGrid, DEVICES_PER_SUBSTRATE};
use crate::error::SequencerError;
use crate::measurement::tracking::TrackingParameters;
use crate::measurement::SweepParameters;
use config::Config;
use serde::Deserialize;
use std::path::Path;

fn default_log_level() -> String {
    "info".to_string()
}
fn default_rows() -> usize {
    4
}
fn default_cols() -> usize {
    4
}
fn default_active() -> bool {
    true
}
fn default_devices_to_track() -> usize {
    2
}
fn default_incident_power() -> f64 {
    // AM1.5G, one sun, in W/cm^2.
    0.1
}

/// One populated slot in the settings file.
#[derive(Debug, Deserialize, Clone)]
pub struct SlotSettings {
    /// Grid row, 0-indexed.
    pub row: usize,
    /// Grid column, 0-indexed.
    pub col: usize,
    /// Substrate label; omitted means the slot stays empty.
    #[serde(default)]
    pub label: Option<String>,
    /// Whether the slot takes part in acquisition.
    #[serde(default = "default_active")]
    pub active: bool,
}

/// Substrate holder description.
#[derive(Debug, Deserialize, Clone)]
pub struct GridSettings {
    /// Holder row count.
    #[serde(default = "default_rows")]
    pub rows: usize,
    /// Holder column count.
    #[serde(default = "default_cols")]
    pub cols: usize,
    /// Populated slots; unlisted positions are empty.
    #[serde(default)]
    pub slots: Vec<SlotSettings>,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            rows: default_rows(),
            cols: default_cols(),
            slots: Vec::new(),
        }
    }
}

/// Tracking phase settings: loop parameters plus device selection count.
#[derive(Debug, Deserialize, Clone)]
pub struct TrackingSettings {
    /// How many top-ranked devices per substrate get tracked.
    #[serde(default = "default_devices_to_track")]
    pub devices_to_track: usize,
    /// Timing and step-size parameters of the tracking loop.
    #[serde(flatten)]
    pub params: TrackingParameters,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            devices_to_track: default_devices_to_track(),
            params: TrackingParameters::default(),
        }
    }
}

/// Top-level settings file contents.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Log filter passed to the tracing subscriber.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Substrate holder layout.
    #[serde(default)]
    pub grid: GridSettings,
    /// JV sweep parameters.
    #[serde(default)]
    pub sweep: SweepParameters,
    /// MPP tracking parameters.
    #[serde(default)]
    pub tracking: TrackingSettings,
    /// Wiring-dependent switch matrix mapping.
    #[serde(default)]
    pub connection: ConnectionMap,
    /// Incident optical power density, W/cm².
    #[serde(default = "default_incident_power")]
    pub incident_power_w_cm2: f64,
}

impl Settings {
    /// Load `config/<name>.toml`, defaulting to `config/default.toml`.
    pub fn new(config_name: Option<&str>) -> Result<Self, SequencerError> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()?;
        Ok(s.try_deserialize()?)
    }

    /// Load settings from an explicit file path.
    pub fn from_file(path: &Path) -> Result<Self, SequencerError> {
        let s = Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        Ok(s.try_deserialize()?)
    }

    /// Freeze these settings into the validated run snapshot.
    pub fn to_acquisition_config(&self) -> Result<AcquisitionConfig, SequencerError> {
        let mut grid = SubstrateGrid::new(self.grid.rows, self.grid.cols);
        for slot in &self.grid.slots {
            grid.set_label(slot.row, slot.col, slot.label.clone())?;
            grid.set_active(slot.row, slot.col, slot.active)?;
        }
        let config = AcquisitionConfig {
            grid,
            connection: self.connection.clone(),
            sweep: self.sweep.clone(),
            tracking: self.tracking.params.clone(),
            devices_to_track: self.tracking.devices_to_track,
            incident_power_w_cm2: self.incident_power_w_cm2,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Immutable parameter snapshot owned by one acquisition run.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    /// Substrate holder contents.
    pub grid: SubstrateGrid,
    /// Switch matrix wiring map.
    pub connection: ConnectionMap,
    /// JV sweep parameters applied to every device.
    pub sweep: SweepParameters,
    /// MPP tracking loop parameters.
    pub tracking: TrackingParameters,
    /// Top-ranked devices per substrate selected for tracking.
    pub devices_to_track: usize,
    /// Incident optical power density, W/cm².
    pub incident_power_w_cm2: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            grid: SubstrateGrid::new(default_rows(), default_cols()),
            connection: ConnectionMap::default(),
            sweep: SweepParameters::default(),
            tracking: TrackingParameters::default(),
            devices_to_track: default_devices_to_track(),
            incident_power_w_cm2: default_incident_power(),
        }
    }
}

impl AcquisitionConfig {
    /// Reject invalid parameters before any hardware session is acquired.
    pub fn validate(&self) -> Result<(), SequencerError> {
        if self.grid.rows() == 0 || self.grid.cols() == 0 {
            return Err(SequencerError::Configuration(
                "substrate grid must have at least one row and one column".into(),
            ));
        }
        self.connection.validate()?;
        self.sweep.validate()?;
        self.tracking.validate()?;
        if self.devices_to_track > DEVICES_PER_SUBSTRATE {
            return Err(SequencerError::Configuration(format!(
                "cannot track {} devices, substrates carry {DEVICES_PER_SUBSTRATE}",
                self.devices_to_track
            )));
        }
        if self.incident_power_w_cm2 <= 0.0 {
            return Err(SequencerError::Configuration(format!(
                "incident power must be positive, got {} W/cm^2",
                self.incident_power_w_cm2
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let file = write_config("");
        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.grid.rows, 4);
        assert_eq!(settings.sweep.polarity, 1);
        assert_eq!(settings.tracking.devices_to_track, 2);
        assert_eq!(settings.connection.device_to_pin, [3, 2, 1, 4, 5, 6]);

        let config = settings.to_acquisition_config().unwrap();
        assert_eq!(config.grid.substrate_count(), 16);
    }

    #[test]
    fn test_full_profile_round_trip() {
        let file = write_config(
            r#"
            log_level = "debug"
            incident_power_w_cm2 = 0.1

            [grid]
            rows = 1
            cols = 1

            [[grid.slots]]
            row = 0
            col = 0
            label = "batch1-s1"

            [sweep]
            reverse_voltage = -1.0
            forward_voltage = 1.0
            step_voltage = 0.1
            hold_time_s = 0.0
            soak_time_s = 0.0
            device_area_cm2 = 0.1575

            [tracking]
            devices_to_track = 1
            duration_s = 5.0
            sample_interval_s = 0.5
            step_v = 0.002

            [connection]
            device_to_pin = [1, 2, 3, 4, 5, 6]
            channels_per_substrate = 8
            "#,
        );
        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.sweep.step_voltage, 0.1);
        assert_eq!(settings.tracking.params.step_v, 0.002);
        assert_eq!(settings.connection.channels_per_substrate, 8);

        let config = settings.to_acquisition_config().unwrap();
        assert_eq!(config.devices_to_track, 1);
        let slot = config.grid.slot(0, 0).unwrap();
        assert_eq!(slot.label.as_deref(), Some("batch1-s1"));
    }

    #[test]
    fn test_invalid_sweep_window_rejected_at_snapshot() {
        let file = write_config(
            r#"
            [sweep]
            reverse_voltage = 1.0
            forward_voltage = -1.0
            "#,
        );
        let settings = Settings::from_file(file.path()).unwrap();
        assert!(matches!(
            settings.to_acquisition_config(),
            Err(SequencerError::Configuration(_))
        ));
    }

    #[test]
    fn test_slot_outside_grid_rejected() {
        let file = write_config(
            r#"
            [grid]
            rows = 2
            cols = 2

            [[grid.slots]]
            row = 3
            col = 0
            label = "oops"
            "#,
        );
        let settings = Settings::from_file(file.path()).unwrap();
        assert!(matches!(
            settings.to_acquisition_config(),
            Err(SequencerError::Addressing(_))
        ));
    }

    #[test]
    fn test_track_count_bounded_by_device_count() {
        let config = AcquisitionConfig {
            devices_to_track: 7,
            ..AcquisitionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
