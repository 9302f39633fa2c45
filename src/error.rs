//! Custom error types for the application.
//!
//! This module defines the primary error type, `SequencerError`, for the
//! entire acquisition core. Using the `thiserror` crate, it provides a
//! centralized and consistent taxonomy for everything that can go wrong
//! during a run:
//!
//! - **`Addressing`**: invalid substrate/device coordinates. Raised before
//!   any hardware call; a run never half-starts because of bad addressing.
//! - **`Instrument`**: a hardware session failed to initialize or a
//!   read/write failed mid-run. Always fatal to the current run and always
//!   followed by full instrument teardown.
//! - **`Configuration`**: semantically invalid acquisition parameters (e.g.
//!   reverse voltage not below forward voltage). Rejected at run start,
//!   before any session is acquired.
//! - **`Config`**: wraps parse/format errors from the `config` crate when
//!   loading settings files.
//! - **`Cancelled`**: not a failure. A distinct terminal outcome reachable
//!   only through the run's cancellation flag, always paired with teardown.
//!
//! Driver implementations report failures as `anyhow::Error` through the
//! capability traits; the `From<anyhow::Error>` conversion folds those into
//! `Instrument` at the sequencer boundary so the `?` operator works
//! throughout the acquisition loop.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, SequencerError>;

/// Error taxonomy for the acquisition core.
#[derive(Error, Debug)]
pub enum SequencerError {
    /// Invalid substrate or device coordinates, rejected before hardware I/O.
    #[error("Addressing error: {0}")]
    Addressing(String),

    /// Hardware session initialization or mid-run I/O failure. Fatal.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Semantically invalid acquisition parameters, rejected at run start.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Settings file could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O error outside the instrument path (settings files, exports).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was cancelled through its cancellation flag.
    #[error("Acquisition cancelled")]
    Cancelled,
}

#[cfg(feature = "storage_csv")]
impl From<csv::Error> for SequencerError {
    fn from(err: csv::Error) -> Self {
        SequencerError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
    }
}

impl From<anyhow::Error> for SequencerError {
    fn from(err: anyhow::Error) -> Self {
        SequencerError::Instrument(format!("{err:#}"))
    }
}

impl SequencerError {
    /// Whether this error represents cooperative cancellation rather than a
    /// genuine failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SequencerError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SequencerError::Instrument("sourcemeter read failed".to_string());
        assert_eq!(err.to_string(), "Instrument error: sourcemeter read failed");
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: SequencerError = anyhow::anyhow!("switch relay stuck").into();
        assert!(matches!(err, SequencerError::Instrument(_)));
        assert!(err.to_string().contains("switch relay stuck"));
    }

    #[test]
    fn test_cancelled_is_not_failure() {
        assert!(SequencerError::Cancelled.is_cancelled());
        assert!(!SequencerError::Addressing("row 9".into()).is_cancelled());
    }
}
