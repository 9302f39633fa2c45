//! Acquisition sequencer.
//!
//! The top-level state machine that turns a validated configuration and a
//! rack of hardware sessions into a finished acquisition: per-substrate
//! positioning, per-device JV sweeps, best-device selection, dark
//! provenance re-sweeps, and MPP tracking, with cooperative cancellation
//! and guaranteed instrument teardown.
//!
//! # Lifecycle
//!
//! ```text
//! Idle → Initializing → Running ⇄ Tracking → Completed
//!                    ↘ Failed            ↘ Cancelled | Failed
//! ```
//!
//! The worker runs as a dedicated tokio task; the caller holds a
//! [`RunHandle`] and only ever reads published state or sets the
//! cancellation flag. All three terminal states guarantee instrument
//! teardown exactly once.

mod run;

use crate::config::AcquisitionConfig;
use crate::error::SequencerError;
use crate::hardware::InstrumentRack;
use crate::measurement::{DeviceId, PerformanceRecord, SweepResult, TrackingSeries};
use crate::sink::ResultSink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// State of an acquisition run, published through the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Not yet started.
    Idle,
    /// Acquiring hardware sessions.
    Initializing,
    /// Sweeping devices substrate by substrate.
    Running,
    /// Tracking the selected devices of the current substrate.
    Tracking,
    /// All substrates finished; instruments torn down.
    Completed,
    /// Cancelled through the run flag; instruments torn down.
    Cancelled,
    /// Aborted on an instrument failure; instruments torn down.
    Failed,
}

impl RunState {
    /// Whether this state ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Cancelled | RunState::Failed
        )
    }
}

/// One device's complete JV acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JvRecord {
    /// Ascending sweep pass.
    pub forward: SweepResult,
    /// Descending sweep pass.
    pub reverse: SweepResult,
    /// Record derived from the forward pass.
    pub perf_forward: PerformanceRecord,
    /// Record derived from the reverse pass.
    pub perf_reverse: PerformanceRecord,
}

impl JvRecord {
    /// The more negative (better) of the two passes' maximum powers.
    pub fn best_power(&self) -> f64 {
        self.perf_forward.p_mp.min(self.perf_reverse.p_mp)
    }

    /// V_mp belonging to [`Self::best_power`].
    pub fn best_voltage(&self) -> f64 {
        if self.perf_forward.p_mp <= self.perf_reverse.p_mp {
            self.perf_forward.v_mp
        } else {
            self.perf_reverse.v_mp
        }
    }
}

/// Everything produced for one device during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceOutcome {
    /// The measured device.
    pub device: DeviceId,
    /// Illuminated acquisition, present for every swept device.
    pub light: JvRecord,
    /// Dark provenance acquisition, present for tracked devices.
    pub dark: Option<JvRecord>,
    /// Tracking series, present for tracked devices.
    pub tracking: Option<TrackingSeries>,
}

/// Final report of a finished, cancelled, or failed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Unique id assigned at start.
    pub run_id: Uuid,
    /// Terminal state the run reached.
    pub state: RunState,
    /// Failure description when `state` is `Failed`.
    pub error: Option<String>,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end, after teardown.
    pub finished_at: DateTime<Utc>,
    /// Per-device results in acquisition order.
    pub devices: Vec<DeviceOutcome>,
}

/// Clonable cancellation trigger for a run.
#[derive(Clone)]
pub struct Canceller {
    tx: Arc<watch::Sender<bool>>,
}

impl Canceller {
    /// Request cooperative cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Caller-side handle to an active acquisition run.
pub struct RunHandle {
    run_id: Uuid,
    canceller: Canceller,
    state_rx: watch::Receiver<RunState>,
    join: tokio::task::JoinHandle<RunSummary>,
}

impl RunHandle {
    /// Unique id of this run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Most recently published state.
    pub fn state(&self) -> RunState {
        *self.state_rx.borrow()
    }

    /// Whether the run has not yet reached a terminal state.
    pub fn is_running(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Request cooperative cancellation of this run.
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    /// A clonable trigger usable from other tasks (e.g. a ctrl-c handler).
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Watch receiver for state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<RunState> {
        self.state_rx.clone()
    }

    /// Wait for the run to finish and return its summary.
    ///
    /// Teardown has already happened by the time this returns.
    pub async fn wait(self) -> Result<RunSummary, SequencerError> {
        self.join
            .await
            .map_err(|e| SequencerError::Instrument(format!("acquisition worker died: {e}")))
    }
}

/// Entry point for starting acquisition runs.
pub struct Sequencer;

impl Sequencer {
    /// Validate `config` and start an acquisition worker.
    ///
    /// Configuration errors are returned synchronously, before any hardware
    /// session is touched. On success the returned handle is the only way
    /// to observe or cancel the run.
    pub fn start(
        config: AcquisitionConfig,
        rack: InstrumentRack,
        sink: Arc<dyn ResultSink>,
    ) -> Result<RunHandle, SequencerError> {
        config.validate()?;

        let run_id = Uuid::new_v4();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(RunState::Idle);

        let worker = run::AcquisitionRun::new(run_id, config, rack, sink, cancel_rx, state_tx);
        let join = tokio::spawn(worker.execute());

        tracing::info!(%run_id, "acquisition run started");
        Ok(RunHandle {
            run_id,
            canceller: Canceller {
                tx: Arc::new(cancel_tx),
            },
            state_rx,
            join,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(!RunState::Tracking.is_terminal());
        assert!(!RunState::Initializing.is_terminal());
    }

    #[test]
    fn test_jv_record_best_pass_selection() {
        use crate::measurement::{Illumination, SweepResult};
        use chrono::Utc;

        let record = |p_mp: f64, v_mp: f64| PerformanceRecord {
            voc: 0.6,
            jsc: -0.02,
            v_mp,
            p_mp,
            fill_factor: 0.25,
            efficiency: 3.0,
            illumination: Illumination::Light,
            timestamp: Utc::now(),
        };
        let jv = JvRecord {
            forward: SweepResult { points: vec![] },
            reverse: SweepResult { points: vec![] },
            perf_forward: record(-0.003, 0.30),
            perf_reverse: record(-0.004, 0.32),
        };
        assert_eq!(jv.best_power(), -0.004);
        assert_eq!(jv.best_voltage(), 0.32);
    }
}
