//! Acquisition worker internals.
//!
//! [`AcquisitionRun`] owns the hardware sessions, the cancellation flag,
//! and the accumulated results for exactly one run. Session acquisition is
//! ordered (stage, switch matrix, source meter, shutter) with reverse-order
//! release if any step fails; after successful acquisition, teardown runs
//! unconditionally on every exit path. Completion, cancellation, and
//! mid-run instrument failure all park the hardware exactly once.
//!
//! The cancellation flag is checked at the top of every substrate
//! iteration, every device iteration, and (inside the tracker) every sample
//! interval. These checks plus the blocking hardware calls are the only
//! suspension points of the loop.

use super::{DeviceOutcome, JvRecord, RunState, RunSummary};
use crate::addressing::DEVICES_PER_SUBSTRATE;
use crate::config::AcquisitionConfig;
use crate::error::SequencerError;
use crate::hardware::capabilities::SourceMode;
use crate::hardware::InstrumentRack;
use crate::measurement::{metrics, sweep, tracking, DeviceId, Illumination};
use crate::sink::ResultSink;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

pub(super) struct AcquisitionRun {
    run_id: Uuid,
    config: AcquisitionConfig,
    rack: InstrumentRack,
    sink: Arc<dyn ResultSink>,
    cancel_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<RunState>,
    outcomes: Vec<DeviceOutcome>,
}

impl AcquisitionRun {
    pub(super) fn new(
        run_id: Uuid,
        config: AcquisitionConfig,
        rack: InstrumentRack,
        sink: Arc<dyn ResultSink>,
        cancel_rx: watch::Receiver<bool>,
        state_tx: watch::Sender<RunState>,
    ) -> Self {
        Self {
            run_id,
            config,
            rack,
            sink,
            cancel_rx,
            state_tx,
            outcomes: Vec::new(),
        }
    }

    /// Drive the run to a terminal state and report it.
    pub(super) async fn execute(mut self) -> RunSummary {
        let started_at = Utc::now();
        self.publish(RunState::Initializing);
        self.status("initializing instrument sessions".to_string());

        let result = match self.initialize().await {
            Ok(()) => {
                let run_result = self.run_loop().await;
                // Finally semantics: teardown happens no matter how the
                // loop ended. Initialization failures released their own
                // partial sessions, so this is the single teardown site.
                self.teardown().await;
                run_result
            }
            Err(err) => Err(err),
        };

        let (state, error) = match result {
            Ok(()) => (RunState::Completed, None),
            Err(SequencerError::Cancelled) => (RunState::Cancelled, None),
            Err(err) => (RunState::Failed, Some(err.to_string())),
        };
        match state {
            RunState::Completed => {
                self.status(format!("run {} completed", self.run_id));
            }
            RunState::Cancelled => {
                self.status(format!("run {} cancelled, instruments parked", self.run_id));
            }
            _ => {
                let msg = error.as_deref().unwrap_or("unknown failure");
                tracing::error!(run_id = %self.run_id, "{msg}");
                self.sink.on_status(msg);
            }
        }
        self.publish(state);

        RunSummary {
            run_id: self.run_id,
            state,
            error,
            started_at,
            finished_at: Utc::now(),
            devices: self.outcomes,
        }
    }

    fn publish(&self, state: RunState) {
        tracing::debug!(run_id = %self.run_id, ?state, "state transition");
        let _ = self.state_tx.send(state);
    }

    fn status(&self, message: String) {
        tracing::info!(run_id = %self.run_id, "{message}");
        self.sink.on_status(&message);
    }

    fn check_cancelled(&self) -> Result<(), SequencerError> {
        if *self.cancel_rx.borrow() {
            return Err(SequencerError::Cancelled);
        }
        Ok(())
    }

    /// Acquire the four sessions in order; release in reverse on failure.
    async fn initialize(&self) -> Result<(), SequencerError> {
        if let Err(err) = self.rack.stage.home().await {
            return Err(self.release_partial(0, err).await);
        }
        if let Err(err) = self.rack.switch.disconnect_all().await {
            return Err(self.release_partial(1, err).await);
        }
        if let Err(err) = self.configure_source().await {
            return Err(self.release_partial(2, err).await);
        }
        if let Err(err) = self.rack.shutter.close().await {
            return Err(self.release_partial(3, err).await);
        }
        Ok(())
    }

    async fn configure_source(&self) -> anyhow::Result<()> {
        self.rack.smu.set_mode(SourceMode::Voltage).await?;
        self.rack
            .smu
            .set_limits(
                self.config.sweep.voltage_limit(),
                self.config.sweep.compliance_current_a,
            )
            .await?;
        Ok(())
    }

    /// Best-effort release of the first `acquired` sessions, newest first.
    async fn release_partial(&self, acquired: usize, err: anyhow::Error) -> SequencerError {
        tracing::error!(run_id = %self.run_id, "session acquisition failed: {err:#}");
        if acquired >= 3 {
            let _ = self.rack.smu.enable(false).await;
        }
        if acquired >= 2 {
            let _ = self.rack.switch.disconnect_all().await;
        }
        if acquired >= 1 {
            let _ = self.rack.stage.shutdown().await;
        }
        SequencerError::Instrument(format!("session acquisition failed: {err:#}"))
    }

    async fn run_loop(&mut self) -> Result<(), SequencerError> {
        let positions: Vec<(usize, usize)> = self.config.grid.iter_physical_order().collect();
        for (row, col) in positions {
            self.check_cancelled()?;
            let slot = self.config.grid.slot(row, col)?.clone();
            if !slot.is_measurable() {
                continue;
            }
            let Some(label) = slot.label else { continue };
            let substrate = self.config.grid.substrate_number(row, col)?;
            self.measure_substrate(substrate, &label).await?;
        }
        Ok(())
    }

    /// Sweep all six devices of one substrate, then track the best of them.
    async fn measure_substrate(
        &mut self,
        substrate: u32,
        label: &str,
    ) -> Result<(), SequencerError> {
        self.publish(RunState::Running);
        self.status(format!("substrate {label} (#{substrate}): moving into position"));
        self.rack.stage.move_to_substrate(substrate).await?;

        // (device, best p_mp, best v_mp) per swept device.
        let mut ranking: Vec<(DeviceId, f64, f64)> = Vec::with_capacity(DEVICES_PER_SUBSTRATE);
        for device_index in 1..=DEVICES_PER_SUBSTRATE {
            self.check_cancelled()?;
            let device = DeviceId {
                substrate_label: label.to_string(),
                substrate_number: substrate,
                device_index,
            };
            self.status(format!("{device}: JV sweep"));
            let jv = self.sweep_device(&device, Illumination::Light).await?;
            ranking.push((device.clone(), jv.best_power(), jv.best_voltage()));
            self.outcomes.push(DeviceOutcome {
                device,
                light: jv,
                dark: None,
                tracking: None,
            });
        }

        // Most negative signed power ranks first.
        ranking.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        ranking.truncate(self.config.devices_to_track);
        let best: Vec<DeviceId> = ranking.iter().map(|r| r.0.clone()).collect();
        self.sink.on_substrate_complete(label, &best);

        self.publish(RunState::Tracking);
        for (device, _power, v_mp) in ranking {
            self.check_cancelled()?;
            self.track_device(&device, v_mp).await?;
        }
        Ok(())
    }

    /// Position, connect, set illumination, sweep, extract, emit.
    async fn sweep_device(
        &mut self,
        device: &DeviceId,
        illumination: Illumination,
    ) -> Result<JvRecord, SequencerError> {
        let channel = self
            .config
            .connection
            .physical_channel(device.substrate_number, device.device_index)?;

        self.rack
            .stage
            .move_to_device(device.substrate_number, device.device_index)
            .await?;
        self.rack.switch.connect(channel).await?;
        match illumination {
            Illumination::Light => self.rack.shutter.open().await?,
            Illumination::Dark => self.rack.shutter.close().await?,
        }

        let (forward, reverse) = sweep::run_sweep(&*self.rack.smu, &self.config.sweep).await?;
        let perf_forward =
            metrics::extract(&forward, self.config.incident_power_w_cm2, illumination);
        let perf_reverse =
            metrics::extract(&reverse, self.config.incident_power_w_cm2, illumination);
        self.sink
            .on_sweep_complete(device, &forward, &reverse, &perf_forward, &perf_reverse);

        Ok(JvRecord {
            forward,
            reverse,
            perf_forward,
            perf_reverse,
        })
    }

    /// Dark provenance re-sweep, then MPP tracking at the best light V_mp.
    async fn track_device(
        &mut self,
        device: &DeviceId,
        seed_voltage: f64,
    ) -> Result<(), SequencerError> {
        self.status(format!("{device}: dark provenance sweep"));
        let dark = self.sweep_device(device, Illumination::Dark).await?;

        self.rack.shutter.open().await?;
        self.status(format!(
            "{device}: tracking maximum power point from {seed_voltage:.3} V"
        ));
        let sink = Arc::clone(&self.sink);
        let sample_device = device.clone();
        let series = tracking::track(
            &*self.rack.smu,
            seed_voltage,
            self.config.sweep.polarity,
            &self.config.tracking,
            &self.cancel_rx,
            move |series| sink.on_tracking_sample(&sample_device, series),
        )
        .await?;

        if let Some(outcome) = self.outcomes.iter_mut().find(|o| &o.device == device) {
            outcome.dark = Some(dark);
            outcome.tracking = Some(series);
        }
        Ok(())
    }

    /// Park everything. Each step is attempted regardless of earlier
    /// failures; problems are logged, never propagated.
    async fn teardown(&self) {
        if let Err(err) = self.rack.shutter.close().await {
            tracing::warn!("teardown: shutter close failed: {err:#}");
        }
        if let Err(err) = self.rack.switch.disconnect_all().await {
            tracing::warn!("teardown: switch matrix release failed: {err:#}");
        }
        if let Err(err) = self.rack.smu.set_output(0.0).await {
            tracing::warn!("teardown: source zeroing failed: {err:#}");
        }
        if let Err(err) = self.rack.smu.enable(false).await {
            tracing::warn!("teardown: source disable failed: {err:#}");
        }
        if let Err(err) = self.rack.stage.home().await {
            tracing::warn!("teardown: stage park failed: {err:#}");
        }
        if let Err(err) = self.rack.stage.shutdown().await {
            tracing::warn!("teardown: stage shutdown failed: {err:#}");
        }
    }
}
