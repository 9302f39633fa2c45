//! Result sinks.
//!
//! The sequencer publishes intermediate results through the [`ResultSink`]
//! trait. Sink calls are synchronous and fire-and-forget: a sink must never
//! block the acquisition worker, so implementations either do trivial work
//! inline or forward into a queue. Sink-side failures are logged and
//! swallowed; a broken export never aborts a run.
//!
//! Provided sinks:
//! - [`ChannelSink`]: forwards events over an unbounded tokio mpsc channel
//!   so a slow consumer queues instead of stalling the hardware loop
//! - [`CsvSink`]: appends sweep samples and derived metrics to CSV files
//!   (behind the `storage_csv` feature)
//! - [`NullSink`]: discards everything

use crate::measurement::{DeviceId, PerformanceRecord, SweepResult, TrackingSeries};

/// Callback surface consumed by the acquisition worker.
///
/// Calls arrive in a strict order: every event for device N of a substrate
/// is emitted before any event for device N+1, and tracking samples for one
/// device arrive in increasing elapsed time.
pub trait ResultSink: Send + Sync {
    /// A bidirectional sweep and both derived records are complete.
    fn on_sweep_complete(
        &self,
        device: &DeviceId,
        forward: &SweepResult,
        reverse: &SweepResult,
        perf_forward: &PerformanceRecord,
        perf_reverse: &PerformanceRecord,
    );

    /// One MPP tracking sample was accepted; `series_so_far` holds every
    /// sample taken for this device, newest last.
    fn on_tracking_sample(&self, device: &DeviceId, series_so_far: &TrackingSeries);

    /// Human-readable progress or failure message.
    fn on_status(&self, message: &str);

    /// All six devices of a substrate are swept; `best` is ordered most
    /// negative power first and truncated to the configured tracking count.
    fn on_substrate_complete(&self, substrate_label: &str, best: &[DeviceId]);
}

/// Sink that drops every event.
pub struct NullSink;

impl ResultSink for NullSink {
    fn on_sweep_complete(
        &self,
        _device: &DeviceId,
        _forward: &SweepResult,
        _reverse: &SweepResult,
        _perf_forward: &PerformanceRecord,
        _perf_reverse: &PerformanceRecord,
    ) {
    }

    fn on_tracking_sample(&self, _device: &DeviceId, _series_so_far: &TrackingSeries) {}

    fn on_status(&self, _message: &str) {}

    fn on_substrate_complete(&self, _substrate_label: &str, _best: &[DeviceId]) {}
}

/// Owned event forwarded by [`ChannelSink`].
#[derive(Debug, Clone)]
pub enum AcquisitionEvent {
    /// A device finished both sweep directions.
    SweepComplete {
        /// Device the sweep belongs to.
        device: DeviceId,
        /// Ascending pass.
        forward: SweepResult,
        /// Descending pass.
        reverse: SweepResult,
        /// Record derived from the forward pass.
        perf_forward: PerformanceRecord,
        /// Record derived from the reverse pass.
        perf_reverse: PerformanceRecord,
    },
    /// One tracking sample was accepted.
    TrackingUpdate {
        /// Device being tracked.
        device: DeviceId,
        /// Every sample taken so far, newest last.
        series: TrackingSeries,
    },
    /// Progress or failure message.
    Status(String),
    /// A substrate's sweep phase finished.
    SubstrateComplete {
        /// Substrate label.
        substrate_label: String,
        /// Devices selected for tracking, best first.
        best: Vec<DeviceId>,
    },
}

/// Forwards events into an unbounded mpsc channel.
///
/// The unbounded send never blocks; if the receiver lags, events queue. A
/// closed receiver is logged once per event and otherwise ignored.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<AcquisitionEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiving half for the consumer.
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<AcquisitionEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: AcquisitionEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("acquisition event receiver dropped, event discarded");
        }
    }
}

impl ResultSink for ChannelSink {
    fn on_sweep_complete(
        &self,
        device: &DeviceId,
        forward: &SweepResult,
        reverse: &SweepResult,
        perf_forward: &PerformanceRecord,
        perf_reverse: &PerformanceRecord,
    ) {
        self.send(AcquisitionEvent::SweepComplete {
            device: device.clone(),
            forward: forward.clone(),
            reverse: reverse.clone(),
            perf_forward: perf_forward.clone(),
            perf_reverse: perf_reverse.clone(),
        });
    }

    fn on_tracking_sample(&self, device: &DeviceId, series_so_far: &TrackingSeries) {
        self.send(AcquisitionEvent::TrackingUpdate {
            device: device.clone(),
            series: series_so_far.clone(),
        });
    }

    fn on_status(&self, message: &str) {
        self.send(AcquisitionEvent::Status(message.to_string()));
    }

    fn on_substrate_complete(&self, substrate_label: &str, best: &[DeviceId]) {
        self.send(AcquisitionEvent::SubstrateComplete {
            substrate_label: substrate_label.to_string(),
            best: best.to_vec(),
        });
    }
}

#[cfg(feature = "storage_csv")]
pub use self::csv_sink::CsvSink;

#[cfg(feature = "storage_csv")]
mod csv_sink {
    use super::ResultSink;
    use crate::measurement::{DeviceId, PerformanceRecord, SweepResult, TrackingSeries};
    use std::path::Path;
    use std::sync::Mutex;

    /// Appends acquisition output to three CSV files in a directory:
    /// `sweeps.csv`, `metrics.csv`, and `tracking.csv`.
    ///
    /// Write errors are logged and swallowed so the hardware loop is never
    /// disturbed by storage problems.
    pub struct CsvSink {
        sweeps: Mutex<csv::Writer<std::fs::File>>,
        metrics: Mutex<csv::Writer<std::fs::File>>,
        tracking: Mutex<csv::Writer<std::fs::File>>,
    }

    impl CsvSink {
        /// Create the output directory and the three writers with headers.
        pub fn create(dir: &Path) -> Result<Self, crate::error::SequencerError> {
            std::fs::create_dir_all(dir)?;

            let mut sweeps = csv::Writer::from_path(dir.join("sweeps.csv"))?;
            sweeps.write_record([
                "substrate",
                "device",
                "pass",
                "voltage_v",
                "current_density_a_cm2",
            ])?;

            let mut metrics = csv::Writer::from_path(dir.join("metrics.csv"))?;
            metrics.write_record([
                "substrate",
                "device",
                "pass",
                "illumination",
                "voc_v",
                "jsc_a_cm2",
                "v_mp_v",
                "p_mp_w_cm2",
                "fill_factor",
                "efficiency_pct",
                "timestamp",
            ])?;

            let mut tracking = csv::Writer::from_path(dir.join("tracking.csv"))?;
            tracking.write_record(["substrate", "device", "elapsed_s", "voltage_v", "power_w"])?;

            Ok(Self {
                sweeps: Mutex::new(sweeps),
                metrics: Mutex::new(metrics),
                tracking: Mutex::new(tracking),
            })
        }

        fn write_pass(
            writer: &mut csv::Writer<std::fs::File>,
            device: &DeviceId,
            pass: &str,
            sweep: &SweepResult,
        ) -> Result<(), csv::Error> {
            for point in &sweep.points {
                writer.write_record([
                    device.substrate_label.as_str(),
                    &device.device_index.to_string(),
                    pass,
                    &point.voltage.to_string(),
                    &point.current_density.to_string(),
                ])?;
            }
            writer.flush()?;
            Ok(())
        }

        fn write_record(
            writer: &mut csv::Writer<std::fs::File>,
            device: &DeviceId,
            pass: &str,
            record: &PerformanceRecord,
        ) -> Result<(), csv::Error> {
            let illumination = match record.illumination {
                crate::measurement::Illumination::Light => "light",
                crate::measurement::Illumination::Dark => "dark",
            };
            writer.write_record([
                device.substrate_label.as_str(),
                &device.device_index.to_string(),
                pass,
                illumination,
                &record.voc.to_string(),
                &record.jsc.to_string(),
                &record.v_mp.to_string(),
                &record.p_mp.to_string(),
                &record.fill_factor.to_string(),
                &record.efficiency.to_string(),
                &record.timestamp.to_rfc3339(),
            ])?;
            writer.flush()?;
            Ok(())
        }
    }

    impl ResultSink for CsvSink {
        fn on_sweep_complete(
            &self,
            device: &DeviceId,
            forward: &SweepResult,
            reverse: &SweepResult,
            perf_forward: &PerformanceRecord,
            perf_reverse: &PerformanceRecord,
        ) {
            let result = (|| -> Result<(), csv::Error> {
                if let Ok(mut writer) = self.sweeps.lock() {
                    Self::write_pass(&mut writer, device, "forward", forward)?;
                    Self::write_pass(&mut writer, device, "reverse", reverse)?;
                }
                if let Ok(mut writer) = self.metrics.lock() {
                    Self::write_record(&mut writer, device, "forward", perf_forward)?;
                    Self::write_record(&mut writer, device, "reverse", perf_reverse)?;
                }
                Ok(())
            })();
            if let Err(err) = result {
                tracing::warn!(%device, "csv sink write failed: {err}");
            }
        }

        fn on_tracking_sample(&self, device: &DeviceId, series_so_far: &TrackingSeries) {
            let Some(sample) = series_so_far.samples.last() else {
                return;
            };
            let result = (|| -> Result<(), csv::Error> {
                if let Ok(mut writer) = self.tracking.lock() {
                    writer.write_record([
                        device.substrate_label.as_str(),
                        &device.device_index.to_string(),
                        &sample.elapsed_s.to_string(),
                        &sample.voltage.to_string(),
                        &sample.power.to_string(),
                    ])?;
                    writer.flush()?;
                }
                Ok(())
            })();
            if let Err(err) = result {
                tracing::warn!(%device, "csv sink write failed: {err}");
            }
        }

        fn on_status(&self, message: &str) {
            tracing::info!("{message}");
        }

        fn on_substrate_complete(&self, substrate_label: &str, best: &[DeviceId]) {
            tracing::info!(
                substrate = substrate_label,
                tracked = best.len(),
                "substrate sweep phase complete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{Illumination, SweepPoint};
    use chrono::Utc;

    fn sample_device() -> DeviceId {
        DeviceId {
            substrate_label: "batch1-s1".into(),
            substrate_number: 1,
            device_index: 2,
        }
    }

    fn sample_sweep() -> SweepResult {
        SweepResult {
            points: vec![
                SweepPoint {
                    voltage: 0.0,
                    current_density: -0.127,
                },
                SweepPoint {
                    voltage: 0.6,
                    current_density: 0.0,
                },
            ],
        }
    }

    fn sample_record() -> PerformanceRecord {
        PerformanceRecord {
            voc: 0.6,
            jsc: -0.127,
            v_mp: 0.3,
            p_mp: -0.019,
            fill_factor: 0.25,
            efficiency: 19.0,
            illumination: Illumination::Light,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelSink::new();
        let device = sample_device();
        let sweep = sample_sweep();
        let record = sample_record();

        sink.on_status("moving to substrate 1");
        sink.on_sweep_complete(&device, &sweep, &sweep, &record, &record);
        sink.on_substrate_complete("batch1-s1", std::slice::from_ref(&device));

        assert!(matches!(
            rx.try_recv().unwrap(),
            AcquisitionEvent::Status(_)
        ));
        match rx.try_recv().unwrap() {
            AcquisitionEvent::SweepComplete { device: d, .. } => assert_eq!(d, device),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            AcquisitionEvent::SubstrateComplete { .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        // Must not panic or block.
        sink.on_status("late event");
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_csv_sink_writes_rows() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::create(dir.path()).unwrap();
        let device = sample_device();
        let sweep = sample_sweep();
        let record = sample_record();

        sink.on_sweep_complete(&device, &sweep, &sweep, &record, &record);
        sink.on_tracking_sample(
            &device,
            &TrackingSeries {
                samples: vec![crate::measurement::TrackingSample {
                    elapsed_s: 0.5,
                    voltage: 0.3,
                    power: -0.003,
                }],
            },
        );

        let sweeps = std::fs::read_to_string(dir.path().join("sweeps.csv")).unwrap();
        // Header + 2 points per pass, both passes.
        assert_eq!(sweeps.lines().count(), 5);
        let metrics = std::fs::read_to_string(dir.path().join("metrics.csv")).unwrap();
        assert_eq!(metrics.lines().count(), 3);
        assert!(metrics.contains("light"));
        let tracking = std::fs::read_to_string(dir.path().join("tracking.csv")).unwrap();
        assert_eq!(tracking.lines().count(), 2);
    }
}
