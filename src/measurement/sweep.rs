//! Bidirectional JV sweep engine.
//!
//! Drives the source meter through one full acquisition: soak, a pass in
//! the configured first direction, then the same ladder in the opposite
//! order. Samples are converted to current density in the logical device
//! frame and returned as an immutable `(forward, reverse)` pair.
//!
//! The engine performs no retries: a failed hardware read propagates to the
//! caller and aborts the enclosing device acquisition. Cancellation is not
//! observed inside a sweep; the sequencer checks its flag between devices,
//! which bounds the latency to one sweep duration.

use crate::error::SequencerError;
use crate::hardware::capabilities::{SourceMeter, SourceMode};
use crate::measurement::{SweepDirection, SweepParameters, SweepPoint, SweepResult};
use tokio::time::{sleep, Duration};

/// Build the ascending voltage ladder from `reverse` to `forward` inclusive.
///
/// Endpoints are always present; the last step is shortened when the window
/// is not an integer multiple of `step`.
pub fn voltage_steps(reverse: f64, forward: f64, step: f64) -> Vec<f64> {
    let span = forward - reverse;
    let count = (span / step).floor() as usize;
    let mut steps = Vec::with_capacity(count + 2);
    for i in 0..=count {
        steps.push(reverse + i as f64 * step);
    }
    // Tolerance absorbs accumulated floating error at the far endpoint.
    let last = *steps.last().unwrap_or(&reverse);
    if (forward - last).abs() > step * 1e-6 {
        steps.push(forward);
    } else if let Some(last) = steps.last_mut() {
        *last = forward;
    }
    steps
}

/// Run one bidirectional sweep, returning `(forward, reverse)` results.
///
/// The forward result always holds the ascending (reverse→forward) pass and
/// the reverse result the descending pass, regardless of which was swept
/// first.
pub async fn run_sweep(
    smu: &dyn SourceMeter,
    params: &SweepParameters,
) -> Result<(SweepResult, SweepResult), SequencerError> {
    let sign = f64::from(params.polarity);

    smu.set_mode(SourceMode::Voltage).await?;
    smu.enable(true).await?;

    if params.soak_time_s > 0.0 {
        tracing::debug!(
            soak_v = params.soak_voltage,
            soak_s = params.soak_time_s,
            "soaking device"
        );
        smu.set_output(sign * params.soak_voltage).await?;
        sleep(Duration::from_secs_f64(params.soak_time_s)).await;
    }

    let ascending = voltage_steps(params.reverse_voltage, params.forward_voltage, params.step_voltage);
    let descending: Vec<f64> = ascending.iter().rev().copied().collect();

    let (forward, reverse) = match params.direction {
        SweepDirection::ReverseToForward => {
            let forward = sweep_pass(smu, &ascending, params).await?;
            let reverse = sweep_pass(smu, &descending, params).await?;
            (forward, reverse)
        }
        SweepDirection::ForwardToReverse => {
            let reverse = sweep_pass(smu, &descending, params).await?;
            let forward = sweep_pass(smu, &ascending, params).await?;
            (forward, reverse)
        }
    };

    Ok((forward, reverse))
}

/// Sample one pass over the given voltage list, in order.
async fn sweep_pass(
    smu: &dyn SourceMeter,
    voltages: &[f64],
    params: &SweepParameters,
) -> Result<SweepResult, SequencerError> {
    let sign = f64::from(params.polarity);
    let hold = Duration::from_secs_f64(params.hold_time_s);
    let mut points = Vec::with_capacity(voltages.len());

    for &v in voltages {
        smu.set_output(sign * v).await?;
        if params.hold_time_s > 0.0 {
            sleep(hold).await;
        }
        let (_measured_v, current) = smu.read().await?;
        points.push(SweepPoint {
            voltage: v,
            current_density: sign * current / params.device_area_cm2,
        });
    }

    Ok(SweepResult { points })
}
