use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PreservationMode {
    Normal,
    SelfPreserving,
}

/// Tuning for the renewal-rate check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreservationParams {
    pub renewal_interval_secs: u64,
    pub renewal_threshold: f64,
    /// Weight of the newest sample in the moving average, in `(0, 1]`.
    pub smoothing: f64,
}

impl Default for PreservationParams {
    fn default() -> Self {
        Self {
            renewal_interval_secs: 30,
            renewal_threshold: 0.85,
            smoothing: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalRates {
    pub mode: PreservationMode,
    pub expected_per_min: f64,
    pub actual_per_min: f64,
    pub threshold_per_min: f64,
}

#[derive(Debug)]
struct RateState {
    average: Option<f64>,
    rates: RenewalRates,
}

/// Tracks the fleet's heartbeat rate and decides whether the eviction sweep
/// may run.
///
/// Renewals are counted lock-free as they arrive. On every tick the count
/// is turned into a per-minute sample and folded into an exponentially
/// weighted average, which is compared with what the current fleet should
/// be sending. When too few heartbeats arrive the node assumes the network
/// is at fault rather than the instances and stops evicting.
#[derive(Debug)]
pub struct SelfPreservation {
    renewals: AtomicU64,
    state: Mutex<RateState>,
}

impl Default for SelfPreservation {
    fn default() -> Self {
        Self::new()
    }
}

impl SelfPreservation {
    pub fn new() -> Self {
        Self {
            renewals: AtomicU64::new(0),
            state: Mutex::new(RateState {
                average: None,
                rates: RenewalRates {
                    mode: PreservationMode::Normal,
                    expected_per_min: 0.0,
                    actual_per_min: 0.0,
                    threshold_per_min: 0.0,
                },
            }),
        }
    }

    pub fn record_renewal(&self) {
        self.renewals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mode(&self) -> PreservationMode {
        self.state.lock().rates.mode
    }

    pub fn is_active(&self) -> bool {
        self.mode() == PreservationMode::SelfPreserving
    }

    pub fn rates(&self) -> RenewalRates {
        self.state.lock().rates
    }

    /// Closes the current measurement window of length `elapsed` and
    /// re-evaluates the mode for a fleet of `active_instances`.
    pub fn evaluate(
        &self,
        active_instances: usize,
        elapsed: Duration,
        params: &PreservationParams,
    ) -> PreservationMode {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return self.mode();
        }
        let count = self.renewals.swap(0, Ordering::Relaxed);
        let sample = count as f64 * 60.0 / secs;

        let interval = params.renewal_interval_secs.max(1) as f64;
        let expected = active_instances as f64 * (60.0 / interval);
        let threshold = expected * params.renewal_threshold;
        let smoothing = params.smoothing.clamp(f64::EPSILON, 1.0);

        let mut state = self.state.lock();
        let average = match state.average {
            Some(previous) => smoothing * sample + (1.0 - smoothing) * previous,
            None => sample,
        };
        state.average = Some(average);

        let mode = if expected > 0.0 && average < threshold {
            PreservationMode::SelfPreserving
        } else {
            PreservationMode::Normal
        };

        if mode != state.rates.mode {
            match mode {
                PreservationMode::SelfPreserving => warn!(
                    "Entering self-preservation: {:.1} renewals/min against {:.1} required ({} instances)",
                    average, threshold, active_instances
                ),
                PreservationMode::Normal => info!(
                    "Leaving self-preservation: {:.1} renewals/min against {:.1} required",
                    average, threshold
                ),
            }
        }

        state.rates = RenewalRates {
            mode,
            expected_per_min: expected,
            actual_per_min: average,
            threshold_per_min: threshold,
        };
        mode
    }
}
