// Adaptive bitrate controller: EWMA bandwidth estimation with two
// half-lives, conservative min() combination, and hysteresis on switches.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use presentation::VariantId;

use crate::config::AbrConfig;

/// Samples shorter than this carry little signal and skew the average.
const MIN_SAMPLE_BYTES: usize = 16_000;
/// Below this many total bytes the default estimate is used.
const MIN_TOTAL_BYTES: u64 = 128_000;
/// Half-life of the spike-sensitive average, seconds of download time.
const FAST_HALF_LIFE: f64 = 2.0;
/// Half-life of the smoothing average, seconds of download time.
const SLOW_HALF_LIFE: f64 = 5.0;

/// Exponentially weighted moving average with zero-bias correction.
#[derive(Debug, Clone)]
struct Ewma {
    half_life: f64,
    estimate: f64,
    total_weight: f64,
}

impl Ewma {
    fn new(half_life: f64) -> Self {
        Self {
            half_life,
            estimate: 0.0,
            total_weight: 0.0,
        }
    }

    fn sample(&mut self, weight: f64, value: f64) {
        let alpha = 0.5f64.powf(weight / self.half_life);
        self.estimate = alpha * self.estimate + (1.0 - alpha) * value;
        self.total_weight += weight;
    }

    fn estimate(&self) -> f64 {
        // Correct for the zero initialization while few samples exist.
        let zero_factor = 1.0 - 0.5f64.powf(self.total_weight / self.half_life);
        if zero_factor <= 0.0 {
            0.0
        } else {
            self.estimate / zero_factor
        }
    }
}

/// Dual-half-life bandwidth estimator; the min of the two averages resists
/// single-segment spikes.
#[derive(Debug, Clone)]
pub struct BandwidthEstimator {
    fast: Ewma,
    slow: Ewma,
    total_bytes: u64,
    default_estimate: f64,
}

impl BandwidthEstimator {
    pub fn new(default_estimate: f64) -> Self {
        Self {
            fast: Ewma::new(FAST_HALF_LIFE),
            slow: Ewma::new(SLOW_HALF_LIFE),
            total_bytes: 0,
            default_estimate,
        }
    }

    pub fn sample(&mut self, duration_ms: u64, bytes: usize) {
        if bytes < MIN_SAMPLE_BYTES {
            return;
        }
        let seconds = (duration_ms as f64 / 1000.0).max(0.001);
        let bandwidth = bytes as f64 * 8.0 / seconds;
        self.total_bytes += bytes as u64;
        self.fast.sample(seconds, bandwidth);
        self.slow.sample(seconds, bandwidth);
    }

    pub fn estimate(&self) -> f64 {
        if self.total_bytes < MIN_TOTAL_BYTES {
            return self.default_estimate;
        }
        self.fast.estimate().min(self.slow.estimate())
    }

    pub fn has_good_estimate(&self) -> bool {
        self.total_bytes >= MIN_TOTAL_BYTES
    }
}

/// A variant as the controller sees it: identity, cost, eligibility.
#[derive(Debug, Clone)]
pub struct AbrVariant {
    pub id: VariantId,
    pub bandwidth: u64,
    pub playable: bool,
}

/// Invoked with the new variant when the controller decides to switch.
pub type SwitchCallback = Arc<dyn Fn(VariantId) + Send + Sync>;

struct AbrState {
    config: AbrConfig,
    estimator: BandwidthEstimator,
    variants: Vec<AbrVariant>,
    current: Option<AbrVariant>,
    enabled: bool,
    last_switch: Option<Instant>,
    switch_callback: Option<SwitchCallback>,
}

/// The ABR controller. Thread-safe; the streaming side calls
/// `segment_downloaded` from the network observer while the facade calls
/// the selection operations.
pub struct AbrController {
    state: Mutex<AbrState>,
}

impl AbrController {
    pub fn new(config: AbrConfig) -> Self {
        let estimator = BandwidthEstimator::new(config.default_bandwidth_estimate);
        Self {
            state: Mutex::new(AbrState {
                config,
                estimator,
                variants: Vec::new(),
                current: None,
                enabled: false,
                last_switch: None,
                switch_callback: None,
            }),
        }
    }

    pub fn set_switch_callback(&self, callback: SwitchCallback) {
        self.state.lock().switch_callback = Some(callback);
    }

    pub fn set_variants(&self, variants: Vec<AbrVariant>) {
        let mut state = self.state.lock();
        if let Some(current) = &state.current {
            // Keep the current selection in sync with the new variant set.
            let id = current.id;
            state.current = variants.iter().find(|v| v.id == id).cloned();
        }
        state.variants = variants;
    }

    pub fn enable(&self) {
        let mut state = self.state.lock();
        state.enabled = true;
        state.last_switch = None;
    }

    pub fn disable(&self) {
        self.state.lock().enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn get_bandwidth_estimate(&self) -> f64 {
        self.state.lock().estimator.estimate()
    }

    /// Picks the best playable variant for the current estimate and records
    /// it as the active choice.
    pub fn choose_variant(&self) -> Option<VariantId> {
        let mut state = self.state.lock();
        let chosen = Self::select(&state)?;
        state.current = Some(chosen.clone());
        Some(chosen.id)
    }

    fn select(state: &AbrState) -> Option<AbrVariant> {
        let estimate = state.estimator.estimate();
        let current_bandwidth = state.current.as_ref().map(|v| v.bandwidth);
        let mut candidates: Vec<&AbrVariant> =
            state.variants.iter().filter(|v| v.playable).collect();
        candidates.sort_by_key(|v| v.bandwidth);

        let mut best: Option<&AbrVariant> = candidates.first().copied();
        for variant in &candidates {
            let target = match current_bandwidth {
                Some(current) if variant.bandwidth > current => {
                    state.config.bandwidth_upgrade_target
                }
                _ => state.config.bandwidth_downgrade_target,
            };
            if (variant.bandwidth as f64) <= estimate * target {
                best = Some(variant);
            }
        }
        best.cloned()
    }

    /// Feeds a completed download into the estimator and, when enabled and
    /// outside the hysteresis window, notifies a switch.
    pub fn segment_downloaded(&self, duration_ms: u64, bytes: usize) {
        let (callback, choice) = {
            let mut state = self.state.lock();
            state.estimator.sample(duration_ms, bytes);
            if !state.enabled {
                return;
            }
            let interval_ok = match state.last_switch {
                Some(at) => at.elapsed().as_secs_f64() >= state.config.switch_interval,
                None => true,
            };
            if !interval_ok {
                return;
            }
            let Some(choice) = Self::select(&state) else {
                return;
            };
            if state.current.as_ref().map(|v| v.id) == Some(choice.id) {
                return;
            }
            debug!(
                variant = choice.id,
                bandwidth = choice.bandwidth,
                estimate = state.estimator.estimate(),
                "ABR switching variant"
            );
            state.last_switch = Some(Instant::now());
            state.current = Some(choice.clone());
            (state.switch_callback.clone(), choice)
        };
        if let Some(callback) = callback {
            callback(choice.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn variants(bandwidths: &[u64]) -> Vec<AbrVariant> {
        bandwidths
            .iter()
            .enumerate()
            .map(|(i, b)| AbrVariant {
                id: i as VariantId,
                bandwidth: *b,
                playable: true,
            })
            .collect()
    }

    fn config() -> AbrConfig {
        AbrConfig {
            switch_interval: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn single_sample_converges_to_sample_rate() {
        let mut estimator = BandwidthEstimator::new(500_000.0);
        // 400 KB over 8 s ≈ 400 kbps.
        estimator.sample(8_000, 400_000);
        let estimate = estimator.estimate();
        assert!((estimate - 400_000.0).abs() < 1_000.0, "estimate {estimate}");
    }

    #[test]
    fn tiny_segments_are_ignored() {
        let mut estimator = BandwidthEstimator::new(500_000.0);
        estimator.sample(10, 500);
        assert_eq!(estimator.estimate(), 500_000.0);
        assert!(!estimator.has_good_estimate());
    }

    #[test]
    fn estimate_is_min_of_fast_and_slow() {
        let mut estimator = BandwidthEstimator::new(500_000.0);
        // Long slow stretch, then one large fast spike: the slow average
        // holds the estimate down.
        for _ in 0..8 {
            estimator.sample(2_000, 250_000); // 1 Mbps
        }
        estimator.sample(500, 5_000_000); // 80 Mbps spike
        let estimate = estimator.estimate();
        assert!(estimate < 10_000_000.0, "estimate {estimate}");
    }

    #[test]
    fn downshift_after_slow_segment() {
        // Default estimate 500 kbps, variants at 200/400/600/1200 kbps.
        let controller = AbrController::new(config());
        controller.set_variants(variants(&[200_000, 400_000, 600_000, 1_200_000]));

        // Initial choice against the default estimate: 400k (≤ 500k·0.95).
        assert_eq!(controller.choose_variant(), Some(1));

        // One 400 kbps segment over 8 s drags the estimate to ~400 kbps;
        // 400k no longer fits under 400k·0.95, so the 200k variant wins.
        controller.segment_downloaded(8_000, 400_000);
        assert_eq!(controller.choose_variant(), Some(0));
    }

    #[test]
    fn upgrade_uses_stricter_target() {
        let controller = AbrController::new(config());
        controller.set_variants(variants(&[100_000, 850_000, 900_000]));
        controller.enable();
        assert_eq!(controller.choose_variant(), Some(0));

        // Estimate ~1 Mbps: 850k ≤ 1M·0.85 qualifies, 900k does not.
        controller.segment_downloaded(4_000, 500_000);
        assert_eq!(controller.choose_variant(), Some(1));
    }

    #[test]
    fn chosen_bandwidth_never_exceeds_downgrade_bound() {
        let controller = AbrController::new(config());
        controller.set_variants(variants(&[100_000, 300_000, 700_000, 2_000_000]));
        for (ms, bytes) in [(2_000u64, 200_000usize), (4_000, 160_000), (1_000, 400_000)] {
            controller.segment_downloaded(ms, bytes);
            let chosen = controller.choose_variant().unwrap();
            let estimate = controller.get_bandwidth_estimate();
            let state = controller.state.lock();
            let bandwidth = state.variants[chosen as usize].bandwidth as f64;
            // The floor variant is exempt: something must be chosen.
            if chosen != 0 {
                assert!(bandwidth <= estimate * 0.95, "{bandwidth} vs {estimate}");
            }
        }
    }

    #[test]
    fn disabled_controller_emits_no_switches() {
        let controller = AbrController::new(config());
        controller.set_variants(variants(&[100_000, 400_000]));
        let switches = Arc::new(AtomicU32::new(0));
        let switches_clone = switches.clone();
        controller.set_switch_callback(Arc::new(move |_| {
            switches_clone.fetch_add(1, Ordering::SeqCst);
        }));

        controller.segment_downloaded(8_000, 4_000_000);
        assert_eq!(switches.load(Ordering::SeqCst), 0);

        controller.enable();
        controller.segment_downloaded(8_000, 4_000_000);
        assert_eq!(switches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hysteresis_suppresses_rapid_switches() {
        let controller = AbrController::new(AbrConfig {
            switch_interval: 3600.0,
            ..Default::default()
        });
        controller.set_variants(variants(&[100_000, 400_000, 4_000_000]));
        controller.enable();
        let switches = Arc::new(AtomicU32::new(0));
        let switches_clone = switches.clone();
        controller.set_switch_callback(Arc::new(move |_| {
            switches_clone.fetch_add(1, Ordering::SeqCst);
        }));

        controller.segment_downloaded(8_000, 4_000_000);
        assert_eq!(switches.load(Ordering::SeqCst), 1);
        // Another sample immediately after stays inside the interval.
        controller.segment_downloaded(8_000, 200_000);
        assert_eq!(switches.load(Ordering::SeqCst), 1);
    }
}
