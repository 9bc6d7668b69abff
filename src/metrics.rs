// =============================================================================
// In-memory metrics: hedge counters, slippage, data lag, spread bucket,
// delta magnitude, current state. Logged periodically by the orchestrator.
// =============================================================================

use parking_lot::Mutex;
use tracing::info;

#[derive(Default)]
struct Inner {
    hedge_count: u64,
    slippage_sum: f64,
    slippage_n: u64,
    last_data_lag_ms: Option<f64>,
    last_spread_bucket: Option<String>,
    last_delta_abs: Option<f64>,
    last_gamma: Option<f64>,
    current_state: Option<String>,
    reprice_count: u64,
    safe_mode_count: u64,
}

/// Counters and gauges for one daemon process.
#[derive(Default)]
pub struct Metrics {
    inner: Mutex<Inner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_hedge_count(&self) -> u64 {
        let mut s = self.inner.lock();
        s.hedge_count += 1;
        s.hedge_count
    }

    pub fn hedge_count(&self) -> u64 {
        self.inner.lock().hedge_count
    }

    pub fn record_slippage(&self, slippage: f64) {
        let mut s = self.inner.lock();
        s.slippage_n += 1;
        s.slippage_sum += slippage;
    }

    pub fn avg_slippage(&self) -> Option<f64> {
        let s = self.inner.lock();
        if s.slippage_n == 0 {
            None
        } else {
            Some(s.slippage_sum / s.slippage_n as f64)
        }
    }

    pub fn set_data_lag_ms(&self, ms: Option<f64>) {
        self.inner.lock().last_data_lag_ms = ms;
    }

    pub fn set_spread_bucket(&self, bucket: Option<&str>) {
        self.inner.lock().last_spread_bucket = bucket.map(str::to_string);
    }

    pub fn set_delta_abs(&self, delta_abs: Option<f64>) {
        self.inner.lock().last_delta_abs = delta_abs;
    }

    pub fn set_gamma(&self, gamma: Option<f64>) {
        self.inner.lock().last_gamma = gamma;
    }

    pub fn set_current_state(&self, state: Option<&str>) {
        self.inner.lock().current_state = state.map(str::to_string);
    }

    pub fn inc_reprice_count(&self) -> u64 {
        let mut s = self.inner.lock();
        s.reprice_count += 1;
        s.reprice_count
    }

    pub fn inc_safe_mode_count(&self) -> u64 {
        let mut s = self.inner.lock();
        s.safe_mode_count += 1;
        s.safe_mode_count
    }

    /// Log the current values at info level.
    pub fn log_snapshot(&self) {
        let s = self.inner.lock();
        info!(
            hedge_count = s.hedge_count,
            avg_slippage = if s.slippage_n > 0 {
                Some(s.slippage_sum / s.slippage_n as f64)
            } else {
                None
            },
            data_lag_ms = s.last_data_lag_ms,
            spread_bucket = s.last_spread_bucket.as_deref(),
            delta_abs = s.last_delta_abs,
            gamma = s.last_gamma,
            current_state = s.current_state.as_deref(),
            reprice_count = s.reprice_count,
            safe_mode_count = s.safe_mode_count,
            "metrics"
        );
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        assert_eq!(m.inc_hedge_count(), 1);
        assert_eq!(m.inc_hedge_count(), 2);
        assert_eq!(m.hedge_count(), 2);
        assert_eq!(m.inc_reprice_count(), 1);
        assert_eq!(m.inc_safe_mode_count(), 1);
    }

    #[test]
    fn slippage_average() {
        let m = Metrics::new();
        assert_eq!(m.avg_slippage(), None);
        m.record_slippage(0.02);
        m.record_slippage(0.04);
        assert!((m.avg_slippage().unwrap() - 0.03).abs() < 1e-12);
    }
}
