// =============================================================================
// Runtime Store
// =============================================================================
//
// The single shared mutable in the process: raw broker positions, the
// underlying quote, last-hedge bookkeeping and daily counters. Broker
// callbacks write here from their own task; the hedge pipeline reads from
// the main task. Everything sits behind one mutex, and accessors copy out
// so no lock is ever held across an await.
// =============================================================================

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;

use crate::broker::BrokerPosition;

#[derive(Default)]
struct Inner {
    positions: Vec<BrokerPosition>,
    stock_position: i64,
    bid: Option<f64>,
    ask: Option<f64>,
    last: Option<f64>,
    /// Unix seconds of the most recent tick.
    last_tick_ts: Option<f64>,
    last_hedge_time: Option<f64>,
    last_hedge_price: Option<f64>,
    daily_hedge_count: u32,
    daily_hedge_date: Option<NaiveDate>,
    daily_pnl_usd: f64,
}

/// Thread-safe store updated by connector callbacks and read by the daemon.
#[derive(Default)]
pub struct RuntimeStore {
    inner: Mutex<Inner>,
}

impl RuntimeStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Positions ───────────────────────────────────────────────────────

    pub fn set_positions(&self, positions: Vec<BrokerPosition>, stock_position: i64) {
        let mut s = self.inner.lock();
        s.positions = positions;
        s.stock_position = stock_position;
    }

    pub fn positions(&self) -> Vec<BrokerPosition> {
        self.inner.lock().positions.clone()
    }

    pub fn stock_position(&self) -> i64 {
        self.inner.lock().stock_position
    }

    // ── Quotes ──────────────────────────────────────────────────────────

    /// Record a two-sided quote and stamp the tick time.
    pub fn set_underlying_quote(&self, bid: f64, ask: f64, now_ts: f64) {
        let mut s = self.inner.lock();
        s.bid = Some(bid);
        s.ask = Some(ask);
        s.last_tick_ts = Some(now_ts);
    }

    /// Record a last-trade price and stamp the tick time.
    pub fn set_underlying_price(&self, price: Option<f64>, now_ts: f64) {
        let mut s = self.inner.lock();
        s.last = price;
        s.last_tick_ts = Some(now_ts);
    }

    /// Mid of bid/ask when both sides exist, else last.
    pub fn underlying_price(&self) -> Option<f64> {
        let s = self.inner.lock();
        match (s.bid, s.ask) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => s.last,
        }
    }

    pub fn bid_ask(&self) -> (Option<f64>, Option<f64>) {
        let s = self.inner.lock();
        (s.bid, s.ask)
    }

    /// Spread as a percent of mid; None without a two-sided quote.
    pub fn spread_pct(&self) -> Option<f64> {
        let s = self.inner.lock();
        match (s.bid, s.ask) {
            (Some(b), Some(a)) if b > 0.0 && a > 0.0 && a >= b => {
                let mid = (b + a) / 2.0;
                if mid > 0.0 {
                    Some(100.0 * (a - b) / mid)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn last_tick_ts(&self) -> Option<f64> {
        self.inner.lock().last_tick_ts
    }

    // ── Hedge bookkeeping ───────────────────────────────────────────────

    pub fn set_last_hedge_time(&self, t: Option<f64>) {
        self.inner.lock().last_hedge_time = t;
    }

    pub fn last_hedge_time(&self) -> Option<f64> {
        self.inner.lock().last_hedge_time
    }

    pub fn set_last_hedge_price(&self, p: Option<f64>) {
        self.inner.lock().last_hedge_price = p;
    }

    pub fn last_hedge_price(&self) -> Option<f64> {
        self.inner.lock().last_hedge_price
    }

    // ── Daily counters ──────────────────────────────────────────────────

    /// Increment today's hedge count, resetting first when the calendar date
    /// rolled over. Returns the new count.
    pub fn inc_daily_hedge_count(&self) -> u32 {
        let today = Utc::now().date_naive();
        let mut s = self.inner.lock();
        if s.daily_hedge_date != Some(today) {
            s.daily_hedge_count = 0;
            s.daily_hedge_date = Some(today);
        }
        s.daily_hedge_count += 1;
        s.daily_hedge_count
    }

    pub fn daily_hedge_count(&self) -> u32 {
        let today = Utc::now().date_naive();
        let s = self.inner.lock();
        if s.daily_hedge_date == Some(today) {
            s.daily_hedge_count
        } else {
            0
        }
    }

    pub fn set_daily_hedge_count(&self, n: u32, as_of: Option<NaiveDate>) {
        let mut s = self.inner.lock();
        s.daily_hedge_count = n;
        s.daily_hedge_date = Some(as_of.unwrap_or_else(|| Utc::now().date_naive()));
    }

    pub fn set_daily_pnl(&self, pnl: f64) {
        self.inner.lock().daily_pnl_usd = pnl;
    }

    pub fn daily_pnl(&self) -> f64 {
        self.inner.lock().daily_pnl_usd
    }

    pub fn add_fill_pnl(&self, delta: f64) -> f64 {
        let mut s = self.inner.lock();
        s.daily_pnl_usd += delta;
        s.daily_pnl_usd
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerContract;

    #[test]
    fn quote_mid_and_spread() {
        let store = RuntimeStore::new();
        assert_eq!(store.underlying_price(), None);
        assert_eq!(store.spread_pct(), None);

        store.set_underlying_quote(99.95, 100.05, 1_700_000_000.0);
        assert_eq!(store.underlying_price(), Some(100.0));
        let spread = store.spread_pct().unwrap();
        assert!((spread - 0.1).abs() < 1e-9, "spread {spread}");
        assert_eq!(store.last_tick_ts(), Some(1_700_000_000.0));
    }

    #[test]
    fn last_price_fallback_when_one_sided() {
        let store = RuntimeStore::new();
        store.set_underlying_price(Some(101.5), 1.0);
        assert_eq!(store.underlying_price(), Some(101.5));
        assert_eq!(store.spread_pct(), None);
    }

    #[test]
    fn positions_roundtrip() {
        let store = RuntimeStore::new();
        let pos = BrokerPosition {
            contract: BrokerContract::stock("NVDA"),
            quantity: 120.0,
            avg_cost: Some(98.5),
            account: None,
        };
        store.set_positions(vec![pos], 120);
        assert_eq!(store.positions().len(), 1);
        assert_eq!(store.stock_position(), 120);
    }

    #[test]
    fn daily_hedge_count_rolls_over() {
        let store = RuntimeStore::new();
        assert_eq!(store.inc_daily_hedge_count(), 1);
        assert_eq!(store.inc_daily_hedge_count(), 2);
        assert_eq!(store.daily_hedge_count(), 2);

        // Count seeded for yesterday reads back as zero today.
        let yesterday = Utc::now().date_naive() - chrono::Duration::days(1);
        store.set_daily_hedge_count(9, Some(yesterday));
        assert_eq!(store.daily_hedge_count(), 0);
        // And the next increment restarts from one.
        assert_eq!(store.inc_daily_hedge_count(), 1);
    }

    #[test]
    fn pnl_accumulates() {
        let store = RuntimeStore::new();
        store.set_daily_pnl(-100.0);
        assert_eq!(store.add_fill_pnl(-50.0), -150.0);
        assert_eq!(store.daily_pnl(), -150.0);
    }
}
