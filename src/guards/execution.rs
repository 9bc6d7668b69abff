// =============================================================================
// Execution Guard
// =============================================================================
//
// Stateful order-send gate consulted immediately before a hedge order goes
// out. Checks run in a fixed order and the first failure wins:
//
//   1. circuit_breaker       (daily loss limit tripped)
//   2. outside_rth           (when trading_hours_only)
//   3. earnings_blackout
//   4. cooldown              (bypassed when force_hedge)
//   5. max_daily_hedge_count
//   6. max_position          (post-trade |position| over the cap)
//   7. spread_too_wide
//   8. min_price_move
//
// Daily counters reset automatically when the calendar day rolls over. The
// circuit breaker latches and only clears by explicit reset.
// =============================================================================

use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::America::New_York;
use parking_lot::Mutex;
use tracing::warn;

use crate::broker::OrderSide;
use crate::config::{EarningsConfig, HedgeIntentConfig, RiskConfig};

/// Settings applied to the guard; rebuilt on config hot-reload.
#[derive(Debug, Clone)]
pub struct GuardSettings {
    pub cooldown_sec: u64,
    pub max_daily_hedge_count: u32,
    pub max_position_shares: i64,
    pub max_daily_loss_usd: f64,
    pub max_net_delta_shares: Option<f64>,
    pub max_spread_pct: Option<f64>,
    pub min_price_move_pct: f64,
    pub earnings_dates: Vec<NaiveDate>,
    pub blackout_days_before: i64,
    pub blackout_days_after: i64,
    pub trading_hours_only: bool,
}

impl GuardSettings {
    pub fn from_config(
        intent: &HedgeIntentConfig,
        risk: &RiskConfig,
        earnings: &EarningsConfig,
    ) -> Self {
        Self {
            cooldown_sec: intent.cooldown_sec,
            max_daily_hedge_count: risk.max_daily_hedge_count,
            max_position_shares: risk.max_position_shares,
            max_daily_loss_usd: risk.max_daily_loss_usd,
            max_net_delta_shares: risk.max_net_delta_shares,
            max_spread_pct: risk.max_spread_pct,
            min_price_move_pct: intent.min_price_move_pct,
            earnings_dates: earnings
                .dates
                .iter()
                .filter_map(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok())
                .collect(),
            blackout_days_before: earnings.blackout_days_before,
            blackout_days_after: earnings.blackout_days_after,
            trading_hours_only: risk.trading_hours_only,
        }
    }
}

struct Inner {
    settings: GuardSettings,
    last_hedge_time: Option<f64>,
    daily_hedge_count: u32,
    daily_hedge_date: Option<NaiveDate>,
    circuit_breaker: bool,
}

/// Order-send gate for the Hedge Execution FSM.
pub struct ExecutionGuard {
    inner: Mutex<Inner>,
}

impl ExecutionGuard {
    pub fn new(settings: GuardSettings) -> Self {
        Self {
            inner: Mutex::new(Inner {
                settings,
                last_hedge_time: None,
                daily_hedge_count: 0,
                daily_hedge_date: None,
                circuit_breaker: false,
            }),
        }
    }

    // ── Seeding / hot reload ────────────────────────────────────────────

    /// Replace settings wholesale (config hot reload). Mutable counters are
    /// untouched.
    pub fn update_config(&self, settings: GuardSettings) {
        self.inner.lock().settings = settings;
    }

    pub fn set_last_hedge_time(&self, t: Option<f64>) {
        self.inner.lock().last_hedge_time = t;
    }

    pub fn set_daily_hedge_count(&self, n: u32, as_of: Option<NaiveDate>) {
        let mut s = self.inner.lock();
        s.daily_hedge_count = n;
        s.daily_hedge_date = Some(as_of.unwrap_or_else(|| Utc::now().date_naive()));
    }

    pub fn set_circuit_breaker(&self, tripped: bool) {
        self.inner.lock().circuit_breaker = tripped;
    }

    /// Trip the breaker when daily P&L breaches the loss limit.
    pub fn set_daily_pnl(&self, pnl_usd: f64) {
        let mut s = self.inner.lock();
        if pnl_usd <= -s.settings.max_daily_loss_usd {
            s.circuit_breaker = true;
            warn!(
                daily_pnl = pnl_usd,
                limit = -s.settings.max_daily_loss_usd,
                "circuit breaker tripped by daily loss"
            );
        }
    }

    // ── Read access (used by retry_allowed and the status snapshot) ─────

    pub fn daily_hedge_count(&self) -> u32 {
        self.inner.lock().daily_hedge_count
    }

    pub fn max_daily_hedge_count(&self) -> u32 {
        self.inner.lock().settings.max_daily_hedge_count
    }

    pub fn circuit_breaker(&self) -> bool {
        self.inner.lock().circuit_breaker
    }

    // ── RTH check ───────────────────────────────────────────────────────

    /// True when `now` falls inside 09:30-16:00 US/Eastern.
    pub fn is_rth_et(now: DateTime<Utc>) -> bool {
        let et = now.with_timezone(&New_York);
        let hm = (et.hour(), et.minute());
        hm >= (9, 30) && hm < (16, 0)
    }

    // ── The gate ────────────────────────────────────────────────────────

    /// Decide whether a hedge order may be sent. Returns `(allowed, reason)`
    /// where `reason` is "ok" or the first failing gate.
    #[allow(clippy::too_many_arguments)]
    pub fn allow_hedge(
        &self,
        now_ts: f64,
        current_stock_position: i64,
        side: OrderSide,
        quantity: i64,
        _portfolio_delta: Option<f64>,
        spot: Option<f64>,
        last_hedge_price: Option<f64>,
        spread_pct: Option<f64>,
        force_hedge: bool,
    ) -> (bool, &'static str) {
        let now_utc = unix_to_utc(now_ts);
        let today = now_utc.with_timezone(&New_York).date_naive();

        let mut s = self.inner.lock();
        reset_daily_if_new_day(&mut s, today);

        if s.circuit_breaker {
            return (false, "circuit_breaker");
        }

        if s.settings.trading_hours_only && !Self::is_rth_et(now_utc) {
            return (false, "outside_rth");
        }

        if in_earnings_blackout(&s.settings, today) {
            return (false, "earnings_blackout");
        }

        if !force_hedge {
            if let Some(last) = s.last_hedge_time {
                if now_ts - last < s.settings.cooldown_sec as f64 {
                    return (false, "cooldown");
                }
            }
        }

        if s.daily_hedge_count >= s.settings.max_daily_hedge_count {
            return (false, "max_daily_hedge_count");
        }

        let after_position = current_stock_position + side.sign() * quantity;
        if after_position.abs() > s.settings.max_position_shares {
            return (false, "max_position");
        }

        if let (Some(max_spread), Some(spread)) = (s.settings.max_spread_pct, spread_pct) {
            if spread > max_spread {
                return (false, "spread_too_wide");
            }
        }

        if s.settings.min_price_move_pct > 0.0 {
            if let (Some(spot), Some(last)) = (spot, last_hedge_price) {
                if last > 0.0 {
                    let move_pct = 100.0 * (spot - last).abs() / last;
                    if move_pct < s.settings.min_price_move_pct {
                        return (false, "min_price_move");
                    }
                }
            }
        }

        (true, "ok")
    }

    /// Optimistic update after an order goes out: bump today's count and
    /// stamp the cooldown clock.
    pub fn record_hedge_sent(&self, now_ts: f64) {
        let today = unix_to_utc(now_ts).with_timezone(&New_York).date_naive();
        let mut s = self.inner.lock();
        reset_daily_if_new_day(&mut s, today);
        s.daily_hedge_count += 1;
        s.daily_hedge_date = Some(today);
        s.last_hedge_time = Some(now_ts);
    }
}

fn unix_to_utc(ts: f64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts as i64, 0).single().unwrap_or_else(Utc::now)
}

fn reset_daily_if_new_day(s: &mut Inner, today: NaiveDate) {
    if let Some(d) = s.daily_hedge_date {
        if d != today {
            s.daily_hedge_count = 0;
            s.daily_hedge_date = Some(today);
        }
    }
}

fn in_earnings_blackout(settings: &GuardSettings, today: NaiveDate) -> bool {
    settings.earnings_dates.iter().any(|ed| {
        let start = *ed - chrono::Duration::days(settings.blackout_days_before);
        let end = *ed + chrono::Duration::days(settings.blackout_days_after);
        start <= today && today <= end
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EarningsConfig, HedgeIntentConfig, RiskConfig};

    /// A Wednesday, 18:00 UTC = 13:00 or 14:00 ET depending on DST; either
    /// way inside RTH. Used where the RTH gate is active.
    const RTH_TS: f64 = 1_750_266_000.0; // 2025-06-18 17:00:00 UTC (13:00 EDT)

    fn settings(trading_hours_only: bool) -> GuardSettings {
        let intent = HedgeIntentConfig {
            cooldown_sec: 60,
            min_price_move_pct: 0.0,
            ..HedgeIntentConfig::default()
        };
        let risk = RiskConfig {
            trading_hours_only,
            ..RiskConfig::default()
        };
        GuardSettings::from_config(&intent, &risk, &EarningsConfig::default())
    }

    fn guard() -> ExecutionGuard {
        ExecutionGuard::new(settings(false))
    }

    fn allow(
        g: &ExecutionGuard,
        now: f64,
        pos: i64,
        side: OrderSide,
        qty: i64,
        force: bool,
    ) -> (bool, &'static str) {
        g.allow_hedge(now, pos, side, qty, None, Some(100.0), None, Some(0.05), force)
    }

    #[test]
    fn ok_path() {
        let g = guard();
        assert_eq!(allow(&g, RTH_TS, 0, OrderSide::Sell, 50, false), (true, "ok"));
    }

    #[test]
    fn circuit_breaker_first() {
        let g = guard();
        g.set_daily_pnl(-6000.0);
        assert!(g.circuit_breaker());
        assert_eq!(
            allow(&g, RTH_TS, 0, OrderSide::Buy, 10, false),
            (false, "circuit_breaker")
        );
        // Force does not bypass the breaker.
        assert_eq!(
            allow(&g, RTH_TS, 0, OrderSide::Buy, 10, true),
            (false, "circuit_breaker")
        );
    }

    #[test]
    fn breaker_only_trips_at_limit() {
        let g = guard();
        g.set_daily_pnl(-4999.0);
        assert!(!g.circuit_breaker());
        g.set_daily_pnl(-5000.0);
        assert!(g.circuit_breaker());
    }

    #[test]
    fn rth_gate() {
        let g = ExecutionGuard::new(settings(true));
        // 03:00 UTC = overnight in New York.
        let overnight = 1_750_215_600.0; // 2025-06-18 03:00:00 UTC
        assert_eq!(
            allow(&g, overnight, 0, OrderSide::Buy, 10, false),
            (false, "outside_rth")
        );
        assert_eq!(allow(&g, RTH_TS, 0, OrderSide::Buy, 10, false), (true, "ok"));
    }

    #[test]
    fn is_rth_boundaries() {
        // 2025-06-18 13:29 UTC is 09:29 EDT; 13:30 UTC is 09:30 EDT.
        let before_open = Utc.timestamp_opt(1_750_253_340, 0).unwrap();
        let at_open = Utc.timestamp_opt(1_750_253_400, 0).unwrap();
        let at_close = Utc.timestamp_opt(1_750_276_800, 0).unwrap(); // 16:00 EDT
        assert!(!ExecutionGuard::is_rth_et(before_open));
        assert!(ExecutionGuard::is_rth_et(at_open));
        assert!(!ExecutionGuard::is_rth_et(at_close));
    }

    #[test]
    fn cooldown_blocks_until_elapsed_and_force_bypasses() {
        let g = guard();
        g.record_hedge_sent(RTH_TS);
        // 10 seconds later: still cooling down.
        assert_eq!(
            allow(&g, RTH_TS + 10.0, 0, OrderSide::Sell, 10, false),
            (false, "cooldown")
        );
        // Force hedge bypasses the cooldown.
        assert_eq!(
            allow(&g, RTH_TS + 10.0, 0, OrderSide::Sell, 10, true),
            (true, "ok")
        );
        // Exactly at the cooldown boundary the gate opens.
        assert_eq!(
            allow(&g, RTH_TS + 60.0, 0, OrderSide::Sell, 10, false),
            (true, "ok")
        );
    }

    #[test]
    fn daily_count_limit() {
        let g = guard();
        g.set_daily_hedge_count(50, None);
        assert_eq!(
            allow(&g, RTH_TS, 0, OrderSide::Buy, 10, false),
            (false, "max_daily_hedge_count")
        );
    }

    #[test]
    fn daily_count_resets_on_new_day() {
        let g = guard();
        let yesterday = unix_to_utc(RTH_TS).date_naive() - chrono::Duration::days(2);
        g.set_daily_hedge_count(50, Some(yesterday));
        assert_eq!(allow(&g, RTH_TS, 0, OrderSide::Buy, 10, false), (true, "ok"));
        assert_eq!(g.daily_hedge_count(), 0);
    }

    #[test]
    fn max_position_post_trade() {
        let g = guard();
        // 1990 + 20 = 2010 > 2000.
        assert_eq!(
            allow(&g, RTH_TS, 1990, OrderSide::Buy, 20, false),
            (false, "max_position")
        );
        // Selling from a long position reduces exposure: allowed.
        assert_eq!(
            allow(&g, RTH_TS, 1990, OrderSide::Sell, 20, false),
            (true, "ok")
        );
        // Max position is enforced even under force hedge.
        assert_eq!(
            allow(&g, RTH_TS, 1990, OrderSide::Buy, 20, true),
            (false, "max_position")
        );
    }

    #[test]
    fn spread_gate() {
        let mut s = settings(false);
        s.max_spread_pct = Some(0.2);
        let g = ExecutionGuard::new(s);
        let verdict = g.allow_hedge(
            RTH_TS,
            0,
            OrderSide::Buy,
            10,
            None,
            Some(100.0),
            None,
            Some(0.3),
            false,
        );
        assert_eq!(verdict, (false, "spread_too_wide"));
    }

    #[test]
    fn min_price_move_gate() {
        let mut s = settings(false);
        s.min_price_move_pct = 0.5;
        let g = ExecutionGuard::new(s);
        // Moved 0.1% since the last hedge: blocked.
        let verdict = g.allow_hedge(
            RTH_TS,
            0,
            OrderSide::Buy,
            10,
            None,
            Some(100.1),
            Some(100.0),
            None,
            false,
        );
        assert_eq!(verdict, (false, "min_price_move"));
        // Moved 1%: allowed.
        let verdict = g.allow_hedge(
            RTH_TS,
            0,
            OrderSide::Buy,
            10,
            None,
            Some(101.0),
            Some(100.0),
            None,
            false,
        );
        assert_eq!(verdict, (true, "ok"));
        // Without a prior hedge price the gate is open.
        let verdict =
            g.allow_hedge(RTH_TS, 0, OrderSide::Buy, 10, None, Some(100.0), None, None, false);
        assert_eq!(verdict, (true, "ok"));
    }

    #[test]
    fn earnings_blackout_window() {
        let today = unix_to_utc(RTH_TS)
            .with_timezone(&New_York)
            .date_naive();
        let earnings = EarningsConfig {
            dates: vec![(today + chrono::Duration::days(2)).format("%Y-%m-%d").to_string()],
            blackout_days_before: 3,
            blackout_days_after: 1,
        };
        let s = GuardSettings::from_config(
            &HedgeIntentConfig::default(),
            &RiskConfig {
                trading_hours_only: false,
                ..RiskConfig::default()
            },
            &earnings,
        );
        let g = ExecutionGuard::new(s);
        assert_eq!(
            allow(&g, RTH_TS, 0, OrderSide::Buy, 10, false),
            (false, "earnings_blackout")
        );
    }

    #[test]
    fn record_hedge_sent_bumps_count_and_clock() {
        let g = guard();
        g.record_hedge_sent(RTH_TS);
        g.record_hedge_sent(RTH_TS + 120.0);
        assert_eq!(g.daily_hedge_count(), 2);
        // Cooldown measured from the second hedge.
        assert_eq!(
            allow(&g, RTH_TS + 150.0, 0, OrderSide::Buy, 10, false),
            (false, "cooldown")
        );
    }
}
