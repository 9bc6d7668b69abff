// =============================================================================
// Self-Check Derivation
// =============================================================================
//
// Synthetic health for the monitor, derived purely from persisted rows:
//
//   self_check  : ok | degraded | blocked      (trading pipeline health)
//   status_lamp : green | yellow | red
//
// plus a daemon-level check from heartbeat freshness. Pure functions so the
// rules are testable without a database.
// =============================================================================

use serde::Serialize;

use crate::db::HeartbeatRow;

/// Heartbeats older than this mean the daemon is not alive.
pub const DAEMON_ALIVE_MAX_AGE_SEC: f64 = 35.0;

/// Default data-lag threshold when the config does not provide one.
const DEFAULT_DATA_LAG_THRESHOLD_MS: f64 = 5000.0;

/// Trading-pipeline health verdict.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SelfCheck {
    pub self_check: &'static str,
    pub block_reasons: Vec<String>,
    pub status_lamp: &'static str,
}

impl SelfCheck {
    fn blocked(reason: &str) -> Self {
        Self {
            self_check: "blocked",
            block_reasons: vec![reason.to_string()],
            status_lamp: "red",
        }
    }

    fn degraded(reason: &str) -> Self {
        Self {
            self_check: "degraded",
            block_reasons: vec![reason.to_string()],
            status_lamp: "yellow",
        }
    }

    fn ok() -> Self {
        Self {
            self_check: "ok",
            block_reasons: Vec::new(),
            status_lamp: "green",
        }
    }
}

/// Derive self_check / status_lamp from the status_current row.
pub fn derive_self_check(
    row: Option<&serde_json::Value>,
    data_lag_threshold_ms: Option<f64>,
    trading_suspended: Option<bool>,
) -> SelfCheck {
    let threshold = data_lag_threshold_ms.unwrap_or(DEFAULT_DATA_LAG_THRESHOLD_MS);

    let Some(row) = row else {
        return SelfCheck::blocked("no_status");
    };

    let daemon_state = row
        .get("daemon_state")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_uppercase();
    if daemon_state != "RUNNING" && daemon_state != "RUNNING_SUSPENDED" {
        return SelfCheck::blocked("daemon_not_running");
    }

    let suspended = trading_suspended.unwrap_or(false) || daemon_state == "RUNNING_SUSPENDED";
    if suspended {
        return SelfCheck::degraded("trading_suspended");
    }

    if let Some(lag) = row.get("data_lag_ms").and_then(|v| v.as_f64()) {
        if lag > threshold {
            return SelfCheck::degraded("data_stale");
        }
    }

    let trading_state = row
        .get("trading_state")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_uppercase();
    if matches!(
        trading_state.as_str(),
        "PAUSE_COST" | "RISK_HALT" | "STALE" | "FORCE_HEDGE"
    ) {
        return SelfCheck::degraded(&format!("trading_state_{}", trading_state.to_lowercase()));
    }

    SelfCheck::ok()
}

/// Daemon-level health verdict from the heartbeat row.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DaemonSelfCheck {
    pub daemon_self_check: &'static str,
    pub daemon_lamp: &'static str,
    pub daemon_block_reasons: Vec<String>,
}

/// Derive the daemon check. `daemon_alive` must already incorporate the
/// heartbeat-age rule (age < [`DAEMON_ALIVE_MAX_AGE_SEC`]).
pub fn derive_daemon_self_check(heartbeat: Option<(&HeartbeatRow, bool)>) -> DaemonSelfCheck {
    let Some((hb, daemon_alive)) = heartbeat else {
        return DaemonSelfCheck {
            daemon_self_check: "blocked",
            daemon_lamp: "red",
            daemon_block_reasons: vec!["no_heartbeat".to_string()],
        };
    };
    if !daemon_alive {
        return DaemonSelfCheck {
            daemon_self_check: "blocked",
            daemon_lamp: "red",
            daemon_block_reasons: vec!["daemon_not_running".to_string()],
        };
    }
    if !hb.ib_connected {
        return DaemonSelfCheck {
            daemon_self_check: "degraded",
            daemon_lamp: "yellow",
            daemon_block_reasons: vec!["ib_not_connected".to_string()],
        };
    }
    DaemonSelfCheck {
        daemon_self_check: "ok",
        daemon_lamp: "green",
        daemon_block_reasons: Vec::new(),
    }
}

/// Heartbeat-age liveness rule.
pub fn daemon_alive(last_ts: Option<f64>, now_ts: f64) -> bool {
    match last_ts {
        Some(ts) => now_ts - ts < DAEMON_ALIVE_MAX_AGE_SEC,
        None => false,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn row(daemon_state: &str, trading_state: &str, data_lag_ms: f64) -> serde_json::Value {
        serde_json::json!({
            "daemon_state": daemon_state,
            "trading_state": trading_state,
            "data_lag_ms": data_lag_ms,
        })
    }

    #[test]
    fn no_row_is_blocked_red() {
        let sc = derive_self_check(None, None, None);
        assert_eq!(sc.self_check, "blocked");
        assert_eq!(sc.status_lamp, "red");
        assert_eq!(sc.block_reasons, vec!["no_status"]);
    }

    #[test]
    fn daemon_not_running_is_blocked() {
        let r = row("STOPPED", "MONITOR", 100.0);
        let sc = derive_self_check(Some(&r), None, None);
        assert_eq!(sc.self_check, "blocked");
        assert_eq!(sc.block_reasons, vec!["daemon_not_running"]);
    }

    #[test]
    fn suspended_is_degraded_yellow() {
        let r = row("RUNNING", "MONITOR", 100.0);
        let sc = derive_self_check(Some(&r), None, Some(true));
        assert_eq!(sc.self_check, "degraded");
        assert_eq!(sc.status_lamp, "yellow");
        assert_eq!(sc.block_reasons, vec!["trading_suspended"]);

        // RUNNING_SUSPENDED reported by the daemon itself also counts.
        let r = row("RUNNING_SUSPENDED", "MONITOR", 100.0);
        let sc = derive_self_check(Some(&r), None, None);
        assert_eq!(sc.block_reasons, vec!["trading_suspended"]);
    }

    #[test]
    fn stale_data_is_degraded() {
        let r = row("RUNNING", "MONITOR", 9000.0);
        let sc = derive_self_check(Some(&r), Some(5000.0), Some(false));
        assert_eq!(sc.self_check, "degraded");
        assert_eq!(sc.block_reasons, vec!["data_stale"]);
    }

    #[test]
    fn degraded_trading_states() {
        for ts in ["PAUSE_COST", "RISK_HALT", "STALE", "FORCE_HEDGE"] {
            let r = row("RUNNING", ts, 100.0);
            let sc = derive_self_check(Some(&r), None, Some(false));
            assert_eq!(sc.self_check, "degraded", "state {ts}");
            assert_eq!(
                sc.block_reasons,
                vec![format!("trading_state_{}", ts.to_lowercase())]
            );
        }
    }

    #[test]
    fn healthy_row_is_ok_green() {
        let r = row("RUNNING", "MONITOR", 100.0);
        let sc = derive_self_check(Some(&r), None, Some(false));
        assert_eq!(sc.self_check, "ok");
        assert_eq!(sc.status_lamp, "green");
        assert!(sc.block_reasons.is_empty());
    }

    #[test]
    fn daemon_check_from_heartbeat() {
        assert_eq!(
            derive_daemon_self_check(None).daemon_block_reasons,
            vec!["no_heartbeat"]
        );

        let hb = HeartbeatRow {
            last_ts: Some(1000.0),
            ib_connected: true,
            ..HeartbeatRow::default()
        };
        let dead = derive_daemon_self_check(Some((&hb, false)));
        assert_eq!(dead.daemon_self_check, "blocked");
        assert_eq!(dead.daemon_block_reasons, vec!["daemon_not_running"]);

        let alive = derive_daemon_self_check(Some((&hb, true)));
        assert_eq!(alive.daemon_self_check, "ok");
        assert_eq!(alive.daemon_lamp, "green");

        let hb_no_ib = HeartbeatRow {
            ib_connected: false,
            ..hb
        };
        let degraded = derive_daemon_self_check(Some((&hb_no_ib, true)));
        assert_eq!(degraded.daemon_self_check, "degraded");
        assert_eq!(degraded.daemon_block_reasons, vec!["ib_not_connected"]);
    }

    #[test]
    fn alive_window_is_35_seconds() {
        assert!(daemon_alive(Some(1000.0), 1030.0));
        assert!(!daemon_alive(Some(1000.0), 1035.0));
        assert!(!daemon_alive(Some(1000.0), 1100.0));
        assert!(!daemon_alive(None, 1000.0));
    }
}
