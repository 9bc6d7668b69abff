// =============================================================================
// Status Reader
// =============================================================================
//
// Read-only PostgreSQL access for the status/control API server, plus the
// small writers the control endpoints need (enqueue a command, toggle the
// suspend flag, set the heartbeat interval, update broker settings). The
// reader never owns the daemon's tables; it only observes and enqueues.
// =============================================================================

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Executor, Row};
use tracing::{debug, info, warn};

use crate::config::PostgresConfig;
use crate::db::sink::ib_port_for_type;

/// Heartbeat intervals are clamped to this range (seconds).
pub const HEARTBEAT_INTERVAL_MIN: i32 = 5;
pub const HEARTBEAT_INTERVAL_MAX: i32 = 120;

/// Clamp a requested heartbeat interval into the accepted range.
pub fn clamp_heartbeat_interval(sec: i32) -> i32 {
    sec.clamp(HEARTBEAT_INTERVAL_MIN, HEARTBEAT_INTERVAL_MAX)
}

/// daemon_heartbeat row with timestamps as unix seconds.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct HeartbeatRow {
    pub last_ts: Option<f64>,
    pub hedge_running: bool,
    pub ib_connected: bool,
    pub ib_client_id: Option<i32>,
    pub next_retry_ts: Option<f64>,
    pub seconds_until_retry: Option<i32>,
    pub graceful_shutdown_at: Option<f64>,
    pub heartbeat_interval_sec: Option<i32>,
}

/// One operations row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OperationRow {
    pub id: i64,
    pub ts: Option<f64>,
    #[serde(rename = "type")]
    pub op_type: Option<String>,
    pub side: Option<String>,
    pub quantity: Option<i32>,
    pub price: Option<f64>,
    pub state_reason: Option<String>,
}

/// Filters for the operations endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationFilter<'a> {
    pub since_ts: Option<f64>,
    pub until_ts: Option<f64>,
    pub op_type: Option<&'a str>,
    pub limit: i64,
}

/// Read-only access to the daemon's tables.
pub struct StatusReader {
    pool: PgPool,
}

impl StatusReader {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password);
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute("SET lock_timeout = '5s'").await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await
            .with_context(|| {
                format!(
                    "status reader connect failed: {}:{}/{}",
                    config.host, config.port, config.database
                )
            })?;
        Ok(Self { pool })
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// The single status_current row as JSON, or None.
    pub async fn get_status_current(&self) -> Option<serde_json::Value> {
        let row = sqlx::query(
            r"SELECT daemon_state, trading_state, symbol, spot, bid, ask, net_delta,
                     stock_position, option_legs_count, daily_hedge_count, daily_pnl,
                     data_lag_ms, config_summary, ts
              FROM status_current WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| warn!(error = %e, "get_status_current failed"))
        .ok()??;

        Some(serde_json::json!({
            "daemon_state": row.get::<Option<String>, _>("daemon_state"),
            "trading_state": row.get::<Option<String>, _>("trading_state"),
            "symbol": row.get::<Option<String>, _>("symbol"),
            "spot": row.get::<Option<f64>, _>("spot"),
            "bid": row.get::<Option<f64>, _>("bid"),
            "ask": row.get::<Option<f64>, _>("ask"),
            "net_delta": row.get::<Option<f64>, _>("net_delta"),
            "stock_position": row.get::<Option<i32>, _>("stock_position"),
            "option_legs_count": row.get::<Option<i32>, _>("option_legs_count"),
            "daily_hedge_count": row.get::<Option<i32>, _>("daily_hedge_count"),
            "daily_pnl": row.get::<Option<f64>, _>("daily_pnl"),
            "data_lag_ms": row.get::<Option<f64>, _>("data_lag_ms"),
            "config_summary": row.get::<Option<String>, _>("config_summary"),
            "ts": row.get::<Option<f64>, _>("ts"),
        }))
    }

    /// daemon_run_status.suspended, or None when unavailable.
    pub async fn get_run_status(&self) -> Option<bool> {
        sqlx::query_scalar::<_, bool>("SELECT suspended FROM daemon_run_status WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| debug!(error = %e, "get_run_status failed"))
            .ok()?
    }

    /// daemon_heartbeat row id=1 with epoch-second timestamps.
    pub async fn get_daemon_heartbeat(&self) -> Option<HeartbeatRow> {
        let row = sqlx::query(
            r"
            SELECT extract(epoch FROM last_ts)::float8 AS last_ts,
                   hedge_running, ib_connected, ib_client_id,
                   extract(epoch FROM next_retry_ts)::float8 AS next_retry_ts,
                   seconds_until_retry,
                   extract(epoch FROM graceful_shutdown_at)::float8 AS graceful_shutdown_at,
                   heartbeat_interval_sec
            FROM daemon_heartbeat WHERE id = 1
            ",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| debug!(error = %e, "get_daemon_heartbeat failed"))
        .ok()??;

        Some(HeartbeatRow {
            last_ts: row.get("last_ts"),
            hedge_running: row.get::<Option<bool>, _>("hedge_running").unwrap_or(false),
            ib_connected: row.get::<Option<bool>, _>("ib_connected").unwrap_or(false),
            ib_client_id: row.get("ib_client_id"),
            next_retry_ts: row.get("next_retry_ts"),
            seconds_until_retry: row
                .get::<Option<i16>, _>("seconds_until_retry")
                .map(|v| v as i32),
            graceful_shutdown_at: row.get("graceful_shutdown_at"),
            heartbeat_interval_sec: row
                .get::<Option<i16>, _>("heartbeat_interval_sec")
                .map(|v| v as i32),
        })
    }

    /// Operations, newest first, with optional time/type filters.
    pub async fn get_operations(&self, filter: OperationFilter<'_>) -> Vec<OperationRow> {
        let limit = filter.limit.clamp(1, 1000);
        let rows = sqlx::query(
            r"
            SELECT id, ts, type, side, quantity, price, state_reason
            FROM operations
            WHERE ($1::float8 IS NULL OR ts >= $1)
              AND ($2::float8 IS NULL OR ts <= $2)
              AND ($3::text IS NULL OR type = $3)
            ORDER BY id DESC
            LIMIT $4
            ",
        )
        .bind(filter.since_ts)
        .bind(filter.until_ts)
        .bind(filter.op_type)
        .bind(limit)
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => rows
                .iter()
                .map(|row| OperationRow {
                    id: row.get("id"),
                    ts: row.get("ts"),
                    op_type: row.get("type"),
                    side: row.get("side"),
                    quantity: row.get("quantity"),
                    price: row.get("price"),
                    state_reason: row.get("state_reason"),
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "get_operations failed");
                Vec::new()
            }
        }
    }

    /// Accounts joined with their positions, as JSON for /status.
    pub async fn get_accounts_from_tables(&self) -> Vec<serde_json::Value> {
        let accounts = match sqlx::query(
            r"SELECT account_id, extract(epoch FROM updated_at)::float8 AS updated_at,
                     net_liquidation, total_cash, buying_power, summary_extra
              FROM accounts ORDER BY account_id",
        )
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                debug!(error = %e, "accounts read failed");
                return Vec::new();
            }
        };

        let mut out = Vec::with_capacity(accounts.len());
        for acc in accounts {
            let account_id: String = acc.get("account_id");
            let positions = sqlx::query(
                r"SELECT contract_key, symbol, sec_type, exchange, currency, position,
                         avg_cost, expiry, strike, option_right
                  FROM account_positions WHERE account_id = $1 ORDER BY contract_key",
            )
            .bind(&account_id)
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default();

            let positions: Vec<serde_json::Value> = positions
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "contract_key": p.get::<Option<String>, _>("contract_key"),
                        "symbol": p.get::<Option<String>, _>("symbol"),
                        "sec_type": p.get::<Option<String>, _>("sec_type"),
                        "exchange": p.get::<Option<String>, _>("exchange"),
                        "currency": p.get::<Option<String>, _>("currency"),
                        "position": p.get::<Option<f64>, _>("position"),
                        "avg_cost": p.get::<Option<f64>, _>("avg_cost"),
                        "expiry": p.get::<Option<String>, _>("expiry"),
                        "strike": p.get::<Option<f64>, _>("strike"),
                        "right": p.get::<Option<String>, _>("option_right"),
                    })
                })
                .collect();

            out.push(serde_json::json!({
                "account_id": account_id,
                "updated_at": acc.get::<Option<f64>, _>("updated_at"),
                "net_liquidation": acc.get::<Option<f64>, _>("net_liquidation"),
                "total_cash": acc.get::<Option<f64>, _>("total_cash"),
                "buying_power": acc.get::<Option<f64>, _>("buying_power"),
                "summary_extra": acc.get::<Option<serde_json::Value>, _>("summary_extra"),
                "positions": positions,
            }));
        }
        out
    }

    /// Most recent accounts.updated_at as unix seconds.
    pub async fn get_accounts_fetched_at(&self) -> Option<f64> {
        sqlx::query_scalar::<_, Option<f64>>(
            "SELECT extract(epoch FROM max(updated_at))::float8 FROM accounts",
        )
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten()
        .flatten()
    }

    /// Broker settings row for /status and /config/ib.
    pub async fn get_ib_config(&self) -> Option<serde_json::Value> {
        let row = sqlx::query("SELECT ib_host, ib_port_type FROM settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| debug!(error = %e, "get_ib_config failed"))
            .ok()??;
        let host: Option<String> = row.get("ib_host");
        let port_type: Option<String> = row.get("ib_port_type");
        let port_type = port_type.unwrap_or_else(|| "tws_paper".to_string());
        Some(serde_json::json!({
            "ib_host": host.unwrap_or_else(|| "127.0.0.1".to_string()),
            "ib_port_type": port_type,
            "ib_port": ib_port_for_type(&port_type),
        }))
    }

    /// Aggregate stats over status_history and operations, for the CLI.
    pub async fn history_stats(&self) -> Option<serde_json::Value> {
        let summary = sqlx::query(
            r"SELECT count(*) AS rows,
                     min(ts) AS first_ts,
                     max(ts) AS last_ts,
                     avg(abs(net_delta)) AS avg_abs_delta,
                     max(abs(net_delta)) AS max_abs_delta
              FROM status_history",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| warn!(error = %e, "history stats query failed"))
        .ok()?;

        let ops = sqlx::query(
            "SELECT type, count(*) AS n FROM operations GROUP BY type ORDER BY type",
        )
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();
        let ops: serde_json::Map<String, serde_json::Value> = ops
            .iter()
            .map(|row| {
                (
                    row.get::<Option<String>, _>("type").unwrap_or_default(),
                    serde_json::json!(row.get::<i64, _>("n")),
                )
            })
            .collect();

        Some(serde_json::json!({
            "history_rows": summary.get::<i64, _>("rows"),
            "first_ts": summary.get::<Option<f64>, _>("first_ts"),
            "last_ts": summary.get::<Option<f64>, _>("last_ts"),
            "avg_abs_net_delta": summary.get::<Option<f64>, _>("avg_abs_delta"),
            "max_abs_net_delta": summary.get::<Option<f64>, _>("max_abs_delta"),
            "operations": ops,
        }))
    }

    // ── Control writers ─────────────────────────────────────────────────

    /// Enqueue a command on daemon_control. Returns true on success.
    pub async fn write_control_command(&self, command: &str) -> bool {
        match sqlx::query("INSERT INTO daemon_control (command) VALUES ($1)")
            .bind(command)
            .execute(&self.pool)
            .await
        {
            Ok(_) => {
                info!(command, "control command enqueued");
                true
            }
            Err(e) => {
                warn!(error = %e, command, "control command enqueue failed");
                false
            }
        }
    }

    /// Set daemon_run_status.suspended.
    pub async fn write_run_status(&self, suspended: bool) -> bool {
        match sqlx::query(
            r"INSERT INTO daemon_run_status (id, suspended, updated_at)
              VALUES (1, $1, now())
              ON CONFLICT (id) DO UPDATE SET suspended = EXCLUDED.suspended, updated_at = now()",
        )
        .bind(suspended)
        .execute(&self.pool)
        .await
        {
            Ok(_) => {
                info!(suspended, "run status updated");
                true
            }
            Err(e) => {
                warn!(error = %e, "run status update failed");
                false
            }
        }
    }

    /// Set the heartbeat interval (clamped 5..=120 seconds).
    pub async fn write_heartbeat_interval(&self, sec: i32) -> Option<i32> {
        let clamped = clamp_heartbeat_interval(sec);
        match sqlx::query(
            r"UPDATE daemon_run_status SET heartbeat_interval_sec = $1, updated_at = now()
              WHERE id = 1",
        )
        .bind(clamped as i16)
        .execute(&self.pool)
        .await
        {
            Ok(_) => {
                info!(requested = sec, applied = clamped, "heartbeat interval updated");
                Some(clamped)
            }
            Err(e) => {
                warn!(error = %e, "heartbeat interval update failed");
                None
            }
        }
    }

    /// Update the broker settings row.
    pub async fn write_ib_config(&self, host: &str, port_type: &str) -> bool {
        match sqlx::query(
            r"INSERT INTO settings (id, ib_host, ib_port_type) VALUES (1, $1, $2)
              ON CONFLICT (id) DO UPDATE SET ib_host = EXCLUDED.ib_host,
                                             ib_port_type = EXCLUDED.ib_port_type",
        )
        .bind(host)
        .bind(port_type)
        .execute(&self.pool)
        .await
        {
            Ok(_) => {
                info!(host, port_type, "ib settings updated");
                true
            }
            Err(e) => {
                warn!(error = %e, "ib settings update failed");
                false
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_interval_clamping() {
        assert_eq!(clamp_heartbeat_interval(1), 5);
        assert_eq!(clamp_heartbeat_interval(5), 5);
        assert_eq!(clamp_heartbeat_interval(30), 30);
        assert_eq!(clamp_heartbeat_interval(120), 120);
        assert_eq!(clamp_heartbeat_interval(600), 120);
        assert_eq!(clamp_heartbeat_interval(-4), 5);
    }
}
