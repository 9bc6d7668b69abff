// =============================================================================
// PostgreSQL Status Sink
// =============================================================================
//
// Persists the daemon's observable state and consumes its control channel:
//
//   status_current / status_history  - snapshot upsert (+ optional append)
//   operations                       - hedge_intent / order_sent / fill / ...
//   daemon_control                   - command queue (stop, retry_ib, ...)
//   daemon_run_status                - suspend flag + heartbeat interval
//   daemon_heartbeat                 - single-row liveness record
//   settings                         - broker host / port type
//   accounts / account_positions     - normalized account snapshots
//
// Every connection runs with lock_timeout = '5s'. When a write on the
// single-row tables trips SQLSTATE 55P03 (a crashed predecessor still holds
// the row lock), the sink terminates the competing backends through a side
// connection and retries once. That routine lives in the free function
// `release_locks_for_tables` so the executing session is never its own
// victim.
// =============================================================================

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{ConnectOptions, Connection, Executor, Row};
use tracing::{debug, info, warn};

use crate::broker::AccountSnapshot;
use crate::config::PostgresConfig;

/// Control commands older than this are consumed but not executed, so a
/// stop queued before a crash cannot kill the restarted daemon.
pub const CONTROL_CMD_MAX_AGE_SEC: f64 = 60.0;

/// Single-row tables whose locks get force-released after a crash restart.
pub const DAEMON_LOCK_TABLES: [&str; 2] = ["daemon_heartbeat", "daemon_run_status"];

/// Broker port-type names to TCP ports.
pub fn ib_port_for_type(port_type: &str) -> u16 {
    match port_type.trim().to_lowercase().as_str() {
        "tws_live" => 7496,
        "gateway" => 4002,
        _ => 7497, // tws_paper and anything unknown
    }
}

/// NaN and infinities are not JSON- or float8-safe for monitor consumers;
/// store them as NULL.
pub fn db_f64(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite())
}

/// Stable key identifying one contract inside an account:
/// "symbol|sec_type|expiry|strike|right" for options, "symbol|sec_type|||"
/// for everything else.
pub fn contract_key(
    symbol: &str,
    sec_type: &str,
    expiry: &str,
    strike: Option<f64>,
    right: &str,
) -> String {
    if sec_type == "OPT" {
        let strike = strike.map(|s| s.to_string()).unwrap_or_default();
        format!("{symbol}|{sec_type}|{expiry}|{strike}|{right}")
    } else {
        format!("{symbol}|{sec_type}|||")
    }
}

/// Commands accepted on the daemon_control queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Stop,
    Flatten,
    RetryIb,
    RefreshAccounts,
}

impl ControlCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Flatten => "flatten",
            Self::RetryIb => "retry_ib",
            Self::RefreshAccounts => "refresh_accounts",
        }
    }

    /// Unknown commands are treated as stop for safety.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "flatten" => Self::Flatten,
            "retry_ib" => Self::RetryIb,
            "refresh_accounts" => Self::RefreshAccounts,
            "stop" => Self::Stop,
            _ => Self::Stop,
        }
    }
}

impl std::fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row for status_current / status_history.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshotRow {
    pub daemon_state: String,
    pub trading_state: String,
    pub symbol: String,
    pub spot: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub net_delta: Option<f64>,
    pub stock_position: i64,
    pub option_legs_count: i64,
    pub daily_hedge_count: i64,
    pub daily_pnl: Option<f64>,
    pub data_lag_ms: Option<f64>,
    pub config_summary: String,
    pub ts: f64,
}

/// One row for the operations table.
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub ts: f64,
    /// hedge_intent, order_sent, fill, reject, cancel.
    pub op_type: String,
    pub side: Option<String>,
    pub quantity: Option<i64>,
    pub price: Option<f64>,
    pub state_reason: Option<String>,
}

/// Fields written on each heartbeat tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatUpdate {
    pub hedge_running: bool,
    pub ib_connected: bool,
    pub ib_client_id: Option<i32>,
    pub next_retry_ts: Option<f64>,
    pub seconds_until_retry: Option<i32>,
    pub heartbeat_interval_sec: Option<i32>,
}

/// Broker connection settings stored in the settings table.
#[derive(Debug, Clone, PartialEq)]
pub struct IbConnectionSettings {
    pub host: String,
    pub port_type: String,
    pub port: u16,
}

fn is_lock_timeout(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db) = err {
        if db.code().as_deref() == Some("55P03") {
            return true;
        }
        let msg = db.message().to_lowercase();
        return msg.contains("lock timeout");
    }
    false
}

fn connect_options(config: &PostgresConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .database(&config.database)
        .username(&config.user)
        .password(&config.password)
}

// ---------------------------------------------------------------------------
// Lock release (side channel)
// ---------------------------------------------------------------------------

/// Open a fresh connection, terminate every other backend holding or
/// waiting on locks over `tables`, and return how many were terminated.
/// Runs on its own connection so the caller's session is not a candidate.
pub async fn release_locks_for_tables(config: &PostgresConfig, tables: &[&str]) -> u32 {
    let mut conn = match connect_options(config).connect().await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "lock release: connect failed");
            return 0;
        }
    };

    let table_list: Vec<String> = tables.iter().map(|t| t.to_string()).collect();
    let pids: Vec<i32> = match sqlx::query(
        r"
        SELECT DISTINCT l.pid
        FROM pg_locks l
        JOIN pg_class c ON l.relation = c.oid
        JOIN pg_stat_activity a ON l.pid = a.pid
        WHERE c.relname = ANY($1)
          AND l.pid != pg_backend_pid()
        ",
    )
    .bind(&table_list)
    .fetch_all(&mut conn)
    .await
    {
        Ok(rows) => rows.iter().map(|r| r.get::<i32, _>(0)).collect(),
        Err(e) => {
            warn!(error = %e, "lock release: query failed");
            return 0;
        }
    };

    let mut terminated = 0;
    for pid in pids {
        match sqlx::query_scalar::<_, bool>("SELECT pg_terminate_backend($1)")
            .bind(pid)
            .fetch_one(&mut conn)
            .await
        {
            Ok(true) => {
                terminated += 1;
                info!(pid, tables = ?tables, "terminated backend holding table lock");
            }
            Ok(false) => {}
            Err(e) => debug!(pid, error = %e, "failed to terminate backend"),
        }
    }
    let _ = conn.close().await;
    terminated
}

// ---------------------------------------------------------------------------
// The sink
// ---------------------------------------------------------------------------

/// Writer for all daemon-owned tables.
pub struct PostgresSink {
    pool: PgPool,
    config: PostgresConfig,
}

impl PostgresSink {
    /// Connect and make sure the schema exists. On a lock-timeout during
    /// bootstrap the competing backends are released and the bootstrap
    /// retried once.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute("SET lock_timeout = '5s'").await?;
                    Ok(())
                })
            })
            .connect_with(connect_options(config))
            .await
            .with_context(|| {
                format!(
                    "postgres sink connect failed: {}@{}:{}/{}",
                    config.user, config.host, config.port, config.database
                )
            })?;

        let sink = Self {
            pool,
            config: config.clone(),
        };

        if let Err(e) = sink.ensure_tables().await {
            if let Some(sql_err) = e.downcast_ref::<sqlx::Error>() {
                if is_lock_timeout(sql_err) {
                    let n = release_locks_for_tables(&sink.config, &DAEMON_LOCK_TABLES).await;
                    if n > 0 {
                        info!(released = n, "released stale locks; retrying schema bootstrap");
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                        sink.ensure_tables().await?;
                    } else {
                        return Err(e);
                    }
                } else {
                    return Err(e);
                }
            } else {
                return Err(e);
            }
        }

        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            "postgres sink connected"
        );
        Ok(sink)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create every table the daemon touches; idempotent.
    pub async fn ensure_tables(&self) -> Result<()> {
        let statements = [
            r"CREATE TABLE IF NOT EXISTS status_current (
                id integer PRIMARY KEY DEFAULT 1,
                daemon_state text,
                trading_state text,
                symbol text,
                spot double precision,
                bid double precision,
                ask double precision,
                net_delta double precision,
                stock_position integer,
                option_legs_count integer,
                daily_hedge_count integer,
                daily_pnl double precision,
                data_lag_ms double precision,
                config_summary text,
                ts double precision
            )",
            r"CREATE TABLE IF NOT EXISTS status_history (
                id bigserial PRIMARY KEY,
                daemon_state text,
                trading_state text,
                symbol text,
                spot double precision,
                bid double precision,
                ask double precision,
                net_delta double precision,
                stock_position integer,
                option_legs_count integer,
                daily_hedge_count integer,
                daily_pnl double precision,
                data_lag_ms double precision,
                config_summary text,
                ts double precision
            )",
            r"CREATE TABLE IF NOT EXISTS operations (
                id bigserial PRIMARY KEY,
                ts double precision,
                type text,
                side text,
                quantity integer,
                price double precision,
                state_reason text
            )",
            r"CREATE TABLE IF NOT EXISTS daemon_control (
                id bigserial PRIMARY KEY,
                command text NOT NULL,
                created_at timestamptz DEFAULT now(),
                consumed_at timestamptz
            )",
            r"CREATE TABLE IF NOT EXISTS daemon_run_status (
                id integer PRIMARY KEY DEFAULT 1,
                suspended boolean NOT NULL DEFAULT false,
                heartbeat_interval_sec smallint,
                updated_at timestamptz DEFAULT now()
            )",
            r"INSERT INTO daemon_run_status (id, suspended) VALUES (1, false)
              ON CONFLICT (id) DO NOTHING",
            r"CREATE TABLE IF NOT EXISTS daemon_heartbeat (
                id integer PRIMARY KEY DEFAULT 1,
                last_ts timestamptz NOT NULL DEFAULT now(),
                hedge_running boolean NOT NULL DEFAULT false,
                ib_connected boolean DEFAULT false,
                ib_client_id integer,
                next_retry_ts timestamptz,
                seconds_until_retry smallint,
                graceful_shutdown_at timestamptz,
                heartbeat_interval_sec smallint
            )",
            r"INSERT INTO daemon_heartbeat (id, last_ts, hedge_running) VALUES (1, now(), false)
              ON CONFLICT (id) DO NOTHING",
            r"CREATE TABLE IF NOT EXISTS settings (
                id integer PRIMARY KEY DEFAULT 1,
                ib_host text NOT NULL DEFAULT '127.0.0.1',
                ib_port_type text NOT NULL DEFAULT 'tws_paper'
            )",
            r"INSERT INTO settings (id, ib_host, ib_port_type) VALUES (1, '127.0.0.1', 'tws_paper')
              ON CONFLICT (id) DO NOTHING",
            r"CREATE TABLE IF NOT EXISTS accounts (
                account_id text PRIMARY KEY,
                updated_at timestamptz DEFAULT now(),
                net_liquidation double precision,
                total_cash double precision,
                buying_power double precision,
                summary_extra jsonb
            )",
            r"CREATE TABLE IF NOT EXISTS account_positions (
                account_id text NOT NULL,
                contract_key text NOT NULL,
                symbol text,
                sec_type text,
                exchange text,
                currency text,
                position double precision,
                avg_cost double precision,
                expiry text,
                strike double precision,
                option_right text,
                updated_at timestamptz DEFAULT now(),
                PRIMARY KEY (account_id, contract_key)
            )",
            // Older deployments predate these heartbeat/run-status columns.
            r"ALTER TABLE daemon_heartbeat ADD COLUMN IF NOT EXISTS ib_connected boolean DEFAULT false",
            r"ALTER TABLE daemon_heartbeat ADD COLUMN IF NOT EXISTS ib_client_id integer",
            r"ALTER TABLE daemon_heartbeat ADD COLUMN IF NOT EXISTS next_retry_ts timestamptz",
            r"ALTER TABLE daemon_heartbeat ADD COLUMN IF NOT EXISTS seconds_until_retry smallint",
            r"ALTER TABLE daemon_heartbeat ADD COLUMN IF NOT EXISTS graceful_shutdown_at timestamptz",
            r"ALTER TABLE daemon_heartbeat ADD COLUMN IF NOT EXISTS heartbeat_interval_sec smallint",
            r"ALTER TABLE daemon_run_status ADD COLUMN IF NOT EXISTS heartbeat_interval_sec smallint",
        ];
        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .context("schema bootstrap statement failed")?;
        }
        Ok(())
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    /// Upsert status_current (id = 1); optionally append to status_history.
    pub async fn write_snapshot(&self, snap: &StatusSnapshotRow, append_history: bool) {
        let result = async {
            sqlx::query(
                r"
                INSERT INTO status_current (
                    id, daemon_state, trading_state, symbol, spot, bid, ask,
                    net_delta, stock_position, option_legs_count,
                    daily_hedge_count, daily_pnl, data_lag_ms, config_summary, ts
                ) VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (id) DO UPDATE SET
                    daemon_state = EXCLUDED.daemon_state,
                    trading_state = EXCLUDED.trading_state,
                    symbol = EXCLUDED.symbol,
                    spot = EXCLUDED.spot,
                    bid = EXCLUDED.bid,
                    ask = EXCLUDED.ask,
                    net_delta = EXCLUDED.net_delta,
                    stock_position = EXCLUDED.stock_position,
                    option_legs_count = EXCLUDED.option_legs_count,
                    daily_hedge_count = EXCLUDED.daily_hedge_count,
                    daily_pnl = EXCLUDED.daily_pnl,
                    data_lag_ms = EXCLUDED.data_lag_ms,
                    config_summary = EXCLUDED.config_summary,
                    ts = EXCLUDED.ts
                ",
            )
            .bind(&snap.daemon_state)
            .bind(&snap.trading_state)
            .bind(&snap.symbol)
            .bind(db_f64(snap.spot))
            .bind(db_f64(snap.bid))
            .bind(db_f64(snap.ask))
            .bind(db_f64(snap.net_delta))
            .bind(snap.stock_position as i32)
            .bind(snap.option_legs_count as i32)
            .bind(snap.daily_hedge_count as i32)
            .bind(db_f64(snap.daily_pnl))
            .bind(db_f64(snap.data_lag_ms))
            .bind(&snap.config_summary)
            .bind(snap.ts)
            .execute(&self.pool)
            .await?;

            if append_history {
                sqlx::query(
                    r"
                    INSERT INTO status_history (
                        daemon_state, trading_state, symbol, spot, bid, ask,
                        net_delta, stock_position, option_legs_count,
                        daily_hedge_count, daily_pnl, data_lag_ms, config_summary, ts
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                    ",
                )
                .bind(&snap.daemon_state)
                .bind(&snap.trading_state)
                .bind(&snap.symbol)
                .bind(db_f64(snap.spot))
                .bind(db_f64(snap.bid))
                .bind(db_f64(snap.ask))
                .bind(db_f64(snap.net_delta))
                .bind(snap.stock_position as i32)
                .bind(snap.option_legs_count as i32)
                .bind(snap.daily_hedge_count as i32)
                .bind(db_f64(snap.daily_pnl))
                .bind(db_f64(snap.data_lag_ms))
                .bind(&snap.config_summary)
                .bind(snap.ts)
                .execute(&self.pool)
                .await?;
            }
            Ok::<_, sqlx::Error>(())
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, "write_snapshot failed");
        }
    }

    /// Append one operation record; failures are logged, never propagated.
    pub async fn write_operation(&self, op: &OperationRecord) {
        let result = sqlx::query(
            r"INSERT INTO operations (ts, type, side, quantity, price, state_reason)
              VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(op.ts)
        .bind(&op.op_type)
        .bind(op.side.as_deref())
        .bind(op.quantity.map(|q| q as i32))
        .bind(db_f64(op.price))
        .bind(op.state_reason.as_deref())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(error = %e, op_type = %op.op_type, "write_operation failed");
        }
    }

    // ── Control channel ─────────────────────────────────────────────────

    /// Pop the oldest unconsumed control command. Stale commands (older
    /// than [`CONTROL_CMD_MAX_AGE_SEC`]) are marked consumed but not
    /// returned. `consume_only` restricts which commands this caller will
    /// take off the queue.
    pub async fn poll_and_consume_control(
        &self,
        consume_only: Option<&[ControlCommand]>,
    ) -> Option<ControlCommand> {
        let row = match sqlx::query(
            r"
            SELECT id, command,
                   EXTRACT(EPOCH FROM (now() - created_at))::float8 AS age_sec
            FROM daemon_control
            WHERE consumed_at IS NULL
            ORDER BY id ASC
            LIMIT 1
            ",
        )
        .fetch_optional(&self.pool)
        .await
        {
            Ok(row) => row?,
            Err(e) => {
                debug!(error = %e, "poll_and_consume_control failed");
                return None;
            }
        };

        let id: i64 = row.get("id");
        let command: String = row.get("command");
        let age_sec: Option<f64> = row.get("age_sec");
        let cmd = ControlCommand::parse(&command);

        if let Some(only) = consume_only {
            if !only.contains(&cmd) {
                // Leave it queued for the process that does consume it.
                return None;
            }
        }

        let consume = sqlx::query("UPDATE daemon_control SET consumed_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await;
        if let Err(e) = consume {
            debug!(error = %e, id, "failed to mark control command consumed");
            return None;
        }

        // NULL created_at counts as stale.
        let age = age_sec.unwrap_or(f64::INFINITY);
        if age > CONTROL_CMD_MAX_AGE_SEC {
            info!(
                id,
                command = %cmd,
                age_sec = age,
                max_age_sec = CONTROL_CMD_MAX_AGE_SEC,
                "consumed stale control command; not executing"
            );
            return None;
        }

        info!(id, command = %cmd, "consumed control command");
        Some(cmd)
    }

    // ── Heartbeat / run status ──────────────────────────────────────────

    /// Update the daemon_heartbeat row; on lock timeout, release the
    /// competing backends and retry once.
    pub async fn write_daemon_heartbeat(&self, hb: &HeartbeatUpdate) {
        for attempt in 0..2 {
            let result = sqlx::query(
                r"
                UPDATE daemon_heartbeat
                SET last_ts = now(),
                    hedge_running = $1,
                    ib_connected = $2,
                    ib_client_id = $3,
                    next_retry_ts = CASE WHEN $4::float8 IS NULL THEN NULL
                                         ELSE to_timestamp($4) END,
                    seconds_until_retry = $5,
                    graceful_shutdown_at = NULL,
                    heartbeat_interval_sec = $6
                WHERE id = 1
                ",
            )
            .bind(hb.hedge_running)
            .bind(hb.ib_connected)
            .bind(hb.ib_client_id)
            .bind(hb.next_retry_ts)
            .bind(hb.seconds_until_retry.map(|s| s as i16))
            .bind(hb.heartbeat_interval_sec.map(|s| s as i16))
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => return,
                Err(e) if attempt == 0 && is_lock_timeout(&e) => {
                    let n = release_locks_for_tables(&self.config, &DAEMON_LOCK_TABLES).await;
                    if n == 0 {
                        debug!(error = %e, "heartbeat lock timeout; nothing to release");
                        return;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
                Err(e) => {
                    debug!(error = %e, "write_daemon_heartbeat failed");
                    return;
                }
            }
        }
    }

    /// Mark a clean shutdown: graceful_shutdown_at = now(), client id
    /// released so the next start can reuse id 1.
    pub async fn write_graceful_shutdown(&self) {
        for attempt in 0..2 {
            let result = sqlx::query(
                r"UPDATE daemon_heartbeat
                  SET graceful_shutdown_at = now(), last_ts = now(), ib_client_id = NULL
                  WHERE id = 1",
            )
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => {
                    info!("graceful shutdown recorded in daemon_heartbeat");
                    return;
                }
                Err(e) if attempt == 0 && is_lock_timeout(&e) => {
                    let n = release_locks_for_tables(&self.config, &DAEMON_LOCK_TABLES).await;
                    if n == 0 {
                        warn!(error = %e, "graceful shutdown write lock timeout");
                        return;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
                Err(e) => {
                    warn!(error = %e, "write_graceful_shutdown failed");
                    return;
                }
            }
        }
    }

    /// Read daemon_run_status: (suspended, heartbeat_interval_sec).
    pub async fn poll_run_status(&self) -> (bool, Option<f64>) {
        match sqlx::query(
            "SELECT suspended, heartbeat_interval_sec FROM daemon_run_status WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        {
            Ok(Some(row)) => {
                let suspended: bool = row.get("suspended");
                let interval: Option<i16> = row.get("heartbeat_interval_sec");
                (suspended, interval.map(|i| i as f64))
            }
            Ok(None) => (false, None),
            Err(e) => {
                debug!(error = %e, "poll_run_status failed");
                (false, None)
            }
        }
    }

    /// The client id recorded by the previous run, if any. A restart after
    /// an abnormal exit uses last+1 to dodge "client id in use".
    pub async fn get_last_ib_client_id(&self) -> Option<i32> {
        match sqlx::query_scalar::<_, Option<i32>>(
            "SELECT ib_client_id FROM daemon_heartbeat WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        {
            Ok(v) => v.flatten(),
            Err(e) => {
                debug!(error = %e, "get_last_ib_client_id failed");
                None
            }
        }
    }

    /// Broker host / port settings from the settings row, resolved to a
    /// TCP port. None when the row is missing or empty; caller falls back
    /// to the config file.
    pub async fn get_ib_connection_config(&self) -> Option<IbConnectionSettings> {
        match sqlx::query("SELECT ib_host, ib_port_type FROM settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some(row)) => {
                let host: Option<String> = row.get("ib_host");
                let port_type: Option<String> = row.get("ib_port_type");
                let host = host.unwrap_or_default().trim().to_string();
                if host.is_empty() {
                    return None;
                }
                let port_type = port_type
                    .unwrap_or_default()
                    .trim()
                    .to_lowercase();
                let port_type = if port_type.is_empty() {
                    "tws_paper".to_string()
                } else {
                    port_type
                };
                let port = ib_port_for_type(&port_type);
                Some(IbConnectionSettings {
                    host,
                    port_type,
                    port,
                })
            }
            Ok(None) => None,
            Err(e) => {
                debug!(error = %e, "get_ib_connection_config failed");
                None
            }
        }
    }

    // ── Accounts ────────────────────────────────────────────────────────

    /// Normalize account snapshots into accounts + account_positions.
    /// Idempotent: re-applying the same snapshot leaves the tables
    /// unchanged; rows for contracts no longer present are deleted.
    pub async fn sync_accounts(&self, snapshots: &[AccountSnapshot]) {
        for acc in snapshots {
            let account_id = acc.account_id.trim();
            if account_id.is_empty() {
                continue;
            }
            let (net_liq, total_cash, buying_power, extra) = parse_summary_floats(&acc.summary);
            let extra_json = if extra.is_empty() {
                None
            } else {
                Some(serde_json::Value::Object(
                    extra
                        .into_iter()
                        .map(|(k, v)| (k, serde_json::Value::String(v)))
                        .collect(),
                ))
            };

            let upsert = sqlx::query(
                r"
                INSERT INTO accounts (account_id, updated_at, net_liquidation, total_cash, buying_power, summary_extra)
                VALUES ($1, now(), $2, $3, $4, $5)
                ON CONFLICT (account_id) DO UPDATE SET
                    updated_at = now(),
                    net_liquidation = EXCLUDED.net_liquidation,
                    total_cash = EXCLUDED.total_cash,
                    buying_power = EXCLUDED.buying_power,
                    summary_extra = EXCLUDED.summary_extra
                ",
            )
            .bind(account_id)
            .bind(net_liq)
            .bind(total_cash)
            .bind(buying_power)
            .bind(extra_json)
            .execute(&self.pool)
            .await;
            if let Err(e) = upsert {
                warn!(error = %e, account_id, "account upsert failed");
                continue;
            }

            let mut seen_keys: Vec<String> = Vec::new();
            for pos in &acc.positions {
                let c = &pos.contract;
                let key = contract_key(&c.symbol, &c.sec_type, &c.expiry, c.strike, &c.right);
                let upsert = sqlx::query(
                    r"
                    INSERT INTO account_positions (
                        account_id, contract_key, symbol, sec_type, exchange, currency,
                        position, avg_cost, expiry, strike, option_right, updated_at
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, now())
                    ON CONFLICT (account_id, contract_key) DO UPDATE SET
                        exchange = EXCLUDED.exchange,
                        currency = EXCLUDED.currency,
                        position = EXCLUDED.position,
                        avg_cost = EXCLUDED.avg_cost,
                        expiry = EXCLUDED.expiry,
                        strike = EXCLUDED.strike,
                        option_right = EXCLUDED.option_right,
                        updated_at = now()
                    ",
                )
                .bind(account_id)
                .bind(&key)
                .bind(&c.symbol)
                .bind(&c.sec_type)
                .bind(&c.exchange)
                .bind(&c.currency)
                .bind(db_f64(Some(pos.quantity)))
                .bind(db_f64(pos.avg_cost))
                .bind(if c.expiry.is_empty() { None } else { Some(c.expiry.as_str()) })
                .bind(db_f64(c.strike))
                .bind(if c.right.is_empty() { None } else { Some(c.right.as_str()) })
                .execute(&self.pool)
                .await;
                match upsert {
                    Ok(_) => seen_keys.push(key),
                    Err(e) => warn!(error = %e, account_id, key, "position upsert failed"),
                }
            }

            // Positions closed since the last snapshot disappear.
            let delete = if seen_keys.is_empty() {
                sqlx::query("DELETE FROM account_positions WHERE account_id = $1")
                    .bind(account_id)
                    .execute(&self.pool)
                    .await
            } else {
                sqlx::query(
                    "DELETE FROM account_positions WHERE account_id = $1 AND contract_key != ALL($2)",
                )
                .bind(account_id)
                .bind(&seen_keys)
                .execute(&self.pool)
                .await
            };
            if let Err(e) = delete {
                warn!(error = %e, account_id, "stale position delete failed");
            }
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Pull the three well-known float tags out of an account summary; the
/// rest is returned as the jsonb extra map.
pub fn parse_summary_floats(
    summary: &std::collections::HashMap<String, String>,
) -> (
    Option<f64>,
    Option<f64>,
    Option<f64>,
    std::collections::HashMap<String, String>,
) {
    let mut extra = summary.clone();
    let mut take = |key: &str| -> Option<f64> {
        let v = extra.get(key)?.parse::<f64>().ok().filter(|f| f.is_finite())?;
        extra.remove(key);
        Some(v)
    };
    let net_liq = take("NetLiquidation");
    let total_cash = take("TotalCashValue");
    let buying_power = take("BuyingPower");
    (net_liq, total_cash, buying_power, extra)
}

// =============================================================================
// Unit Tests (pure helpers; table I/O is covered by integration environments)
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn port_type_mapping() {
        assert_eq!(ib_port_for_type("tws_live"), 7496);
        assert_eq!(ib_port_for_type("tws_paper"), 7497);
        assert_eq!(ib_port_for_type("gateway"), 4002);
        assert_eq!(ib_port_for_type("GATEWAY"), 4002);
        assert_eq!(ib_port_for_type("unknown"), 7497);
    }

    #[test]
    fn db_f64_drops_non_finite() {
        assert_eq!(db_f64(Some(1.5)), Some(1.5));
        assert_eq!(db_f64(Some(f64::NAN)), None);
        assert_eq!(db_f64(Some(f64::INFINITY)), None);
        assert_eq!(db_f64(Some(f64::NEG_INFINITY)), None);
        assert_eq!(db_f64(None), None);
    }

    #[test]
    fn contract_key_formats() {
        assert_eq!(
            contract_key("NVDA", "OPT", "20260320", Some(120.0), "C"),
            "NVDA|OPT|20260320|120|C"
        );
        assert_eq!(
            contract_key("NVDA", "OPT", "20260320", Some(120.5), "P"),
            "NVDA|OPT|20260320|120.5|P"
        );
        assert_eq!(contract_key("NVDA", "STK", "", None, ""), "NVDA|STK|||");
    }

    #[test]
    fn control_command_parse() {
        assert_eq!(ControlCommand::parse("stop"), ControlCommand::Stop);
        assert_eq!(ControlCommand::parse(" Flatten "), ControlCommand::Flatten);
        assert_eq!(ControlCommand::parse("retry_ib"), ControlCommand::RetryIb);
        assert_eq!(
            ControlCommand::parse("refresh_accounts"),
            ControlCommand::RefreshAccounts
        );
        // Unknown commands degrade to stop.
        assert_eq!(ControlCommand::parse("bogus"), ControlCommand::Stop);
    }

    #[test]
    fn summary_floats_extraction() {
        let mut summary = HashMap::new();
        summary.insert("NetLiquidation".to_string(), "1000000.5".to_string());
        summary.insert("TotalCashValue".to_string(), "250000".to_string());
        summary.insert("BuyingPower".to_string(), "nan".to_string());
        summary.insert("Currency".to_string(), "USD".to_string());

        let (nl, tc, bp, extra) = parse_summary_floats(&summary);
        assert_eq!(nl, Some(1000000.5));
        assert_eq!(tc, Some(250000.0));
        // NaN is not a usable float; left in extra untouched.
        assert_eq!(bp, None);
        assert!(extra.contains_key("Currency"));
        assert!(extra.contains_key("BuyingPower"));
        assert!(!extra.contains_key("NetLiquidation"));
    }
}
