// =============================================================================
// Hedge Daemon Orchestrator
// =============================================================================
//
// Wires the broker, the runtime store, the persistence sink and the three
// FSMs into one event-driven loop:
//
//   broker callback (broker task) -> AppEvent channel -> main loop ->
//   RuntimeStore update -> eval_hedge -> classify -> Trading FSM ->
//   intent -> gates -> Hedge Execution FSM -> place_order
//
// All FSMs live on the main task; broker callbacks only update the store
// and post events. One tokio mutex serializes eval_hedge so a single hedge
// cycle is in flight at a time. The daemon FSM drives the outer loop:
// a connect failure or mid-run disconnect parks the daemon in WAITING_IB
// with a retry schedule, it never exits because the broker is unreachable.
// =============================================================================

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::broker::{AckReport, Broker, FillReport, OrderType, TickerUpdate};
use crate::config::HedgeConfig;
use crate::db::{
    ControlCommand, HeartbeatUpdate, OperationRecord, PostgresSink, StatusSnapshotRow,
};
use crate::fsm::{
    DaemonFsm, DaemonState, HedgeExecState, HedgeExecutionFsm, TargetPositionEvent, TradingEvent,
    TradingFsm, TradingState,
};
use crate::guards::{ExecutionGuard, GuardSettings, TradingGuard};
use crate::metrics::Metrics;
use crate::portfolio::{self, compute_greeks};
use crate::state::{
    MarketInputs, PositionInputs, StateClassifier, StateSnapshot,
};
use crate::store::RuntimeStore;
use crate::strategy::{apply_hedge_gates, gamma_scalper_intent, should_output_target};

/// Cap on the mid-price history fed to the market-regime classifier.
const PRICE_HISTORY_CAP: usize = 120;

/// Events posted onto the main loop.
#[derive(Debug)]
pub enum AppEvent {
    Tick(TickerUpdate),
    PositionsChanged,
    Ack(AckReport),
    Fill(FillReport),
}

/// Pick the broker client id for this session: the previous run's id plus
/// one when a crashed session may still hold it, else the configured id.
pub fn next_client_id(last_recorded: Option<i32>, configured: i32) -> i32 {
    match last_recorded {
        Some(last) => last + 1,
        None => configured,
    }
}

/// The daemon application.
pub struct HedgeApp {
    config: RwLock<HedgeConfig>,
    config_path: Option<PathBuf>,
    broker: Arc<dyn Broker>,
    store: Arc<RuntimeStore>,
    metrics: Arc<Metrics>,
    guard: Arc<ExecutionGuard>,
    sink: Option<Arc<PostgresSink>>,

    daemon_fsm: Mutex<DaemonFsm>,
    trading_fsm: Mutex<TradingFsm>,
    exec_fsm: Mutex<HedgeExecutionFsm>,

    /// Serializes hedge cycles.
    hedge_lock: tokio::sync::Mutex<()>,
    events_tx: mpsc::UnboundedSender<AppEvent>,
    shutdown: Notify,
    price_history: Mutex<VecDeque<f64>>,
    last_config_mtime: Mutex<Option<std::time::SystemTime>>,
}

impl HedgeApp {
    /// Build the app. The returned receiver feeds [`HedgeApp::run`].
    pub fn new(
        config: HedgeConfig,
        config_path: Option<PathBuf>,
        broker: Arc<dyn Broker>,
        sink: Option<Arc<PostgresSink>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<AppEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let settings = GuardSettings::from_config(
            &config.resolved_hedge_intent(),
            &config.resolved_risk(),
            &config.resolved_earnings(),
        );
        let app = Arc::new(Self {
            config: RwLock::new(config),
            config_path,
            broker,
            store: Arc::new(RuntimeStore::new()),
            metrics: Arc::new(Metrics::new()),
            guard: Arc::new(ExecutionGuard::new(settings)),
            sink,
            daemon_fsm: Mutex::new(DaemonFsm::new()),
            trading_fsm: Mutex::new(TradingFsm::new()),
            exec_fsm: Mutex::new(HedgeExecutionFsm::new()),
            hedge_lock: tokio::sync::Mutex::new(()),
            events_tx,
            shutdown: Notify::new(),
            price_history: Mutex::new(VecDeque::new()),
            last_config_mtime: Mutex::new(None),
        });
        (app, events_rx)
    }

    pub fn store(&self) -> &Arc<RuntimeStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn guard(&self) -> &Arc<ExecutionGuard> {
        &self.guard
    }

    pub fn daemon_state(&self) -> DaemonState {
        self.daemon_fsm.lock().current()
    }

    pub fn trading_state(&self) -> TradingState {
        self.trading_fsm.lock().state()
    }

    pub fn exec_state(&self) -> HedgeExecState {
        self.exec_fsm.lock().state()
    }

    pub fn event_sender(&self) -> mpsc::UnboundedSender<AppEvent> {
        self.events_tx.clone()
    }

    /// Request a graceful stop from any task (signal handler, control).
    pub fn request_stop(&self) {
        self.daemon_fsm.lock().request_stop();
        self.shutdown.notify_waiters();
    }

    fn now_ts() -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }

    // =========================================================================
    // Outer daemon loop
    // =========================================================================

    /// State-driven daemon loop; returns when STOPPED.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<AppEvent>) -> Result<()> {
        loop {
            let current = self.daemon_state();
            let next = match current {
                DaemonState::Idle => DaemonState::Connecting,
                DaemonState::Connecting => self.handle_connecting().await,
                DaemonState::WaitingIb => self.handle_waiting_ib().await,
                DaemonState::Connected => self.handle_connected().await,
                DaemonState::Running | DaemonState::RunningSuspended => {
                    self.handle_running(&mut events).await
                }
                DaemonState::Stopping => self.handle_stopping().await,
                DaemonState::Stopped => break,
            };
            let mut fsm = self.daemon_fsm.lock();
            // request_stop may have moved the FSM while the handler ran.
            if fsm.current() != current && fsm.current() != next {
                continue;
            }
            if fsm.current() == next {
                continue;
            }
            if !fsm.transition(next) && fsm.current() == current {
                warn!(from = %current, to = %next, "daemon handler produced invalid transition; stopping");
                fsm.request_stop();
            }
        }
        info!("daemon stopped");
        Ok(())
    }

    async fn handle_connecting(&self) -> DaemonState {
        let timeout = Duration::from_secs_f64(self.config.read().ib.connect_timeout.max(1.0));
        info!(timeout_sec = timeout.as_secs(), "connecting to broker");
        match tokio::time::timeout(timeout, self.broker.connect()).await {
            Ok(true) => {
                self.exec_fsm.lock().set_connected(true);
                DaemonState::Connected
            }
            Ok(false) => {
                warn!("broker connect failed; waiting with retry schedule");
                DaemonState::WaitingIb
            }
            Err(_) => {
                warn!(timeout_sec = timeout.as_secs(), "broker connect timed out");
                DaemonState::WaitingIb
            }
        }
    }

    /// Up but disconnected: write heartbeat with the retry countdown, honor
    /// stop / retry_ib from the control queue, retry on schedule.
    async fn handle_waiting_ib(&self) -> DaemonState {
        let retry_interval = self.config.read().daemon.ib_retry_interval_sec.max(1.0);
        let next_retry_ts = Self::now_ts() + retry_interval;
        self.write_heartbeat(HeartbeatUpdate {
            hedge_running: false,
            ib_connected: false,
            ib_client_id: None,
            next_retry_ts: Some(next_retry_ts),
            seconds_until_retry: Some(retry_interval.round() as i32),
            heartbeat_interval_sec: None,
        })
        .await;

        if let Some(sink) = &self.sink {
            match sink
                .poll_and_consume_control(Some(&[ControlCommand::Stop, ControlCommand::RetryIb]))
                .await
            {
                Some(ControlCommand::Stop) => {
                    self.daemon_fsm.lock().request_stop();
                    return DaemonState::Stopping;
                }
                Some(ControlCommand::RetryIb) => {
                    info!("retry_ib consumed; reconnecting now");
                    return DaemonState::Connecting;
                }
                _ => {}
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(retry_interval)) => DaemonState::Connecting,
            _ = self.shutdown.notified() => DaemonState::Stopping,
        }
    }

    /// Connected: prime positions and spot, install subscriptions, arm the
    /// trading FSM.
    async fn handle_connected(&self) -> DaemonState {
        match self.refresh_positions().await {
            Ok(()) => {
                // A reconnect completes the micro FSM's recovery cycle.
                let mut exec = self.exec_fsm.lock();
                if exec.state() == HedgeExecState::Recover {
                    exec.on_positions_resynced();
                }
            }
            Err(e) => warn!(error = %e, "initial position refresh failed"),
        }
        let symbol = self.config.read().symbol.clone();
        match self.broker.get_underlying_price(&symbol).await {
            Ok(price) => self.store.set_underlying_price(price, Self::now_ts()),
            Err(e) => warn!(error = %e, "initial underlying price fetch failed"),
        }

        self.install_subscriptions(&symbol);

        // BOOT -> SYNC; a broker reconnect re-enters here from SAFE.
        {
            let snapshot = self.build_snapshot_for_guards();
            let mut trading = self.trading_fsm.lock();
            let config = self.config.read();
            let gates = config.resolved_state_gates();
            let risk = config.resolved_risk();
            let intent = config.resolved_hedge_intent();
            let guard = TradingGuard::new(
                &snapshot,
                &gates,
                &risk,
                &intent,
                config.strategy_enabled,
                Some(&*self.guard),
            );
            let report = guard.eval_all();
            if trading.state() == TradingState::Boot {
                trading.apply_transition(TradingEvent::Start, &report);
            } else if trading.state() == TradingState::Safe {
                trading.apply_transition(TradingEvent::BrokerUp, &report);
            }
        }

        info!(symbol = %symbol, "broker session primed; entering run loop");
        DaemonState::Running
    }

    fn install_subscriptions(&self, symbol: &str) {
        let tx = self.events_tx.clone();
        self.broker.subscribe_ticker(
            symbol,
            Box::new(move |update| {
                let _ = tx.send(AppEvent::Tick(update));
            }),
        );
        let tx = self.events_tx.clone();
        self.broker.subscribe_positions(Box::new(move || {
            let _ = tx.send(AppEvent::PositionsChanged);
        }));
        let tx_ack = self.events_tx.clone();
        let tx_fill = self.events_tx.clone();
        self.broker.subscribe_fills(
            Box::new(move |ack| {
                let _ = tx_ack.send(AppEvent::Ack(ack));
            }),
            Box::new(move |fill| {
                let _ = tx_fill.send(AppEvent::Fill(fill));
            }),
        );
    }

    /// RUNNING / RUNNING_SUSPENDED: consume events, heartbeat, reload
    /// config, until stop or disconnect.
    async fn handle_running(&self, events: &mut mpsc::UnboundedReceiver<AppEvent>) -> DaemonState {
        let mut heartbeat_interval = self.config.read().daemon.heartbeat_interval.clamp(5.0, 120.0);
        let mut heartbeat = tokio::time::interval(Duration::from_secs_f64(heartbeat_interval));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut reload = tokio::time::interval(Duration::from_secs(30));
        reload.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut liveness = tokio::time::interval(Duration::from_secs(1));

        info!(
            paper_trade = self.config.read().resolved_risk().paper_trade,
            "daemon running"
        );

        loop {
            if !self.daemon_fsm.lock().is_running() {
                return DaemonState::Stopping;
            }

            tokio::select! {
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            warn!("event channel closed; stopping");
                            return DaemonState::Stopping;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if let Some(next) = self.heartbeat_tick(&mut heartbeat_interval, &mut heartbeat).await {
                        return next;
                    }
                }
                _ = reload.tick() => {
                    self.maybe_reload_config();
                }
                _ = liveness.tick() => {
                    if !self.broker.is_connected() {
                        warn!("broker connection lost; entering WAITING_IB");
                        self.on_broker_lost().await;
                        return DaemonState::WaitingIb;
                    }
                }
                _ = self.shutdown.notified() => {
                    return DaemonState::Stopping;
                }
            }
        }
    }

    async fn handle_stopping(&self) -> DaemonState {
        info!("stopping: disconnecting broker, recording graceful shutdown");
        self.broker.disconnect().await;
        if let Some(sink) = &self.sink {
            sink.write_graceful_shutdown().await;
        }
        self.metrics.log_snapshot();
        DaemonState::Stopped
    }

    // =========================================================================
    // Event handling (main task only)
    // =========================================================================

    async fn handle_event(&self, event: AppEvent) {
        match event {
            AppEvent::Tick(update) => {
                let now = Self::now_ts();
                match (update.bid, update.ask) {
                    (Some(bid), Some(ask)) => self.store.set_underlying_quote(bid, ask, now),
                    _ => self.store.set_underlying_price(update.last, now),
                }
                if let Some(mid) = self.store.underlying_price() {
                    let mut history = self.price_history.lock();
                    history.push_back(mid);
                    while history.len() > PRICE_HISTORY_CAP {
                        history.pop_front();
                    }
                }
                self.eval_hedge(TradingEvent::Tick).await;
            }
            AppEvent::PositionsChanged => {
                self.eval_hedge(TradingEvent::Quote).await;
            }
            AppEvent::Ack(ack) => {
                let mut exec = self.exec_fsm.lock();
                if ack.ok {
                    exec.on_ack_ok();
                } else {
                    debug!(reason = ?ack.reject_reason, "broker ack reject");
                    exec.on_ack_reject();
                }
            }
            AppEvent::Fill(fill) => self.handle_fill(fill).await,
        }
    }

    async fn handle_fill(&self, fill: FillReport) {
        let done = {
            let mut exec = self.exec_fsm.lock();
            match (exec.state(), fill.is_full) {
                (HedgeExecState::Working, true) => exec.on_full_fill(),
                (HedgeExecState::Working, false) => {
                    exec.on_partial_fill();
                    false
                }
                // Remaining quantity arrived while parked in PARTIAL.
                (HedgeExecState::Partial, true) => exec.on_partial_replan(false),
                _ => false,
            }
        };
        if done {
            self.write_op("fill", Some(fill.side.as_str()), Some(fill.quantity), fill.price, None)
                .await;
            self.apply_trading_event(TradingEvent::HedgeDone);
        }
    }

    /// Handle a mid-run disconnect: drive the micro FSM through its broker
    /// down path. An in-flight order parks in RECOVER; the reconnect's
    /// position refresh completes the cycle back to EXEC_IDLE.
    async fn on_broker_lost(&self) {
        {
            let mut exec = self.exec_fsm.lock();
            exec.set_connected(false);
            exec.on_broker_down();
            if exec.state() == HedgeExecState::Cancel {
                // The broker is gone; the working order dies with the session.
                exec.on_cancel_sent();
            }
        }
        // Trading FSM sees E3 through the global override.
        self.apply_trading_event(TradingEvent::Tick);
        self.metrics.inc_safe_mode_count();
    }

    /// Re-apply the trading FSM against a fresh snapshot.
    fn apply_trading_event(&self, event: TradingEvent) -> TradingState {
        let snapshot = self.build_snapshot_for_guards();
        let config = self.config.read();
        let gates = config.resolved_state_gates();
        let risk = config.resolved_risk();
        let intent = config.resolved_hedge_intent();
        let guard = TradingGuard::new(
            &snapshot,
            &gates,
            &risk,
            &intent,
            config.strategy_enabled,
            Some(&*self.guard),
        );
        let report = guard.eval_all();
        let mut trading = self.trading_fsm.lock();
        trading.apply_transition(event, &report);
        trading.state()
    }

    // =========================================================================
    // Heartbeat / control / reload
    // =========================================================================

    /// One heartbeat tick: persist the heartbeat row and a status snapshot,
    /// poll the suspend flag and control queue, and kick a hedge evaluation
    /// even without tick flow. Returns the next daemon state if the tick
    /// demands a lifecycle change.
    async fn heartbeat_tick(
        &self,
        heartbeat_interval: &mut f64,
        heartbeat: &mut tokio::time::Interval,
    ) -> Option<DaemonState> {
        let suspended_now = self.daemon_state() == DaemonState::RunningSuspended;

        self.write_heartbeat(HeartbeatUpdate {
            hedge_running: !suspended_now,
            ib_connected: self.broker.is_connected(),
            ib_client_id: Some(self.broker.client_id()),
            next_retry_ts: None,
            seconds_until_retry: None,
            heartbeat_interval_sec: Some(heartbeat_interval.round() as i32),
        })
        .await;
        self.write_status_snapshot(true).await;

        if let Some(sink) = &self.sink {
            // Suspend flag + interval from the run-status row.
            let (suspended, interval) = sink.poll_run_status().await;
            if let Some(interval) = interval {
                let clamped = interval.clamp(5.0, 120.0);
                if (clamped - *heartbeat_interval).abs() > f64::EPSILON {
                    info!(interval_sec = clamped, "heartbeat interval updated from run status");
                    *heartbeat_interval = clamped;
                    *heartbeat = tokio::time::interval(Duration::from_secs_f64(clamped));
                    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                }
            }
            {
                let mut fsm = self.daemon_fsm.lock();
                match (suspended, fsm.current()) {
                    (true, DaemonState::Running) => {
                        info!("suspend flag set; hedging paused");
                        fsm.transition(DaemonState::RunningSuspended);
                    }
                    (false, DaemonState::RunningSuspended) => {
                        info!("suspend flag cleared; hedging resumes");
                        fsm.transition(DaemonState::Running);
                    }
                    _ => {}
                }
            }

            // At most one control command per heartbeat tick.
            match sink.poll_and_consume_control(None).await {
                Some(ControlCommand::Stop) => {
                    info!("stop command consumed");
                    self.daemon_fsm.lock().request_stop();
                    return Some(DaemonState::Stopping);
                }
                Some(ControlCommand::Flatten) => {
                    // Reserved; acknowledged but not executed.
                    warn!("flatten command consumed; flatten is not implemented");
                }
                Some(ControlCommand::RetryIb) => {
                    if !self.broker.is_connected() {
                        return Some(DaemonState::WaitingIb);
                    }
                    debug!("retry_ib consumed while already connected");
                }
                Some(ControlCommand::RefreshAccounts) => {
                    self.refresh_accounts().await;
                }
                None => {}
            }
        }

        // Periodic evaluation even without tick flow.
        if self.daemon_state() == DaemonState::Running {
            self.eval_hedge(TradingEvent::GreeksUpdate).await;
        }
        None
    }

    async fn refresh_accounts(&self) {
        match self.broker.account_snapshots().await {
            Ok(snapshots) => {
                info!(accounts = snapshots.len(), "account snapshots fetched");
                if let Some(sink) = &self.sink {
                    sink.sync_accounts(&snapshots).await;
                }
            }
            Err(e) => warn!(error = %e, "account snapshot fetch failed"),
        }
    }

    /// Reload the config file when its mtime moved; hot-reloadable settings
    /// are applied in place, connection settings require a restart.
    fn maybe_reload_config(&self) {
        let Some(path) = self.config_path.as_deref() else {
            return;
        };
        let Ok(meta) = std::fs::metadata(path) else {
            return;
        };
        let Ok(mtime) = meta.modified() else {
            return;
        };
        let mut last = self.last_config_mtime.lock();
        match *last {
            None => {
                *last = Some(mtime);
                return;
            }
            Some(prev) if mtime <= prev => return,
            _ => {}
        }
        match HedgeConfig::load(path) {
            Ok(new_config) => {
                self.guard.update_config(GuardSettings::from_config(
                    &new_config.resolved_hedge_intent(),
                    &new_config.resolved_risk(),
                    &new_config.resolved_earnings(),
                ));
                *self.config.write() = new_config;
                *last = Some(mtime);
                info!(path = %path.display(), "config reloaded");
            }
            Err(e) => warn!(error = %e, "config reload failed; keeping previous config"),
        }
    }

    // =========================================================================
    // The hedge cycle
    // =========================================================================

    async fn refresh_positions(&self) -> Result<()> {
        let positions = self.broker.get_positions().await?;
        let config = self.config.read();
        let structure = config.resolved_structure();
        let symbol = config.symbol.clone();
        drop(config);
        let spot = self.store.underlying_price();
        let (_, stock_shares) = portfolio::parse_positions(
            &positions,
            &symbol,
            structure.min_dte,
            structure.max_dte,
            structure.atm_band_pct,
            spot,
        );
        self.store.set_positions(positions, stock_shares);
        Ok(())
    }

    /// Build the guard snapshot from current runtime (no broker I/O).
    fn build_snapshot_for_guards(&self) -> StateSnapshot {
        let now = Self::now_ts();
        let config = self.config.read();
        let structure = config.resolved_structure();
        let gates = config.resolved_state_gates();
        let greeks_cfg = config.greeks;
        let symbol = config.symbol.clone();
        drop(config);

        let spot = self.store.underlying_price();
        let positions = self.store.positions();
        let (legs, stock_shares) = portfolio::parse_positions(
            &positions,
            &symbol,
            structure.min_dte,
            structure.max_dte,
            structure.atm_band_pct,
            spot,
        );
        let greeks = compute_greeks(
            &legs,
            stock_shares,
            spot.unwrap_or(0.0),
            greeks_cfg.risk_free_rate,
            greeks_cfg.volatility,
        );
        let data_lag_ms = self
            .store
            .last_tick_ts()
            .map(|last| (now - last).max(0.0) * 1000.0);
        let history: Vec<f64> = self.price_history.lock().iter().copied().collect();
        let cs = StateClassifier::classify(
            PositionInputs {
                stock_shares,
                option_legs: legs.len(),
            },
            MarketInputs {
                spread_pct: self.store.spread_pct(),
                last_tick_ts: self.store.last_tick_ts(),
            },
            &greeks,
            self.exec_fsm.lock().effective_execution_state(),
            self.store.last_hedge_price(),
            self.store.last_hedge_time(),
            data_lag_ms,
            self.guard.circuit_breaker(),
            &gates,
            if history.is_empty() { None } else { Some(history.as_slice()) },
            now,
        );
        StateSnapshot::from_composite(&cs, spot, Some(greeks), legs.len())
    }

    /// One hedge evaluation: refresh, classify, gate, and possibly place
    /// one order. Serialized by the hedge lock.
    pub async fn eval_hedge(&self, progress_event: TradingEvent) {
        let _permit = self.hedge_lock.lock().await;

        if self.daemon_state() == DaemonState::RunningSuspended {
            debug!("suspended; skipping hedge evaluation");
            return;
        }

        if let Err(e) = self.refresh_positions().await {
            debug!(error = %e, "position refresh failed; skipping cycle");
            return;
        }

        let now = Self::now_ts();
        let config = self.config.read();
        let structure = config.resolved_structure();
        let gates = config.resolved_state_gates();
        let intent_cfg = config.resolved_hedge_intent();
        let risk_cfg = config.resolved_risk();
        let greeks_cfg = config.greeks;
        let symbol = config.symbol.clone();
        let order_type = OrderType::from_config(&config.order.order_type);
        let strategy_enabled = config.strategy_enabled;
        drop(config);

        let Some(spot) = self.store.underlying_price().filter(|s| *s > 0.0) else {
            debug!("no spot price; skipping cycle");
            return;
        };

        let positions = self.store.positions();
        let (legs, stock_shares) = portfolio::parse_positions(
            &positions,
            &symbol,
            structure.min_dte,
            structure.max_dte,
            structure.atm_band_pct,
            Some(spot),
        );
        let greeks = compute_greeks(
            &legs,
            stock_shares,
            spot,
            greeks_cfg.risk_free_rate,
            greeks_cfg.volatility,
        );

        let data_lag_ms = self
            .store
            .last_tick_ts()
            .map(|last| (now - last).max(0.0) * 1000.0);
        let history: Vec<f64> = self.price_history.lock().iter().copied().collect();
        let cs = StateClassifier::classify(
            PositionInputs {
                stock_shares,
                option_legs: legs.len(),
            },
            MarketInputs {
                spread_pct: self.store.spread_pct(),
                last_tick_ts: self.store.last_tick_ts(),
            },
            &greeks,
            self.exec_fsm.lock().effective_execution_state(),
            self.store.last_hedge_price(),
            self.store.last_hedge_time(),
            data_lag_ms,
            self.guard.circuit_breaker(),
            &gates,
            if history.is_empty() { None } else { Some(history.as_slice()) },
            now,
        );
        debug!(state = %cs.letters(), net_delta = cs.net_delta, "classified");

        self.metrics.set_data_lag_ms(cs.data_lag_ms);
        self.metrics.set_delta_abs(Some(cs.net_delta.abs()));
        self.metrics.set_spread_bucket(Some(cs.l.tag()));
        self.metrics.set_gamma(Some(greeks.gamma));
        self.metrics.set_current_state(Some(cs.letters().as_str()));

        // Drive the macro FSM one step on this progress event.
        let snapshot = StateSnapshot::from_composite(&cs, Some(spot), Some(greeks), legs.len());
        let trading_state = {
            let guard = TradingGuard::new(
                &snapshot,
                &gates,
                &risk_cfg,
                &intent_cfg,
                strategy_enabled,
                Some(&*self.guard),
            );
            let report = guard.eval_all();
            let mut trading = self.trading_fsm.lock();
            if trading.state() == TradingState::Boot {
                trading.apply_transition(TradingEvent::Start, &report);
            }
            trading.apply_transition(progress_event, &report);
            trading.state()
        };

        if trading_state != TradingState::NeedHedge {
            return;
        }
        if !should_output_target(&cs) {
            debug!(state = %cs.letters(), "state gate: no target");
            return;
        }

        let force = cs.d == crate::state::DeltaDeviationState::ForceHedge;
        let Some(intent) = gamma_scalper_intent(
            greeks.delta,
            stock_shares,
            &intent_cfg,
            gates.delta.hedge_threshold,
            force,
        ) else {
            debug!("delta within hedge threshold; no intent");
            return;
        };

        let (approved, reason) = apply_hedge_gates(
            intent,
            &cs,
            &self.guard,
            now,
            Some(spot),
            self.store.last_hedge_price(),
            self.store.spread_pct(),
            intent_cfg.min_hedge_shares,
        );
        let Some(intent) = approved else {
            info!(
                reason,
                net_delta = cs.net_delta,
                side = %intent.side,
                quantity = intent.quantity,
                "hedge blocked by gates"
            );
            return;
        };

        if !self.exec_fsm.lock().can_place_order() {
            warn!(
                exec_state = %self.exec_fsm.lock().state(),
                "execution not idle; skipping order"
            );
            return;
        }

        // Micro FSM: RECV_TARGET -> PLAN -> SEND.
        let target = TargetPositionEvent {
            target_shares: intent.target_shares,
            side: intent.side,
            quantity: intent.quantity,
            reason: "delta_hedge".to_string(),
            ts: now,
            trace_id: Some(uuid::Uuid::new_v4().to_string()),
        };
        {
            let mut exec = self.exec_fsm.lock();
            exec.on_target(target, cs.stock_pos);
            exec.on_plan_decide(intent.quantity >= intent_cfg.min_hedge_shares);
            if exec.state() != HedgeExecState::Send {
                return;
            }
        }

        self.write_op(
            "hedge_intent",
            Some(intent.side.as_str()),
            Some(intent.quantity),
            Some(spot),
            Some(cs.letters().as_str()),
        )
        .await;
        self.apply_trading_event(TradingEvent::TargetEmitted);

        if risk_cfg.paper_trade {
            info!(
                side = %intent.side,
                quantity = intent.quantity,
                net_delta = cs.net_delta,
                "PAPER hedge"
            );
            {
                let mut exec = self.exec_fsm.lock();
                exec.on_order_placed();
                exec.on_ack_ok();
            }
            self.record_hedge_success(now, spot).await;
            self.write_op(
                "order_sent",
                Some(intent.side.as_str()),
                Some(intent.quantity),
                Some(spot),
                Some("paper"),
            )
            .await;
            self.exec_fsm.lock().on_full_fill();
            self.apply_trading_event(TradingEvent::HedgeDone);
            return;
        }

        self.exec_fsm.lock().on_order_placed();
        match self
            .broker
            .place_order(&symbol, intent.side, intent.quantity, order_type, None)
            .await
        {
            Ok(ticket) => {
                self.exec_fsm.lock().on_ack_ok();
                self.record_hedge_success(now, spot).await;
                self.write_op(
                    "order_sent",
                    Some(intent.side.as_str()),
                    Some(intent.quantity),
                    Some(spot),
                    Some(ticket.order_id.as_str()),
                )
                .await;
                info!(
                    side = %intent.side,
                    quantity = intent.quantity,
                    order_id = %ticket.order_id,
                    "hedge order sent"
                );
                // Fill reports arriving on the event channel complete the
                // cycle; a market order that already filled synchronously
                // (paper-style brokers) has moved the FSM past WORKING.
                let mut exec = self.exec_fsm.lock();
                if exec.state() == HedgeExecState::Working {
                    exec.on_full_fill();
                    drop(exec);
                    self.apply_trading_event(TradingEvent::HedgeDone);
                }
            }
            Err(e) => {
                warn!(error = %e, "order placement failed");
                self.write_op(
                    "reject",
                    Some(intent.side.as_str()),
                    Some(intent.quantity),
                    Some(spot),
                    Some(e.to_string().as_str()),
                )
                .await;
                {
                    let mut exec = self.exec_fsm.lock();
                    exec.on_ack_reject();
                    exec.on_try_resync();
                }
                let resynced = self.refresh_positions().await.is_ok();
                {
                    let mut exec = self.exec_fsm.lock();
                    if resynced {
                        exec.on_positions_resynced();
                    } else {
                        exec.on_cannot_recover();
                    }
                }
                self.apply_trading_event(TradingEvent::HedgeFailed);
            }
        }
    }

    async fn record_hedge_success(&self, now: f64, spot: f64) {
        self.guard.record_hedge_sent(now);
        self.store.set_last_hedge_time(Some(now));
        self.store.set_last_hedge_price(Some(spot));
        self.store.inc_daily_hedge_count();
        self.metrics.inc_hedge_count();
    }

    // =========================================================================
    // Persistence helpers
    // =========================================================================

    async fn write_heartbeat(&self, hb: HeartbeatUpdate) {
        if let Some(sink) = &self.sink {
            sink.write_daemon_heartbeat(&hb).await;
        }
    }

    async fn write_op(
        &self,
        op_type: &str,
        side: Option<&str>,
        quantity: Option<i64>,
        price: Option<f64>,
        reason: Option<&str>,
    ) {
        if let Some(sink) = &self.sink {
            sink.write_operation(&OperationRecord {
                ts: Self::now_ts(),
                op_type: op_type.to_string(),
                side: side.map(str::to_string),
                quantity,
                price,
                state_reason: reason.map(str::to_string),
            })
            .await;
        }
    }

    /// Persist the current status snapshot row.
    pub async fn write_status_snapshot(&self, append_history: bool) {
        let Some(sink) = &self.sink else {
            return;
        };
        let config = self.config.read();
        let symbol = config.symbol.clone();
        let summary = config.summary();
        let structure = config.resolved_structure();
        let greeks_cfg = config.greeks;
        drop(config);

        let now = Self::now_ts();
        let spot = self.store.underlying_price();
        let (bid, ask) = self.store.bid_ask();
        let positions = self.store.positions();
        let (legs, stock_shares) = portfolio::parse_positions(
            &positions,
            &symbol,
            structure.min_dte,
            structure.max_dte,
            structure.atm_band_pct,
            spot,
        );
        let greeks = compute_greeks(
            &legs,
            stock_shares,
            spot.unwrap_or(0.0),
            greeks_cfg.risk_free_rate,
            greeks_cfg.volatility,
        );
        let data_lag_ms = self
            .store
            .last_tick_ts()
            .map(|last| (now - last).max(0.0) * 1000.0);

        let row = StatusSnapshotRow {
            daemon_state: self.daemon_state().as_str().to_string(),
            trading_state: self.trading_state().as_str().to_string(),
            symbol,
            spot,
            bid,
            ask,
            net_delta: if greeks.valid { Some(greeks.delta) } else { None },
            stock_position: stock_shares,
            option_legs_count: legs.len() as i64,
            daily_hedge_count: self.store.daily_hedge_count() as i64,
            daily_pnl: Some(self.store.daily_pnl()),
            data_lag_ms,
            config_summary: summary,
            ts: now,
        };
        sink.write_snapshot(&row, append_history).await;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerContract, BrokerPosition, OrderSide, PaperBroker};
    use chrono::Duration as ChronoDuration;

    fn expiry_in(days: i64) -> String {
        (Utc::now().date_naive() + ChronoDuration::days(days))
            .format("%Y%m%d")
            .to_string()
    }

    fn call_leg(symbol: &str, qty: f64) -> BrokerPosition {
        BrokerPosition {
            contract: BrokerContract::option(symbol, &expiry_in(28), 100.0, "C"),
            quantity: qty,
            avg_cost: None,
            account: None,
        }
    }

    /// Config with the off-hours gates disabled so tests run any time. The
    /// simulated broker plays the live role, so paper_trade is off.
    fn test_config() -> HedgeConfig {
        let yaml = r#"
symbol: NVDA
gates:
  guard:
    risk:
      paper_trade: false
      trading_hours_only: false
  intent:
    hedge:
      cooldown_seconds: 0
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    async fn app_with_long_call() -> (Arc<HedgeApp>, Arc<PaperBroker>) {
        let broker = Arc::new(PaperBroker::new(1));
        broker.connect().await;
        broker.set_positions(vec![call_leg("NVDA", 1.0)]);
        let (app, _rx) = HedgeApp::new(test_config(), None, broker.clone(), None);
        // Mark the daemon running so eval_hedge proceeds.
        {
            let mut fsm = app.daemon_fsm.lock();
            fsm.transition(DaemonState::Connecting);
            fsm.transition(DaemonState::Connected);
            fsm.transition(DaemonState::Running);
        }
        app.store.set_underlying_quote(99.95, 100.05, HedgeApp::now_ts());
        (app, broker)
    }

    #[test]
    fn client_id_selection() {
        assert_eq!(next_client_id(None, 1), 1);
        assert_eq!(next_client_id(None, 7), 7);
        assert_eq!(next_client_id(Some(3), 1), 4);
    }

    #[tokio::test]
    async fn happy_path_hedge_places_one_order() {
        let (app, broker) = app_with_long_call().await;

        // The macro FSM walks BOOT -> SYNC -> IDLE -> ARMED -> MONITOR ->
        // NEED_HEDGE one step per progress event; the fourth eval hedges.
        for _ in 0..4 {
            app.eval_hedge(TradingEvent::Tick).await;
        }

        // One ATM call is ~54 delta shares: expect one SELL hedge.
        let orders = broker.orders_placed();
        assert_eq!(orders.len(), 1, "trading_state={}", app.trading_state());
        assert_eq!(orders[0].1, OrderSide::Sell);
        assert!(orders[0].2 >= 25, "quantity {}", orders[0].2);

        // Cycle completes: exec FILLED, trading back at MONITOR, count = 1.
        assert_eq!(app.exec_state(), HedgeExecState::Filled);
        assert_eq!(app.trading_state(), TradingState::Monitor);
        assert_eq!(app.store().daily_hedge_count(), 1);
        assert!(app.store().last_hedge_price().is_some());
        assert_eq!(app.metrics().hedge_count(), 1);

        // The fill flattened delta; further ticks settle into NO_TRADE
        // without another order.
        for _ in 0..2 {
            app.eval_hedge(TradingEvent::Tick).await;
        }
        assert_eq!(app.trading_state(), TradingState::NoTrade);
        assert_eq!(broker.orders_placed().len(), 1);
    }

    #[tokio::test]
    async fn paper_mode_synthesizes_fill_without_broker_order() {
        let broker = Arc::new(PaperBroker::new(1));
        broker.connect().await;
        broker.set_positions(vec![call_leg("NVDA", 1.0)]);
        let mut config = test_config();
        config.gates.guard.risk.paper_trade = Some(true);
        let (app, _rx) = HedgeApp::new(config, None, broker.clone(), None);
        {
            let mut fsm = app.daemon_fsm.lock();
            fsm.transition(DaemonState::Connecting);
            fsm.transition(DaemonState::Connected);
            fsm.transition(DaemonState::Running);
        }
        app.store.set_underlying_quote(99.95, 100.05, HedgeApp::now_ts());

        for _ in 0..4 {
            app.eval_hedge(TradingEvent::Tick).await;
        }

        // The hedge completed internally but never reached the broker.
        assert!(broker.orders_placed().is_empty());
        assert_eq!(app.exec_state(), HedgeExecState::Filled);
        assert_eq!(app.trading_state(), TradingState::Monitor);
        assert_eq!(app.store().daily_hedge_count(), 1);
    }

    #[tokio::test]
    async fn in_band_delta_never_emits_target() {
        let broker = Arc::new(PaperBroker::new(1));
        broker.connect().await;
        // Call plus stock hedge that nets delta inside the band: a 55-delta
        // call against 55 short shares.
        broker.set_positions(vec![
            call_leg("NVDA", 1.0),
            BrokerPosition {
                contract: BrokerContract::stock("NVDA"),
                quantity: -55.0,
                avg_cost: None,
                account: None,
            },
        ]);
        let (app, _rx) = HedgeApp::new(test_config(), None, broker.clone(), None);
        {
            let mut fsm = app.daemon_fsm.lock();
            fsm.transition(DaemonState::Connecting);
            fsm.transition(DaemonState::Connected);
            fsm.transition(DaemonState::Running);
        }
        app.store.set_underlying_quote(99.95, 100.05, HedgeApp::now_ts());

        for _ in 0..6 {
            app.eval_hedge(TradingEvent::Tick).await;
        }
        // A snapshot inside the band never emits a target.
        assert!(broker.orders_placed().is_empty());
        assert_eq!(app.trading_state(), TradingState::NoTrade);
    }

    #[tokio::test]
    async fn suspended_daemon_places_no_orders() {
        let (app, broker) = app_with_long_call().await;
        {
            let mut fsm = app.daemon_fsm.lock();
            fsm.transition(DaemonState::RunningSuspended);
        }
        for _ in 0..6 {
            app.eval_hedge(TradingEvent::Tick).await;
        }
        assert!(broker.orders_placed().is_empty());
    }

    #[tokio::test]
    async fn cooldown_blocks_second_hedge() {
        let (app, broker) = app_with_long_call().await;
        // Re-apply a 60 s cooldown.
        let config = test_config();
        let mut settings = GuardSettings::from_config(
            &config.resolved_hedge_intent(),
            &config.resolved_risk(),
            &config.resolved_earnings(),
        );
        settings.cooldown_sec = 60;
        app.guard.update_config(settings);

        for _ in 0..4 {
            app.eval_hedge(TradingEvent::Tick).await;
        }
        assert_eq!(broker.orders_placed().len(), 1);

        // Simulate delta drifting out again right after the fill: drop the
        // stock hedge from the book. The cooldown gate holds the next order.
        broker.set_positions(vec![call_leg("NVDA", 1.0)]);
        for _ in 0..4 {
            app.eval_hedge(TradingEvent::Tick).await;
        }
        assert_eq!(broker.orders_placed().len(), 1);
        assert_eq!(app.store().daily_hedge_count(), 1);
    }

    #[tokio::test]
    async fn broker_loss_sends_trading_to_safe() {
        let (app, broker) = app_with_long_call().await;
        for _ in 0..4 {
            app.eval_hedge(TradingEvent::Tick).await;
        }
        assert_eq!(app.trading_state(), TradingState::Monitor);

        broker.disconnect().await;
        app.on_broker_lost().await;
        assert_eq!(app.trading_state(), TradingState::Safe);
        // No order was in flight: the cycle state survives, only the
        // connected flag drops (E maps to DISCONNECTED).
        assert_eq!(app.exec_state(), HedgeExecState::Filled);
    }

    #[tokio::test]
    async fn order_reject_recovers_to_idle() {
        let (app, broker) = app_with_long_call().await;
        broker.set_fail_orders(true);

        for _ in 0..6 {
            app.eval_hedge(TradingEvent::Tick).await;
        }
        assert!(broker.orders_placed().is_empty());
        // Reject path: FAIL -> TRY_RESYNC -> RECOVER -> EXEC_IDLE.
        assert_eq!(app.exec_state(), HedgeExecState::ExecIdle);
        // No hedge was recorded.
        assert_eq!(app.store().daily_hedge_count(), 0);
    }

    #[tokio::test]
    async fn stale_data_skips_hedging() {
        let (app, broker) = app_with_long_call().await;
        // Quote stamped far in the past: data is stale.
        app.store
            .set_underlying_quote(99.95, 100.05, HedgeApp::now_ts() - 30.0);
        for _ in 0..6 {
            app.eval_hedge(TradingEvent::Tick).await;
        }
        assert!(broker.orders_placed().is_empty());
        assert_eq!(app.trading_state(), TradingState::Safe);
    }
}
