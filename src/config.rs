// =============================================================================
// Hedge Daemon Configuration
// =============================================================================
//
// Central configuration for the daemon, loaded from a YAML file. The
// canonical layout is pipeline-aligned under `gates.{strategy,state,intent,
// guard}`; the legacy top-level sections (`hedge`, `risk`, `structure`,
// `state_space`) are still honored as fallbacks so older config files keep
// working. Every field carries a serde default so a partial file never
// fails to load.
//
// Raw sections hold Options; call the `resolved_*` accessors to obtain
// concrete values with the fallback chain applied:
//
//   gates.<section>  ->  legacy top-level / state_space  ->  built-in default
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Resolved gate values (what the classifier and guards consume)
// =============================================================================

/// D-dimension thresholds (share-equivalent delta).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaGates {
    pub epsilon_band: f64,
    pub hedge_threshold: f64,
    pub max_delta_limit: f64,
}

impl Default for DeltaGates {
    fn default() -> Self {
        Self {
            epsilon_band: 10.0,
            hedge_threshold: 25.0,
            max_delta_limit: 500.0,
        }
    }
}

/// M-dimension thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketGates {
    pub vol_window_min: u32,
    pub stale_ts_threshold_ms: f64,
}

impl Default for MarketGates {
    fn default() -> Self {
        Self {
            vol_window_min: 5,
            stale_ts_threshold_ms: 5000.0,
        }
    }
}

/// L-dimension thresholds (spread as percent of mid).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiquidityGates {
    pub wide_spread_pct: f64,
    pub extreme_spread_pct: f64,
}

impl Default for LiquidityGates {
    fn default() -> Self {
        Self {
            wide_spread_pct: 0.1,
            extreme_spread_pct: 0.5,
        }
    }
}

/// S-dimension thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemGates {
    pub data_lag_threshold_ms: f64,
}

impl Default for SystemGates {
    fn default() -> Self {
        Self {
            data_lag_threshold_ms: 1000.0,
        }
    }
}

/// All four state-classification gate groups, resolved.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StateGates {
    pub delta: DeltaGates,
    pub market: MarketGates,
    pub liquidity: LiquidityGates,
    pub system: SystemGates,
}

/// Option-leg structure filter, resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StructureConfig {
    pub min_dte: i64,
    pub max_dte: i64,
    pub atm_band_pct: f64,
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            min_dte: 21,
            max_dte: 35,
            atm_band_pct: 0.03,
        }
    }
}

/// Earnings blackout window, resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct EarningsConfig {
    /// Earnings dates as YYYY-MM-DD strings.
    pub dates: Vec<String>,
    pub blackout_days_before: i64,
    pub blackout_days_after: i64,
}

impl Default for EarningsConfig {
    fn default() -> Self {
        Self {
            dates: Vec::new(),
            blackout_days_before: 3,
            blackout_days_after: 1,
        }
    }
}

/// Hedge intent sizing and cost gate, resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HedgeIntentConfig {
    pub min_hedge_shares: i64,
    pub max_hedge_shares_per_order: i64,
    pub cooldown_sec: u64,
    pub min_price_move_pct: f64,
}

impl Default for HedgeIntentConfig {
    fn default() -> Self {
        Self {
            min_hedge_shares: 10,
            max_hedge_shares_per_order: 500,
            cooldown_sec: 60,
            min_price_move_pct: 0.0,
        }
    }
}

/// Order-send risk limits, resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskConfig {
    pub max_daily_hedge_count: u32,
    pub max_position_shares: i64,
    pub max_daily_loss_usd: f64,
    pub max_spread_pct: Option<f64>,
    pub max_net_delta_shares: Option<f64>,
    pub paper_trade: bool,
    pub trading_hours_only: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_hedge_count: 50,
            max_position_shares: 2000,
            max_daily_loss_usd: 5000.0,
            max_spread_pct: None,
            max_net_delta_shares: None,
            paper_trade: true,
            trading_hours_only: true,
        }
    }
}

// =============================================================================
// Raw serde sections (Options; canonical gates layout)
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawDeltaSection {
    #[serde(default)]
    pub epsilon_band: Option<f64>,
    #[serde(default)]
    pub hedge_threshold: Option<f64>,
    /// Legacy alias of `hedge_threshold`.
    #[serde(default)]
    pub threshold_hedge_shares: Option<f64>,
    #[serde(default)]
    pub max_delta_limit: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMarketSection {
    #[serde(default)]
    pub vol_window_min: Option<u32>,
    #[serde(default)]
    pub stale_ts_threshold_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawLiquiditySection {
    #[serde(default)]
    pub wide_spread_pct: Option<f64>,
    #[serde(default)]
    pub extreme_spread_pct: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSystemSection {
    #[serde(default)]
    pub data_lag_threshold_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawStructureSection {
    #[serde(default)]
    pub min_dte: Option<i64>,
    #[serde(default)]
    pub max_dte: Option<i64>,
    #[serde(default)]
    pub atm_band_pct: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEarningsSection {
    #[serde(default)]
    pub dates: Option<Vec<String>>,
    #[serde(default)]
    pub blackout_days_before: Option<i64>,
    #[serde(default)]
    pub blackout_days_after: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawHedgeSection {
    #[serde(default)]
    pub min_hedge_shares: Option<i64>,
    #[serde(default)]
    pub max_hedge_shares_per_order: Option<i64>,
    /// Canonical key.
    #[serde(default)]
    pub cooldown_seconds: Option<u64>,
    /// Legacy key.
    #[serde(default)]
    pub cooldown_sec: Option<u64>,
    #[serde(default)]
    pub min_price_move_pct: Option<f64>,
    /// Legacy delta threshold carried in hedge sections of old files.
    #[serde(default)]
    pub threshold_hedge_shares: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRiskSection {
    #[serde(default)]
    pub max_daily_hedge_count: Option<u32>,
    #[serde(default)]
    pub max_position_shares: Option<i64>,
    #[serde(default)]
    pub max_daily_loss_usd: Option<f64>,
    #[serde(default)]
    pub max_spread_pct: Option<f64>,
    #[serde(default)]
    pub max_net_delta_shares: Option<f64>,
    #[serde(default)]
    pub paper_trade: Option<bool>,
    #[serde(default)]
    pub trading_hours_only: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatesStrategySection {
    #[serde(default)]
    pub structure: RawStructureSection,
    #[serde(default)]
    pub earnings: RawEarningsSection,
    #[serde(default)]
    pub trading_hours_only: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatesStateSection {
    #[serde(default)]
    pub delta: RawDeltaSection,
    #[serde(default)]
    pub market: RawMarketSection,
    #[serde(default)]
    pub liquidity: RawLiquiditySection,
    #[serde(default)]
    pub system: RawSystemSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatesIntentSection {
    #[serde(default)]
    pub hedge: RawHedgeSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatesGuardSection {
    #[serde(default)]
    pub risk: RawRiskSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatesConfig {
    #[serde(default)]
    pub strategy: GatesStrategySection,
    #[serde(default)]
    pub state: GatesStateSection,
    #[serde(default)]
    pub intent: GatesIntentSection,
    #[serde(default)]
    pub guard: GatesGuardSection,
}

/// Legacy `state_space` block: same sections as `gates.state` plus `hedge`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSpaceConfig {
    #[serde(default)]
    pub delta: RawDeltaSection,
    #[serde(default)]
    pub market: RawMarketSection,
    #[serde(default)]
    pub liquidity: RawLiquiditySection,
    #[serde(default)]
    pub system: RawSystemSection,
    #[serde(default)]
    pub hedge: RawHedgeSection,
}

// =============================================================================
// Fixed sections
// =============================================================================

fn default_risk_free_rate() -> f64 {
    0.05
}

fn default_volatility() -> f64 {
    0.35
}

/// Black-Scholes inputs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GreeksConfig {
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,
    #[serde(default = "default_volatility")]
    pub volatility: f64,
}

impl Default for GreeksConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: default_risk_free_rate(),
            volatility: default_volatility(),
        }
    }
}

fn default_ib_host() -> String {
    "127.0.0.1".to_string()
}

fn default_ib_port() -> u16 {
    4001
}

fn default_ib_client_id() -> i32 {
    1
}

fn default_connect_timeout() -> f64 {
    60.0
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IbConfig {
    #[serde(default = "default_ib_host")]
    pub host: String,
    #[serde(default = "default_ib_port")]
    pub port: u16,
    #[serde(default = "default_ib_client_id")]
    pub client_id: i32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
}

impl Default for IbConfig {
    fn default() -> Self {
        Self {
            host: default_ib_host(),
            port: default_ib_port(),
            client_id: default_ib_client_id(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_order_type() -> String {
    "market".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfig {
    #[serde(default = "default_order_type")]
    pub order_type: String,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            order_type: default_order_type(),
        }
    }
}

fn default_pg_host() -> String {
    std::env::var("PGHOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_pg_port() -> u16 {
    std::env::var("PGPORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5432)
}

fn default_pg_database() -> String {
    std::env::var("PGDATABASE").unwrap_or_else(|_| "hedger".to_string())
}

fn default_pg_user() -> String {
    std::env::var("PGUSER").unwrap_or_else(|_| "hedger".to_string())
}

fn default_pg_password() -> String {
    std::env::var("PGPASSWORD").unwrap_or_default()
}

/// PostgreSQL connection settings. Environment variables (PGHOST, PGPORT,
/// PGDATABASE, PGUSER, PGPASSWORD) supply the defaults for missing keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default = "default_pg_database")]
    pub database: String,
    #[serde(default = "default_pg_user")]
    pub user: String,
    #[serde(default = "default_pg_password")]
    pub password: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            port: default_pg_port(),
            database: default_pg_database(),
            user: default_pg_user(),
            password: default_pg_password(),
        }
    }
}

fn default_sink() -> String {
    "postgres".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_sink")]
    pub sink: String,
    #[serde(default)]
    pub postgres: PostgresConfig,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            sink: default_sink(),
            postgres: PostgresConfig::default(),
        }
    }
}

fn default_heartbeat_interval() -> f64 {
    10.0
}

fn default_ib_retry_interval() -> f64 {
    30.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: f64,
    #[serde(default = "default_ib_retry_interval")]
    pub ib_retry_interval_sec: f64,
    /// Reserved: external hedge command used by the subprocess supervisor.
    #[serde(default)]
    pub hedge_command: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            ib_retry_interval_sec: default_ib_retry_interval(),
            hedge_command: None,
        }
    }
}

fn default_status_server_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusServerConfig {
    #[serde(default = "default_status_server_port")]
    pub port: u16,
}

impl Default for StatusServerConfig {
    fn default() -> Self {
        Self {
            port: default_status_server_port(),
        }
    }
}

// =============================================================================
// Root config
// =============================================================================

fn default_symbol() -> String {
    "NVDA".to_string()
}

fn default_true() -> bool {
    true
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HedgeConfig {
    pub gates: GatesConfig,

    // Legacy fallbacks.
    pub hedge: RawHedgeSection,
    pub risk: RawRiskSection,
    pub structure: RawStructureSection,
    pub earnings: RawEarningsSection,
    pub state_space: StateSpaceConfig,

    pub greeks: GreeksConfig,
    pub ib: IbConfig,
    pub order: OrderConfig,
    pub status: StatusConfig,
    pub daemon: DaemonConfig,
    pub status_server: StatusServerConfig,

    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_true")]
    pub strategy_enabled: bool,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            gates: GatesConfig::default(),
            hedge: RawHedgeSection::default(),
            risk: RawRiskSection::default(),
            structure: RawStructureSection::default(),
            earnings: RawEarningsSection::default(),
            state_space: StateSpaceConfig::default(),
            greeks: GreeksConfig::default(),
            ib: IbConfig::default(),
            order: OrderConfig::default(),
            status: StatusConfig::default(),
            daemon: DaemonConfig::default(),
            status_server: StatusServerConfig::default(),
            symbol: default_symbol(),
            strategy_enabled: true,
        }
    }
}

impl HedgeConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        info!(
            path = %path.display(),
            symbol = %config.symbol,
            paper_trade = config.resolved_risk().paper_trade,
            "config loaded"
        );
        Ok(config)
    }

    // ── Resolution helpers (gates -> legacy -> default) ─────────────────

    /// Classifier / guard thresholds.
    pub fn resolved_state_gates(&self) -> StateGates {
        let d = DeltaGates::default();
        let m = MarketGates::default();
        let l = LiquidityGates::default();
        let s = SystemGates::default();

        let delta = DeltaGates {
            epsilon_band: self
                .gates
                .state
                .delta
                .epsilon_band
                .or(self.state_space.delta.epsilon_band)
                .unwrap_or(d.epsilon_band),
            hedge_threshold: self
                .gates
                .state
                .delta
                .hedge_threshold
                .or(self.gates.state.delta.threshold_hedge_shares)
                .or(self.state_space.delta.hedge_threshold)
                .or(self.state_space.delta.threshold_hedge_shares)
                .unwrap_or(d.hedge_threshold),
            max_delta_limit: self
                .gates
                .state
                .delta
                .max_delta_limit
                .or(self.state_space.delta.max_delta_limit)
                .unwrap_or(d.max_delta_limit),
        };
        let market = MarketGates {
            vol_window_min: self
                .gates
                .state
                .market
                .vol_window_min
                .or(self.state_space.market.vol_window_min)
                .unwrap_or(m.vol_window_min),
            stale_ts_threshold_ms: self
                .gates
                .state
                .market
                .stale_ts_threshold_ms
                .or(self.state_space.market.stale_ts_threshold_ms)
                .unwrap_or(m.stale_ts_threshold_ms),
        };
        let liquidity = LiquidityGates {
            wide_spread_pct: self
                .gates
                .state
                .liquidity
                .wide_spread_pct
                .or(self.state_space.liquidity.wide_spread_pct)
                .unwrap_or(l.wide_spread_pct),
            extreme_spread_pct: self
                .gates
                .state
                .liquidity
                .extreme_spread_pct
                .or(self.state_space.liquidity.extreme_spread_pct)
                .unwrap_or(l.extreme_spread_pct),
        };
        let system = SystemGates {
            data_lag_threshold_ms: self
                .gates
                .state
                .system
                .data_lag_threshold_ms
                .or(self.state_space.system.data_lag_threshold_ms)
                .unwrap_or(s.data_lag_threshold_ms),
        };

        StateGates {
            delta,
            market,
            liquidity,
            system,
        }
    }

    /// Option-leg DTE / ATM filter.
    pub fn resolved_structure(&self) -> StructureConfig {
        let d = StructureConfig::default();
        StructureConfig {
            min_dte: self
                .gates
                .strategy
                .structure
                .min_dte
                .or(self.structure.min_dte)
                .unwrap_or(d.min_dte),
            max_dte: self
                .gates
                .strategy
                .structure
                .max_dte
                .or(self.structure.max_dte)
                .unwrap_or(d.max_dte),
            atm_band_pct: self
                .gates
                .strategy
                .structure
                .atm_band_pct
                .or(self.structure.atm_band_pct)
                .unwrap_or(d.atm_band_pct),
        }
    }

    /// Earnings blackout window.
    pub fn resolved_earnings(&self) -> EarningsConfig {
        let d = EarningsConfig::default();
        EarningsConfig {
            dates: self
                .gates
                .strategy
                .earnings
                .dates
                .clone()
                .or_else(|| self.earnings.dates.clone())
                .unwrap_or(d.dates)
                .into_iter()
                .filter(|s| !s.trim().is_empty())
                .collect(),
            blackout_days_before: self
                .gates
                .strategy
                .earnings
                .blackout_days_before
                .or(self.earnings.blackout_days_before)
                .unwrap_or(d.blackout_days_before),
            blackout_days_after: self
                .gates
                .strategy
                .earnings
                .blackout_days_after
                .or(self.earnings.blackout_days_after)
                .unwrap_or(d.blackout_days_after),
        }
    }

    /// Hedge intent sizing and cost gate.
    pub fn resolved_hedge_intent(&self) -> HedgeIntentConfig {
        let d = HedgeIntentConfig::default();
        let canonical = &self.gates.intent.hedge;
        HedgeIntentConfig {
            min_hedge_shares: canonical
                .min_hedge_shares
                .or(self.hedge.min_hedge_shares)
                .or(self.state_space.hedge.min_hedge_shares)
                .unwrap_or(d.min_hedge_shares),
            max_hedge_shares_per_order: canonical
                .max_hedge_shares_per_order
                .or(self.hedge.max_hedge_shares_per_order)
                .or(self.state_space.hedge.max_hedge_shares_per_order)
                .unwrap_or(d.max_hedge_shares_per_order),
            cooldown_sec: canonical
                .cooldown_seconds
                .or(canonical.cooldown_sec)
                .or(self.hedge.cooldown_seconds)
                .or(self.hedge.cooldown_sec)
                .or(self.state_space.hedge.cooldown_sec)
                .unwrap_or(d.cooldown_sec),
            min_price_move_pct: canonical
                .min_price_move_pct
                .or(self.hedge.min_price_move_pct)
                .or(self.state_space.hedge.min_price_move_pct)
                .unwrap_or(d.min_price_move_pct),
        }
    }

    /// Order-send risk limits.
    pub fn resolved_risk(&self) -> RiskConfig {
        let d = RiskConfig::default();
        let canonical = &self.gates.guard.risk;
        RiskConfig {
            max_daily_hedge_count: canonical
                .max_daily_hedge_count
                .or(self.risk.max_daily_hedge_count)
                .unwrap_or(d.max_daily_hedge_count),
            max_position_shares: canonical
                .max_position_shares
                .or(self.risk.max_position_shares)
                .unwrap_or(d.max_position_shares),
            max_daily_loss_usd: canonical
                .max_daily_loss_usd
                .or(self.risk.max_daily_loss_usd)
                .unwrap_or(d.max_daily_loss_usd),
            max_spread_pct: canonical.max_spread_pct.or(self.risk.max_spread_pct),
            max_net_delta_shares: canonical
                .max_net_delta_shares
                .or(self.risk.max_net_delta_shares),
            paper_trade: canonical
                .paper_trade
                .or(self.risk.paper_trade)
                .unwrap_or(d.paper_trade),
            trading_hours_only: self
                .gates
                .strategy
                .trading_hours_only
                .or(canonical.trading_hours_only)
                .or(self.risk.trading_hours_only)
                .unwrap_or(d.trading_hours_only),
        }
    }

    /// One-line summary persisted in `status_current.config_summary`.
    pub fn summary(&self) -> String {
        let gates = self.resolved_state_gates();
        let intent = self.resolved_hedge_intent();
        let risk = self.resolved_risk();
        format!(
            "symbol={} eps={} hedge={} max={} cooldown={}s max_per_order={} paper={}",
            self.symbol,
            gates.delta.epsilon_band,
            gates.delta.hedge_threshold,
            gates.delta.max_delta_limit,
            intent.cooldown_sec,
            intent.max_hedge_shares_per_order,
            risk.paper_trade,
        )
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_uses_defaults() {
        let cfg: HedgeConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.symbol, "NVDA");
        assert!(cfg.strategy_enabled);
        let gates = cfg.resolved_state_gates();
        assert_eq!(gates.delta.epsilon_band, 10.0);
        assert_eq!(gates.delta.hedge_threshold, 25.0);
        assert_eq!(gates.delta.max_delta_limit, 500.0);
        assert_eq!(gates.liquidity.wide_spread_pct, 0.1);
        assert_eq!(gates.system.data_lag_threshold_ms, 1000.0);
        let intent = cfg.resolved_hedge_intent();
        assert_eq!(intent.min_hedge_shares, 10);
        assert_eq!(intent.cooldown_sec, 60);
        let risk = cfg.resolved_risk();
        assert!(risk.paper_trade);
        assert_eq!(risk.max_daily_hedge_count, 50);
    }

    #[test]
    fn gates_layout_is_canonical() {
        let yaml = r#"
symbol: AAPL
gates:
  state:
    delta:
      epsilon_band: 5
      hedge_threshold: 20
      max_delta_limit: 400
    liquidity:
      wide_spread_pct: 0.2
  intent:
    hedge:
      cooldown_seconds: 120
      max_hedge_shares_per_order: 250
  guard:
    risk:
      max_daily_hedge_count: 12
      paper_trade: false
  strategy:
    structure:
      min_dte: 14
      max_dte: 45
    trading_hours_only: false
"#;
        let cfg: HedgeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.symbol, "AAPL");
        let gates = cfg.resolved_state_gates();
        assert_eq!(gates.delta.epsilon_band, 5.0);
        assert_eq!(gates.delta.hedge_threshold, 20.0);
        assert_eq!(gates.delta.max_delta_limit, 400.0);
        assert_eq!(gates.liquidity.wide_spread_pct, 0.2);
        // Unset extreme spread falls back to the default.
        assert_eq!(gates.liquidity.extreme_spread_pct, 0.5);
        let intent = cfg.resolved_hedge_intent();
        assert_eq!(intent.cooldown_sec, 120);
        assert_eq!(intent.max_hedge_shares_per_order, 250);
        let risk = cfg.resolved_risk();
        assert_eq!(risk.max_daily_hedge_count, 12);
        assert!(!risk.paper_trade);
        assert!(!risk.trading_hours_only);
        let st = cfg.resolved_structure();
        assert_eq!(st.min_dte, 14);
        assert_eq!(st.max_dte, 45);
    }

    #[test]
    fn legacy_sections_are_fallbacks() {
        let yaml = r#"
hedge:
  cooldown_sec: 90
  min_hedge_shares: 25
risk:
  max_position_shares: 750
  paper_trade: false
structure:
  atm_band_pct: 0.05
state_space:
  delta:
    epsilon_band: 7
  liquidity:
    extreme_spread_pct: 0.8
"#;
        let cfg: HedgeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.resolved_hedge_intent().cooldown_sec, 90);
        assert_eq!(cfg.resolved_hedge_intent().min_hedge_shares, 25);
        assert_eq!(cfg.resolved_risk().max_position_shares, 750);
        assert!(!cfg.resolved_risk().paper_trade);
        assert_eq!(cfg.resolved_structure().atm_band_pct, 0.05);
        assert_eq!(cfg.resolved_state_gates().delta.epsilon_band, 7.0);
        assert_eq!(cfg.resolved_state_gates().liquidity.extreme_spread_pct, 0.8);
    }

    #[test]
    fn gates_take_precedence_over_legacy() {
        let yaml = r#"
gates:
  intent:
    hedge:
      cooldown_seconds: 30
hedge:
  cooldown_sec: 600
"#;
        let cfg: HedgeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.resolved_hedge_intent().cooldown_sec, 30);
    }

    #[test]
    fn earnings_dates_filter_blanks() {
        let yaml = r#"
gates:
  strategy:
    earnings:
      dates: ["2026-02-19", "", "2026-05-20"]
      blackout_days_before: 2
"#;
        let cfg: HedgeConfig = serde_yaml::from_str(yaml).unwrap();
        let e = cfg.resolved_earnings();
        assert_eq!(e.dates, vec!["2026-02-19", "2026-05-20"]);
        assert_eq!(e.blackout_days_before, 2);
        assert_eq!(e.blackout_days_after, 1);
    }

    #[test]
    fn config_summary_mentions_key_gates() {
        let cfg = HedgeConfig::default();
        let summary = cfg.summary();
        assert!(summary.contains("symbol=NVDA"));
        assert!(summary.contains("eps=10"));
        assert!(summary.contains("hedge=25"));
        assert!(summary.contains("paper=true"));
    }
}
