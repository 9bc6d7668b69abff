// =============================================================================
// Broker Contract
// =============================================================================
//
// The abstract surface the daemon consumes from a broker connection:
// connect / positions / market data subscriptions / order placement. A real
// TWS or gateway client lives behind this trait out of tree; the in-tree
// `PaperBroker` backs paper-trade mode and the test suite.
//
// Threading rule: subscription callbacks may fire on a broker-owned task.
// They must never touch the FSMs directly; the orchestrator installs
// closures that forward events onto its own channel.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::portfolio::PositionRow;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures surfaced by a broker client.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker not connected")]
    NotConnected,
    #[error("connect timed out after {0:.0}s")]
    ConnectTimeout(f64),
    #[error("order rejected: {0}")]
    OrderRejected(String),
    #[error("broker transport error: {0}")]
    Transport(String),
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// BUY / SELL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// Signed direction: +1 for BUY, -1 for SELL.
    pub fn sign(self) -> i64 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Market or limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    /// Parse a config string; anything other than "limit" is market.
    pub fn from_config(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("limit") {
            Self::Limit
        } else {
            Self::Market
        }
    }
}

/// One contract as reported by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerContract {
    pub symbol: String,
    /// "STK" or "OPT".
    pub sec_type: String,
    /// YYYYMMDD; empty for stock.
    pub expiry: String,
    pub strike: Option<f64>,
    /// "C" / "P"; empty for stock.
    pub right: String,
    pub multiplier: i64,
    pub exchange: String,
    pub currency: String,
}

impl BrokerContract {
    pub fn stock(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            sec_type: "STK".to_string(),
            expiry: String::new(),
            strike: None,
            right: String::new(),
            multiplier: 1,
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
        }
    }

    pub fn option(symbol: &str, expiry: &str, strike: f64, right: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            sec_type: "OPT".to_string(),
            expiry: expiry.to_string(),
            strike: Some(strike),
            right: right.to_string(),
            multiplier: 100,
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
        }
    }
}

/// One position row as reported by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerPosition {
    pub contract: BrokerContract,
    /// Signed quantity; long > 0.
    pub quantity: f64,
    pub avg_cost: Option<f64>,
    pub account: Option<String>,
}

impl PositionRow for BrokerPosition {
    fn symbol(&self) -> &str {
        &self.contract.symbol
    }
    fn sec_type(&self) -> &str {
        &self.contract.sec_type
    }
    fn expiry(&self) -> &str {
        &self.contract.expiry
    }
    fn strike(&self) -> Option<f64> {
        self.contract.strike
    }
    fn right(&self) -> &str {
        &self.contract.right
    }
    fn multiplier(&self) -> i64 {
        self.contract.multiplier
    }
    fn quantity(&self) -> f64 {
        self.quantity
    }
}

/// Ticker callback payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickerUpdate {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
}

/// Ack callback payload.
#[derive(Debug, Clone)]
pub struct AckReport {
    pub order_id: String,
    pub ok: bool,
    pub reject_reason: Option<String>,
}

/// Fill callback payload.
#[derive(Debug, Clone)]
pub struct FillReport {
    pub order_id: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: Option<f64>,
    /// Cumulative filled quantity on the order.
    pub cumulative: i64,
    pub is_full: bool,
}

/// Handle returned by a successful `place_order`.
#[derive(Debug, Clone)]
pub struct OrderTicket {
    pub order_id: String,
}

/// One account's summary and positions, for the refresh_accounts sync.
#[derive(Debug, Clone, Default)]
pub struct AccountSnapshot {
    pub account_id: String,
    /// Raw summary tags (NetLiquidation, TotalCashValue, BuyingPower, ...).
    pub summary: HashMap<String, String>,
    pub positions: Vec<BrokerPosition>,
}

pub type TickerCallback = Box<dyn Fn(TickerUpdate) + Send + Sync>;
pub type PositionsCallback = Box<dyn Fn() + Send + Sync>;
pub type AckCallback = Box<dyn Fn(AckReport) + Send + Sync>;
pub type FillCallback = Box<dyn Fn(FillReport) + Send + Sync>;

// ---------------------------------------------------------------------------
// The trait
// ---------------------------------------------------------------------------

/// Operations the daemon consumes from a broker client.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connect; returns false on failure (the daemon retries, it never
    /// treats a connect failure as fatal).
    async fn connect(&self) -> bool;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// The client id in use for this session.
    fn client_id(&self) -> i32;

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    /// Mid of bid/ask, else last.
    async fn get_underlying_price(&self, symbol: &str) -> Result<Option<f64>, BrokerError>;

    fn subscribe_ticker(&self, symbol: &str, on_update: TickerCallback);

    fn subscribe_positions(&self, on_update: PositionsCallback);

    fn subscribe_fills(&self, on_ack: AckCallback, on_fill: FillCallback);

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: i64,
        order_type: OrderType,
        limit_price: Option<f64>,
    ) -> Result<OrderTicket, BrokerError>;

    /// Account summaries + positions for the refresh_accounts control.
    async fn account_snapshots(&self) -> Result<Vec<AccountSnapshot>, BrokerError>;
}

// ---------------------------------------------------------------------------
// PaperBroker
// ---------------------------------------------------------------------------

struct PaperInner {
    connected: bool,
    positions: Vec<BrokerPosition>,
    quote: TickerUpdate,
    ticker_cb: Option<TickerCallback>,
    positions_cb: Option<PositionsCallback>,
    ack_cb: Option<AckCallback>,
    fill_cb: Option<FillCallback>,
    orders_placed: Vec<(String, OrderSide, i64)>,
    fail_orders: bool,
}

/// In-process broker used for paper-trade mode and tests: connect always
/// succeeds, orders fill synchronously via the registered callbacks.
pub struct PaperBroker {
    inner: Arc<Mutex<PaperInner>>,
    client_id: i32,
}

impl PaperBroker {
    pub fn new(client_id: i32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PaperInner {
                connected: false,
                positions: Vec::new(),
                quote: TickerUpdate::default(),
                ticker_cb: None,
                positions_cb: None,
                ack_cb: None,
                fill_cb: None,
                orders_placed: Vec::new(),
                fail_orders: false,
            })),
            client_id,
        }
    }

    /// Seed the simulated position book and fire the positions callback.
    pub fn set_positions(&self, positions: Vec<BrokerPosition>) {
        let inner = &mut *self.inner.lock();
        inner.positions = positions;
        if let Some(ref f) = inner.positions_cb {
            f();
        }
    }

    /// Seed the simulated quote and fire the ticker callback.
    pub fn push_quote(&self, bid: f64, ask: f64) {
        let update = TickerUpdate {
            bid: Some(bid),
            ask: Some(ask),
            last: Some((bid + ask) / 2.0),
        };
        let inner = &mut *self.inner.lock();
        inner.quote = update;
        if let Some(ref f) = inner.ticker_cb {
            f(update);
        }
    }

    /// Make subsequent orders reject (for failure-path tests).
    pub fn set_fail_orders(&self, fail: bool) {
        self.inner.lock().fail_orders = fail;
    }

    /// Orders recorded so far: (order_id, side, quantity).
    pub fn orders_placed(&self) -> Vec<(String, OrderSide, i64)> {
        self.inner.lock().orders_placed.clone()
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn connect(&self) -> bool {
        self.inner.lock().connected = true;
        info!(client_id = self.client_id, "paper broker connected");
        true
    }

    async fn disconnect(&self) {
        self.inner.lock().connected = false;
        info!("paper broker disconnected");
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    fn client_id(&self) -> i32 {
        self.client_id
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let inner = self.inner.lock();
        if !inner.connected {
            return Err(BrokerError::NotConnected);
        }
        Ok(inner.positions.clone())
    }

    async fn get_underlying_price(&self, _symbol: &str) -> Result<Option<f64>, BrokerError> {
        let inner = self.inner.lock();
        if !inner.connected {
            return Err(BrokerError::NotConnected);
        }
        let q = inner.quote;
        Ok(match (q.bid, q.ask) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => q.last,
        })
    }

    fn subscribe_ticker(&self, symbol: &str, on_update: TickerCallback) {
        debug!(symbol, "paper broker ticker subscription");
        self.inner.lock().ticker_cb = Some(on_update);
    }

    fn subscribe_positions(&self, on_update: PositionsCallback) {
        self.inner.lock().positions_cb = Some(on_update);
    }

    fn subscribe_fills(&self, on_ack: AckCallback, on_fill: FillCallback) {
        let mut inner = self.inner.lock();
        inner.ack_cb = Some(on_ack);
        inner.fill_cb = Some(on_fill);
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: i64,
        order_type: OrderType,
        limit_price: Option<f64>,
    ) -> Result<OrderTicket, BrokerError> {
        if quantity <= 0 {
            return Err(BrokerError::OrderRejected("quantity <= 0".to_string()));
        }
        let order_id = Uuid::new_v4().to_string();
        {
            let mut inner = self.inner.lock();
            if !inner.connected {
                return Err(BrokerError::NotConnected);
            }
            if inner.fail_orders {
                warn!(symbol, %side, quantity, "paper broker rejecting order");
                if let Some(ref ack) = inner.ack_cb {
                    ack(AckReport {
                        order_id: order_id.clone(),
                        ok: false,
                        reject_reason: Some("simulated reject".to_string()),
                    });
                }
                return Err(BrokerError::OrderRejected("simulated reject".to_string()));
            }
            inner.orders_placed.push((order_id.clone(), side, quantity));

            // Apply the fill to the simulated stock position.
            let delta = (side.sign() * quantity) as f64;
            match inner
                .positions
                .iter_mut()
                .find(|p| p.contract.sec_type == "STK" && p.contract.symbol == symbol)
            {
                Some(stock) => stock.quantity += delta,
                None => inner.positions.push(BrokerPosition {
                    contract: BrokerContract::stock(symbol),
                    quantity: delta,
                    avg_cost: None,
                    account: None,
                }),
            }
        }

        let fill_price = {
            let inner = self.inner.lock();
            match order_type {
                OrderType::Limit => limit_price.or(inner.quote.last),
                OrderType::Market => match (inner.quote.bid, inner.quote.ask) {
                    (Some(b), Some(a)) => Some((b + a) / 2.0),
                    _ => inner.quote.last,
                },
            }
        };

        info!(symbol, %side, quantity, ?fill_price, "paper order placed");

        // Synchronous ack + full fill.
        let inner = self.inner.lock();
        if let Some(ref ack) = inner.ack_cb {
            ack(AckReport {
                order_id: order_id.clone(),
                ok: true,
                reject_reason: None,
            });
        }
        if let Some(ref fill) = inner.fill_cb {
            fill(FillReport {
                order_id: order_id.clone(),
                side,
                quantity,
                price: fill_price,
                cumulative: quantity,
                is_full: true,
            });
        }
        Ok(OrderTicket { order_id })
    }

    async fn account_snapshots(&self) -> Result<Vec<AccountSnapshot>, BrokerError> {
        let inner = self.inner.lock();
        if !inner.connected {
            return Err(BrokerError::NotConnected);
        }
        let mut summary = HashMap::new();
        summary.insert("NetLiquidation".to_string(), "1000000".to_string());
        summary.insert("TotalCashValue".to_string(), "500000".to_string());
        summary.insert("BuyingPower".to_string(), "2000000".to_string());
        Ok(vec![AccountSnapshot {
            account_id: "PAPER1".to_string(),
            summary,
            positions: inner.positions.clone(),
        }])
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn paper_broker_connect_and_quote() {
        let broker = PaperBroker::new(7);
        assert!(!broker.is_connected());
        assert!(broker.connect().await);
        assert!(broker.is_connected());
        broker.push_quote(99.0, 101.0);
        let mid = broker.get_underlying_price("NVDA").await.unwrap();
        assert_eq!(mid, Some(100.0));
    }

    #[tokio::test]
    async fn paper_order_fires_ack_and_full_fill() {
        let broker = PaperBroker::new(1);
        broker.connect().await;
        broker.push_quote(99.0, 101.0);

        let acks = Arc::new(AtomicUsize::new(0));
        let fills = Arc::new(AtomicUsize::new(0));
        let a = acks.clone();
        let f = fills.clone();
        broker.subscribe_fills(
            Box::new(move |ack| {
                assert!(ack.ok);
                a.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(move |fill| {
                assert!(fill.is_full);
                assert_eq!(fill.quantity, 50);
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let ticket = broker
            .place_order("NVDA", OrderSide::Sell, 50, OrderType::Market, None)
            .await
            .unwrap();
        assert!(!ticket.order_id.is_empty());
        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(fills.load(Ordering::SeqCst), 1);
        assert_eq!(broker.orders_placed().len(), 1);

        // The fill lands in the simulated position book.
        let positions = broker.get_positions().await.unwrap();
        let stock = positions
            .iter()
            .find(|p| p.contract.sec_type == "STK")
            .unwrap();
        assert_eq!(stock.quantity, -50.0);
    }

    #[tokio::test]
    async fn paper_order_reject_path() {
        let broker = PaperBroker::new(1);
        broker.connect().await;
        broker.set_fail_orders(true);
        let err = broker
            .place_order("NVDA", OrderSide::Buy, 10, OrderType::Market, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::OrderRejected(_)));
    }

    #[tokio::test]
    async fn disconnected_broker_refuses_positions() {
        let broker = PaperBroker::new(1);
        let err = broker.get_positions().await.unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected));
    }

    #[test]
    fn order_side_helpers() {
        assert_eq!(OrderSide::Buy.as_str(), "BUY");
        assert_eq!(OrderSide::Sell.sign(), -1);
        assert_eq!(OrderType::from_config("LIMIT"), OrderType::Limit);
        assert_eq!(OrderType::from_config("market"), OrderType::Market);
    }
}
