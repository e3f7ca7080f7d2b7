use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::strategy::errors::ExchangeError;
use crate::strategy::execution_backend::ExchangeBackend;
use crate::strategy::symbol_meta::SymbolMeta;
use crate::strategy::types::{
    LimitOrderRequest, MarginMode, MarketOrderRequest, OpenOrder, PositionInfo, PositionSide,
};

/// Remote operations that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    GetBalance,
    GetPosition,
    GetLastPrice,
    SubmitMarketOrder,
    SubmitLimitOrder,
    SetNativeStop,
    ClearNativeStop,
    ListOpenOrders,
    CancelOrder,
}

/// Every write the paper exchange accepted, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum PaperEvent {
    Leverage { symbol: String, leverage: u32, margin_mode: MarginMode },
    MarketOrder(MarketOrderRequest),
    LimitOrder(LimitOrderRequest),
    NativeStop { symbol: String, position_idx: u8, take_profit: Option<String>, stop_loss: Option<String> },
    ClearNativeStop { symbol: String, position_idx: u8 },
    Cancel { symbol: String, order_id: String },
}

#[derive(Debug, Clone, Default)]
struct PaperPosition {
    size: f64,
    avg_price: f64,
}

#[derive(Debug, Clone)]
struct RestingOrder {
    order_id: String,
    request: LimitOrderRequest,
}

struct PaperState {
    balance: f64,
    meta: HashMap<String, SymbolMeta>,
    last_prices: HashMap<String, f64>,
    mark_prices: HashMap<String, f64>,
    positions: HashMap<(String, u8), PaperPosition>,
    resting: Vec<RestingOrder>,
    native_stops: HashMap<(String, u8), (Option<String>, Option<String>)>,
    journal: Vec<PaperEvent>,
    fill_market_orders: bool,
    honor_reduce_only: bool,
    report_entry_price: bool,
    failures: HashMap<PaperOp, InjectedFailure>,
}

/// Let `skip` calls through, then fail the following `times`.
#[derive(Debug, Clone, Copy)]
struct InjectedFailure {
    skip: u32,
    times: u32,
}

impl PaperState {
    fn check(&mut self, op: PaperOp) -> Result<(), ExchangeError> {
        let Some(plan) = self.failures.get_mut(&op) else {
            return Ok(());
        };
        if plan.skip > 0 {
            plan.skip -= 1;
            return Ok(());
        }
        if plan.times > 0 {
            plan.times -= 1;
            return Err(ExchangeError::Rejected(format!("injected failure for {:?}", op)));
        }
        Ok(())
    }

    fn apply_fill(&mut self, symbol: &str, position_idx: u8, qty: f64, reduce: bool, price: f64) {
        let pos = self.positions.entry((symbol.to_string(), position_idx)).or_default();
        if reduce {
            pos.size = (pos.size - qty).max(0.0);
            if pos.size == 0.0 {
                pos.avg_price = 0.0;
            }
        } else {
            let notional = pos.size * pos.avg_price + qty * price;
            pos.size += qty;
            pos.avg_price = if pos.size > 0.0 { notional / pos.size } else { 0.0 };
        }
    }
}

/// In-memory exchange: simulated balance, positions, resting orders and
/// position-level stops, without real money.
///
/// Market orders fill immediately at the last price; resting limit orders
/// only fill through [`PaperExchange::trigger_order`]. Market data can
/// optionally be read from a live backend.
#[derive(Clone)]
pub struct PaperExchange {
    state: Arc<RwLock<PaperState>>,
    market_data: Option<Arc<dyn ExchangeBackend>>,
}

impl PaperExchange {
    pub fn new(balance: f64) -> Self {
        Self {
            state: Arc::new(RwLock::new(PaperState {
                balance,
                meta: HashMap::new(),
                last_prices: HashMap::new(),
                mark_prices: HashMap::new(),
                positions: HashMap::new(),
                resting: Vec::new(),
                native_stops: HashMap::new(),
                journal: Vec::new(),
                fill_market_orders: true,
                honor_reduce_only: true,
                report_entry_price: true,
                failures: HashMap::new(),
            })),
            market_data: None,
        }
    }

    /// Read instrument metadata and last prices from `source`; trade locally.
    pub fn with_market_data(mut self, source: Arc<dyn ExchangeBackend>) -> Self {
        self.market_data = Some(source);
        self
    }

    pub async fn set_meta(&self, symbol: &str, meta: SymbolMeta) {
        self.state.write().await.meta.insert(symbol.to_string(), meta);
    }

    pub async fn set_last_price(&self, symbol: &str, price: f64) {
        self.state.write().await.last_prices.insert(symbol.to_string(), price);
    }

    pub async fn set_mark_price(&self, symbol: &str, price: f64) {
        self.state.write().await.mark_prices.insert(symbol.to_string(), price);
    }

    pub async fn set_balance(&self, balance: f64) {
        self.state.write().await.balance = balance;
    }

    pub async fn set_position(&self, symbol: &str, side: PositionSide, size: f64, avg_price: f64) {
        self.state
            .write()
            .await
            .positions
            .insert((symbol.to_string(), side.position_idx()), PaperPosition { size, avg_price });
    }

    /// When off, entry market orders are accepted but never become a position.
    pub async fn set_fill_market_orders(&self, fill: bool) {
        self.state.write().await.fill_market_orders = fill;
    }

    /// When off, reduce-only market orders are accepted but the position stays.
    pub async fn set_honor_reduce_only(&self, honor: bool) {
        self.state.write().await.honor_reduce_only = honor;
    }

    /// When off, positions report no average price.
    pub async fn set_report_entry_price(&self, report: bool) {
        self.state.write().await.report_entry_price = report;
    }

    /// Make the next `times` calls of `op` fail.
    pub async fn fail_next(&self, op: PaperOp, times: u32) {
        self.fail_after(op, 0, times).await;
    }

    /// Let the next `skip` calls of `op` succeed, then fail `times` calls.
    pub async fn fail_after(&self, op: PaperOp, skip: u32, times: u32) {
        self.state.write().await.failures.insert(op, InjectedFailure { skip, times });
    }

    /// Fill a resting order by link id as if the market reached its price.
    pub async fn trigger_order(&self, order_link_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(pos) = state.resting.iter().position(|o| o.request.order_link_id == order_link_id) else {
            return false;
        };
        let order = state.resting.remove(pos);
        let qty = order.request.qty.parse::<f64>().unwrap_or(0.0);
        let price = order.request.price.parse::<f64>().unwrap_or(0.0);
        state.apply_fill(&order.request.symbol, order.request.position_idx, qty, order.request.reduce_only, price);
        true
    }

    pub async fn position(&self, symbol: &str, side: PositionSide) -> f64 {
        self.state
            .read()
            .await
            .positions
            .get(&(symbol.to_string(), side.position_idx()))
            .map(|p| p.size)
            .unwrap_or(0.0)
    }

    pub async fn journal(&self) -> Vec<PaperEvent> {
        self.state.read().await.journal.clone()
    }

    pub async fn market_orders(&self) -> Vec<MarketOrderRequest> {
        self.journal()
            .await
            .into_iter()
            .filter_map(|e| match e {
                PaperEvent::MarketOrder(o) => Some(o),
                _ => None,
            })
            .collect()
    }

    pub async fn limit_orders(&self) -> Vec<LimitOrderRequest> {
        self.journal()
            .await
            .into_iter()
            .filter_map(|e| match e {
                PaperEvent::LimitOrder(o) => Some(o),
                _ => None,
            })
            .collect()
    }

    /// Every native-stop update for one position, oldest first.
    pub async fn native_stop_updates(&self, symbol: &str, side: PositionSide) -> Vec<(Option<String>, Option<String>)> {
        let idx = side.position_idx();
        self.journal()
            .await
            .into_iter()
            .filter_map(|e| match e {
                PaperEvent::NativeStop { symbol: s, position_idx, take_profit, stop_loss } if s == symbol && position_idx == idx => {
                    Some((take_profit, stop_loss))
                }
                _ => None,
            })
            .collect()
    }

    /// Current position-level (take_profit, stop_loss).
    pub async fn native_stop(&self, symbol: &str, side: PositionSide) -> Option<(Option<String>, Option<String>)> {
        self.state
            .read()
            .await
            .native_stops
            .get(&(symbol.to_string(), side.position_idx()))
            .cloned()
    }

    pub async fn resting_link_ids(&self, symbol: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .resting
            .iter()
            .filter(|o| o.request.symbol == symbol)
            .map(|o| o.request.order_link_id.clone())
            .collect()
    }

    async fn local_last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.state
            .read()
            .await
            .last_prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::decode(format!("no price for {}", symbol)))
    }
}

#[async_trait::async_trait]
impl ExchangeBackend for PaperExchange {
    async fn get_instrument_meta(&self) -> Result<HashMap<String, SymbolMeta>, ExchangeError> {
        if let Some(source) = &self.market_data {
            let meta = source.get_instrument_meta().await?;
            self.state.write().await.meta = meta.clone();
            return Ok(meta);
        }
        Ok(self.state.read().await.meta.clone())
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        let mut state = self.state.write().await;
        state.check(PaperOp::GetBalance)?;
        Ok(state.balance)
    }

    async fn set_leverage_and_mode(
        &self,
        symbol: &str,
        buy_leverage: u32,
        _sell_leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<bool, ExchangeError> {
        let mut state = self.state.write().await;
        state.journal.push(PaperEvent::Leverage {
            symbol: symbol.to_string(),
            leverage: buy_leverage,
            margin_mode,
        });
        Ok(true)
    }

    async fn get_position(&self, symbol: &str, position_idx: u8) -> Result<PositionInfo, ExchangeError> {
        let pos = {
            let mut state = self.state.write().await;
            state.check(PaperOp::GetPosition)?;
            state
                .positions
                .get(&(symbol.to_string(), position_idx))
                .cloned()
                .unwrap_or_default()
        };

        // Open positions are marked at the live price when a source is attached.
        let mut live = None;
        if pos.size > 0.0 {
            if let Some(source) = &self.market_data {
                let price = source.get_last_price(symbol).await?;
                self.set_last_price(symbol, price).await;
                live = Some(price);
            }
        }

        let state = self.state.read().await;
        let mark = live.or_else(|| {
            state
                .mark_prices
                .get(symbol)
                .or_else(|| state.last_prices.get(symbol))
                .copied()
        });
        Ok(PositionInfo {
            size: pos.size,
            avg_price: (state.report_entry_price && pos.size > 0.0).then_some(pos.avg_price),
            mark_price: if pos.size > 0.0 { mark } else { None },
        })
    }

    async fn get_last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.state.write().await.check(PaperOp::GetLastPrice)?;
        if let Some(source) = &self.market_data {
            let price = source.get_last_price(symbol).await?;
            self.set_last_price(symbol, price).await;
            return Ok(price);
        }
        self.local_last_price(symbol).await
    }

    async fn submit_market_order(&self, order: MarketOrderRequest) -> Result<String, ExchangeError> {
        let mut state = self.state.write().await;
        state.check(PaperOp::SubmitMarketOrder)?;
        let qty = order
            .qty
            .parse::<f64>()
            .map_err(|_| ExchangeError::Rejected(format!("bad qty '{}'", order.qty)))?;
        let price = state.last_prices.get(&order.symbol).copied().unwrap_or(0.0);

        let fills = if order.reduce_only { state.honor_reduce_only } else { state.fill_market_orders };
        if fills {
            state.apply_fill(&order.symbol, order.position_idx, qty, order.reduce_only, price);
        }
        state.journal.push(PaperEvent::MarketOrder(order));
        Ok(format!("paper_{}", Uuid::new_v4()))
    }

    async fn submit_limit_order(&self, order: LimitOrderRequest) -> Result<String, ExchangeError> {
        let mut state = self.state.write().await;
        state.check(PaperOp::SubmitLimitOrder)?;
        let order_id = format!("paper_{}", Uuid::new_v4());
        state.resting.push(RestingOrder {
            order_id: order_id.clone(),
            request: order.clone(),
        });
        state.journal.push(PaperEvent::LimitOrder(order));
        Ok(order_id)
    }

    async fn set_native_stop(
        &self,
        symbol: &str,
        position_idx: u8,
        take_profit: Option<String>,
        stop_loss: Option<String>,
    ) -> Result<(), ExchangeError> {
        let mut state = self.state.write().await;
        state.check(PaperOp::SetNativeStop)?;
        let current = state
            .native_stops
            .entry((symbol.to_string(), position_idx))
            .or_insert((None, None));
        if take_profit.is_some() {
            current.0 = take_profit.clone();
        }
        if stop_loss.is_some() {
            current.1 = stop_loss.clone();
        }
        state.journal.push(PaperEvent::NativeStop {
            symbol: symbol.to_string(),
            position_idx,
            take_profit,
            stop_loss,
        });
        Ok(())
    }

    async fn clear_native_stop(&self, symbol: &str, position_idx: u8) -> Result<(), ExchangeError> {
        let mut state = self.state.write().await;
        state.check(PaperOp::ClearNativeStop)?;
        state.native_stops.remove(&(symbol.to_string(), position_idx));
        state.journal.push(PaperEvent::ClearNativeStop {
            symbol: symbol.to_string(),
            position_idx,
        });
        Ok(())
    }

    async fn list_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let mut state = self.state.write().await;
        state.check(PaperOp::ListOpenOrders)?;
        Ok(state
            .resting
            .iter()
            .filter(|o| o.request.symbol == symbol)
            .map(|o| OpenOrder {
                order_id: o.order_id.clone(),
                order_link_id: o.request.order_link_id.clone(),
            })
            .collect())
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.write().await;
        state.check(PaperOp::CancelOrder)?;
        let before = state.resting.len();
        state.resting.retain(|o| o.order_id != order_id);
        if state.resting.len() == before {
            return Err(ExchangeError::Rejected(format!("order {} not found", order_id)));
        }
        state.journal.push(PaperEvent::Cancel {
            symbol: symbol.to_string(),
            order_id: order_id.to_string(),
        });
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "PaperTrading"
    }
}
