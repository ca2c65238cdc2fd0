//! Order manager: order lifecycle state machine, fill simulation, order
//! type downgrade.
//!
//! The state machine (`OrderState`/`Event`/`apply_event`, fill-id dedupe)
//! drives the full lifecycle itself rather than observing it from a wire
//! feed. Fill probability/price/fee simulation is this engine's sandbox
//! substitute for a real matching engine.

use crate::contracts::FeeInfo;
use crate::pricing::Side;
use rand::Rng;
use rust_decimal::prelude::*;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TakeProfit,
    TakeProfitLimit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Stop => "stop",
            OrderType::StopLimit => "stop_limit",
            OrderType::TakeProfit => "take_profit",
            OrderType::TakeProfitLimit => "take_profit_limit",
        }
    }

    /// Downgrade chain: `stop_limit -> limit`, `stop -> market`,
    /// `take_profit{_limit} -> limit`, last resort market.
    pub fn downgrade(&self) -> Option<OrderType> {
        match self {
            OrderType::StopLimit => Some(OrderType::Limit),
            OrderType::Stop => Some(OrderType::Market),
            OrderType::TakeProfit | OrderType::TakeProfitLimit => Some(OrderType::Limit),
            OrderType::Limit => Some(OrderType::Market),
            OrderType::Market => None,
        }
    }
}

/// Picks the first type the connector supports, following the downgrade
/// chain. `None` if nothing in the chain (down to market) is supported.
pub fn resolve_supported_type(requested: OrderType, supported: &[String]) -> Option<OrderType> {
    let mut current = requested;
    loop {
        if supported.iter().any(|s| s == current.as_str()) {
            return Some(current);
        }
        current = current.downgrade()?;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    New,
    Submitted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct Order {
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>, // None for market
    pub reduce_only: bool,
    pub state: OrderState,
    pub filled_qty: Decimal,
    seen_fills: HashSet<String>,
}

impl Order {
    pub fn new(client_id: String, symbol: String, side: Side, order_type: OrderType, qty: Decimal, price: Option<Decimal>, reduce_only: bool) -> Self {
        Self {
            client_id,
            symbol,
            side,
            order_type,
            qty,
            price,
            reduce_only,
            state: OrderState::New,
            filled_qty: Decimal::ZERO,
            seen_fills: HashSet::new(),
        }
    }

    pub fn remaining_qty(&self) -> Decimal {
        (self.qty - self.filled_qty).max(Decimal::ZERO)
    }

    pub fn submit(&mut self) {
        if self.state == OrderState::New {
            self.state = OrderState::Submitted;
        }
    }

    /// Idempotent on `fill_id` (a replayed fill notification is a no-op).
    pub fn apply_fill(&mut self, fill_id: &str, qty: Decimal) {
        if !self.seen_fills.insert(fill_id.to_string()) {
            return;
        }
        self.filled_qty += qty;
        self.state = if self.remaining_qty() <= Decimal::new(1, 8) { OrderState::Filled } else { OrderState::PartiallyFilled };
    }

    pub fn cancel(&mut self) {
        if matches!(self.state, OrderState::Submitted | OrderState::PartiallyFilled) {
            self.state = OrderState::Canceled;
        }
    }

    pub fn reject(&mut self) {
        self.state = OrderState::Rejected;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimulatedFill {
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub is_maker: bool,
}

/// Fill probability: market ~0.99*liquidity; limit depends
/// on favorability of `order.price` vs `mkt`; stop only when `mkt` has
/// crossed the trigger. `liquidity` is a `(0,1]` multiplier supplied by the
/// caller (venue/connector specific); defaults to 1.0 upstream.
pub fn fill_probability(order: &Order, mkt: Decimal, liquidity: f64) -> f64 {
    match order.order_type {
        OrderType::Market => 0.99 * liquidity,
        OrderType::Limit => {
            let Some(limit_price) = order.price else { return 0.0 };
            let favorable = match order.side {
                Side::Long => limit_price >= mkt,
                Side::Short => limit_price <= mkt,
            };
            if favorable {
                0.95 * liquidity
            } else {
                let distance = ((limit_price - mkt).abs() / mkt.max(Decimal::new(1, 8))).to_f64().unwrap_or(1.0);
                (0.3 * liquidity * (-distance * 50.0).exp()).max(0.0)
            }
        }
        OrderType::Stop | OrderType::StopLimit | OrderType::TakeProfit | OrderType::TakeProfitLimit => {
            let Some(trigger) = order.price else { return 0.0 };
            let crossed = match order.side {
                Side::Long => mkt <= trigger,
                Side::Short => mkt >= trigger,
            };
            if crossed { 0.97 * liquidity } else { 0.0 }
        }
    }
}

/// Simulates a fill at the current mark. Caller decides whether the draw
/// against `fill_probability` succeeds; this only computes price/fee given
/// that it did.
pub fn simulate_fill(order: &Order, mkt: Decimal, qty: Decimal, fees: FeeInfo, slippage_bps: Decimal, rng: &mut impl Rng) -> SimulatedFill {
    let is_maker = matches!(order.order_type, OrderType::Limit) && order.price.map(|p| match order.side {
        Side::Long => p < mkt,
        Side::Short => p > mkt,
    }).unwrap_or(false);

    let price = match order.order_type {
        OrderType::Market | OrderType::Stop | OrderType::TakeProfit => {
            let slip_frac = Decimal::from_f64(rng.gen_range(0.0..1.0)).unwrap_or(Decimal::ZERO) * slippage_bps / Decimal::new(10_000, 0);
            match order.side {
                Side::Long => mkt * (Decimal::ONE + slip_frac),
                Side::Short => mkt * (Decimal::ONE - slip_frac),
            }
        }
        OrderType::Limit | OrderType::StopLimit | OrderType::TakeProfitLimit => order.price.unwrap_or(mkt),
    };

    let fee_bps = if is_maker { fees.maker_fee_bps } else { fees.taker_fee_bps };
    let fee = qty * price * fee_bps / Decimal::new(10_000, 0);

    SimulatedFill { qty, price, fee, is_maker }
}
