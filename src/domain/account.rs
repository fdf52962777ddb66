//! Simulated brokerage account: positions, trades, cash, daily loss
//! tracking. Every mutating operation is a pure function of the pre-state
//! that returns a new state plus either an emitted `Trade` or a
//! `SkipReason` — never an exception, never a `null`.

use crate::domain::errors::SkipReason;
use crate::domain::position::{DcaState, Position, Side, StagedTakeProfit, TrailingStopState};
use crate::domain::trade::{Trade, TradeSide};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DailyLoss {
    pub date: NaiveDate,
    pub cumulative_loss: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub scenario: String,
    pub initial_cash: Decimal,
    pub cash: Decimal,
    pub positions: HashMap<String, Position>,
    pub trades: Vec<Trade>,
    pub created_at: i64,
    pub updated_at: i64,
    pub daily_loss: Option<DailyLoss>,
    /// Set once `(initial - equity)/initial*100 >= maxTotalLossPct`; blocks
    /// new opens until manually resumed.
    pub paused: bool,
}

impl Account {
    pub fn new(scenario: impl Into<String>, initial_cash: Decimal, now: i64) -> Self {
        Self {
            scenario: scenario.into(),
            initial_cash,
            cash: initial_cash,
            positions: HashMap::new(),
            trades: Vec::new(),
            created_at: now,
            updated_at: now,
            daily_loss: None,
            paused: false,
        }
    }

    pub fn equity(&self, marks: &HashMap<String, Decimal>) -> Decimal {
        let mut equity = self.cash;
        for (symbol, pos) in &self.positions {
            if let Some(&mark) = marks.get(symbol) {
                equity += pos.mark_to_market(mark);
            }
        }
        equity
    }

    pub fn win_rate(&self) -> Decimal {
        let closed: Vec<&Trade> = self.trades.iter().filter(|t| t.is_closing()).collect();
        if closed.is_empty() {
            return Decimal::ZERO;
        }
        let wins = closed.iter().filter(|t| t.is_win()).count();
        Decimal::from(wins) / Decimal::from(closed.len()) * Decimal::from(100)
    }

    fn record_realized_loss(&mut self, pnl: Decimal, date: NaiveDate) {
        if pnl >= Decimal::ZERO {
            return;
        }
        let loss = -pnl;
        match &mut self.daily_loss {
            Some(dl) if dl.date == date => dl.cumulative_loss += loss,
            _ => {
                self.daily_loss = Some(DailyLoss {
                    date,
                    cumulative_loss: loss,
                })
            }
        }
    }

    pub fn today_realized_loss(&self, today: NaiveDate) -> Decimal {
        match &self.daily_loss {
            Some(dl) if dl.date == today => dl.cumulative_loss,
            _ => Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    pub fee_rate: Decimal,
    pub slippage_percent: Decimal,
    pub spread_bps: Decimal,
    pub position_ratio: Decimal,
    pub stop_loss_percent: Decimal,
    pub take_profit_percent: Decimal,
    pub usdt_to_spend_override: Option<Decimal>,
    pub min_order_size: Decimal,
    pub is_futures_or_margin_market: bool,
}

fn price_is_valid(price: Decimal) -> bool {
    price.is_sign_positive() && !price.is_zero()
}

fn spread_adjustment(spread_bps: Decimal) -> Decimal {
    spread_bps / Decimal::from(20_000)
}

/// Open a long position. Rejects (no state change) if a position already
/// exists for `symbol`, spend is below the minimum order size, cash is
/// insufficient, equity is non-positive, or the price is not finite-positive.
pub fn open_long(
    account: &Account,
    symbol: &str,
    price: Decimal,
    reason: &str,
    opts: &OpenOptions,
    now: i64,
    equity: Decimal,
) -> Result<(Account, Trade), SkipReason> {
    if !price_is_valid(price) {
        return Err(SkipReason::PriceInvalid { price });
    }
    if account.positions.contains_key(symbol) {
        return Err(SkipReason::PositionAlreadyOpen {
            symbol: symbol.to_string(),
        });
    }
    if equity <= Decimal::ZERO {
        return Err(SkipReason::NonPositiveEquity);
    }

    let exec_price = price * (Decimal::ONE + opts.slippage_percent + spread_adjustment(opts.spread_bps));
    let spend = opts.usdt_to_spend_override.unwrap_or(equity * opts.position_ratio);

    if spend < opts.min_order_size {
        return Err(SkipReason::BelowMinimumOrderSize {
            spend,
            min: opts.min_order_size,
        });
    }
    if account.cash < spend {
        return Err(SkipReason::InsufficientFunds {
            need: spend,
            available: account.cash,
        });
    }

    let fee = spend * opts.fee_rate;
    let quantity = (spend - fee) / exec_price;

    let mut next = account.clone();
    next.cash -= spend;
    next.updated_at = now;

    let position = Position {
        symbol: symbol.to_string(),
        side: Side::Long,
        quantity,
        entry_price: exec_price,
        entry_time: now,
        stop_loss: exec_price * (Decimal::ONE - opts.stop_loss_percent),
        take_profit: exec_price * (Decimal::ONE + opts.take_profit_percent),
        trailing_stop: TrailingStopState::Inactive,
        dca_state: None,
        staged_take_profits: Vec::new(),
        margin_amount: None,
        signal_history_id: None,
    };
    next.positions.insert(symbol.to_string(), position);

    let trade = Trade {
        id: uuid::Uuid::new_v4().to_string(),
        symbol: symbol.to_string(),
        side: TradeSide::Buy,
        quantity,
        executed_price: exec_price,
        cash_impact: -spend,
        fee,
        slippage: opts.slippage_percent,
        timestamp: now,
        reason: reason.to_string(),
        pnl: None,
        pnl_fraction: None,
        liquidation: false,
    };
    next.trades.push(trade.clone());

    Ok((next, trade))
}

/// Open a short position. Requires a futures/margin market. Margin locked
/// is `equity * position_ratio`; stop-loss sits above entry, take-profit
/// below.
pub fn open_short(
    account: &Account,
    symbol: &str,
    price: Decimal,
    reason: &str,
    opts: &OpenOptions,
    now: i64,
    equity: Decimal,
) -> Result<(Account, Trade), SkipReason> {
    if !opts.is_futures_or_margin_market {
        return Err(SkipReason::MarketUnsupported {
            symbol: symbol.to_string(),
        });
    }
    if !price_is_valid(price) {
        return Err(SkipReason::PriceInvalid { price });
    }
    if account.positions.contains_key(symbol) {
        return Err(SkipReason::PositionAlreadyOpen {
            symbol: symbol.to_string(),
        });
    }
    if equity <= Decimal::ZERO {
        return Err(SkipReason::NonPositiveEquity);
    }

    let exec_price = price * (Decimal::ONE - opts.slippage_percent - spread_adjustment(opts.spread_bps));
    let margin = opts.usdt_to_spend_override.unwrap_or(equity * opts.position_ratio);

    if margin < opts.min_order_size {
        return Err(SkipReason::BelowMinimumOrderSize {
            spend: margin,
            min: opts.min_order_size,
        });
    }
    if account.cash < margin {
        return Err(SkipReason::InsufficientMargin {
            need: margin,
            available: account.cash,
        });
    }

    let fee = margin * opts.fee_rate;
    let quantity = (margin - fee) / exec_price;

    let mut next = account.clone();
    next.cash -= margin;
    next.updated_at = now;

    let position = Position {
        symbol: symbol.to_string(),
        side: Side::Short,
        quantity,
        entry_price: exec_price,
        entry_time: now,
        stop_loss: exec_price * (Decimal::ONE + opts.stop_loss_percent),
        take_profit: exec_price * (Decimal::ONE - opts.take_profit_percent),
        trailing_stop: TrailingStopState::Inactive,
        dca_state: None,
        staged_take_profits: Vec::new(),
        margin_amount: Some(margin),
        signal_history_id: None,
    };
    next.positions.insert(symbol.to_string(), position);

    let trade = Trade {
        id: uuid::Uuid::new_v4().to_string(),
        symbol: symbol.to_string(),
        side: TradeSide::Short,
        quantity,
        executed_price: exec_price,
        cash_impact: -margin,
        fee,
        slippage: opts.slippage_percent,
        timestamp: now,
        reason: reason.to_string(),
        pnl: None,
        pnl_fraction: None,
        liquidation: false,
    };
    next.trades.push(trade.clone());

    Ok((next, trade))
}

/// Close a long position (sell). `pnl = cash_gained - (quantity * entry)`.
pub fn close_long(
    account: &Account,
    symbol: &str,
    price: Decimal,
    reason: &str,
    fee_rate: Decimal,
    slippage_percent: Decimal,
    spread_bps: Decimal,
    now: i64,
    today: NaiveDate,
) -> Result<(Account, Trade), SkipReason> {
    let position = account
        .positions
        .get(symbol)
        .ok_or_else(|| SkipReason::NoPositionOpen {
            symbol: symbol.to_string(),
        })?;
    if position.side != Side::Long {
        return Err(SkipReason::NoPositionOpen {
            symbol: symbol.to_string(),
        });
    }
    if !price_is_valid(price) {
        return Err(SkipReason::PriceInvalid { price });
    }

    let exec_price = price * (Decimal::ONE - slippage_percent - spread_adjustment(spread_bps));
    let gross = position.quantity * exec_price;
    let fee = gross * fee_rate;
    let cash_gained = gross - fee;
    let pnl = cash_gained - (position.quantity * position.entry_price);
    let pnl_fraction = if position.entry_price.is_zero() {
        Decimal::ZERO
    } else {
        pnl / (position.quantity * position.entry_price)
    };

    let mut next = account.clone();
    next.cash += cash_gained;
    next.positions.remove(symbol);
    next.updated_at = now;
    next.record_realized_loss(pnl, today);

    let trade = Trade {
        id: uuid::Uuid::new_v4().to_string(),
        symbol: symbol.to_string(),
        side: TradeSide::Sell,
        quantity: position.quantity,
        executed_price: exec_price,
        cash_impact: cash_gained,
        fee,
        slippage: slippage_percent,
        timestamp: now,
        reason: reason.to_string(),
        pnl: Some(pnl),
        pnl_fraction: Some(pnl_fraction),
        liquidation: false,
    };
    next.trades.push(trade.clone());

    Ok((next, trade))
}

/// Close a short position (cover). Clamps returned cash at zero rather than
/// letting it go negative; the clamped trade is annotated `liquidation`.
pub fn close_short(
    account: &Account,
    symbol: &str,
    price: Decimal,
    reason: &str,
    fee_rate: Decimal,
    slippage_percent: Decimal,
    spread_bps: Decimal,
    now: i64,
    today: NaiveDate,
) -> Result<(Account, Trade), SkipReason> {
    let position = account
        .positions
        .get(symbol)
        .ok_or_else(|| SkipReason::NoPositionOpen {
            symbol: symbol.to_string(),
        })?;
    if position.side != Side::Short {
        return Err(SkipReason::NoPositionOpen {
            symbol: symbol.to_string(),
        });
    }
    if !price_is_valid(price) {
        return Err(SkipReason::PriceInvalid { price });
    }

    let exec_price = price * (Decimal::ONE + slippage_percent + spread_adjustment(spread_bps));
    let fee = position.quantity * exec_price * fee_rate;
    let pnl = (position.entry_price - exec_price) * position.quantity - fee;
    let margin = position.margin_amount.unwrap_or(Decimal::ZERO);
    let pnl_fraction = if margin.is_zero() {
        Decimal::ZERO
    } else {
        pnl / margin
    };

    let returned = margin + pnl;
    let (cash_impact, liquidation) = if returned < Decimal::ZERO {
        (Decimal::ZERO, true)
    } else {
        (returned, false)
    };

    let mut next = account.clone();
    next.cash += cash_impact;
    next.positions.remove(symbol);
    next.updated_at = now;
    next.record_realized_loss(pnl, today);

    let trade = Trade {
        id: uuid::Uuid::new_v4().to_string(),
        symbol: symbol.to_string(),
        side: TradeSide::Cover,
        quantity: position.quantity,
        executed_price: exec_price,
        cash_impact,
        fee,
        slippage: slippage_percent,
        timestamp: now,
        reason: reason.to_string(),
        pnl: Some(pnl),
        pnl_fraction: Some(pnl_fraction),
        liquidation,
    };
    next.trades.push(trade.clone());

    Ok((next, trade))
}

/// Close `ratio` of a position's quantity at `price`, leaving the remainder
/// open under its existing stop-loss, take-profit, and trailing-stop state.
/// Used by staged take-profit and by a strategy's negative `adjustPosition`
/// override. `ratio` is clamped to `[0, 1]`; a ratio that consumes the whole
/// position removes it exactly as `closeLong`/`closeShort` would.
pub fn close_partial(
    account: &Account,
    symbol: &str,
    price: Decimal,
    ratio: Decimal,
    reason: &str,
    fee_rate: Decimal,
    slippage_percent: Decimal,
    spread_bps: Decimal,
    now: i64,
    today: NaiveDate,
) -> Result<(Account, Trade), SkipReason> {
    let position = account
        .positions
        .get(symbol)
        .ok_or_else(|| SkipReason::NoPositionOpen {
            symbol: symbol.to_string(),
        })?;
    if !price_is_valid(price) {
        return Err(SkipReason::PriceInvalid { price });
    }
    let ratio = ratio.clamp(Decimal::ZERO, Decimal::ONE);
    let close_qty = position.quantity * ratio;

    match position.side {
        Side::Long => {
            let exec_price = price * (Decimal::ONE - slippage_percent - spread_adjustment(spread_bps));
            let gross = close_qty * exec_price;
            let fee = gross * fee_rate;
            let cash_gained = gross - fee;
            let pnl = cash_gained - (close_qty * position.entry_price);
            let pnl_fraction = if position.entry_price.is_zero() {
                Decimal::ZERO
            } else {
                pnl / (close_qty * position.entry_price)
            };

            let mut next = account.clone();
            next.cash += cash_gained;
            next.updated_at = now;
            next.record_realized_loss(pnl, today);

            let remaining = position.quantity - close_qty;
            if remaining <= Decimal::ZERO {
                next.positions.remove(symbol);
            } else {
                next.positions.get_mut(symbol).expect("checked above").quantity = remaining;
            }

            let trade = Trade {
                id: uuid::Uuid::new_v4().to_string(),
                symbol: symbol.to_string(),
                side: TradeSide::Sell,
                quantity: close_qty,
                executed_price: exec_price,
                cash_impact: cash_gained,
                fee,
                slippage: slippage_percent,
                timestamp: now,
                reason: reason.to_string(),
                pnl: Some(pnl),
                pnl_fraction: Some(pnl_fraction),
                liquidation: false,
            };
            next.trades.push(trade.clone());
            Ok((next, trade))
        }
        Side::Short => {
            let exec_price = price * (Decimal::ONE + slippage_percent + spread_adjustment(spread_bps));
            let fee = close_qty * exec_price * fee_rate;
            let pnl = (position.entry_price - exec_price) * close_qty - fee;
            let margin_total = position.margin_amount.unwrap_or(Decimal::ZERO);
            let margin_portion = margin_total * ratio;
            let pnl_fraction = if margin_portion.is_zero() {
                Decimal::ZERO
            } else {
                pnl / margin_portion
            };

            let returned = margin_portion + pnl;
            let (cash_impact, liquidation) = if returned < Decimal::ZERO {
                (Decimal::ZERO, true)
            } else {
                (returned, false)
            };

            let mut next = account.clone();
            next.cash += cash_impact;
            next.updated_at = now;
            next.record_realized_loss(pnl, today);

            let remaining = position.quantity - close_qty;
            if remaining <= Decimal::ZERO {
                next.positions.remove(symbol);
            } else {
                let pos = next.positions.get_mut(symbol).expect("checked above");
                pos.quantity = remaining;
                pos.margin_amount = Some(margin_total - margin_portion);
            }

            let trade = Trade {
                id: uuid::Uuid::new_v4().to_string(),
                symbol: symbol.to_string(),
                side: TradeSide::Cover,
                quantity: close_qty,
                executed_price: exec_price,
                cash_impact,
                fee,
                slippage: slippage_percent,
                timestamp: now,
                reason: reason.to_string(),
                pnl: Some(pnl),
                pnl_fraction: Some(pnl_fraction),
                liquidation,
            };
            next.trades.push(trade.clone());
            Ok((next, trade))
        }
    }
}

/// Add a DCA tranche. Requires an existing position; does not move the
/// stop-loss or take-profit. Updates entry price as a cash-weighted average.
pub fn dca_add(
    account: &Account,
    symbol: &str,
    price: Decimal,
    add_usdt: Decimal,
    now: i64,
) -> Result<(Account, Trade), SkipReason> {
    let position = account
        .positions
        .get(symbol)
        .ok_or_else(|| SkipReason::NoPositionOpen {
            symbol: symbol.to_string(),
        })?;
    if !price_is_valid(price) {
        return Err(SkipReason::PriceInvalid { price });
    }
    if add_usdt < Decimal::ONE {
        return Err(SkipReason::BelowMinimumOrderSize {
            spend: add_usdt,
            min: Decimal::ONE,
        });
    }
    if add_usdt > account.cash {
        return Err(SkipReason::InsufficientFunds {
            need: add_usdt,
            available: account.cash,
        });
    }

    let added_quantity = add_usdt / price;
    let old_cost = position.quantity * position.entry_price;
    let new_quantity = position.quantity + added_quantity;
    let new_entry_price = (old_cost + add_usdt) / new_quantity;

    let mut next = account.clone();
    next.cash -= add_usdt;
    next.updated_at = now;

    {
        let pos = next.positions.get_mut(symbol).expect("checked above");
        pos.quantity = new_quantity;
        pos.entry_price = new_entry_price;
        if let Some(dca) = &mut pos.dca_state {
            dca.completed_tranches += 1;
            dca.last_tranche_price = price;
        }
    }

    let trade = Trade {
        id: uuid::Uuid::new_v4().to_string(),
        symbol: symbol.to_string(),
        side: TradeSide::Buy,
        quantity: added_quantity,
        executed_price: price,
        cash_impact: -add_usdt,
        fee: Decimal::ZERO,
        slippage: Decimal::ZERO,
        timestamp: now,
        reason: "dca_add".to_string(),
        pnl: None,
        pnl_fraction: None,
        liquidation: false,
    };
    next.trades.push(trade.clone());

    Ok((next, trade))
}

/// Default paper-DCA trigger: fires when price has dropped far enough from
/// the last tranche, tranches remain, and the configured window hasn't
/// elapsed.
pub fn paper_dca_should_trigger(dca: &DcaState, current_price: Decimal, now: i64) -> bool {
    if dca.completed_tranches >= dca.total_tranches {
        return false;
    }
    let elapsed = now - dca.started_at;
    if elapsed >= dca.max_duration_ms {
        return false;
    }
    let threshold = dca.last_tranche_price * (Decimal::ONE - dca.drop_pct_threshold / Decimal::from(100));
    current_price <= threshold
}

/// Update trailing-stop state on a new mark. Longs activate when
/// `mark >= entry * (1 + activation%)` and track the highest price seen
/// since; shorts activate on the symmetric downside condition and track the
/// lowest. Returns `true` if the retrace from the extreme should trigger an
/// exit.
pub fn update_trailing_stop(
    position: &mut Position,
    mark: Decimal,
    activation_percent: Decimal,
    callback_percent: Decimal,
) -> bool {
    match position.side {
        Side::Long => {
            let activation_price = position.entry_price * (Decimal::ONE + activation_percent);
            match &mut position.trailing_stop {
                TrailingStopState::Inactive => {
                    if mark >= activation_price {
                        position.trailing_stop = TrailingStopState::Active { extreme_price: mark };
                    }
                    false
                }
                TrailingStopState::Active { extreme_price } => {
                    if mark > *extreme_price {
                        *extreme_price = mark;
                        return false;
                    }
                    let trigger_price = *extreme_price * (Decimal::ONE - callback_percent);
                    mark <= trigger_price
                }
            }
        }
        Side::Short => {
            let activation_price = position.entry_price * (Decimal::ONE - activation_percent);
            match &mut position.trailing_stop {
                TrailingStopState::Inactive => {
                    if mark <= activation_price {
                        position.trailing_stop = TrailingStopState::Active { extreme_price: mark };
                    }
                    false
                }
                TrailingStopState::Active { extreme_price } => {
                    if mark < *extreme_price {
                        *extreme_price = mark;
                        return false;
                    }
                    let trigger_price = *extreme_price * (Decimal::ONE + callback_percent);
                    mark >= trigger_price
                }
            }
        }
    }
}

/// Staged take-profit: when a stage's threshold is crossed, the stage is
/// consumed and the ratio to close at the current mark is returned.
pub fn check_staged_take_profit(position: &mut Position, mark: Decimal) -> Option<StagedTakeProfit> {
    let profit_pct = match position.side {
        Side::Long => (mark - position.entry_price) / position.entry_price,
        Side::Short => (position.entry_price - mark) / position.entry_price,
    } * Decimal::from(100);

    let idx = position
        .staged_take_profits
        .iter()
        .position(|stage| profit_pct >= stage.at_percent)?;
    Some(position.staged_take_profits.remove(idx))
}

/// A position held longer than `time_stop_hours` without profit is force-
/// closed with reason `time_stop`.
pub fn time_stop_triggered(position: &Position, mark: Decimal, now: i64, time_stop_hours: i64) -> bool {
    let held_hours = (now - position.entry_time) / 3_600_000;
    if held_hours < time_stop_hours {
        return false;
    }
    match position.side {
        Side::Long => mark <= position.entry_price,
        Side::Short => mark >= position.entry_price,
    }
}
