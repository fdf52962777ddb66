use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

/// Trailing-stop state as a one-way tagged sum rather than a lazily
/// allocated optional object: `Inactive` can only ever transition to
/// `Active`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrailingStopState {
    Inactive,
    Active { extreme_price: Decimal },
}

impl Default for TrailingStopState {
    fn default() -> Self {
        TrailingStopState::Inactive
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DcaState {
    pub total_tranches: u32,
    pub completed_tranches: u32,
    pub last_tranche_price: Decimal,
    pub drop_pct_threshold: Decimal,
    pub started_at: i64,
    pub max_duration_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StagedTakeProfit {
    pub at_percent: Decimal,
    pub close_ratio: Decimal,
}

/// One position per (scenario, symbol). `entry_price > 0` and
/// `quantity > 0` hold for the lifetime of the position; `stop_loss` and
/// `take_profit` sit on the correct side of `entry_price` for `side`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub entry_time: i64,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub trailing_stop: TrailingStopState,
    pub dca_state: Option<DcaState>,
    pub staged_take_profits: Vec<StagedTakeProfit>,
    pub margin_amount: Option<Decimal>,
    pub signal_history_id: Option<String>,
}

impl Position {
    pub fn is_valid(&self) -> bool {
        if self.entry_price <= Decimal::ZERO || self.quantity <= Decimal::ZERO {
            return false;
        }
        match self.side {
            Side::Long => self.stop_loss < self.entry_price && self.take_profit > self.entry_price,
            Side::Short => self.stop_loss > self.entry_price && self.take_profit < self.entry_price,
        }
    }

    /// Mark-to-market unrealized value contribution for equity calculation.
    /// Longs contribute `qty * mark`; shorts contribute
    /// `margin + (entry - mark) * qty`.
    pub fn mark_to_market(&self, mark: Decimal) -> Decimal {
        match self.side {
            Side::Long => self.quantity * mark,
            Side::Short => {
                let margin = self.margin_amount.unwrap_or(Decimal::ZERO);
                margin + (self.entry_price - mark) * self.quantity
            }
        }
    }

    pub fn notional(&self, mark: Decimal) -> Decimal {
        self.quantity * mark
    }
}
