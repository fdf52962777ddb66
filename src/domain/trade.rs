use crate::domain::position::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
    Short,
    Cover,
}

impl TradeSide {
    pub fn opening(side: Side) -> Self {
        match side {
            Side::Long => TradeSide::Buy,
            Side::Short => TradeSide::Short,
        }
    }

    pub fn closing(side: Side) -> Self {
        match side {
            Side::Long => TradeSide::Sell,
            Side::Short => TradeSide::Cover,
        }
    }

    pub fn is_closing(self) -> bool {
        matches!(self, TradeSide::Sell | TradeSide::Cover)
    }
}

/// Immutable, append-only trade record. No write path may mutate a trade
/// once recorded; corrections happen by appending a new record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: Decimal,
    pub executed_price: Decimal,
    pub cash_impact: Decimal,
    pub fee: Decimal,
    pub slippage: Decimal,
    pub timestamp: i64,
    pub reason: String,
    pub pnl: Option<Decimal>,
    pub pnl_fraction: Option<Decimal>,
    /// Set when a catastrophic short loss required clamping cash at zero
    /// rather than letting it go negative.
    pub liquidation: bool,
}

impl Trade {
    pub fn is_closing(&self) -> bool {
        self.side.is_closing()
    }

    pub fn is_win(&self) -> bool {
        self.pnl.map(|p| p > Decimal::ZERO).unwrap_or(false)
    }
}
