//! Strategy registry. Strategies are registered into an explicit registry
//! object (never a process-global static) so backtests and live runs can
//! hold independent registries in the same process.

use crate::domain::indicator::IndicatorSnapshot;
use crate::domain::position::Position;
use crate::domain::signal::{Signal, SignalRules};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;

/// A named, versioned set of signal rules plus any position-adjustment
/// behavior a strategy wants beyond entries/exits driven by the signal
/// detector.
pub trait StrategyHandle: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    fn rules(&self) -> &SignalRules;

    /// Called once per bar after a signal has been produced, before it is
    /// handed to the risk gate. The default implementation passes the
    /// signal through unchanged.
    fn populate_signal(&self, signal: Signal, _snapshot: &IndicatorSnapshot) -> Signal {
        signal
    }

    /// Called once per bar for each open position this strategy owns,
    /// before the default DCA trigger fires. A positive return adds that
    /// much notional (USDT) to the position, a negative return reduces it;
    /// `None` falls through to the default DCA trigger. The default
    /// implementation never overrides the default trigger.
    fn adjust_position(&self, position: &Position, _snapshot: &IndicatorSnapshot) -> Option<Decimal> {
        let _ = position;
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Inserted,
    Replaced,
}

impl fmt::Display for RegisterOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterOutcome::Inserted => write!(f, "inserted"),
            RegisterOutcome::Replaced => write!(f, "replaced"),
        }
    }
}

/// Process-local strategy registry, keyed by strategy id.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Box<dyn StrategyHandle>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Registers `strategy`, logging and reporting whether it replaced an
    /// existing entry under the same id. Never panics on collision.
    pub fn register(&mut self, strategy: Box<dyn StrategyHandle>) -> RegisterOutcome {
        let id = strategy.id().to_string();
        let outcome = if self.strategies.contains_key(&id) {
            RegisterOutcome::Replaced
        } else {
            RegisterOutcome::Inserted
        };
        if outcome == RegisterOutcome::Replaced {
            tracing::warn!(strategy_id = %id, "replacing already-registered strategy");
        }
        self.strategies.insert(id, strategy);
        outcome
    }

    pub fn get(&self, id: &str) -> Option<&dyn StrategyHandle> {
        self.strategies.get(id).map(|boxed| boxed.as_ref())
    }

    pub fn ids(&self) -> Vec<&str> {
        self.strategies.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::signal::Rule;

    struct TestStrategy {
        id: String,
        rules: SignalRules,
    }

    impl StrategyHandle for TestStrategy {
        fn id(&self) -> &str {
            &self.id
        }
        fn name(&self) -> &str {
            "test"
        }
        fn description(&self) -> &str {
            "test strategy"
        }
        fn rules(&self) -> &SignalRules {
            &self.rules
        }
    }

    fn make(id: &str) -> Box<dyn StrategyHandle> {
        Box::new(TestStrategy {
            id: id.to_string(),
            rules: SignalRules {
                buy: vec![Rule::MaBullish],
                sell: vec![Rule::MaBearish],
                short: vec![],
                cover: vec![],
            },
        })
    }

    #[test]
    fn register_reports_inserted_then_replaced() {
        let mut registry = StrategyRegistry::new();
        assert_eq!(registry.register(make("a")), RegisterOutcome::Inserted);
        assert_eq!(registry.register(make("a")), RegisterOutcome::Replaced);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_returns_none_for_unknown_id() {
        let registry = StrategyRegistry::new();
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn default_adjust_position_is_noop() {
        let strategy = TestStrategy {
            id: "a".into(),
            rules: SignalRules {
                buy: vec![],
                sell: vec![],
                short: vec![],
                cover: vec![],
            },
        };
        let position = crate::domain::position::Position {
            symbol: "X".into(),
            side: crate::domain::position::Side::Long,
            quantity: rust_decimal::Decimal::ONE,
            entry_price: rust_decimal::Decimal::ONE,
            entry_time: 0,
            stop_loss: rust_decimal::Decimal::ZERO,
            take_profit: rust_decimal::Decimal::ONE,
            trailing_stop: crate::domain::position::TrailingStopState::Inactive,
            dca_state: None,
            staged_take_profits: Vec::new(),
            margin_amount: None,
            signal_history_id: None,
        };
        let snapshot = IndicatorSnapshot::default();
        assert!(strategy.adjust_position(&position, &snapshot).is_none());
    }
}
