//! Live-execution orchestrator: mirrors the paper account API but delegates
//! order placement to an exchange client, then reconciles the local
//! position map against what the exchange actually reports.

pub mod binance;

use crate::domain::account::Account;
use crate::domain::errors::TradingError;
use crate::domain::position::Side;
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub symbol: String,
    pub avg_price: Decimal,
    pub executed_quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub avg_price: Decimal,
}

/// Exchange boundary. Implementations talk to a real venue (or a simulator
/// standing in for one); everything above this trait is venue-agnostic.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn market_buy(&self, symbol: &str, quote_amount: Decimal) -> Result<Fill>;
    async fn market_sell(&self, symbol: &str, base_quantity: Decimal) -> Result<Fill>;
    async fn get_usdt_balance(&self) -> Result<Decimal>;
    async fn get_open_positions(&self) -> Result<Vec<ExchangePosition>>;
    async fn get_price(&self, symbol: &str) -> Result<Decimal>;
    async fn ping(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileSeverity {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileIssue {
    MissingOnExchange { symbol: String },
    MissingLocally { symbol: String },
    QuantityMismatch { symbol: String, local_qty: Decimal, exchange_qty: Decimal, drift_pct: Decimal },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub severity: ReconcileSeverity,
    pub issues: Vec<ReconcileIssue>,
}

const WARNING_DRIFT_PCT: Decimal = Decimal::from_parts(5, 0, 0, false, 2); // 0.05
const CRITICAL_DRIFT_PCT: Decimal = Decimal::from_parts(10, 0, 0, false, 2); // 0.10

/// Compares the local ledger's open positions against the exchange's
/// reported positions. A symbol present in exactly one of the two sets is
/// always reported; a symbol in both is checked for quantity drift.
pub fn reconcile(local: &Account, exchange: &[ExchangePosition]) -> ReconcileReport {
    let exchange_by_symbol: HashMap<&str, &ExchangePosition> =
        exchange.iter().map(|p| (p.symbol.as_str(), p)).collect();

    let mut issues = Vec::new();
    let mut severity = ReconcileSeverity::Ok;

    for (symbol, position) in &local.positions {
        match exchange_by_symbol.get(symbol.as_str()) {
            None => {
                issues.push(ReconcileIssue::MissingOnExchange { symbol: symbol.clone() });
                severity = ReconcileSeverity::Critical;
            }
            Some(exch_pos) => {
                let drift_pct = if position.quantity.is_zero() {
                    Decimal::ZERO
                } else {
                    ((position.quantity - exch_pos.quantity) / position.quantity).abs()
                };
                if drift_pct >= CRITICAL_DRIFT_PCT {
                    issues.push(ReconcileIssue::QuantityMismatch {
                        symbol: symbol.clone(),
                        local_qty: position.quantity,
                        exchange_qty: exch_pos.quantity,
                        drift_pct,
                    });
                    severity = ReconcileSeverity::Critical;
                } else if drift_pct >= WARNING_DRIFT_PCT {
                    issues.push(ReconcileIssue::QuantityMismatch {
                        symbol: symbol.clone(),
                        local_qty: position.quantity,
                        exchange_qty: exch_pos.quantity,
                        drift_pct,
                    });
                    if severity == ReconcileSeverity::Ok {
                        severity = ReconcileSeverity::Warning;
                    }
                }
            }
        }
    }

    for exch_pos in exchange {
        if !local.positions.contains_key(&exch_pos.symbol) {
            issues.push(ReconcileIssue::MissingLocally { symbol: exch_pos.symbol.clone() });
            severity = ReconcileSeverity::Critical;
        }
    }

    ReconcileReport { severity, issues }
}

/// Drives one scan cycle against a live exchange, mirroring paper-mode
/// signal/risk/ledger flow but recording fills only after the exchange call
/// returns successfully. Never fabricates a fill from local pricing.
pub struct LiveExecutor<C: ExchangeClient> {
    client: C,
    paused: bool,
}

impl<C: ExchangeClient> LiveExecutor<C> {
    pub fn new(client: C) -> Self {
        Self { client, paused: false }
    }

    /// Startup check: confirms the exchange is reachable and the account is
    /// readable before any trading begins. Either failure aborts startup.
    pub async fn startup_check(&self) -> Result<Decimal, TradingError> {
        self.client.ping().await.map_err(|e| TradingError::ExchangeFatal { reason: e.to_string() })?;
        self.client
            .get_usdt_balance()
            .await
            .map_err(|e| TradingError::ExchangeFatal { reason: e.to_string() })
    }

    pub async fn reconcile_against_exchange(&mut self, local: &Account) -> Result<ReconcileReport, TradingError> {
        let exchange_positions = self
            .client
            .get_open_positions()
            .await
            .map_err(|e| TradingError::ExchangeTransient { reason: e.to_string() })?;
        let report = reconcile(local, &exchange_positions);
        if report.severity == ReconcileSeverity::Critical {
            self.paused = true;
            return Err(TradingError::ReconcileCritical {
                reason: format!("{} issue(s) at or above 10% drift", report.issues.len()),
            });
        }
        Ok(report)
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub async fn enter_long(&self, symbol: &str, quote_amount: Decimal) -> Result<Fill, TradingError> {
        self.client
            .market_buy(symbol, quote_amount)
            .await
            .map_err(|e| TradingError::ExchangeTransient { reason: e.to_string() })
    }

    pub async fn exit_long(&self, symbol: &str, base_quantity: Decimal) -> Result<Fill, TradingError> {
        self.client
            .market_sell(symbol, base_quantity)
            .await
            .map_err(|e| TradingError::ExchangeTransient { reason: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::Account;
    use crate::domain::position::{Position, TrailingStopState};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct MockClient {
        ping_ok: bool,
        balance: Decimal,
        positions: Mutex<Vec<ExchangePosition>>,
        buy_called: AtomicBool,
    }

    #[async_trait]
    impl ExchangeClient for MockClient {
        async fn market_buy(&self, symbol: &str, quote_amount: Decimal) -> Result<Fill> {
            self.buy_called.store(true, Ordering::SeqCst);
            Ok(Fill {
                symbol: symbol.to_string(),
                avg_price: dec!(100),
                executed_quantity: quote_amount / dec!(100),
            })
        }
        async fn market_sell(&self, symbol: &str, base_quantity: Decimal) -> Result<Fill> {
            Ok(Fill {
                symbol: symbol.to_string(),
                avg_price: dec!(100),
                executed_quantity: base_quantity,
            })
        }
        async fn get_usdt_balance(&self) -> Result<Decimal> {
            Ok(self.balance)
        }
        async fn get_open_positions(&self) -> Result<Vec<ExchangePosition>> {
            Ok(self.positions.lock().unwrap().clone())
        }
        async fn get_price(&self, _symbol: &str) -> Result<Decimal> {
            Ok(dec!(100))
        }
        async fn ping(&self) -> Result<()> {
            if self.ping_ok {
                Ok(())
            } else {
                Err(anyhow::anyhow!("unreachable"))
            }
        }
    }

    fn account_with_position(symbol: &str, qty: Decimal) -> Account {
        let mut account = Account::new("test", dec!(10000), 0);
        account.positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                side: Side::Long,
                quantity: qty,
                entry_price: dec!(100),
                entry_time: 0,
                stop_loss: dec!(90),
                take_profit: dec!(120),
                trailing_stop: TrailingStopState::Inactive,
                dca_state: None,
                staged_take_profits: Vec::new(),
                margin_amount: None,
                signal_history_id: None,
            },
        );
        account
    }

    #[tokio::test]
    async fn startup_check_fails_fast_on_ping_failure() {
        let client = MockClient {
            ping_ok: false,
            balance: dec!(1000),
            positions: Mutex::new(vec![]),
            buy_called: AtomicBool::new(false),
        };
        let executor = LiveExecutor::new(client);
        assert!(executor.startup_check().await.is_err());
    }

    #[tokio::test]
    async fn startup_check_returns_balance_on_success() {
        let client = MockClient {
            ping_ok: true,
            balance: dec!(5000),
            positions: Mutex::new(vec![]),
            buy_called: AtomicBool::new(false),
        };
        let executor = LiveExecutor::new(client);
        assert_eq!(executor.startup_check().await.unwrap(), dec!(5000));
    }

    #[test]
    fn reconcile_flags_missing_on_exchange() {
        let local = account_with_position("BTCUSDT", dec!(1));
        let report = reconcile(&local, &[]);
        assert_eq!(report.severity, ReconcileSeverity::Critical);
        assert!(matches!(report.issues[0], ReconcileIssue::MissingOnExchange { .. }));
    }

    #[test]
    fn reconcile_flags_missing_locally() {
        let local = Account::new("test", dec!(10000), 0);
        let exchange = vec![ExchangePosition {
            symbol: "ETHUSDT".into(),
            side: Side::Long,
            quantity: dec!(2),
            avg_price: dec!(50),
        }];
        let report = reconcile(&local, &exchange);
        assert_eq!(report.severity, ReconcileSeverity::Critical);
    }

    #[test]
    fn reconcile_is_clean_when_quantities_match() {
        let local = account_with_position("BTCUSDT", dec!(1));
        let exchange = vec![ExchangePosition {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            quantity: dec!(1),
            avg_price: dec!(100),
        }];
        let report = reconcile(&local, &exchange);
        assert_eq!(report.severity, ReconcileSeverity::Ok);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn reconcile_warns_at_five_percent_drift() {
        let local = account_with_position("BTCUSDT", dec!(1));
        let exchange = vec![ExchangePosition {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            quantity: dec!(0.94),
            avg_price: dec!(100),
        }];
        let report = reconcile(&local, &exchange);
        assert_eq!(report.severity, ReconcileSeverity::Warning);
    }

    #[test]
    fn reconcile_is_critical_at_ten_percent_drift() {
        let local = account_with_position("BTCUSDT", dec!(1));
        let exchange = vec![ExchangePosition {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            quantity: dec!(0.88),
            avg_price: dec!(100),
        }];
        let report = reconcile(&local, &exchange);
        assert_eq!(report.severity, ReconcileSeverity::Critical);
    }

    #[tokio::test]
    async fn reconcile_against_exchange_pauses_executor_on_critical() {
        let client = MockClient {
            ping_ok: true,
            balance: dec!(1000),
            positions: Mutex::new(vec![]),
            buy_called: AtomicBool::new(false),
        };
        let mut executor = LiveExecutor::new(client);
        let local = account_with_position("BTCUSDT", dec!(1));
        let result = executor.reconcile_against_exchange(&local).await;
        assert!(result.is_err());
        assert!(executor.is_paused());
    }
}
