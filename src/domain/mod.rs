pub mod account;
pub mod candle;
pub mod errors;
pub mod indicator;
pub mod position;
pub mod protections;
pub mod regime;
pub mod risk;
pub mod sentiment;
pub mod signal;
pub mod strategy;
pub mod trade;

pub use candle::Candle;
pub use errors::{SkipReason, TradingError};
pub use indicator::IndicatorSnapshot;
pub use position::{DcaState, Position, Side, TrailingStopState};
pub use regime::RegimeLabel;
pub use signal::{Signal, SignalType};
pub use trade::Trade;
