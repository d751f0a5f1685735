//! # Domain Models
//!
//! Normalized market data shared by every provider adapter.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`TradeDate`] | Validated ISO `YYYY-MM-DD` date |
//! | [`DataKind`] | Requested data category |
//! | [`NormalizedStockRecord`] | One equity quote row |
//! | [`NormalizedIndexRecord`] | One index quote row |
//! | [`MarketData`] | Payload returned by the fetch service |
//! | [`UtcDateTime`] | UTC timestamp |

mod date;
mod kind;
pub mod numeric;
mod records;
mod timestamp;

pub use date::TradeDate;
pub use kind::DataKind;
pub use records::{
    filter_limit_down, filter_limit_up, MarketData, NormalizedIndexRecord, NormalizedStockRecord,
    LIMIT_THRESHOLD_PERCENT,
};
pub use timestamp::UtcDateTime;
