use serde::{Deserialize, Serialize};

use super::numeric::{finite_or_zero, round_to};

/// Change-rate threshold (percent) used to detect limit-up and limit-down boards.
pub const LIMIT_THRESHOLD_PERCENT: f64 = 9.9;

const CHANGE_RATE_TOLERANCE: f64 = 0.01;

/// Canonical equity quote row shared by every provider.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizedStockRecord {
    pub code: String,
    pub name: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub last: f64,
    pub prev_close: f64,
    pub change: f64,
    pub change_rate_percent: f64,
    pub volume: f64,
    pub amount: f64,
    pub trading_phase: String,
    pub amplitude_rate_percent: f64,
    /// Provider passthrough: security sub-type.
    pub sub_type: String,
    /// Provider passthrough: product status flags.
    pub product_status: String,
}

impl NormalizedStockRecord {
    /// Returns a cleaned copy that satisfies the record invariants.
    ///
    /// Zero prices are treated as "not reported" and do not take part in the
    /// range check. Applying `clean` twice yields the same record as once.
    #[must_use]
    pub fn clean(self) -> Self {
        let mut record = Self {
            code: self.code.trim().to_owned(),
            name: self.name.trim().to_owned(),
            open: finite_or_zero(self.open),
            high: finite_or_zero(self.high),
            low: finite_or_zero(self.low),
            last: finite_or_zero(self.last),
            prev_close: finite_or_zero(self.prev_close),
            change: finite_or_zero(self.change),
            change_rate_percent: finite_or_zero(self.change_rate_percent),
            volume: finite_or_zero(self.volume),
            amount: finite_or_zero(self.amount),
            trading_phase: self.trading_phase.trim().to_owned(),
            amplitude_rate_percent: finite_or_zero(self.amplitude_rate_percent),
            sub_type: self.sub_type.trim().to_owned(),
            product_status: self.product_status.trim().to_owned(),
        };

        let prices = PriceFields {
            open: record.open,
            high: record.high,
            low: record.low,
            last: record.last,
            prev_close: record.prev_close,
            change: record.change,
            change_rate_percent: record.change_rate_percent,
            amplitude_rate_percent: record.amplitude_rate_percent,
        }
        .clean();

        record.high = prices.high;
        record.low = prices.low;
        record.change = prices.change;
        record.change_rate_percent = prices.change_rate_percent;
        record.amplitude_rate_percent = prices.amplitude_rate_percent;
        record
    }

    pub fn is_limit_up(&self) -> bool {
        self.change_rate_percent >= LIMIT_THRESHOLD_PERCENT
    }

    pub fn is_limit_down(&self) -> bool {
        self.change_rate_percent <= -LIMIT_THRESHOLD_PERCENT
    }
}

/// Canonical index quote row shared by every provider.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizedIndexRecord {
    pub code: String,
    pub name: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub current: f64,
    pub prev_close: f64,
    pub change: f64,
    pub change_rate_percent: f64,
    pub volume: f64,
    pub amount: f64,
    pub trading_phase: String,
    pub amplitude_rate_percent: f64,
    pub update_time: String,
}

impl NormalizedIndexRecord {
    #[must_use]
    pub fn clean(self) -> Self {
        let prices = PriceFields {
            open: finite_or_zero(self.open),
            high: finite_or_zero(self.high),
            low: finite_or_zero(self.low),
            last: finite_or_zero(self.current),
            prev_close: finite_or_zero(self.prev_close),
            change: finite_or_zero(self.change),
            change_rate_percent: finite_or_zero(self.change_rate_percent),
            amplitude_rate_percent: finite_or_zero(self.amplitude_rate_percent),
        }
        .clean();

        Self {
            code: self.code.trim().to_owned(),
            name: self.name.trim().to_owned(),
            open: prices.open,
            high: prices.high,
            low: prices.low,
            current: prices.last,
            prev_close: prices.prev_close,
            change: prices.change,
            change_rate_percent: prices.change_rate_percent,
            volume: finite_or_zero(self.volume),
            amount: finite_or_zero(self.amount),
            trading_phase: self.trading_phase.trim().to_owned(),
            amplitude_rate_percent: prices.amplitude_rate_percent,
            update_time: self.update_time.trim().to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PriceFields {
    open: f64,
    high: f64,
    low: f64,
    last: f64,
    prev_close: f64,
    change: f64,
    change_rate_percent: f64,
    amplitude_rate_percent: f64,
}

impl PriceFields {
    fn clean(mut self) -> Self {
        let reported = [self.low, self.open, self.last, self.high]
            .into_iter()
            .filter(|price| *price > 0.0);
        let (mut min, mut max) = (f64::INFINITY, f64::NEG_INFINITY);
        for price in reported {
            min = min.min(price);
            max = max.max(price);
        }
        if min.is_finite() && max.is_finite() {
            self.low = min;
            self.high = max;
        }

        if self.prev_close > 0.0 && self.last > 0.0 {
            let delta = self.last - self.prev_close;
            if (self.change - delta).abs() > 0.005 {
                self.change = round_to(delta, 3);
            }

            let expected_rate = delta / self.prev_close * 100.0;
            if (self.change_rate_percent - expected_rate).abs() > CHANGE_RATE_TOLERANCE {
                self.change_rate_percent = round_to(expected_rate, 2);
            }

            if self.amplitude_rate_percent == 0.0 && self.high > 0.0 && self.low > 0.0 {
                self.amplitude_rate_percent =
                    round_to((self.high - self.low) / self.prev_close * 100.0, 2);
            }
        }

        self
    }
}

/// Normalized payload returned by the fetch path and stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "records", rename_all = "snake_case")]
pub enum MarketData {
    Stocks(Vec<NormalizedStockRecord>),
    Indices(Vec<NormalizedIndexRecord>),
}

impl MarketData {
    pub fn len(&self) -> usize {
        match self {
            Self::Stocks(records) => records.len(),
            Self::Indices(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_stocks(&self) -> Option<&[NormalizedStockRecord]> {
        match self {
            Self::Stocks(records) => Some(records),
            Self::Indices(_) => None,
        }
    }

    pub fn as_indices(&self) -> Option<&[NormalizedIndexRecord]> {
        match self {
            Self::Indices(records) => Some(records),
            Self::Stocks(_) => None,
        }
    }
}

pub fn filter_limit_up(records: Vec<NormalizedStockRecord>) -> Vec<NormalizedStockRecord> {
    records.into_iter().filter(|record| record.is_limit_up()).collect()
}

pub fn filter_limit_down(records: Vec<NormalizedStockRecord>) -> Vec<NormalizedStockRecord> {
    records.into_iter().filter(|record| record.is_limit_down()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stock(code: &str, prev_close: f64, last: f64, change_rate: f64) -> NormalizedStockRecord {
        NormalizedStockRecord {
            code: code.to_owned(),
            name: format!("stock {code}"),
            open: prev_close,
            high: last.max(prev_close),
            low: last.min(prev_close),
            last,
            prev_close,
            change_rate_percent: change_rate,
            ..NormalizedStockRecord::default()
        }
    }

    #[test]
    fn clean_is_idempotent() {
        let raw = NormalizedStockRecord {
            code: " 600000 ".to_owned(),
            name: "浦发银行 ".to_owned(),
            open: 7.20,
            high: 7.10,
            low: 7.30,
            last: 7.35,
            prev_close: 7.00,
            change: 0.0,
            change_rate_percent: 1.0,
            volume: f64::NAN,
            amount: 1_000.0,
            ..NormalizedStockRecord::default()
        };

        let once = raw.clean();
        let twice = once.clone().clean();
        assert_eq!(once, twice);
        assert_eq!(once.code, "600000");
        assert_eq!(once.volume, 0.0);
    }

    #[test]
    fn clean_restores_price_range_and_change_rate() {
        let cleaned = NormalizedStockRecord {
            open: 10.5,
            high: 10.2,
            low: 10.4,
            last: 11.0,
            prev_close: 10.0,
            change_rate_percent: 3.0,
            ..NormalizedStockRecord::default()
        }
        .clean();

        assert!(cleaned.low <= cleaned.open && cleaned.open <= cleaned.high);
        assert!(cleaned.low <= cleaned.last && cleaned.last <= cleaned.high);
        let expected = (cleaned.last - cleaned.prev_close) / cleaned.prev_close * 100.0;
        assert!((cleaned.change_rate_percent - expected).abs() <= 0.01);
        assert!((cleaned.change - 1.0).abs() < 1e-9);
    }

    #[test]
    fn suspended_rows_keep_zero_prices() {
        let cleaned = NormalizedStockRecord {
            code: "600001".to_owned(),
            prev_close: 5.0,
            ..NormalizedStockRecord::default()
        }
        .clean();

        assert_eq!(cleaned.last, 0.0);
        assert_eq!(cleaned.change_rate_percent, 0.0);
    }

    #[test]
    fn limit_filters_use_fixed_threshold() {
        let boards = vec![
            stock("600100", 10.00, 11.02, 10.2),
            stock("600200", 10.00, 10.98, 9.8),
            stock("600300", 10.00, 9.00, -10.0),
        ];

        let up = filter_limit_up(boards.clone());
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].code, "600100");

        let down = filter_limit_down(boards);
        assert_eq!(down.len(), 1);
        assert_eq!(down[0].code, "600300");
    }

    #[test]
    fn index_clean_uses_current_price() {
        let cleaned = NormalizedIndexRecord {
            code: "000001".to_owned(),
            open: 3000.0,
            high: 3010.0,
            low: 2990.0,
            current: 3030.0,
            prev_close: 3000.0,
            ..NormalizedIndexRecord::default()
        }
        .clean();

        assert_eq!(cleaned.high, 3030.0);
        assert!((cleaned.change_rate_percent - 1.0).abs() <= 0.01);
        assert_eq!(cleaned.clone().clean(), cleaned);
    }
}
