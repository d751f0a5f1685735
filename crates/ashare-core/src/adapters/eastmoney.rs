use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use time::macros::{format_description, offset};
use time::OffsetDateTime;
use tracing::debug;

use super::common::{cache_buster, validate_date, Upstream};
use crate::circuit_breaker::CircuitState;
use crate::data_source::{
    BoxFuture, DataSource, DataSourceDescriptor, FetchOutcome, SourceResponse,
};
use crate::domain::numeric::{coerce_f64, coerce_string};
use crate::domain::{NormalizedIndexRecord, NormalizedStockRecord};
use crate::error::FetchError;
use crate::http_client::HttpClient;
use crate::jsonp::{callback_name, unwrap_jsonp};
use crate::provider_policy::ProviderPolicy;
use crate::SourceKind;

pub const EASTMONEY_BASE_URL: &str = "https://push2.eastmoney.com/api/qt/clist/get";
const EASTMONEY_REFERER: &str = "https://quote.eastmoney.com/";

const FIELDS: &str = "f2,f3,f4,f5,f6,f7,f12,f14,f15,f16,f17,f18,f124";
const PAGE_SIZE: &str = "6000";

/// Volume is reported in lots of one hundred shares.
const SHARES_PER_LOT: f64 = 100.0;

/// Market filters understood by the list API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Board {
    Sse,
    Szse,
    Index,
}

impl Board {
    const fn filter(self) -> &'static str {
        match self {
            Self::Sse => "m:1 t:2,m:1 t:23",
            Self::Szse => "m:0 t:6,m:0 t:80",
            Self::Index => "m:1 s:2,m:0 t:5",
        }
    }
}

/// Eastmoney list API.
///
/// Third-party aggregator covering both exchanges and their indices; used as
/// the last-resort fallback.
pub struct EastmoneyAdapter {
    upstream: Upstream,
}

impl Default for EastmoneyAdapter {
    fn default() -> Self {
        Self::new(ProviderPolicy::eastmoney_default(), Upstream::default_client())
    }
}

impl EastmoneyAdapter {
    pub fn new(policy: ProviderPolicy, http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            upstream: Upstream::new(
                "东方财富",
                EASTMONEY_BASE_URL,
                EASTMONEY_REFERER,
                &policy,
                http_client,
            ),
        }
    }

    pub fn with_http_client(http_client: Arc<dyn HttpClient>) -> Self {
        Self::new(ProviderPolicy::eastmoney_default(), http_client)
    }

    async fn fetch_rows(&self, board: Board, once: bool) -> Result<Vec<Map<String, Value>>, FetchError> {
        let token = cache_buster();
        let request = self
            .upstream
            .request(self.upstream.base_url())
            .with_query("cb", callback_name("jQuery", token))
            .with_query("pn", "1")
            .with_query("pz", PAGE_SIZE)
            .with_query("po", "1")
            .with_query("np", "1")
            .with_query("fltt", "2")
            .with_query("invt", "2")
            .with_query("fid", "f3")
            .with_query("fs", board.filter())
            .with_query("fields", FIELDS)
            .with_query("_", token.to_string());

        let body = if once {
            self.upstream.fetch_text_once(request).await?
        } else {
            self.upstream.fetch_text(request).await?
        };
        let rows = parse_rows(&body)?;
        debug!(board = ?board, rows = rows.len(), "eastmoney list parsed");
        Ok(rows)
    }

    async fn fetch_stocks(&self, board: Board) -> Result<Vec<NormalizedStockRecord>, FetchError> {
        let rows = self.fetch_rows(board, false).await?;
        Ok(rows.iter().filter_map(stock_from_row).collect())
    }
}

impl DataSource for EastmoneyAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Eastmoney
    }

    fn descriptor(&self) -> DataSourceDescriptor {
        self.upstream.descriptor.snapshot()
    }

    fn set_enabled(&self, enabled: bool) {
        self.upstream.descriptor.set_enabled(enabled);
    }

    fn set_priority(&self, priority: u32) {
        self.upstream.descriptor.set_priority(priority);
    }

    fn get_sse_data<'a>(
        &'a self,
        date: &'a str,
    ) -> BoxFuture<'a, FetchOutcome<Vec<NormalizedStockRecord>>> {
        Box::pin(async move {
            validate_date(date)?;
            Ok(SourceResponse::ok(self.fetch_stocks(Board::Sse).await?))
        })
    }

    fn get_szse_data<'a>(
        &'a self,
        date: &'a str,
    ) -> BoxFuture<'a, FetchOutcome<Vec<NormalizedStockRecord>>> {
        Box::pin(async move {
            validate_date(date)?;
            Ok(SourceResponse::ok(self.fetch_stocks(Board::Szse).await?))
        })
    }

    fn get_index_data<'a>(
        &'a self,
        date: &'a str,
    ) -> BoxFuture<'a, FetchOutcome<Vec<NormalizedIndexRecord>>> {
        Box::pin(async move {
            validate_date(date)?;
            let rows = self.fetch_rows(Board::Index, false).await?;
            Ok(SourceResponse::ok(
                rows.iter().filter_map(index_from_row).collect(),
            ))
        })
    }

    fn health_check<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.fetch_rows(Board::Index, true).await.is_ok() })
    }

    fn circuit_state(&self) -> Option<CircuitState> {
        Some(self.upstream.circuit_state())
    }
}

#[derive(Debug, Deserialize)]
struct ListEnvelope {
    #[serde(default)]
    data: Option<ListData>,
}

#[derive(Debug, Deserialize)]
struct ListData {
    #[serde(default)]
    diff: Value,
}

/// `data.diff` is an array, or an object keyed by position when `np` is not honoured.
fn parse_rows(body: &str) -> Result<Vec<Map<String, Value>>, FetchError> {
    let json = unwrap_jsonp("eastmoney", body)?;
    let envelope: ListEnvelope = serde_json::from_str(json)
        .map_err(|e| FetchError::parse(format!("failed to parse eastmoney response: {e}")))?;

    let Some(data) = envelope.data else {
        return Ok(Vec::new());
    };

    let rows = match data.diff {
        Value::Array(items) => items,
        Value::Object(map) => {
            // Map keys iterate as strings ("10" before "2"); restore position order.
            let mut keyed: Vec<(u64, Value)> = map
                .into_iter()
                .map(|(key, row)| (key.parse().unwrap_or(u64::MAX), row))
                .collect();
            keyed.sort_by_key(|(position, _)| *position);
            keyed.into_iter().map(|(_, row)| row).collect()
        }
        Value::Null => Vec::new(),
        other => {
            return Err(FetchError::parse(format!(
                "eastmoney 'diff' has unexpected shape: {other}"
            )))
        }
    };

    Ok(rows
        .into_iter()
        .filter_map(|row| match row {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect())
}

fn field<'a>(row: &'a Map<String, Value>, name: &str) -> &'a Value {
    row.get(name).unwrap_or(&Value::Null)
}

fn number(row: &Map<String, Value>, name: &str) -> f64 {
    coerce_f64(field(row, name))
}

fn stock_from_row(row: &Map<String, Value>) -> Option<NormalizedStockRecord> {
    let code = coerce_string(field(row, "f12"));
    if code.is_empty() {
        return None;
    }

    Some(
        NormalizedStockRecord {
            code,
            name: coerce_string(field(row, "f14")),
            open: number(row, "f17"),
            high: number(row, "f15"),
            low: number(row, "f16"),
            last: number(row, "f2"),
            prev_close: number(row, "f18"),
            change: number(row, "f4"),
            change_rate_percent: number(row, "f3"),
            volume: number(row, "f5") * SHARES_PER_LOT,
            amount: number(row, "f6"),
            amplitude_rate_percent: number(row, "f7"),
            ..NormalizedStockRecord::default()
        }
        .clean(),
    )
}

fn index_from_row(row: &Map<String, Value>) -> Option<NormalizedIndexRecord> {
    let code = coerce_string(field(row, "f12"));
    if code.is_empty() {
        return None;
    }

    Some(
        NormalizedIndexRecord {
            code,
            name: coerce_string(field(row, "f14")),
            open: number(row, "f17"),
            high: number(row, "f15"),
            low: number(row, "f16"),
            current: number(row, "f2"),
            prev_close: number(row, "f18"),
            change: number(row, "f4"),
            change_rate_percent: number(row, "f3"),
            volume: number(row, "f5") * SHARES_PER_LOT,
            amount: number(row, "f6"),
            amplitude_rate_percent: number(row, "f7"),
            update_time: format_update_time(field(row, "f124")),
            ..NormalizedIndexRecord::default()
        }
        .clean(),
    )
}

/// `f124` is a unix timestamp in seconds; rendered on the exchange clock.
fn format_update_time(value: &Value) -> String {
    let seconds = coerce_f64(value) as i64;
    if seconds <= 0 {
        return String::new();
    }
    OffsetDateTime::from_unix_timestamp(seconds)
        .ok()
        .and_then(|moment| {
            moment
                .to_offset(offset!(+8))
                .format(format_description!(
                    "[year]-[month]-[day] [hour]:[minute]:[second]"
                ))
                .ok()
        })
        .unwrap_or_default()
}
