use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
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

pub const SSE_BASE_URL: &str = "https://yunhq.sse.com.cn:32042/v1/sh1/list/exchange";
const SSE_REFERER: &str = "https://www.sse.com.cn/";

/// Column order requested through the `select` parameter; rows come back positionally.
const STOCK_COLUMNS: &str = "code,name,open,high,low,last,prev_close,chg_rate,volume,amount,\
tradephase,change,amp_rate,cpxxsubtype,cpxxprodusta";
const INDEX_COLUMNS: &str =
    "code,name,open,high,low,last,prev_close,chg_rate,volume,amount,tradephase,change,amp_rate";
const BOARD_END: &str = "5000";

/// Shanghai Stock Exchange quote feed.
///
/// Serves the SSE board and SSE indices only; asked for the Shenzhen board it
/// answers "not applicable".
pub struct SseAdapter {
    upstream: Upstream,
}

impl Default for SseAdapter {
    fn default() -> Self {
        Self::new(ProviderPolicy::sse_default(), Upstream::default_client())
    }
}

impl SseAdapter {
    pub fn new(policy: ProviderPolicy, http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            upstream: Upstream::new(
                "上交所官方",
                SSE_BASE_URL,
                SSE_REFERER,
                &policy,
                http_client,
            ),
        }
    }

    pub fn with_http_client(http_client: Arc<dyn HttpClient>) -> Self {
        Self::new(ProviderPolicy::sse_default(), http_client)
    }

    async fn fetch_list(&self, segment: &str, columns: &str, once: bool) -> Result<SseList, FetchError> {
        let token = cache_buster();
        let request = self
            .upstream
            .request(format!("{}/{segment}", self.upstream.base_url()))
            .with_query("callback", callback_name("jsonpCallback", token))
            .with_query("select", columns)
            .with_query("order", "")
            .with_query("begin", "0")
            .with_query("end", BOARD_END)
            .with_query("_", token.to_string());

        let body = if once {
            self.upstream.fetch_text_once(request).await?
        } else {
            self.upstream.fetch_text(request).await?
        };
        parse_list(&body)
    }

    async fn fetch_stocks(&self) -> Result<Vec<NormalizedStockRecord>, FetchError> {
        let list = self.fetch_list("equity", STOCK_COLUMNS, false).await?;
        let records: Vec<_> = list.rows.iter().filter_map(|row| stock_from_row(row)).collect();
        debug!(count = records.len(), "sse board parsed");
        Ok(records)
    }

    async fn fetch_indices(&self, once: bool) -> Result<Vec<NormalizedIndexRecord>, FetchError> {
        let list = self.fetch_list("index", INDEX_COLUMNS, once).await?;
        let update_time = list.update_time();
        Ok(list
            .rows
            .iter()
            .filter_map(|row| index_from_row(row, &update_time))
            .collect())
    }
}

impl DataSource for SseAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Sse
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
            Ok(SourceResponse::ok(self.fetch_stocks().await?))
        })
    }

    fn get_szse_data<'a>(
        &'a self,
        date: &'a str,
    ) -> BoxFuture<'a, FetchOutcome<Vec<NormalizedStockRecord>>> {
        Box::pin(async move {
            validate_date(date)?;
            Ok(SourceResponse::not_applicable())
        })
    }

    fn get_index_data<'a>(
        &'a self,
        date: &'a str,
    ) -> BoxFuture<'a, FetchOutcome<Vec<NormalizedIndexRecord>>> {
        Box::pin(async move {
            validate_date(date)?;
            Ok(SourceResponse::ok(self.fetch_indices(false).await?))
        })
    }

    fn health_check<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.fetch_indices(true).await.is_ok() })
    }

    fn circuit_state(&self) -> Option<CircuitState> {
        Some(self.upstream.circuit_state())
    }
}

#[derive(Debug, Deserialize)]
struct SseListPayload {
    #[serde(default)]
    date: Value,
    #[serde(default)]
    time: Value,
    list: Option<Vec<Vec<Value>>>,
}

#[derive(Debug)]
struct SseList {
    date: String,
    time: String,
    rows: Vec<Vec<Value>>,
}

impl SseList {
    /// `20240105` + `93005` -> `2024-01-05 09:30:05`.
    fn update_time(&self) -> String {
        let time = format!("{:0>6}", self.time);
        if self.date.len() != 8 || time.len() != 6 {
            return format!("{} {}", self.date, self.time).trim().to_owned();
        }
        format!(
            "{}-{}-{} {}:{}:{}",
            &self.date[0..4],
            &self.date[4..6],
            &self.date[6..8],
            &time[0..2],
            &time[2..4],
            &time[4..6]
        )
    }
}

fn parse_list(body: &str) -> Result<SseList, FetchError> {
    let json = unwrap_jsonp("sse", body)?;
    let payload: SseListPayload = serde_json::from_str(json)
        .map_err(|e| FetchError::parse(format!("failed to parse sse response: {e}")))?;
    let rows = payload
        .list
        .ok_or_else(|| FetchError::parse("sse response is missing the 'list' field"))?;

    Ok(SseList {
        date: coerce_string(&payload.date),
        time: coerce_string(&payload.time),
        rows,
    })
}

fn cell(row: &[Value], index: usize) -> &Value {
    row.get(index).unwrap_or(&Value::Null)
}

fn stock_from_row(row: &[Value]) -> Option<NormalizedStockRecord> {
    let code = coerce_string(cell(row, 0));
    if code.is_empty() {
        return None;
    }

    Some(
        NormalizedStockRecord {
            code,
            name: coerce_string(cell(row, 1)),
            open: coerce_f64(cell(row, 2)),
            high: coerce_f64(cell(row, 3)),
            low: coerce_f64(cell(row, 4)),
            last: coerce_f64(cell(row, 5)),
            prev_close: coerce_f64(cell(row, 6)),
            change_rate_percent: coerce_f64(cell(row, 7)),
            volume: coerce_f64(cell(row, 8)),
            amount: coerce_f64(cell(row, 9)),
            trading_phase: coerce_string(cell(row, 10)),
            change: coerce_f64(cell(row, 11)),
            amplitude_rate_percent: coerce_f64(cell(row, 12)),
            sub_type: coerce_string(cell(row, 13)),
            product_status: coerce_string(cell(row, 14)),
        }
        .clean(),
    )
}

fn index_from_row(row: &[Value], update_time: &str) -> Option<NormalizedIndexRecord> {
    let code = coerce_string(cell(row, 0));
    if code.is_empty() {
        return None;
    }

    Some(
        NormalizedIndexRecord {
            code,
            name: coerce_string(cell(row, 1)),
            open: coerce_f64(cell(row, 2)),
            high: coerce_f64(cell(row, 3)),
            low: coerce_f64(cell(row, 4)),
            current: coerce_f64(cell(row, 5)),
            prev_close: coerce_f64(cell(row, 6)),
            change_rate_percent: coerce_f64(cell(row, 7)),
            volume: coerce_f64(cell(row, 8)),
            amount: coerce_f64(cell(row, 9)),
            trading_phase: coerce_string(cell(row, 10)),
            change: coerce_f64(cell(row, 11)),
            amplitude_rate_percent: coerce_f64(cell(row, 12)),
            update_time: update_time.to_owned(),
        }
        .clean(),
    )
}
