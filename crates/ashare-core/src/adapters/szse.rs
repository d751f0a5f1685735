use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::common::{strip_html, validate_date, Upstream};
use crate::circuit_breaker::CircuitState;
use crate::data_source::{
    BoxFuture, DataSource, DataSourceDescriptor, FetchOutcome, SourceResponse,
};
use crate::domain::numeric::{coerce_f64, coerce_string};
use crate::domain::{NormalizedIndexRecord, NormalizedStockRecord, TradeDate};
use crate::error::FetchError;
use crate::http_client::HttpClient;
use crate::provider_policy::ProviderPolicy;
use crate::SourceKind;

pub const SZSE_BASE_URL: &str = "https://www.szse.cn/api/report/ShowReport/data";
const SZSE_REFERER: &str = "https://www.szse.cn/market/trend/index.html";

const STOCK_CATALOG: &str = "1815_stock_snapshot";
const INDEX_CATALOG: &str = "1826";
const MAX_PAGES: u32 = 200;

/// Volume and turnover are reported in units of ten thousand.
const WAN: f64 = 10_000.0;

/// Shenzhen Stock Exchange report API.
///
/// The only provider that honours the requested date; results are paged and
/// every numeric cell arrives as a formatted string.
pub struct SzseAdapter {
    upstream: Upstream,
}

impl Default for SzseAdapter {
    fn default() -> Self {
        Self::new(ProviderPolicy::szse_default(), Upstream::default_client())
    }
}

impl SzseAdapter {
    pub fn new(policy: ProviderPolicy, http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            upstream: Upstream::new(
                "深交所官方",
                SZSE_BASE_URL,
                SZSE_REFERER,
                &policy,
                http_client,
            ),
        }
    }

    pub fn with_http_client(http_client: Arc<dyn HttpClient>) -> Self {
        Self::new(ProviderPolicy::szse_default(), http_client)
    }

    async fn fetch_page(
        &self,
        catalog: &str,
        date: TradeDate,
        page: u32,
        once: bool,
    ) -> Result<ReportPage, FetchError> {
        let date = date.to_string();
        let request = self
            .upstream
            .request(self.upstream.base_url())
            .with_query("SHOWTYPE", "JSON")
            .with_query("CATALOGID", catalog)
            .with_query("TABKEY", "tab1")
            .with_query("txtBeginDate", date.as_str())
            .with_query("txtEndDate", date.as_str())
            .with_query("PAGENO", page.to_string())
            .with_query("random", fastrand::f64().to_string());

        let body = if once {
            self.upstream.fetch_text_once(request).await?
        } else {
            self.upstream.fetch_text(request).await?
        };
        parse_report(&body)
    }

    /// Walks every page of a catalog and returns the concatenated rows.
    async fn fetch_all_rows(
        &self,
        catalog: &str,
        date: TradeDate,
    ) -> Result<Vec<Map<String, Value>>, FetchError> {
        let first = self.fetch_page(catalog, date, 1, false).await?;
        let page_count = first.page_count;
        let mut rows = first.rows;

        if page_count > MAX_PAGES {
            warn!(page_count, cap = MAX_PAGES, "szse page count exceeds cap, truncating");
        }
        for page in 2..=page_count.min(MAX_PAGES) {
            let next = self.fetch_page(catalog, date, page, false).await?;
            if next.rows.is_empty() {
                break;
            }
            rows.extend(next.rows);
        }

        debug!(catalog, pages = page_count, rows = rows.len(), "szse report fetched");
        Ok(rows)
    }
}

impl DataSource for SzseAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Szse
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
            Ok(SourceResponse::not_applicable())
        })
    }

    fn get_szse_data<'a>(
        &'a self,
        date: &'a str,
    ) -> BoxFuture<'a, FetchOutcome<Vec<NormalizedStockRecord>>> {
        Box::pin(async move {
            let date = validate_date(date)?;
            let rows = self.fetch_all_rows(STOCK_CATALOG, date).await?;
            Ok(SourceResponse::ok(
                rows.iter().filter_map(stock_from_row).collect(),
            ))
        })
    }

    fn get_index_data<'a>(
        &'a self,
        date: &'a str,
    ) -> BoxFuture<'a, FetchOutcome<Vec<NormalizedIndexRecord>>> {
        Box::pin(async move {
            let date = validate_date(date)?;
            let rows = self.fetch_all_rows(INDEX_CATALOG, date).await?;
            let update_time = date.to_string();
            Ok(SourceResponse::ok(
                rows.iter()
                    .filter_map(|row| index_from_row(row, &update_time))
                    .collect(),
            ))
        })
    }

    fn health_check<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let today = TradeDate::today();
            self.fetch_page(INDEX_CATALOG, today, 1, true).await.is_ok()
        })
    }

    fn circuit_state(&self) -> Option<CircuitState> {
        Some(self.upstream.circuit_state())
    }
}

#[derive(Debug, Deserialize)]
struct ReportCatalog {
    #[serde(default)]
    metadata: ReportMetadata,
    #[serde(default)]
    data: Vec<Map<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct ReportMetadata {
    #[serde(default)]
    pagecount: Value,
}

#[derive(Debug)]
struct ReportPage {
    page_count: u32,
    rows: Vec<Map<String, Value>>,
}

/// The report API answers an array of catalogs; the first carries the table.
fn parse_report(body: &str) -> Result<ReportPage, FetchError> {
    let trimmed = body.trim().trim_start_matches('\u{feff}');
    let catalogs: Vec<ReportCatalog> = serde_json::from_str(trimmed)
        .map_err(|e| FetchError::parse(format!("failed to parse szse report: {e}")))?;
    let catalog = catalogs
        .into_iter()
        .next()
        .ok_or_else(|| FetchError::parse("szse report contained no catalog"))?;

    let page_count = coerce_f64(&catalog.metadata.pagecount).max(1.0) as u32;
    Ok(ReportPage {
        page_count,
        rows: catalog.data,
    })
}

fn field<'a>(row: &'a Map<String, Value>, name: &str) -> &'a Value {
    row.get(name).unwrap_or(&Value::Null)
}

fn text(row: &Map<String, Value>, name: &str) -> String {
    strip_html(&coerce_string(field(row, name)))
}

fn number(row: &Map<String, Value>, name: &str) -> f64 {
    coerce_f64(field(row, name))
}

fn stock_from_row(row: &Map<String, Value>) -> Option<NormalizedStockRecord> {
    let code = text(row, "zqdm");
    if code.is_empty() {
        return None;
    }

    Some(
        NormalizedStockRecord {
            code,
            name: text(row, "zqjc"),
            open: number(row, "ks"),
            high: number(row, "zg"),
            low: number(row, "zd"),
            last: number(row, "ss"),
            prev_close: number(row, "qss"),
            change_rate_percent: number(row, "sdf"),
            volume: number(row, "cjgs") * WAN,
            amount: number(row, "cjje") * WAN,
            ..NormalizedStockRecord::default()
        }
        .clean(),
    )
}

fn index_from_row(row: &Map<String, Value>, update_time: &str) -> Option<NormalizedIndexRecord> {
    let code = text(row, "zsdm");
    if code.is_empty() {
        return None;
    }

    Some(
        NormalizedIndexRecord {
            code,
            name: text(row, "zsmc"),
            open: number(row, "ks"),
            high: number(row, "zg"),
            low: number(row, "zd"),
            current: number(row, "ss"),
            prev_close: number(row, "qss"),
            change_rate_percent: number(row, "sdf"),
            volume: number(row, "cjgs") * WAN,
            amount: number(row, "cjje") * WAN,
            update_time: update_time.to_owned(),
            ..NormalizedIndexRecord::default()
        }
        .clean(),
    )
}
