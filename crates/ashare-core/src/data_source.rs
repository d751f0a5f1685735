//! Data source trait and descriptor types.
//!
//! Every upstream provider is wrapped in a type implementing [`DataSource`].
//! The manager and the fetch service only ever hold `Arc<dyn DataSource>`.
//!
//! # Operations
//!
//! | Method | Payload | Description |
//! |--------|---------|-------------|
//! | [`get_sse_data`](DataSource::get_sse_data) | stocks | Shanghai A-share board |
//! | [`get_szse_data`](DataSource::get_szse_data) | stocks | Shenzhen A-share board |
//! | [`get_index_data`](DataSource::get_index_data) | indices | Major indices |
//! | [`get_limit_up_data`](DataSource::get_limit_up_data) | stocks | Boards filtered at +9.9% |
//! | [`get_limit_down_data`](DataSource::get_limit_down_data) | stocks | Boards filtered at -9.9% |
//! | [`health_check`](DataSource::health_check) | bool | Lightweight real fetch |

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitState;
use crate::domain::{
    filter_limit_down, filter_limit_up, DataKind, MarketData, NormalizedIndexRecord,
    NormalizedStockRecord,
};
use crate::error::{ErrorClass, FetchError};
use crate::SourceKind;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of one data source call.
pub type FetchOutcome<T> = Result<SourceResponse<T>, FetchError>;

/// Per-source request settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestConfig {
    pub timeout: Duration,
    pub headers: BTreeMap<String, String>,
}

/// Identity and runtime settings of a data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    pub name: String,
    pub kind: SourceKind,
    pub base_url: String,
    pub enabled: bool,
    /// Lower values are preferred during selection.
    pub priority: u32,
    pub request_config: RequestConfig,
}

/// Interior-mutable descriptor storage shared by adapter implementations.
#[derive(Debug)]
pub struct DescriptorCell {
    inner: RwLock<DataSourceDescriptor>,
}

impl DescriptorCell {
    pub fn new(descriptor: DataSourceDescriptor) -> Self {
        Self {
            inner: RwLock::new(descriptor),
        }
    }

    pub fn snapshot(&self) -> DataSourceDescriptor {
        self.inner
            .read()
            .expect("descriptor lock is not poisoned")
            .clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner
            .write()
            .expect("descriptor lock is not poisoned")
            .enabled = enabled;
    }

    pub fn set_priority(&self, priority: u32) {
        self.inner
            .write()
            .expect("descriptor lock is not poisoned")
            .priority = priority;
    }
}

/// Successful data source payload.
///
/// `not_applicable` marks a well-formed empty answer from a source that
/// cannot serve the requested board at all; it is not a source failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceResponse<T> {
    pub data: T,
    pub not_applicable: bool,
}

impl<T> SourceResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            data,
            not_applicable: false,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> SourceResponse<U> {
        SourceResponse {
            data: f(self.data),
            not_applicable: self.not_applicable,
        }
    }

    pub fn classification(&self) -> Option<ErrorClass> {
        self.not_applicable.then_some(ErrorClass::NotApplicable)
    }
}

impl<T: Default> SourceResponse<T> {
    pub fn not_applicable() -> Self {
        Self {
            data: T::default(),
            not_applicable: true,
        }
    }
}

/// Provider adapter contract.
///
/// Every method validates its `YYYY-MM-DD` date before touching the network
/// and reports failures as classified [`FetchError`]s. Implementations must be
/// `Send + Sync`; they are shared across tasks behind `Arc`.
pub trait DataSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn descriptor(&self) -> DataSourceDescriptor;

    fn set_enabled(&self, enabled: bool);

    fn set_priority(&self, priority: u32);

    fn get_sse_data<'a>(
        &'a self,
        date: &'a str,
    ) -> BoxFuture<'a, FetchOutcome<Vec<NormalizedStockRecord>>>;

    fn get_szse_data<'a>(
        &'a self,
        date: &'a str,
    ) -> BoxFuture<'a, FetchOutcome<Vec<NormalizedStockRecord>>>;

    fn get_index_data<'a>(
        &'a self,
        date: &'a str,
    ) -> BoxFuture<'a, FetchOutcome<Vec<NormalizedIndexRecord>>>;

    /// Both boards this source serves, filtered at `+9.9%`.
    fn get_limit_up_data<'a>(
        &'a self,
        date: &'a str,
    ) -> BoxFuture<'a, FetchOutcome<Vec<NormalizedStockRecord>>> {
        Box::pin(async move {
            let boards = combined_boards(self, date).await?;
            Ok(boards.map(filter_limit_up))
        })
    }

    /// Both boards this source serves, filtered at `-9.9%`.
    fn get_limit_down_data<'a>(
        &'a self,
        date: &'a str,
    ) -> BoxFuture<'a, FetchOutcome<Vec<NormalizedStockRecord>>> {
        Box::pin(async move {
            let boards = combined_boards(self, date).await?;
            Ok(boards.map(filter_limit_down))
        })
    }

    /// True iff a subsequent data fetch would very likely succeed.
    fn health_check<'a>(&'a self) -> BoxFuture<'a, bool>;

    /// State of the breaker guarding upstream calls, for sources that have one.
    fn circuit_state(&self) -> Option<CircuitState> {
        None
    }
}

/// Fetches the SSE and SZSE boards and concatenates whichever apply.
async fn combined_boards<S>(
    source: &S,
    date: &str,
) -> FetchOutcome<Vec<NormalizedStockRecord>>
where
    S: DataSource + ?Sized,
{
    let sse = source.get_sse_data(date).await;
    if let Err(error) = &sse {
        if error.class() == ErrorClass::Validation {
            return Err(error.clone());
        }
    }
    let szse = source.get_szse_data(date).await;

    let mut records = Vec::new();
    let mut applicable = false;
    let mut first_error = None;
    for outcome in [sse, szse] {
        match outcome {
            Ok(response) if response.not_applicable => {}
            Ok(response) => {
                applicable = true;
                records.extend(response.data);
            }
            Err(error) => {
                applicable = true;
                first_error.get_or_insert(error);
            }
        }
    }

    if let Some(error) = first_error {
        return Err(error);
    }
    if !applicable {
        return Ok(SourceResponse::not_applicable());
    }
    Ok(SourceResponse::ok(records))
}

/// Routes a [`DataKind`] to the matching data source operation.
pub async fn dispatch(
    source: &dyn DataSource,
    kind: DataKind,
    date: &str,
) -> FetchOutcome<MarketData> {
    match kind {
        DataKind::SseStocks => Ok(source.get_sse_data(date).await?.map(MarketData::Stocks)),
        DataKind::SzseStocks => Ok(source.get_szse_data(date).await?.map(MarketData::Stocks)),
        DataKind::Index => Ok(source.get_index_data(date).await?.map(MarketData::Indices)),
        DataKind::LimitUp => Ok(source
            .get_limit_up_data(date)
            .await?
            .map(MarketData::Stocks)),
        DataKind::LimitDown => Ok(source
            .get_limit_down_data(date)
            .await?
            .map(MarketData::Stocks)),
    }
}
