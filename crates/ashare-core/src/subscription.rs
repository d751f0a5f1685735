//! Polling subscriptions over [`DataFetchService`].
//!
//! Each subscription is one background task: fetch immediately, then once per
//! `interval`, always bypassing the cache. A failed poll with
//! `auto_reconnect` suspends the regular schedule, retries once after
//! `reconnect_interval` and then restarts the interval from that retry, so at
//! most one fetch per subscription is ever in flight.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::background::BackgroundTask;
use crate::domain::{DataKind, TradeDate};
use crate::error::ValidationError;
use crate::service::{DataFetchService, FetchCore, FetchFailure, FetchOptions, FetchSuccess};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

pub type DataCallback = Arc<dyn Fn(FetchSuccess) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(FetchFailure) + Send + Sync>;

#[derive(Clone)]
pub struct SubscribeOptions {
    pub interval: Duration,
    pub auto_reconnect: bool,
    pub reconnect_interval: Duration,
    pub on_data_change: DataCallback,
    pub on_error: Option<ErrorCallback>,
}

impl SubscribeOptions {
    pub fn new(on_data_change: impl Fn(FetchSuccess) + Send + Sync + 'static) -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            auto_reconnect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            on_data_change: Arc::new(on_data_change),
            on_error: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_reconnect(mut self, enabled: bool, reconnect_interval: Duration) -> Self {
        self.auto_reconnect = enabled;
        self.reconnect_interval = reconnect_interval;
        self
    }

    pub fn on_error(mut self, on_error: impl Fn(FetchFailure) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("interval", &self.interval)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

/// Cancellation flag shared by a [`Subscription`] and its poller.
///
/// The poller holds the lock from its cancellation check until its callback
/// returns, so setting the flag waits out a callback already running and no
/// later one can start.
#[derive(Debug, Default)]
struct CancelGate(Mutex<bool>);

impl CancelGate {
    /// Sets the flag; returns `true` on the first call only.
    fn cancel(&self) -> bool {
        !std::mem::replace(&mut *self.lock(), true)
    }

    fn is_cancelled(&self) -> bool {
        *self.lock()
    }

    // A panicking callback poisons the lock; the flag itself stays valid.
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cancellation handle for a polling subscription.
///
/// Dropping the handle cancels the subscription. Cancelling from inside one
/// of its own callbacks deadlocks.
#[derive(Debug)]
pub struct Subscription {
    kind: DataKind,
    gate: Arc<CancelGate>,
    task: BackgroundTask,
}

impl Subscription {
    pub fn kind(&self) -> DataKind {
        self.kind
    }

    /// Stops polling. No callback runs after this returns, including for a
    /// fetch that was already in flight.
    pub fn cancel(&mut self) {
        if self.gate.cancel() {
            info!(kind = self.kind.as_str(), "subscription cancelled");
        }
        self.task.stop();
    }

    pub fn is_active(&self) -> bool {
        !self.gate.is_cancelled() && self.task.is_running()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.gate.cancel();
    }
}

impl DataFetchService {
    /// Starts polling `kind` for `date` until the returned handle is
    /// cancelled or dropped. Must be called inside a tokio runtime.
    pub fn subscribe(
        &self,
        kind: DataKind,
        date: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription, ValidationError> {
        if options.interval.is_zero() {
            return Err(ValidationError::ZeroInterval);
        }
        TradeDate::parse(date)?;

        let gate = Arc::new(CancelGate::default());
        let poller = Poller {
            core: self.core(),
            kind,
            date: date.to_owned(),
            options,
            gate: Arc::clone(&gate),
        };
        info!(
            kind = kind.as_str(),
            date,
            interval_ms = poller.options.interval.as_millis() as u64,
            "subscription started"
        );

        Ok(Subscription {
            kind,
            gate,
            task: BackgroundTask::spawn("subscription", poller.run()),
        })
    }
}

struct Poller {
    core: Arc<FetchCore>,
    kind: DataKind,
    date: String,
    options: SubscribeOptions,
    gate: Arc<CancelGate>,
}

impl Poller {
    fn is_cancelled(&self) -> bool {
        self.gate.is_cancelled()
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.is_cancelled() {
                break;
            }
            if self.poll().await || !self.options.auto_reconnect {
                continue;
            }

            debug!(
                kind = self.kind.as_str(),
                retry_in_ms = self.options.reconnect_interval.as_millis() as u64,
                "poll failed; scheduling reconnect"
            );
            tokio::time::sleep(self.options.reconnect_interval).await;
            if self.is_cancelled() {
                break;
            }
            self.poll().await;
            ticker.reset();
        }
        debug!(kind = self.kind.as_str(), "subscription loop exited");
    }

    /// One uncached fetch; returns whether it succeeded.
    async fn poll(&self) -> bool {
        let options = FetchOptions::without_cache();
        let result = self.core.get_data(self.kind, &self.date, &options).await;
        self.deliver(result)
    }

    /// Hands `result` to the callbacks under the cancellation lock. Results
    /// arriving after cancellation are dropped.
    fn deliver(&self, result: Result<FetchSuccess, FetchFailure>) -> bool {
        let cancelled = self.gate.lock();
        if *cancelled {
            return result.is_ok();
        }

        match result {
            Ok(success) => {
                (self.options.on_data_change)(success);
                true
            }
            Err(failure) => {
                warn!(
                    kind = self.kind.as_str(),
                    class = %failure.classification,
                    error = %failure.message,
                    "subscription poll failed"
                );
                if let Some(on_error) = &self.options.on_error {
                    on_error(failure);
                }
                false
            }
        }
    }
}
