use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::data_source::{DataSourceDescriptor, DescriptorCell, RequestConfig};
use crate::domain::{TradeDate, UtcDateTime};
use crate::error::FetchError;
use crate::http_client::{HttpClient, HttpRequest, ReqwestHttpClient, BROWSER_USER_AGENT};
use crate::provider_policy::ProviderPolicy;
use crate::retry::RetryConfig;
use crate::throttling::Throttle;

/// Transport plumbing shared by every provider adapter.
pub(crate) struct Upstream {
    pub(crate) descriptor: DescriptorCell,
    http_client: Arc<dyn HttpClient>,
    circuit_breaker: CircuitBreaker,
    throttle: Throttle,
    retry: RetryConfig,
}

impl Upstream {
    pub(crate) fn new(
        name: &str,
        base_url: &str,
        referer: &str,
        policy: &ProviderPolicy,
        http_client: Arc<dyn HttpClient>,
    ) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(String::from("user-agent"), BROWSER_USER_AGENT.to_owned());
        headers.insert(String::from("referer"), referer.to_owned());
        headers.insert(
            String::from("accept"),
            String::from("application/json, text/javascript, */*; q=0.01"),
        );
        headers.insert(
            String::from("accept-language"),
            String::from("zh-CN,zh;q=0.9,en;q=0.8"),
        );

        let descriptor = DataSourceDescriptor {
            name: name.to_owned(),
            kind: policy.kind,
            base_url: base_url.to_owned(),
            enabled: true,
            priority: policy.priority,
            request_config: RequestConfig {
                timeout: policy.timeout,
                headers,
            },
        };

        Self {
            descriptor: DescriptorCell::new(descriptor),
            http_client,
            circuit_breaker: CircuitBreaker::from_policy(policy),
            throttle: Throttle::from_policy(policy),
            retry: policy.retry.clone(),
        }
    }

    pub(crate) fn default_client() -> Arc<dyn HttpClient> {
        Arc::new(ReqwestHttpClient::new())
    }

    pub(crate) fn name(&self) -> String {
        self.descriptor.snapshot().name
    }

    pub(crate) fn base_url(&self) -> String {
        self.descriptor.snapshot().base_url
    }

    pub(crate) fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    /// Builds a GET request carrying the descriptor's headers and timeout.
    pub(crate) fn request(&self, url: impl Into<String>) -> HttpRequest {
        let descriptor = self.descriptor.snapshot();
        HttpRequest::get(url)
            .with_headers(&descriptor.request_config.headers)
            .with_timeout(descriptor.request_config.timeout)
    }

    /// Executes a request with breaker, pacing and retry applied, returning the body.
    pub(crate) async fn fetch_text(&self, request: HttpRequest) -> Result<String, FetchError> {
        self.fetch_with_budget(request, self.retry.max_retries).await
    }

    /// Single attempt without retries, used by health probes.
    pub(crate) async fn fetch_text_once(&self, request: HttpRequest) -> Result<String, FetchError> {
        self.fetch_with_budget(request, 0).await
    }

    async fn fetch_with_budget(
        &self,
        request: HttpRequest,
        max_retries: u32,
    ) -> Result<String, FetchError> {
        let name = self.name();
        if let Err(remaining) = self.circuit_breaker.admit() {
            return Err(FetchError::network(format!(
                "{name} circuit breaker is open; next trial in {}ms",
                remaining.as_millis()
            )));
        }

        let result = self.attempt(&name, &request, max_retries).await;
        match &result {
            Ok(_) => self.circuit_breaker.on_success(),
            Err(_) => self.circuit_breaker.on_failure(),
        }
        result
    }

    async fn attempt(
        &self,
        name: &str,
        request: &HttpRequest,
        max_retries: u32,
    ) -> Result<String, FetchError> {
        let mut attempt = 0_u32;

        loop {
            self.throttle.acquire().await;
            debug!(source = %name, url = %request.full_url(), attempt, "upstream request");

            let error = match self.http_client.execute(request.clone()).await {
                Ok(response) if response.is_success() => return Ok(response.body),
                Ok(response) => {
                    let error = FetchError::from_status(name, response.status);
                    if !self.retry.should_retry_status(response.status) {
                        return Err(error);
                    }
                    error
                }
                Err(error) => {
                    let retry = self.retry.should_retry_transport(error.kind());
                    let error = error.into_fetch_error(name);
                    if !retry {
                        return Err(error);
                    }
                    error
                }
            };

            if attempt >= max_retries {
                return Err(error);
            }

            let delay = self.retry.delay_for_attempt(attempt);
            warn!(
                source = %name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying upstream request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

pub(crate) fn validate_date(date: &str) -> Result<TradeDate, FetchError> {
    TradeDate::parse(date).map_err(FetchError::from)
}

/// Millisecond token used to defeat intermediary caching.
pub(crate) fn cache_buster() -> i64 {
    UtcDateTime::now().unix_millis()
}

/// Removes HTML markup some upstreams embed in text cells.
pub(crate) fn strip_html(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut in_tag = false;
    for ch in text.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => output.push(ch),
            _ => {}
        }
    }
    output.replace("&nbsp;", " ").trim().to_owned()
}
