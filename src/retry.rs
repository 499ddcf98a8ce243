use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::{HeaderMap, Method, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Largest delay the timer layer accepts, in milliseconds.
pub(crate) const MAX_DELAY_MS: u64 = 2_147_483_647;

/// Numeric rate-limit values at or after this instant (2024-01-01T00:00:00Z,
/// in milliseconds) are Unix timestamps rather than delta-seconds.
const TIMESTAMP_THRESHOLD_MS: f64 = 1_704_067_200_000.0;

/// Headers consulted, in order, for a server-provided retry delay.
const RATE_LIMIT_HEADERS: [&str; 4] = [
    "retry-after",
    "ratelimit-reset",
    "x-ratelimit-reset",
    "x-rate-limit-reset",
];

const DEFAULT_LIMIT: u32 = 2;
const DEFAULT_METHODS: [&str; 6] = ["get", "put", "head", "delete", "options", "trace"];
const DEFAULT_STATUS_CODES: [u16; 7] = [408, 413, 429, 500, 502, 503, 504];
const DEFAULT_AFTER_STATUS_CODES: [u16; 3] = [413, 429, 503];

/// Delay function: retry count (starting at 1) to delay.
pub type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Retry eligibility override: `Some(_)` decides outright, `None` defers to
/// the policy.
pub type ShouldRetryFn = Arc<dyn Fn(&Error, u32) -> Option<bool> + Send + Sync>;

/// Exponential backoff with a 300 ms base: `300 * 2^(retry_count - 1)` ms.
pub fn default_delay(retry_count: u32) -> Duration {
    let exp = retry_count.saturating_sub(1).min(32);
    Duration::from_millis(300u64.saturating_mul(1u64 << exp))
}

/// Partial retry configuration; unset fields take the policy defaults.
#[derive(Clone, Default)]
pub struct RetryOptions {
    pub limit: Option<u32>,
    pub methods: Option<Vec<String>>,
    pub status_codes: Option<Vec<u16>>,
    pub after_status_codes: Option<Vec<u16>>,
    pub max_retry_after: Option<Duration>,
    pub backoff_limit: Option<Duration>,
    pub delay: Option<DelayFn>,
    pub retry_on_timeout: Option<bool>,
    pub should_retry: Option<ShouldRetryFn>,
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("limit", &self.limit)
            .field("methods", &self.methods)
            .field("status_codes", &self.status_codes)
            .field("after_status_codes", &self.after_status_codes)
            .field("max_retry_after", &self.max_retry_after)
            .field("backoff_limit", &self.backoff_limit)
            .field("retry_on_timeout", &self.retry_on_timeout)
            .finish_non_exhaustive()
    }
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn methods<I, M>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: AsRef<str>,
    {
        self.methods = Some(
            methods
                .into_iter()
                .map(|method| method.as_ref().to_ascii_lowercase())
                .collect(),
        );
        self
    }

    pub fn status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.status_codes = Some(codes.into_iter().collect());
        self
    }

    pub fn after_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.after_status_codes = Some(codes.into_iter().collect());
        self
    }

    pub fn max_retry_after(mut self, max: Duration) -> Self {
        self.max_retry_after = Some(max);
        self
    }

    pub fn backoff_limit(mut self, limit: Duration) -> Self {
        self.backoff_limit = Some(limit);
        self
    }

    pub fn delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Arc::new(delay));
        self
    }

    pub fn retry_on_timeout(mut self, enabled: bool) -> Self {
        self.retry_on_timeout = Some(enabled);
        self
    }

    /// Overrides eligibility per failure. The callback gets the error and the
    /// retry count, starting at 1.
    ///
    /// `Some(true)` retries even past [`limit`](Self::limit) and for statuses
    /// or methods the policy would skip, so the callback must bound retries
    /// itself, e.g. `|_, count| (count <= 5).then_some(true)`. `Some(false)`
    /// gives up. `None` falls back to the policy. Cancellation and validation
    /// errors are never retried.
    pub fn should_retry<F>(mut self, decide: F) -> Self
    where
        F: Fn(&Error, u32) -> Option<bool> + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(decide));
        self
    }

    fn merge(self, later: RetryOptions) -> RetryOptions {
        RetryOptions {
            limit: later.limit.or(self.limit),
            methods: later.methods.or(self.methods),
            status_codes: later.status_codes.or(self.status_codes),
            after_status_codes: later.after_status_codes.or(self.after_status_codes),
            max_retry_after: later.max_retry_after.or(self.max_retry_after),
            backoff_limit: later.backoff_limit.or(self.backoff_limit),
            delay: later.delay.or(self.delay),
            retry_on_timeout: later.retry_on_timeout.or(self.retry_on_timeout),
            should_retry: later.should_retry.or(self.should_retry),
        }
    }
}

/// Retry setting as supplied by the caller: a bare limit or a policy.
#[derive(Clone, Debug)]
pub enum RetryOption {
    Limit(u32),
    Policy(RetryOptions),
}

impl RetryOption {
    /// A later bare limit replaces everything; a later policy is merged
    /// field-wise into an earlier one.
    pub(crate) fn merge(self, later: RetryOption) -> RetryOption {
        match (self, later) {
            (Self::Policy(base), Self::Policy(later)) => Self::Policy(base.merge(later)),
            (_, later) => later,
        }
    }
}

impl From<u32> for RetryOption {
    fn from(limit: u32) -> Self {
        Self::Limit(limit)
    }
}

impl From<RetryOptions> for RetryOption {
    fn from(options: RetryOptions) -> Self {
        Self::Policy(options)
    }
}

/// Fully populated retry policy.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Attempts beyond the first; `0` disables retries.
    pub limit: u32,
    /// Lowercase method names eligible for retry.
    pub methods: Vec<String>,
    pub status_codes: Vec<u16>,
    /// Statuses for which a rate-limit header overrides the delay function.
    pub after_status_codes: Vec<u16>,
    /// Upper bound for server-hinted delays; `None` is unbounded.
    pub max_retry_after: Option<Duration>,
    /// Upper bound for computed backoff; `None` is unbounded.
    pub backoff_limit: Option<Duration>,
    pub delay: DelayFn,
    pub retry_on_timeout: bool,
    pub should_retry: Option<ShouldRetryFn>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("limit", &self.limit)
            .field("methods", &self.methods)
            .field("status_codes", &self.status_codes)
            .field("after_status_codes", &self.after_status_codes)
            .field("max_retry_after", &self.max_retry_after)
            .field("backoff_limit", &self.backoff_limit)
            .field("retry_on_timeout", &self.retry_on_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            methods: DEFAULT_METHODS.iter().map(|m| (*m).to_owned()).collect(),
            status_codes: DEFAULT_STATUS_CODES.to_vec(),
            after_status_codes: DEFAULT_AFTER_STATUS_CODES.to_vec(),
            max_retry_after: None,
            backoff_limit: None,
            delay: Arc::new(default_delay),
            retry_on_timeout: false,
            should_retry: None,
        }
    }
}

impl RetryPolicy {
    pub(crate) fn from_option(option: Option<RetryOption>) -> Self {
        let defaults = Self::default();
        match option {
            None => defaults,
            Some(RetryOption::Limit(limit)) => Self { limit, ..defaults },
            Some(RetryOption::Policy(options)) => Self {
                limit: options.limit.unwrap_or(defaults.limit),
                methods: options.methods.unwrap_or(defaults.methods),
                status_codes: options.status_codes.unwrap_or(defaults.status_codes),
                after_status_codes: options
                    .after_status_codes
                    .unwrap_or(defaults.after_status_codes),
                max_retry_after: options.max_retry_after,
                backoff_limit: options.backoff_limit,
                delay: options.delay.unwrap_or(defaults.delay),
                retry_on_timeout: options.retry_on_timeout.unwrap_or(defaults.retry_on_timeout),
                should_retry: options.should_retry,
            },
        }
    }

    pub fn allows_method(&self, method: &Method) -> bool {
        self.methods
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(method.as_str()))
    }

    /// Records a failed attempt and decides whether to retry it.
    pub(crate) fn evaluate(&self, state: &mut AttemptState, error: &Error) -> RetryDecision {
        state.retry_count += 1;
        let retry_count = state.retry_count;

        if matches!(error, Error::Cancelled | Error::Validation(_)) {
            return RetryDecision::GiveUp;
        }

        if let Some(should_retry) = &self.should_retry {
            match should_retry(error, retry_count) {
                Some(true) => {
                    let delay = self
                        .server_hint(error)
                        .unwrap_or_else(|| self.backoff(retry_count));
                    return RetryDecision::Retry(delay);
                }
                Some(false) => return RetryDecision::GiveUp,
                None => {}
            }
        }

        if retry_count > self.limit {
            return RetryDecision::GiveUp;
        }

        if error.is_timeout() && !self.retry_on_timeout {
            return RetryDecision::GiveUp;
        }

        if let Some(status) = error.status() {
            if !self.status_codes.contains(&status.as_u16()) {
                return RetryDecision::GiveUp;
            }
            if let Some(delay) = self.server_hint(error) {
                return RetryDecision::Retry(delay);
            }
            if status == StatusCode::PAYLOAD_TOO_LARGE {
                return RetryDecision::GiveUp;
            }
        }

        RetryDecision::Retry(self.backoff(retry_count))
    }

    fn server_hint(&self, error: &Error) -> Option<Duration> {
        let response = error.as_http()?.response();
        if !self
            .after_status_codes
            .contains(&response.status().as_u16())
        {
            return None;
        }
        let after = parse_retry_after(response.headers(), SystemTime::now())?;
        let bounded = match self.max_retry_after {
            Some(max) => after.min(max),
            None => after,
        };
        Some(clamp_delay(bounded))
    }

    fn backoff(&self, retry_count: u32) -> Duration {
        let delay = (self.delay)(retry_count);
        let bounded = match self.backoff_limit {
            Some(limit) => delay.min(limit),
            None => delay,
        };
        clamp_delay(bounded)
    }
}

fn clamp_delay(delay: Duration) -> Duration {
    delay.min(Duration::from_millis(MAX_DELAY_MS))
}

/// Per-call failure counter, owned by the call's retry loop.
#[derive(Debug, Default)]
pub(crate) struct AttemptState {
    retry_count: u32,
}

impl AttemptState {
    pub(crate) fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

/// Reads the server-provided delay from the rate-limit headers.
///
/// Numeric values are seconds, or a Unix timestamp in seconds once they reach
/// 2024-01-01. Anything else is parsed as an HTTP-date. Instants in the past
/// yield a zero delay.
pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = RATE_LIMIT_HEADERS
        .iter()
        .find_map(|name| headers.get(*name))?
        .to_str()
        .ok()?
        .trim();
    if value.is_empty() {
        return None;
    }

    match value.parse::<f64>() {
        Ok(seconds) if seconds.is_finite() => {
            let mut millis = seconds * 1000.0;
            if millis >= TIMESTAMP_THRESHOLD_MS {
                let now_ms = now.duration_since(UNIX_EPOCH).ok()?.as_millis() as f64;
                millis -= now_ms;
            }
            Some(Duration::from_millis(
                millis.clamp(0.0, MAX_DELAY_MS as f64) as u64
            ))
        }
        _ => {
            let at = httpdate::parse_http_date(value).ok()?;
            Some(at.duration_since(now).unwrap_or(Duration::ZERO))
        }
    }
}

/// Sleeps for `delay`, returning early with [`Error::Cancelled`] when the
/// call's token fires.
pub(crate) async fn wait(delay: Duration, signal: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        () = signal.cancelled() => Err(Error::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}
