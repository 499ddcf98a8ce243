use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    BoxError, Error, Hooks, ProgressCallback, Result, RetryOption, SearchParams, Transport,
};

const ENV_PREFIX_URL: &str = "KITE_PREFIX_URL";
const ENV_TIMEOUT_MS: &str = "KITE_TIMEOUT_MS";
const ENV_RETRY_LIMIT: &str = "KITE_RETRY_LIMIT";

/// Custom JSON decoder applied to response text.
pub type JsonParser =
    Arc<dyn Fn(&str) -> std::result::Result<serde_json::Value, BoxError> + Send + Sync>;

/// Custom JSON encoder applied to the `json` request payload.
pub type JsonStringifier =
    Arc<dyn Fn(&serde_json::Value) -> std::result::Result<String, BoxError> + Send + Sync>;

/// Per-attempt deadline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Timeout {
    Millis(u64),
    Disabled,
}

impl From<u64> for Timeout {
    fn from(millis: u64) -> Self {
        Self::Millis(millis)
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::Millis(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Partial request options.
///
/// Instance defaults and per-call options are both `Options`; they are layered
/// with [`Options::merge`] and resolved once per call into
/// [`NormalizedOptions`](crate::NormalizedOptions).
#[derive(Clone, Default)]
pub struct Options {
    /// HTTP method; standard verbs are matched case-insensitively.
    pub method: Option<String>,
    /// Ordered header patches. `None` removes a previously set header.
    pub headers: Vec<(String, Option<String>)>,
    /// JSON payload serialized into the body.
    pub json: Option<serde_json::Value>,
    /// Raw request body, ignored when `json` is set.
    pub body: Option<Bytes>,
    /// Query parameters; replace any query already present on the URL.
    pub search_params: Option<SearchParams>,
    /// Prefix joined in front of string inputs.
    pub prefix_url: Option<String>,
    pub retry: Option<RetryOption>,
    pub timeout: Option<Timeout>,
    pub hooks: Hooks,
    /// Whether non-2xx responses fail the call. Defaults to `true`.
    pub throw_http_errors: Option<bool>,
    pub parse_json: Option<JsonParser>,
    pub stringify_json: Option<JsonStringifier>,
    pub on_download_progress: Option<ProgressCallback>,
    pub on_upload_progress: Option<ProgressCallback>,
    /// Caller-owned cancellation token.
    pub signal: Option<CancellationToken>,
    /// Overrides the instance transport.
    pub transport: Option<Arc<dyn Transport>>,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("json", &self.json)
            .field("search_params", &self.search_params)
            .field("prefix_url", &self.prefix_url)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("hooks", &self.hooks)
            .field("throw_http_errors", &self.throw_http_errors)
            .finish_non_exhaustive()
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads instance defaults from the environment.
    ///
    /// Reads:
    /// - `KITE_PREFIX_URL`: prefix joined in front of string inputs
    /// - `KITE_TIMEOUT_MS`: per-attempt timeout in milliseconds, or `off`
    /// - `KITE_RETRY_LIMIT`: number of retries after the first attempt
    ///
    /// Unset or empty variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();
        if let Some(prefix) = read_env(ENV_PREFIX_URL) {
            options.prefix_url = Some(prefix);
        }
        if let Some(raw) = read_env(ENV_TIMEOUT_MS) {
            options.timeout = Some(parse_timeout(&raw)?);
        }
        if let Some(raw) = read_env(ENV_RETRY_LIMIT) {
            let limit = raw.parse::<u32>().map_err(|_| {
                Error::validation(format!(
                    "{ENV_RETRY_LIMIT} must be a non-negative integer, got '{raw}'"
                ))
            })?;
            options.retry = Some(RetryOption::Limit(limit));
        }
        Ok(options)
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), Some(value.into())));
        self
    }

    /// Removes a header set by an earlier layer.
    pub fn remove_header(mut self, name: impl Into<String>) -> Self {
        self.headers.push((name.into(), None));
        self
    }

    pub fn json(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.json = Some(value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn search_params(mut self, params: impl Into<SearchParams>) -> Self {
        self.search_params = Some(params.into());
        self
    }

    pub fn prefix_url(mut self, prefix: impl Into<String>) -> Self {
        self.prefix_url = Some(prefix.into());
        self
    }

    pub fn retry(mut self, retry: impl Into<RetryOption>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.timeout = Some(Timeout::Disabled);
        self
    }

    /// Appends hooks after the ones already registered.
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = std::mem::take(&mut self.hooks).merge(hooks);
        self
    }

    pub fn throw_http_errors(mut self, enabled: bool) -> Self {
        self.throw_http_errors = Some(enabled);
        self
    }

    pub fn parse_json<F>(mut self, parser: F) -> Self
    where
        F: Fn(&str) -> std::result::Result<serde_json::Value, BoxError> + Send + Sync + 'static,
    {
        self.parse_json = Some(Arc::new(parser));
        self
    }

    pub fn stringify_json<F>(mut self, stringify: F) -> Self
    where
        F: Fn(&serde_json::Value) -> std::result::Result<String, BoxError> + Send + Sync + 'static,
    {
        self.stringify_json = Some(Arc::new(stringify));
        self
    }

    pub fn on_download_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(crate::Progress, &[u8]) + Send + Sync + 'static,
    {
        self.on_download_progress = Some(Arc::new(callback));
        self
    }

    pub fn on_upload_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(crate::Progress, &[u8]) + Send + Sync + 'static,
    {
        self.on_upload_progress = Some(Arc::new(callback));
        self
    }

    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Layers `later` on top of `self`.
    ///
    /// Scalars from `later` win when set. Header patches and hook lists are
    /// concatenated, so parent entries keep running first.
    pub fn merge(self, later: Options) -> Options {
        let Options {
            method,
            headers,
            json,
            body,
            search_params,
            prefix_url,
            retry,
            timeout,
            hooks,
            throw_http_errors,
            parse_json,
            stringify_json,
            on_download_progress,
            on_upload_progress,
            signal,
            transport,
        } = later;

        let mut merged_headers = self.headers;
        merged_headers.extend(headers);

        let retry = match (self.retry, retry) {
            (Some(base), Some(later)) => Some(base.merge(later)),
            (base, later) => later.or(base),
        };

        Options {
            method: method.or(self.method),
            headers: merged_headers,
            json: json.or(self.json),
            body: body.or(self.body),
            search_params: search_params.or(self.search_params),
            prefix_url: prefix_url.or(self.prefix_url),
            retry,
            timeout: timeout.or(self.timeout),
            hooks: self.hooks.merge(hooks),
            throw_http_errors: throw_http_errors.or(self.throw_http_errors),
            parse_json: parse_json.or(self.parse_json),
            stringify_json: stringify_json.or(self.stringify_json),
            on_download_progress: on_download_progress.or(self.on_download_progress),
            on_upload_progress: on_upload_progress.or(self.on_upload_progress),
            signal: signal.or(self.signal),
            transport: transport.or(self.transport),
        }
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_timeout(raw: &str) -> Result<Timeout> {
    if raw.eq_ignore_ascii_case("off") || raw.eq_ignore_ascii_case("false") {
        return Ok(Timeout::Disabled);
    }
    raw.parse::<u64>().map(Timeout::Millis).map_err(|_| {
        Error::validation(format!(
            "{ENV_TIMEOUT_MS} must be a number of milliseconds or 'off', got '{raw}'"
        ))
    })
}
