use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{
    header::{HeaderName, HeaderValue},
    HeaderMap, Method,
};
use tokio_util::sync::CancellationToken;

use crate::{
    retry::MAX_DELAY_MS, Error, Hooks, Input, JsonParser, JsonStringifier, Options,
    ProgressCallback, ReqwestTransport, Result, RetryPolicy, Timeout, Transport,
};

const DEFAULT_TIMEOUT_MS: u64 = 10_000;

const STANDARD_METHODS: [Method; 8] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::HEAD,
    Method::DELETE,
    Method::OPTIONS,
    Method::TRACE,
];

/// Fully resolved options for one call.
///
/// Built once per call from the merged [`Options`] and shared read-only with
/// hooks and errors afterwards.
#[derive(Clone)]
pub struct NormalizedOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub retry: RetryPolicy,
    /// Per-attempt deadline; `None` when disabled.
    pub timeout: Option<Duration>,
    pub prefix_url: Option<String>,
    pub search_params: Option<Vec<(String, String)>>,
    pub json: Option<serde_json::Value>,
    pub body: Option<Bytes>,
    pub hooks: Hooks,
    pub throw_http_errors: bool,
    pub parse_json: Option<JsonParser>,
    pub stringify_json: Option<JsonStringifier>,
    pub on_download_progress: Option<ProgressCallback>,
    pub on_upload_progress: Option<ProgressCallback>,
    pub signal: Option<CancellationToken>,
    pub transport: Arc<dyn Transport>,
}

impl fmt::Debug for NormalizedOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedOptions")
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("prefix_url", &self.prefix_url)
            .field("search_params", &self.search_params)
            .field("hooks", &self.hooks)
            .field("throw_http_errors", &self.throw_http_errors)
            .finish_non_exhaustive()
    }
}

impl Default for NormalizedOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            retry: RetryPolicy::default(),
            timeout: Some(Duration::from_millis(DEFAULT_TIMEOUT_MS)),
            prefix_url: None,
            search_params: None,
            json: None,
            body: None,
            hooks: Hooks::default(),
            throw_http_errors: true,
            parse_json: None,
            stringify_json: None,
            on_download_progress: None,
            on_upload_progress: None,
            signal: None,
            transport: Arc::new(ReqwestTransport::default()),
        }
    }
}

/// Validates merged options and fills in defaults. Also applies the prefix
/// join to string inputs.
pub(crate) fn normalize(
    input: Input,
    options: Options,
    default_transport: &Arc<dyn Transport>,
) -> Result<(Input, NormalizedOptions)> {
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
    } = options;

    let method = match method {
        Some(raw) => normalize_method(&raw)?,
        None => input
            .request()
            .map(|request| request.method().clone())
            .unwrap_or(Method::GET),
    };

    let timeout = match timeout.unwrap_or(Timeout::Millis(DEFAULT_TIMEOUT_MS)) {
        Timeout::Disabled => None,
        Timeout::Millis(millis) if millis > MAX_DELAY_MS => {
            return Err(Error::validation(format!(
                "timeout must not be greater than {MAX_DELAY_MS} ms, got {millis}"
            )));
        }
        Timeout::Millis(millis) => Some(Duration::from_millis(millis)),
    };

    let prefix_url = prefix_url.filter(|prefix| !prefix.is_empty());
    let input = match (input, prefix_url.as_deref()) {
        (Input::Str(raw), Some(prefix)) => Input::Str(join_prefix(prefix, &raw)?),
        (input, _) => input,
    };

    let normalized = NormalizedOptions {
        method,
        headers: resolve_headers(headers)?,
        retry: RetryPolicy::from_option(retry),
        timeout,
        prefix_url,
        search_params: search_params.map(|params| params.into_pairs()),
        json,
        body,
        hooks,
        throw_http_errors: throw_http_errors.unwrap_or(true),
        parse_json,
        stringify_json,
        on_download_progress,
        on_upload_progress,
        signal,
        transport: transport.unwrap_or_else(|| Arc::clone(default_transport)),
    };
    Ok((input, normalized))
}

/// Uppercases standard verbs; anything else must be a valid token and is
/// passed through as given.
fn normalize_method(raw: &str) -> Result<Method> {
    if let Some(standard) = STANDARD_METHODS
        .iter()
        .find(|method| method.as_str().eq_ignore_ascii_case(raw))
    {
        return Ok(standard.clone());
    }
    Method::from_bytes(raw.as_bytes())
        .map_err(|_| Error::validation(format!("invalid HTTP method '{raw}'")))
}

fn join_prefix(prefix: &str, input: &str) -> Result<String> {
    if input.starts_with('/') {
        return Err(Error::validation(
            "`input` must not begin with a slash when using `prefix_url`",
        ));
    }
    Ok(format!("{}/{input}", prefix.trim_end_matches('/')))
}

/// Applies header patches in order. A `None` value removes the header.
fn resolve_headers(patches: Vec<(String, Option<String>)>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in patches {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::validation(format!("invalid header name '{name}'")))?;
        match value {
            Some(value) => {
                let value = HeaderValue::from_str(&value).map_err(|_| {
                    Error::validation(format!("invalid value for header '{name}'"))
                })?;
                headers.insert(name, value);
            }
            None => {
                headers.remove(&name);
            }
        }
    }
    Ok(headers)
}
