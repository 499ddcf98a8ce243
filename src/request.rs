use std::collections::{BTreeMap, HashMap};
use std::fmt;

use bytes::Bytes;
use http::{
    header::{self, HeaderName, HeaderValue},
    HeaderMap, Method,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{Error, NormalizedOptions, ProgressCallback, Result};

/// Immutable description of one HTTP exchange.
///
/// Hooks never mutate a request in place. The `with_*` methods consume the
/// value and return a new snapshot, which a hook hands back through
/// [`HookAction::Request`](crate::HookAction::Request).
#[derive(Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
    signal: CancellationToken,
    half_duplex: bool,
    upload_progress: Option<ProgressCallback>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("body_len", &self.body.as_ref().map(Bytes::len))
            .field("half_duplex", &self.half_duplex)
            .finish_non_exhaustive()
    }
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            signal: CancellationToken::new(),
            half_duplex: false,
            upload_progress: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Cancellation token observed by the transport for this request.
    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    /// Whether the body is streamed while headers are already sent.
    pub fn is_half_duplex(&self) -> bool {
        self.half_duplex
    }

    pub fn upload_progress(&self) -> Option<&ProgressCallback> {
        self.upload_progress.as_ref()
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = url;
        self
    }

    /// Sets a header, replacing every existing value under that name.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn without_header(mut self, name: &HeaderName) -> Self {
        self.headers.remove(name);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = signal;
        self
    }
}

/// Target of a call: a URL string, a parsed URL, or a prebuilt request.
#[derive(Clone, Debug)]
pub enum Input {
    Str(String),
    Url(Url),
    Request(Request),
}

impl Input {
    pub(crate) fn request(&self) -> Option<&Request> {
        match self {
            Self::Request(request) => Some(request),
            _ => None,
        }
    }
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for Input {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<Url> for Input {
    fn from(value: Url) -> Self {
        Self::Url(value)
    }
}

impl From<&Url> for Input {
    fn from(value: &Url) -> Self {
        Self::Url(value.clone())
    }
}

impl From<Request> for Input {
    fn from(value: Request) -> Self {
        Self::Request(value)
    }
}

/// Query-string source. Every shape resolves to ordered pairs, so repeated
/// keys survive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchParams {
    /// Raw query text, with or without a leading `?`.
    Raw(String),
    /// Ordered key/value pairs.
    Pairs(Vec<(String, String)>),
}

impl SearchParams {
    /// Encodes any serializable value the way `serde_urlencoded` does.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_urlencoded::to_string(value)
            .map(Self::Raw)
            .map_err(|err| Error::validation(format!("invalid search params: {err}")))
    }

    pub(crate) fn into_pairs(self) -> Vec<(String, String)> {
        match self {
            Self::Raw(raw) => url::form_urlencoded::parse(raw.trim_start_matches('?').as_bytes())
                .into_owned()
                .collect(),
            Self::Pairs(pairs) => pairs,
        }
    }
}

impl From<&str> for SearchParams {
    fn from(value: &str) -> Self {
        Self::Raw(value.to_owned())
    }
}

impl From<String> for SearchParams {
    fn from(value: String) -> Self {
        Self::Raw(value)
    }
}

impl<K: Into<String>, V: Into<String>> From<Vec<(K, V)>> for SearchParams {
    fn from(pairs: Vec<(K, V)>) -> Self {
        Self::Pairs(
            pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for SearchParams {
    fn from(pairs: [(K, V); N]) -> Self {
        Self::from(Vec::from(pairs))
    }
}

impl<K: Into<String>, V: Into<String>> From<BTreeMap<K, V>> for SearchParams {
    fn from(map: BTreeMap<K, V>) -> Self {
        Self::from(map.into_iter().collect::<Vec<_>>())
    }
}

impl<K: Into<String>, V: Into<String>, S> From<HashMap<K, V, S>> for SearchParams {
    fn from(map: HashMap<K, V, S>) -> Self {
        Self::from(map.into_iter().collect::<Vec<_>>())
    }
}

/// Builds the request for a call from its resolved input and options.
///
/// The returned request carries the call-level cancellation token: a child of
/// the caller's signal (from the options, else from an input request) so that
/// cancelling the caller's token aborts the call without the call holding on to
/// the caller's token afterwards.
pub(crate) fn build_request(
    input: Input,
    options: &NormalizedOptions,
    accept: Option<&'static str>,
) -> Result<Request> {
    let parent_signal = options
        .signal
        .clone()
        .or_else(|| input.request().map(|request| request.signal.clone()));

    let (url, mut headers, input_body) = match input {
        Input::Str(raw) => {
            let url = Url::parse(&raw)
                .map_err(|err| Error::validation(format!("invalid URL '{raw}': {err}")))?;
            (url, HeaderMap::new(), None)
        }
        Input::Url(url) => (url, HeaderMap::new(), None),
        Input::Request(request) => (request.url, request.headers, request.body),
    };

    for name in options.headers.keys() {
        headers.remove(name);
    }
    for (name, value) in &options.headers {
        headers.append(name.clone(), value.clone());
    }

    let body = match &options.json {
        Some(json) => {
            let encoded = match &options.stringify_json {
                Some(stringify) => stringify(json)
                    .map_err(|err| Error::validation(format!("json serializer failed: {err}")))?,
                None => serde_json::to_string(json)
                    .map_err(|err| Error::validation(format!("invalid json body: {err}")))?,
            };
            if !headers.contains_key(header::CONTENT_TYPE) {
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
            }
            Some(Bytes::from(encoded))
        }
        None => options.body.clone().or(input_body),
    };

    if body.is_some() && (options.method == Method::GET || options.method == Method::HEAD) {
        return Err(Error::validation(format!(
            "request with {} method cannot have a body",
            options.method
        )));
    }

    if let Some(mime) = accept {
        if !headers.contains_key(header::ACCEPT) {
            headers.insert(header::ACCEPT, HeaderValue::from_static(mime));
        }
    }

    let mut url = url;
    if let Some(pairs) = &options.search_params {
        url.set_query(None);
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
    }

    let upload_progress = options.on_upload_progress.clone();
    Ok(Request {
        method: options.method.clone(),
        url,
        headers,
        half_duplex: body.is_some() && upload_progress.is_some(),
        body,
        signal: parent_signal
            .map(|parent| parent.child_token())
            .unwrap_or_default(),
        upload_progress,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::{header, HeaderValue, Method};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use url::Url;

    use super::{build_request, Input, Request, SearchParams};
    use crate::{normalize::NormalizedOptions, Error};

    fn options() -> NormalizedOptions {
        NormalizedOptions::default()
    }

    #[test]
    fn json_payload_sets_body_and_content_type() {
        let mut opts = options();
        opts.method = Method::POST;
        opts.json = Some(json!({"name": "kit"}));

        let request = build_request("https://example.com/users".into(), &opts, None)
            .expect("request must build");

        assert_eq!(request.body().map(|b| b.as_ref()), Some(&br#"{"name":"kit"}"#[..]));
        assert_eq!(
            request.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/json"))
        );
    }

    #[test]
    fn json_payload_keeps_explicit_content_type() {
        let mut opts = options();
        opts.method = Method::POST;
        opts.json = Some(json!([1, 2]));
        opts.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/vnd.api+json"),
        );

        let request = build_request("https://example.com/".into(), &opts, None)
            .expect("request must build");

        assert_eq!(
            request.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/vnd.api+json"))
        );
    }

    #[test]
    fn custom_stringifier_is_used_for_json_body() {
        let mut opts = options();
        opts.method = Method::PUT;
        opts.json = Some(json!({"a": 1}));
        opts.stringify_json = Some(Arc::new(|_| Ok("custom".to_owned())));

        let request = build_request("https://example.com/".into(), &opts, None)
            .expect("request must build");

        assert_eq!(request.body().map(|b| b.as_ref()), Some(&b"custom"[..]));
    }

    #[test]
    fn search_params_replace_existing_query_and_keep_repeats() {
        let mut opts = options();
        opts.search_params =
            Some(SearchParams::from(vec![("tag", "a"), ("tag", "b"), ("q", "x y")]).into_pairs());

        let request = build_request("https://example.com/list?old=1#frag".into(), &opts, None)
            .expect("request must build");

        assert_eq!(request.url().query(), Some("tag=a&tag=b&q=x+y"));
        assert_eq!(request.url().fragment(), Some("frag"));
    }

    #[test]
    fn raw_search_params_strip_leading_question_mark() {
        let pairs = SearchParams::from("?a=1&a=2").into_pairs();
        assert_eq!(
            pairs,
            vec![("a".to_owned(), "1".to_owned()), ("a".to_owned(), "2".to_owned())]
        );
    }

    #[test]
    fn get_with_body_is_rejected() {
        let mut opts = options();
        opts.json = Some(json!({}));

        let err = build_request("https://example.com/".into(), &opts, None)
            .expect_err("GET with body must fail");
        assert!(matches!(err, Error::Validation(message) if message.contains("GET")));
    }

    #[test]
    fn unparseable_url_is_a_validation_error() {
        let err = build_request("not a url".into(), &options(), None)
            .expect_err("relative url must fail without prefix");
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn input_request_headers_are_overridden_by_options() {
        let input = Request::new(
            Method::GET,
            Url::parse("https://example.com/").expect("static url"),
        )
        .with_header(header::USER_AGENT, HeaderValue::from_static("input"))
        .with_header(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en"));
        let mut opts = options();
        opts.headers
            .insert(header::USER_AGENT, HeaderValue::from_static("options"));

        let request = build_request(Input::Request(input), &opts, None).expect("must build");

        assert_eq!(request.headers()[header::USER_AGENT], "options");
        assert_eq!(request.headers()[header::ACCEPT_LANGUAGE], "en");
    }

    #[test]
    fn accept_is_only_set_when_absent() {
        let request = build_request("https://example.com/".into(), &options(), Some("text/*"))
            .expect("must build");
        assert_eq!(request.headers()[header::ACCEPT], "text/*");

        let mut opts = options();
        opts.headers
            .insert(header::ACCEPT, HeaderValue::from_static("application/xml"));
        let request =
            build_request("https://example.com/".into(), &opts, Some("text/*")).expect("must build");
        assert_eq!(request.headers()[header::ACCEPT], "application/xml");
    }

    #[test]
    fn caller_signal_cancels_request_signal() {
        let caller = CancellationToken::new();
        let mut opts = options();
        opts.signal = Some(caller.clone());

        let request = build_request("https://example.com/".into(), &opts, None).expect("must build");
        assert!(!request.signal().is_cancelled());
        caller.cancel();
        assert!(request.signal().is_cancelled());
    }

    #[test]
    fn internal_signal_does_not_cancel_caller() {
        let caller = CancellationToken::new();
        let mut opts = options();
        opts.signal = Some(caller.clone());

        let request = build_request("https://example.com/".into(), &opts, None).expect("must build");
        request.signal().cancel();
        assert!(!caller.is_cancelled());
    }

    #[test]
    fn upload_progress_marks_body_half_duplex() {
        let mut opts = options();
        opts.method = Method::POST;
        opts.body = Some("payload".into());
        opts.on_upload_progress = Some(Arc::new(|_, _| {}));

        let request = build_request("https://example.com/".into(), &opts, None).expect("must build");
        assert!(request.is_half_duplex());
    }
}
