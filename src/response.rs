use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{stream, stream::BoxStream, StreamExt};
use http::{
    header::{self, HeaderName, HeaderValue},
    HeaderMap, StatusCode,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use url::Url;

use crate::{Error, JsonParser, Result};

enum Body {
    Full(Bytes),
    Stream(BoxStream<'static, Result<Bytes>>),
}

/// HTTP response with lazy body extraction.
///
/// The body can be read once; a second read fails with [`Error::BodyUsed`].
/// Use [`Response::clone_buffered`] to read it more than once.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    url: Option<Url>,
    body: Arc<Mutex<Option<Body>>>,
    parse_json: Option<JsonParser>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("url", &self.url.as_ref().map(Url::as_str))
            .field("body_used", &self.body_used())
            .finish_non_exhaustive()
    }
}

/// Body bytes tagged with their media type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    pub content_type: String,
    pub data: Bytes,
}

impl Blob {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl Response {
    /// Creates a response with an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self::from_body(status, Body::Full(Bytes::new()))
    }

    /// Creates a response whose body is read from `stream`.
    pub fn from_stream(status: StatusCode, stream: BoxStream<'static, Result<Bytes>>) -> Self {
        Self::from_body(status, Body::Stream(stream))
    }

    fn from_body(status: StatusCode, body: Body) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            url: None,
            body: Arc::new(Mutex::new(Some(body))),
            parse_json: None,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Replaces the body with the given bytes.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Arc::new(Mutex::new(Some(Body::Full(body.into()))));
        self
    }

    /// Replaces the body with a JSON document and sets `content-type`.
    pub fn with_json(self, value: &serde_json::Value) -> Self {
        self.with_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )
        .with_body(value.to_string())
    }

    pub(crate) fn with_stream(mut self, stream: BoxStream<'static, Result<Bytes>>) -> Self {
        self.body = Arc::new(Mutex::new(Some(Body::Stream(stream))));
        self
    }

    /// Attaches the call's JSON parser.
    pub(crate) fn decorate(mut self, parse_json: Option<&JsonParser>) -> Self {
        if self.parse_json.is_none() {
            self.parse_json = parse_json.cloned();
        }
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Whether the status is 2xx.
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Final URL after redirects, when the transport reports one.
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    pub fn body_used(&self) -> bool {
        self.body.lock().is_none()
    }

    fn take_body(&self) -> Result<Body> {
        self.body.lock().take().ok_or(Error::BodyUsed)
    }

    /// Takes the body as a stream of chunks.
    pub fn body_stream(&self) -> Result<BoxStream<'static, Result<Bytes>>> {
        Ok(match self.take_body()? {
            Body::Full(bytes) if bytes.is_empty() => stream::empty().boxed(),
            Body::Full(bytes) => stream::once(async move { Ok(bytes) }).boxed(),
            Body::Stream(stream) => stream,
        })
    }

    /// Reads the whole body.
    pub async fn bytes(&self) -> Result<Bytes> {
        match self.take_body()? {
            Body::Full(bytes) => Ok(bytes),
            Body::Stream(mut stream) => {
                let mut buffer = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buffer.extend_from_slice(&chunk?);
                }
                Ok(buffer.freeze())
            }
        }
    }

    pub async fn array_buffer(&self) -> Result<Vec<u8>> {
        Ok(self.bytes().await?.to_vec())
    }

    /// Reads the body as UTF-8, replacing invalid sequences.
    pub async fn text(&self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Parses the body as JSON.
    ///
    /// Returns `Ok(None)` for 204 responses and empty bodies instead of a
    /// parse error. Uses the configured JSON parser when one is set.
    pub async fn json<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if self.status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let bytes = self.bytes().await?;
        if bytes.is_empty() {
            return Ok(None);
        }

        let value = match &self.parse_json {
            Some(parse) => {
                let text = std::str::from_utf8(&bytes)
                    .map_err(|err| Error::Decode(format!("response body is not UTF-8: {err}")))?;
                let value = parse(text).map_err(|err| Error::Decode(err.to_string()))?;
                serde_json::from_value(value)?
            }
            None => serde_json::from_slice(&bytes)?,
        };
        Ok(Some(value))
    }

    pub async fn blob(&self) -> Result<Blob> {
        let content_type = self
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        Ok(Blob {
            content_type,
            data: self.bytes().await?,
        })
    }

    /// Decodes an `application/x-www-form-urlencoded` body into ordered pairs.
    pub async fn form_data(&self) -> Result<Vec<(String, String)>> {
        let content_type = self
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !content_type.starts_with("application/x-www-form-urlencoded") {
            return Err(Error::Decode(format!(
                "cannot read form data from content type '{content_type}'"
            )));
        }
        let bytes = self.bytes().await?;
        Ok(url::form_urlencoded::parse(&bytes).into_owned().collect())
    }

    /// Buffers the body and returns an independent response with the same
    /// bytes. This response stays readable.
    pub async fn clone_buffered(&self) -> Result<Response> {
        let bytes = self.bytes().await?;
        *self.body.lock() = Some(Body::Full(bytes.clone()));
        Ok(Self {
            status: self.status,
            headers: self.headers.clone(),
            url: self.url.clone(),
            body: Arc::new(Mutex::new(Some(Body::Full(bytes)))),
            parse_json: self.parse_json.clone(),
        })
    }
}
