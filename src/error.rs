use std::sync::Arc;

use http::StatusCode;

use crate::{NormalizedOptions, Request, Response};

/// Boxed error used for transport failures and user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed call-time input. Raised before any network activity and never retried.
    #[error("invalid request: {0}")]
    Validation(String),
    /// A single attempt exceeded its deadline.
    #[error(transparent)]
    Timeout(Box<TimeoutError>),
    /// Terminal non-2xx response.
    #[error(transparent)]
    Http(Box<HttpError>),
    /// The call was aborted through its cancellation token.
    #[error("request was cancelled")]
    Cancelled,
    /// Network or request execution error from the transport.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
    /// Error raised by user hook code.
    #[error("hook error: {0}")]
    Hook(#[source] BoxError),
    /// A hook panicked with a value that is not an error.
    #[error("non-error value raised by hook: {0}")]
    NonError(String),
    /// The response body was already consumed.
    #[error("response body has already been used")]
    BodyUsed,
    /// Response decoding error.
    #[error("decode error: {0}")]
    Decode(String),
}

impl Error {
    /// Wraps an arbitrary error raised from a hook.
    pub fn hook(err: impl Into<BoxError>) -> Self {
        Self::Hook(err.into())
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Self::Http(_))
    }

    /// Returns the HTTP error details when this is an [`Error::Http`].
    pub fn as_http(&self) -> Option<&HttpError> {
        match self {
            Self::Http(err) => Some(&**err),
            _ => None,
        }
    }

    /// Status code of the failed response, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.as_http().map(|err| err.response().status())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// A non-2xx response that was not retried, or exhausted its retries.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HttpError {
    message: String,
    request: Request,
    response: Response,
    options: Arc<NormalizedOptions>,
}

impl HttpError {
    pub(crate) fn new(request: Request, response: Response, options: Arc<NormalizedOptions>) -> Self {
        let status = response.status();
        let code = format!(
            "{} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or_default()
        );
        let message = format!(
            "Request failed with status code {}: {} {}",
            code.trim(),
            request.method(),
            request.url()
        );
        Self {
            message,
            request,
            response,
            options,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn options(&self) -> &NormalizedOptions {
        &self.options
    }

    /// Takes the response out, e.g. to read the error body.
    pub fn into_response(self) -> Response {
        self.response
    }
}

/// An attempt exceeded its configured timeout.
#[derive(Debug, thiserror::Error)]
#[error("Request timed out: {} {}", .request.method(), .request.url())]
pub struct TimeoutError {
    request: Request,
}

impl TimeoutError {
    pub(crate) fn new(request: Request) -> Self {
        Self { request }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }
}
