use std::fmt;
use std::future::Future;

use futures::{future::BoxFuture, StreamExt, TryStreamExt};

use crate::{progress, Error, Request, Response, Result};

/// The fetch primitive this crate wraps.
///
/// Implementations perform exactly one HTTP exchange for the given request.
/// They should stop work when [`Request::signal`] is cancelled; the engine
/// also stops awaiting them at that point.
pub trait Transport: Send + Sync {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response>>;
}

/// Default transport backed by `reqwest`.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a preconfigured `reqwest` client (proxies, TLS roots, pools).
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Transport for ReqwestTransport {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move {
            let mut builder = self
                .http
                .request(request.method().clone(), request.url().clone())
                .headers(request.headers().clone());

            if let Some(body) = request.body() {
                builder = match request.upload_progress() {
                    Some(callback) => builder.body(reqwest::Body::wrap_stream(
                        progress::upload_stream(body.clone(), callback.clone()),
                    )),
                    None => builder.body(body.clone()),
                };
            }

            let response = builder.send().await?;
            Ok(from_reqwest(response))
        })
    }
}

fn from_reqwest(response: reqwest::Response) -> Response {
    let status = response.status();
    let headers = response.headers().clone();
    let url = response.url().clone();
    let stream = response.bytes_stream().map_err(Error::from).boxed();

    Response::from_stream(status, stream)
        .with_headers(headers)
        .with_url(url)
}

/// Transport built from a closure, see [`transport_fn`].
#[derive(Clone)]
pub struct FnTransport<F> {
    f: F,
}

impl<F> fmt::Debug for FnTransport<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransport").finish_non_exhaustive()
    }
}

/// Wraps an async closure as a [`Transport`].
///
/// ```
/// use kite_http::{transport_fn, Response};
/// use http::StatusCode;
///
/// let transport = transport_fn(|_request| async { Ok(Response::new(StatusCode::NO_CONTENT)) });
/// # let _ = transport;
/// ```
pub fn transport_fn<F, Fut>(f: F) -> FnTransport<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    FnTransport { f }
}

impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response>> {
        Box::pin((self.f)(request))
    }
}
