//! `kite-http` is an async HTTP request wrapper built on a pluggable fetch
//! transport (`reqwest` by default).
//!
//! Each call is one logical exchange that may span several attempts:
//! - per-attempt timeouts and caller cancellation through [`CancellationToken`]
//! - retries with exponential backoff and `Retry-After`/rate-limit headers
//! - lifecycle [`Hooks`] that can replace requests, responses and errors
//! - body shortcuts ([`ResponseFuture::json`], [`ResponseFuture::text`], ...)
//! - instances with layered defaults ([`Client::create`], [`Client::extend`])
//!
//! ```no_run
//! use kite_http::{Client, Options};
//!
//! # async fn run() -> kite_http::Result<()> {
//! let api = Client::create(
//!     Options::new()
//!         .prefix_url("https://api.example.com/v1")
//!         .header("authorization", "Bearer token"),
//! );
//!
//! let created: Option<serde_json::Value> = api
//!     .post("todos")
//!     .json_body(serde_json::json!({ "title": "write docs" }))
//!     .json()
//!     .await?;
//! # let _ = created;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod hooks;
mod normalize;
mod options;
mod progress;
mod request;
mod response;
mod retry;
mod timeout;
mod transport;

pub use client::{delete, fetch, get, head, patch, post, put, Client, ResponseFuture};
pub use error::{BoxError, Error, HttpError, TimeoutError};
pub use hooks::{HookAction, Hooks, RetryContext};
pub use normalize::NormalizedOptions;
pub use options::{JsonParser, JsonStringifier, Options, Timeout};
pub use progress::{Progress, ProgressCallback};
pub use request::{Input, Request, SearchParams};
pub use response::{Blob, Response};
pub use retry::{default_delay, DelayFn, RetryOption, RetryOptions, RetryPolicy, ShouldRetryFn};
pub use transport::{transport_fn, FnTransport, ReqwestTransport, Transport};

pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, Error>;
