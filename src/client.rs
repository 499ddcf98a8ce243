use std::fmt;
use std::future::IntoFuture;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::Method;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::{
    hooks::{self, BeforeRequestOutcome, RetryStep},
    normalize::normalize,
    progress,
    request::build_request,
    retry::{self, AttemptState, RetryDecision},
    timeout::fetch_with_timeout,
    Blob, Error, HttpError, Input, NormalizedOptions, Options, Request, ReqwestTransport,
    Response, Result, RetryOption, SearchParams, Timeout, Transport,
};

const ACCEPT_JSON: &str = "application/json";
const ACCEPT_TEXT: &str = "text/*";
const ACCEPT_FORM_DATA: &str = "multipart/form-data";
const ACCEPT_ANY: &str = "*/*";

/// HTTP client instance holding default options.
///
/// Instances are immutable. [`Client::extend`] derives a child whose defaults
/// are the parent's merged with new ones; the parent is left untouched.
#[derive(Clone)]
pub struct Client {
    defaults: Arc<Options>,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Creates a client with default options and the `reqwest` transport.
    pub fn new() -> Self {
        Self::create(Options::default())
    }

    /// Creates a client with the given defaults.
    pub fn create(defaults: Options) -> Self {
        Self {
            defaults: Arc::new(defaults),
            transport: Arc::new(ReqwestTransport::new()),
        }
    }

    /// Creates a client from environment variables, see [`Options::from_env`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use kite_http::Client;
    ///
    /// let api = Client::from_env().expect("invalid KITE_* env vars");
    /// ```
    pub fn from_env() -> Result<Self> {
        Ok(Self::create(Options::from_env()?))
    }

    /// Derives a client whose defaults are this client's merged with `options`.
    ///
    /// Hooks and header patches are appended, so the parent's entries run
    /// first.
    pub fn extend(&self, options: Options) -> Client {
        Client {
            defaults: Arc::new(self.defaults.as_ref().clone().merge(options)),
            transport: Arc::clone(&self.transport),
        }
    }

    /// Like [`Client::extend`], computing the new options from the current
    /// defaults.
    pub fn extend_with<F>(&self, build: F) -> Client
    where
        F: FnOnce(&Options) -> Options,
    {
        let options = build(&self.defaults);
        self.extend(options)
    }

    pub fn defaults(&self) -> &Options {
        &self.defaults
    }

    /// Starts a call. Nothing is sent until the returned future is awaited.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use kite_http::{Client, Options};
    ///
    /// # async fn run() -> kite_http::Result<()> {
    /// let api = Client::create(Options::new().prefix_url("https://api.example.com/v1"));
    /// let user: Option<serde_json::Value> = api
    ///     .fetch("users/1", Options::new().retry(3))
    ///     .json()
    ///     .await?;
    /// # let _ = user;
    /// # Ok(())
    /// # }
    /// ```
    pub fn fetch(&self, input: impl Into<Input>, options: Options) -> ResponseFuture {
        ResponseFuture {
            client: self.clone(),
            input: input.into(),
            options,
        }
    }

    pub fn request(&self, method: Method, input: impl Into<Input>) -> ResponseFuture {
        self.fetch(input, Options::new().method(method.as_str()))
    }

    pub fn get(&self, input: impl Into<Input>) -> ResponseFuture {
        self.request(Method::GET, input)
    }

    pub fn post(&self, input: impl Into<Input>) -> ResponseFuture {
        self.request(Method::POST, input)
    }

    pub fn put(&self, input: impl Into<Input>) -> ResponseFuture {
        self.request(Method::PUT, input)
    }

    pub fn patch(&self, input: impl Into<Input>) -> ResponseFuture {
        self.request(Method::PATCH, input)
    }

    pub fn head(&self, input: impl Into<Input>) -> ResponseFuture {
        self.request(Method::HEAD, input)
    }

    pub fn delete(&self, input: impl Into<Input>) -> ResponseFuture {
        self.request(Method::DELETE, input)
    }

    /// Runs one logical call: the attempt loop with hooks, timeouts and
    /// retries. `Ok(None)` means a before-retry hook stopped the call.
    async fn execute(
        &self,
        input: Input,
        options: Options,
        accept: Option<&'static str>,
    ) -> Result<Option<Response>> {
        let merged = self.defaults.as_ref().clone().merge(options);
        let (input, normalized) = normalize(input, merged, &self.transport)?;
        let options = Arc::new(normalized);

        let mut request = build_request(input, &options, accept)?;
        let call_signal = request.signal().clone();
        let retriable = options.retry.allows_method(request.method());
        let mut state = AttemptState::default();

        loop {
            let attempt = request.clone().with_signal(call_signal.child_token());
            let error = match Self::attempt(attempt, &options).await {
                Ok(response) => return Self::finish(response, &options).map(Some),
                Err(error) => error,
            };

            let decision = if retriable {
                options.retry.evaluate(&mut state, &error)
            } else {
                RetryDecision::GiveUp
            };
            let delay = match decision {
                RetryDecision::Retry(delay) => delay,
                RetryDecision::GiveUp => return Err(Self::fail(error, &options).await),
            };

            #[cfg(feature = "tracing")]
            tracing::debug!(
                method = %request.method(),
                url = %request.url(),
                retry_count = state.retry_count(),
                delay_ms = delay.as_millis() as u64,
                status = ?error.status(),
                "retrying request"
            );

            if let Err(err) = retry::wait(delay, &call_signal).await {
                #[cfg(feature = "tracing")]
                tracing::debug!(url = %request.url(), "request cancelled during retry delay");
                return Err(err);
            }

            match hooks::run_before_retry(
                &options.hooks,
                request.clone(),
                &options,
                error,
                state.retry_count(),
            )
            .await?
            {
                RetryStep::Continue(next) => request = next.with_signal(call_signal.clone()),
                RetryStep::Stop => return Ok(None),
            }
        }
    }

    /// One attempt: before-request hooks, the guarded transport call,
    /// after-response hooks and the HTTP status check.
    async fn attempt(request: Request, options: &Arc<NormalizedOptions>) -> Result<Response> {
        let signal = request.signal().clone();
        let (request, response) =
            match hooks::run_before_request(&options.hooks, request, options).await? {
                BeforeRequestOutcome::Respond(request, response) => (request, response),
                BeforeRequestOutcome::Send(request) => {
                    let request = request.with_signal(signal);
                    let response = fetch_with_timeout(
                        options.transport.as_ref(),
                        request.clone(),
                        options.timeout,
                    )
                    .await?;
                    (request, response)
                }
            };

        let response = response.decorate(options.parse_json.as_ref());
        let response = hooks::run_after_response(&options.hooks, &request, options, response)
            .await?
            .decorate(options.parse_json.as_ref());

        if options.throw_http_errors && !response.ok() {
            return Err(Error::Http(Box::new(HttpError::new(
                request,
                response,
                Arc::clone(options),
            ))));
        }
        Ok(response)
    }

    fn finish(response: Response, options: &NormalizedOptions) -> Result<Response> {
        match &options.on_download_progress {
            Some(callback) => progress::track_download(response, callback),
            None => Ok(response),
        }
    }

    /// Final error of a call. HTTP errors pass through the error-transform
    /// hooks once.
    async fn fail(error: Error, options: &NormalizedOptions) -> Error {
        if error.is_http() {
            hooks::run_before_error(&options.hooks, error).await
        } else {
            error
        }
    }
}

/// A pending call.
///
/// Await it for the [`Response`], or use a body shortcut such as
/// [`ResponseFuture::json`], which also sets a matching `Accept` header.
#[must_use = "requests do nothing unless awaited"]
pub struct ResponseFuture {
    client: Client,
    input: Input,
    options: Options,
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("input", &self.input)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ResponseFuture {
    /// Layers more per-call options on top of the current ones.
    pub fn with(mut self, options: Options) -> Self {
        self.options = self.options.merge(options);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options = self.options.header(name, value);
        self
    }

    pub fn json_body(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.options = self.options.json(value);
        self
    }

    pub fn search_params(mut self, params: impl Into<SearchParams>) -> Self {
        self.options = self.options.search_params(params);
        self
    }

    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.options = self.options.timeout(timeout);
        self
    }

    pub fn retry(mut self, retry: impl Into<RetryOption>) -> Self {
        self.options = self.options.retry(retry);
        self
    }

    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.options = self.options.signal(signal);
        self
    }

    /// Sends the request. `Ok(None)` means a before-retry hook stopped the call.
    pub async fn send(self) -> Result<Option<Response>> {
        self.send_accepting(None).await
    }

    async fn send_accepting(self, accept: Option<&'static str>) -> Result<Option<Response>> {
        let Self {
            client,
            input,
            options,
        } = self;
        client.execute(input, options, accept).await
    }

    /// Sends with `Accept: application/json` and parses the body.
    /// `None` for a stopped call, a 204, or an empty body.
    pub async fn json<T: DeserializeOwned>(self) -> Result<Option<T>> {
        match self.send_accepting(Some(ACCEPT_JSON)).await? {
            Some(response) => response.json().await,
            None => Ok(None),
        }
    }

    pub async fn text(self) -> Result<Option<String>> {
        match self.send_accepting(Some(ACCEPT_TEXT)).await? {
            Some(response) => response.text().await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn bytes(self) -> Result<Option<Bytes>> {
        match self.send_accepting(Some(ACCEPT_ANY)).await? {
            Some(response) => response.bytes().await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn array_buffer(self) -> Result<Option<Vec<u8>>> {
        match self.send_accepting(Some(ACCEPT_ANY)).await? {
            Some(response) => response.array_buffer().await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn blob(self) -> Result<Option<Blob>> {
        match self.send_accepting(Some(ACCEPT_ANY)).await? {
            Some(response) => response.blob().await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn form_data(self) -> Result<Option<Vec<(String, String)>>> {
        match self.send_accepting(Some(ACCEPT_FORM_DATA)).await? {
            Some(response) => response.form_data().await.map(Some),
            None => Ok(None),
        }
    }
}

impl IntoFuture for ResponseFuture {
    type Output = Result<Option<Response>>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.send())
    }
}

fn default_client() -> &'static Client {
    static DEFAULT: OnceLock<Client> = OnceLock::new();
    DEFAULT.get_or_init(Client::new)
}

/// Starts a call on the shared default client.
pub fn fetch(input: impl Into<Input>, options: Options) -> ResponseFuture {
    default_client().fetch(input, options)
}

/// `GET` on the shared default client.
pub fn get(input: impl Into<Input>) -> ResponseFuture {
    default_client().get(input)
}

/// `POST` on the shared default client.
pub fn post(input: impl Into<Input>) -> ResponseFuture {
    default_client().post(input)
}

/// `PUT` on the shared default client.
pub fn put(input: impl Into<Input>) -> ResponseFuture {
    default_client().put(input)
}

/// `PATCH` on the shared default client.
pub fn patch(input: impl Into<Input>) -> ResponseFuture {
    default_client().patch(input)
}

/// `HEAD` on the shared default client.
pub fn head(input: impl Into<Input>) -> ResponseFuture {
    default_client().head(input)
}

/// `DELETE` on the shared default client.
pub fn delete(input: impl Into<Input>) -> ResponseFuture {
    default_client().delete(input)
}
