//! Lifecycle hooks.
//!
//! Each stage runs its hooks one at a time in registration order, awaiting
//! each before the next starts. A hook reports what it wants through a
//! [`HookAction`]; a single dispatcher per stage interprets it.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{future::BoxFuture, FutureExt};

use crate::{Error, NormalizedOptions, Request, Response, Result};

/// Outcome of a hook invocation.
#[derive(Debug)]
pub enum HookAction {
    /// Keep going with the current request/response.
    Continue,
    /// Use this request from now on.
    Request(Request),
    /// Use this response. In a before-request hook this skips the transport.
    Response(Response),
    /// Settle the call with no result. Only valid in before-retry hooks.
    Stop,
}

impl HookAction {
    fn name(&self) -> &'static str {
        match self {
            Self::Continue => "Continue",
            Self::Request(_) => "Request",
            Self::Response(_) => "Response",
            Self::Stop => "Stop",
        }
    }
}

/// State handed to before-retry hooks.
#[derive(Debug)]
pub struct RetryContext {
    pub request: Request,
    pub options: Arc<NormalizedOptions>,
    /// The failure that triggered this retry.
    pub error: Arc<Error>,
    /// Starts at 1 for the first retry.
    pub retry_count: u32,
}

type BeforeRequestHook =
    dyn Fn(Request, Arc<NormalizedOptions>) -> BoxFuture<'static, Result<HookAction>> + Send + Sync;
type BeforeRetryHook = dyn Fn(RetryContext) -> BoxFuture<'static, Result<HookAction>> + Send + Sync;
type AfterResponseHook = dyn Fn(Request, Arc<NormalizedOptions>, Response) -> BoxFuture<'static, Result<HookAction>>
    + Send
    + Sync;
type BeforeErrorHook = dyn Fn(Error) -> BoxFuture<'static, Error> + Send + Sync;

/// Ordered hook lists for the four lifecycle stages.
#[derive(Clone, Default)]
pub struct Hooks {
    before_request: Vec<Arc<BeforeRequestHook>>,
    before_retry: Vec<Arc<BeforeRetryHook>>,
    after_response: Vec<Arc<AfterResponseHook>>,
    before_error: Vec<Arc<BeforeErrorHook>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before_request", &self.before_request.len())
            .field("before_retry", &self.before_retry.len())
            .field("after_response", &self.after_response.len())
            .field("before_error", &self.before_error.len())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs before every attempt. May replace the request, or answer with a
    /// response and skip the transport.
    pub fn before_request<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Request, Arc<NormalizedOptions>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HookAction>> + Send + 'static,
    {
        self.before_request
            .push(Arc::new(move |request, options| hook(request, options).boxed()));
        self
    }

    /// Runs after the retry delay, before the next attempt. Return
    /// [`HookAction::Stop`] to settle the call with no result.
    pub fn before_retry<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(RetryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HookAction>> + Send + 'static,
    {
        self.before_retry
            .push(Arc::new(move |context| hook(context).boxed()));
        self
    }

    /// Runs on every response, including ones produced by before-request
    /// hooks. Each hook gets its own buffered copy, so reading it leaves the
    /// caller's body intact. The last replacement wins.
    pub fn after_response<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Request, Arc<NormalizedOptions>, Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HookAction>> + Send + 'static,
    {
        self.after_response.push(Arc::new(move |request, options, response| {
            hook(request, options, response).boxed()
        }));
        self
    }

    /// Transforms the final HTTP error. Must return an error.
    pub fn before_error<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Error> + Send + 'static,
    {
        self.before_error
            .push(Arc::new(move |error| hook(error).boxed()));
        self
    }

    /// Appends `later`'s hooks after this registry's hooks.
    pub fn merge(mut self, later: Hooks) -> Hooks {
        self.before_request.extend(later.before_request);
        self.before_retry.extend(later.before_retry);
        self.after_response.extend(later.after_response);
        self.before_error.extend(later.before_error);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.before_request.is_empty()
            && self.before_retry.is_empty()
            && self.after_response.is_empty()
            && self.before_error.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn before_request_len(&self) -> usize {
        self.before_request.len()
    }
}

/// Invokes a hook, turning a panic (in the call or in its future) into
/// [`Error::NonError`].
async fn guarded<T>(call: impl FnOnce() -> BoxFuture<'static, T>) -> Result<T> {
    let future = std::panic::catch_unwind(AssertUnwindSafe(call)).map_err(non_error)?;
    AssertUnwindSafe(future).catch_unwind().await.map_err(non_error)
}

fn non_error(payload: Box<dyn Any + Send>) -> Error {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "hook panicked".to_owned()
    };
    Error::NonError(message)
}

fn misplaced(stage: &str, action: &HookAction) -> Error {
    Error::validation(format!(
        "{stage} hook returned HookAction::{}, which that stage does not accept",
        action.name()
    ))
}

pub(crate) enum BeforeRequestOutcome {
    Send(Request),
    Respond(Request, Response),
}

pub(crate) async fn run_before_request(
    hooks: &Hooks,
    mut request: Request,
    options: &Arc<NormalizedOptions>,
) -> Result<BeforeRequestOutcome> {
    for hook in &hooks.before_request {
        let current = request.clone();
        match guarded(|| hook(current, Arc::clone(options))).await?? {
            HookAction::Continue => {}
            HookAction::Request(replacement) => request = replacement,
            HookAction::Response(response) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    url = %request.url(),
                    status = response.status().as_u16(),
                    "before-request hook answered without calling the transport"
                );
                return Ok(BeforeRequestOutcome::Respond(request, response));
            }
            action @ HookAction::Stop => return Err(misplaced("before-request", &action)),
        }
    }
    Ok(BeforeRequestOutcome::Send(request))
}

pub(crate) enum RetryStep {
    Continue(Request),
    Stop,
}

pub(crate) async fn run_before_retry(
    hooks: &Hooks,
    mut request: Request,
    options: &Arc<NormalizedOptions>,
    error: Error,
    retry_count: u32,
) -> Result<RetryStep> {
    let error = Arc::new(error);
    for hook in &hooks.before_retry {
        let context = RetryContext {
            request: request.clone(),
            options: Arc::clone(options),
            error: Arc::clone(&error),
            retry_count,
        };
        match guarded(|| hook(context)).await?? {
            HookAction::Continue => {}
            HookAction::Request(replacement) => request = replacement,
            HookAction::Stop => {
                #[cfg(feature = "tracing")]
                tracing::debug!(url = %request.url(), retry_count, "before-retry hook stopped the call");
                return Ok(RetryStep::Stop);
            }
            action @ HookAction::Response(_) => return Err(misplaced("before-retry", &action)),
        }
    }
    Ok(RetryStep::Continue(request))
}

pub(crate) async fn run_after_response(
    hooks: &Hooks,
    request: &Request,
    options: &Arc<NormalizedOptions>,
    mut response: Response,
) -> Result<Response> {
    for hook in &hooks.after_response {
        let copy = response.clone_buffered().await?;
        match guarded(|| hook(request.clone(), Arc::clone(options), copy)).await?? {
            HookAction::Continue => {}
            HookAction::Response(replacement) => response = replacement,
            action => return Err(misplaced("after-response", &action)),
        }
    }
    Ok(response)
}

pub(crate) async fn run_before_error(hooks: &Hooks, mut error: Error) -> Error {
    for hook in &hooks.before_error {
        let current = error;
        error = guarded(|| hook(current)).await.unwrap_or_else(|raised| raised);
    }
    error
}
