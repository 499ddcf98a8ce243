use std::time::Duration;

use crate::{Error, Request, Response, Result, TimeoutError, Transport};

/// Runs exactly one transport call under an optional deadline.
///
/// When the deadline fires first the request's token is cancelled so the
/// transport can drop its work, and the call fails with [`Error::Timeout`].
/// Cancellation of the token by anyone else fails the call with
/// [`Error::Cancelled`].
pub(crate) async fn fetch_with_timeout(
    transport: &dyn Transport,
    request: Request,
    timeout: Option<Duration>,
) -> Result<Response> {
    let signal = request.signal().clone();
    let in_flight = transport.fetch(request.clone());
    let observed = signal.clone();
    let guarded = async move {
        tokio::select! {
            biased;
            () = observed.cancelled() => Err(Error::Cancelled),
            result = in_flight => result,
        }
    };

    let Some(limit) = timeout else {
        return guarded.await;
    };

    match tokio::time::timeout(limit, guarded).await {
        Ok(result) => result,
        Err(_) => {
            signal.cancel();
            #[cfg(feature = "tracing")]
            tracing::debug!(
                method = %request.method(),
                url = %request.url(),
                timeout_ms = limit.as_millis() as u64,
                "request attempt timed out"
            );
            Err(Error::Timeout(Box::new(TimeoutError::new(request))))
        }
    }
}
