use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use http::StatusCode;

use crate::{Response, Result};

const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// In-flight reports stay strictly below completion; only the end of the
/// stream reports `1.0`.
const MAX_IN_FLIGHT_PERCENT: f64 = 1.0 - f64::EPSILON;

/// Transfer progress snapshot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Progress {
    /// Fraction in `[0, 1]`; `0` while the total is unknown.
    pub percent: f64,
    pub transferred_bytes: u64,
    /// From `content-length` (or the request body length), `0` if unknown.
    pub total_bytes: u64,
}

/// Progress callback: receives the snapshot and the chunk just transferred.
pub type ProgressCallback = Arc<dyn Fn(Progress, &[u8]) + Send + Sync>;

struct ProgressStream<S> {
    inner: S,
    transferred: u64,
    total: u64,
    callback: ProgressCallback,
    finished: bool,
}

impl<S> ProgressStream<S> {
    fn new(inner: S, total: u64, callback: ProgressCallback) -> Self {
        Self {
            inner,
            transferred: 0,
            total,
            callback,
            finished: false,
        }
    }

    fn snapshot(&self) -> Progress {
        let percent = if self.total == 0 {
            0.0
        } else {
            (self.transferred as f64 / self.total as f64).min(MAX_IN_FLIGHT_PERCENT)
        };
        Progress {
            percent,
            transferred_bytes: self.transferred,
            total_bytes: self.total.max(self.transferred),
        }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.transferred += chunk.len() as u64;
                let progress = self.snapshot();
                (self.callback)(progress, &chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                let done = Progress {
                    percent: 1.0,
                    transferred_bytes: self.transferred,
                    total_bytes: self.total.max(self.transferred),
                };
                (self.callback)(done, &[]);
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

/// Replaces the response body with one that reports download progress.
///
/// A 204 response reports completion once, with an empty chunk, and gets an
/// empty body.
pub(crate) fn track_download(response: Response, callback: &ProgressCallback) -> Result<Response> {
    let total = response.content_length().unwrap_or(0);

    if response.status() == StatusCode::NO_CONTENT {
        callback(
            Progress {
                percent: 1.0,
                transferred_bytes: 0,
                total_bytes: total,
            },
            &[],
        );
        return Ok(response.with_body(Bytes::new()));
    }

    let body = response.body_stream()?;
    let tracked = ProgressStream::new(body, total, Arc::clone(callback)).boxed();
    Ok(response.with_stream(tracked))
}

/// Splits a request body into chunks that report upload progress as the
/// transport pulls them.
pub(crate) fn upload_stream(
    body: Bytes,
    callback: ProgressCallback,
) -> impl Stream<Item = std::result::Result<Bytes, io::Error>> + Send + Sync + 'static {
    let total = body.len() as u64;
    let chunks: Vec<Result<Bytes>> = (0..body.len())
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(|start| Ok(body.slice(start..(start + UPLOAD_CHUNK_SIZE).min(body.len()))))
        .collect();

    ProgressStream::new(stream::iter(chunks), total, callback)
        .map(|chunk| chunk.map_err(io::Error::other))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use futures::{stream, StreamExt};
    use http::{header, HeaderValue, StatusCode};
    use parking_lot::Mutex;

    use super::{track_download, upload_stream, Progress, ProgressCallback};
    use crate::Response;

    fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<(Progress, usize)>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: ProgressCallback = Arc::new(move |progress, chunk: &[u8]| {
            sink.lock().push((progress, chunk.len()));
        });
        (callback, events)
    }

    fn chunked(status: StatusCode, chunks: &[&'static str], length: Option<&'static str>) -> Response {
        let body = stream::iter(
            chunks
                .iter()
                .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
                .collect::<Vec<_>>(),
        )
        .boxed();
        let response = Response::from_stream(status, body);
        match length {
            Some(length) => {
                response.with_header(header::CONTENT_LENGTH, HeaderValue::from_static(length))
            }
            None => response,
        }
    }

    #[tokio::test]
    async fn reports_every_chunk_then_completion() {
        let (callback, events) = recorder();
        let response = chunked(StatusCode::OK, &["abcd", "efgh"], Some("8"));

        let tracked = track_download(response, &callback).expect("body available");
        let text = tracked.text().await.expect("body readable");

        assert_eq!(text, "abcdefgh");
        let events = events.lock();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].0.percent, 0.5);
        assert_eq!(events[0].0.transferred_bytes, 4);
        assert_eq!(events[0].1, 4);
        assert!(events[1].0.percent < 1.0);
        assert_eq!(events[1].0.transferred_bytes, 8);
        assert_eq!(events[2].0.percent, 1.0);
        assert_eq!(events[2].1, 0);
    }

    #[tokio::test]
    async fn unknown_length_reports_zero_until_done() {
        let (callback, events) = recorder();
        let response = chunked(StatusCode::OK, &["abc"], None);

        let tracked = track_download(response, &callback).expect("body available");
        tracked.bytes().await.expect("body readable");

        let events = events.lock();
        assert_eq!(events[0].0.percent, 0.0);
        assert_eq!(events[0].0.total_bytes, 3);
        assert_eq!(events.last().map(|e| e.0.percent), Some(1.0));
    }

    #[tokio::test]
    async fn understated_length_never_reports_complete_early() {
        let (callback, events) = recorder();
        let response = chunked(StatusCode::OK, &["abcdef", "gh"], Some("4"));

        let tracked = track_download(response, &callback).expect("body available");
        tracked.bytes().await.expect("body readable");

        let events = events.lock();
        assert!(events[..2].iter().all(|(progress, _)| progress.percent < 1.0));
        assert_eq!(events[2].0.total_bytes, 8);
    }

    #[tokio::test]
    async fn no_content_reports_single_completion() {
        let (callback, events) = recorder();
        let response = Response::new(StatusCode::NO_CONTENT);

        let tracked = track_download(response, &callback).expect("no body needed");

        assert_eq!(
            events.lock().as_slice(),
            &[(
                Progress {
                    percent: 1.0,
                    transferred_bytes: 0,
                    total_bytes: 0
                },
                0
            )]
        );
        assert!(tracked.bytes().await.expect("empty body").is_empty());
    }

    #[tokio::test]
    async fn upload_stream_chunks_large_bodies() {
        let (callback, events) = recorder();
        let body = Bytes::from(vec![7u8; 150 * 1024]);

        let chunks: Vec<Bytes> = upload_stream(body, callback)
            .map(|chunk| chunk.expect("infallible chunk"))
            .collect()
            .await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(Bytes::len).sum::<usize>(), 150 * 1024);
        let events = events.lock();
        assert_eq!(events.len(), 4);
        assert_eq!(events[3].0.percent, 1.0);
        assert_eq!(events[3].0.total_bytes, 150 * 1024);
    }
}
