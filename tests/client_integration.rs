use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use axum::{
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response as AxumResponse},
    Json, Router,
};
use kite_http::{Client, Error, Hooks, HookAction, Options, RetryOptions};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

#[derive(Clone)]
enum MockBody {
    Json(JsonValue),
    Text(&'static str),
    Echo,
    Empty,
}

#[derive(Clone)]
struct MockResponse {
    status: StatusCode,
    headers: Vec<(&'static str, String)>,
    body: MockBody,
    delay: Duration,
}

impl MockResponse {
    fn new(status: StatusCode, body: MockBody) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
            delay: Duration::from_millis(0),
        }
    }

    fn json(status: StatusCode, body: JsonValue) -> Self {
        Self::new(status, MockBody::Json(body))
    }

    fn echo() -> Self {
        Self::new(StatusCode::OK, MockBody::Echo)
    }

    fn status(status: StatusCode) -> Self {
        Self::new(status, MockBody::Empty)
    }

    fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone)]
struct MockState {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    hits: Arc<AtomicUsize>,
}

/// What the server saw, as returned by [`MockBody::Echo`].
#[derive(Debug, Deserialize)]
struct Echo {
    method: String,
    path: String,
    query: Option<String>,
    content_type: Option<String>,
    accept: Option<String>,
    body: String,
}

async fn mock_handler(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> AxumResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);

    let response = {
        let mut queue = state
            .responses
            .lock()
            .expect("response queue mutex must not be poisoned");
        queue.pop_front().unwrap_or_else(|| {
            MockResponse::json(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "no mock response available"}),
            )
        })
    };

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    let header_text = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };

    let mut reply = match response.body {
        MockBody::Json(value) => (response.status, Json(value)).into_response(),
        MockBody::Text(text) => (response.status, text).into_response(),
        MockBody::Empty => response.status.into_response(),
        MockBody::Echo => (
            response.status,
            Json(json!({
                "method": method.as_str(),
                "path": uri.path(),
                "query": uri.query(),
                "content_type": header_text("content-type"),
                "accept": header_text("accept"),
                "body": body,
            })),
        )
            .into_response(),
    };
    for (name, value) in response.headers {
        if let Ok(value) = value.parse() {
            reply.headers_mut().insert(name, value);
        }
    }
    reply
}

struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn spawn_server(responses: Vec<MockResponse>) -> TestServer {
    let state = MockState {
        responses: Arc::new(Mutex::new(responses.into())),
        hits: Arc::new(AtomicUsize::new(0)),
    };

    let app = Router::new()
        .fallback(mock_handler)
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        hits: state.hits,
        task,
    }
}

fn fast_retry(limit: u32) -> RetryOptions {
    RetryOptions::new()
        .limit(limit)
        .delay(|_| Duration::from_millis(10))
}

#[tokio::test]
async fn json_body_round_trips_through_server() -> anyhow::Result<()> {
    let server = spawn_server(vec![MockResponse::echo()]).await;
    let client = Client::new();

    let echo: Echo = client
        .post(server.url("/todos"))
        .json_body(json!({"title": "ship it"}))
        .json()
        .await?
        .expect("echo body");

    assert_eq!(echo.method, "POST");
    assert_eq!(echo.path, "/todos");
    assert_eq!(echo.body, r#"{"title":"ship it"}"#);
    assert_eq!(echo.content_type.as_deref(), Some("application/json"));
    assert_eq!(echo.accept.as_deref(), Some("application/json"));
    assert_eq!(server.hits(), 1);
    Ok(())
}

#[tokio::test]
async fn no_content_json_resolves_to_none() -> anyhow::Result<()> {
    let server = spawn_server(vec![MockResponse::status(StatusCode::NO_CONTENT)]).await;

    let value: Option<JsonValue> = Client::new().delete(server.url("/todos/1")).json().await?;

    assert!(value.is_none());
    Ok(())
}

#[tokio::test]
async fn request_timeout_status_is_retried_up_to_limit() {
    let server = spawn_server(vec![
        MockResponse::status(StatusCode::REQUEST_TIMEOUT);
        4
    ])
    .await;
    let client = Client::create(Options::new().retry(fast_retry(3)));

    let err = client
        .get(server.url("/flaky"))
        .await
        .expect_err("408 must exhaust retries");

    assert_eq!(server.hits(), 4);
    match &err {
        Error::Http(http) => {
            assert_eq!(http.response().status(), StatusCode::REQUEST_TIMEOUT);
            assert!(http.to_string().contains("Request Timeout"));
        }
        other => panic!("expected http error, got {other:?}"),
    }
}

#[tokio::test]
async fn payload_too_large_honours_retry_after() {
    let server = spawn_server(vec![
        MockResponse::status(StatusCode::PAYLOAD_TOO_LARGE).with_header("retry-after", "2"),
        MockResponse::new(StatusCode::OK, MockBody::Text("done")),
    ])
    .await;

    let started = Instant::now();
    let text = Client::new()
        .get(server.url("/upload-slot"))
        .text()
        .await
        .expect("second attempt succeeds");

    assert_eq!(text.as_deref(), Some("done"));
    assert!(started.elapsed() >= Duration::from_millis(2_000));
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn slow_endpoint_times_out_after_one_attempt() {
    let server = spawn_server(vec![
        MockResponse::status(StatusCode::OK).with_delay(Duration::from_millis(1_000)),
    ])
    .await;
    let client = Client::create(Options::new().timeout(500));

    let started = Instant::now();
    let err = client
        .get(server.url("/slow"))
        .await
        .expect_err("must time out");

    assert!(err.is_timeout(), "unexpected error: {err:?}");
    assert!(started.elapsed() < Duration::from_millis(1_000));
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn search_params_replace_query_and_keep_repeated_keys() -> anyhow::Result<()> {
    let server = spawn_server(vec![MockResponse::echo()]).await;

    let echo: Echo = Client::new()
        .get(server.url("/search?stale=1"))
        .search_params([("tag", "rust"), ("tag", "http"), ("q", "a b")])
        .json()
        .await?
        .expect("echo body");

    assert_eq!(echo.query.as_deref(), Some("tag=rust&tag=http&q=a+b"));
    Ok(())
}

#[tokio::test]
async fn prefix_url_and_extended_defaults_are_applied() -> anyhow::Result<()> {
    let server = spawn_server(vec![MockResponse::echo()]).await;
    let api = Client::create(Options::new().prefix_url(server.url("/api/")))
        .extend(Options::new().header("accept", "application/vnd.kite+json"));

    let echo: Echo = api.get("users/7").json().await?.expect("echo body");

    assert_eq!(echo.path, "/api/users/7");
    assert_eq!(echo.accept.as_deref(), Some("application/vnd.kite+json"));
    Ok(())
}

#[tokio::test]
async fn http_error_keeps_response_body_readable() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::UNPROCESSABLE_ENTITY,
        json!({"error": "title is required"}),
    )])
    .await;

    let err = Client::new()
        .post(server.url("/todos"))
        .json_body(json!({}))
        .await
        .expect_err("422 must fail");

    let response = match err {
        Error::Http(http) => http.into_response(),
        other => panic!("expected http error, got {other:?}"),
    };
    let body: Option<JsonValue> = response.json().await.expect("error body is json");
    assert_eq!(body, Some(json!({"error": "title is required"})));
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn disabled_http_errors_resolve_with_the_response() -> anyhow::Result<()> {
    let server = spawn_server(vec![MockResponse::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        MockBody::Text("boom"),
    )])
    .await;
    let client = Client::create(
        Options::new()
            .throw_http_errors(false)
            .retry(fast_retry(2)),
    );

    let response = client
        .get(server.url("/broken"))
        .await?
        .expect("not stopped");

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.text().await?, "boom");
    assert_eq!(server.hits(), 1);
    Ok(())
}

#[tokio::test]
async fn before_retry_stop_resolves_without_result() {
    let server = spawn_server(vec![MockResponse::status(StatusCode::SERVICE_UNAVAILABLE)]).await;
    let client = Client::create(
        Options::new()
            .retry(fast_retry(5))
            .hooks(Hooks::new().before_retry(|_| async { Ok(HookAction::Stop) })),
    );

    let result = client
        .get(server.url("/maintenance"))
        .json::<JsonValue>()
        .await
        .expect("stop is not an error");

    assert!(result.is_none());
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn upload_progress_reports_completion() -> anyhow::Result<()> {
    let server = spawn_server(vec![MockResponse::echo()]).await;
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let payload = "x".repeat(200 * 1024);

    let echo: Echo = Client::new()
        .fetch(
            server.url("/upload"),
            Options::new()
                .method("post")
                .body(payload.clone())
                .on_upload_progress(move |progress, _| {
                    sink.lock()
                        .expect("progress mutex must not be poisoned")
                        .push(progress)
                }),
        )
        .json()
        .await?
        .expect("echo body");

    assert_eq!(echo.body.len(), payload.len());
    let events = events.lock().expect("progress mutex must not be poisoned");
    let last = events.last().expect("at least one progress event");
    assert_eq!(last.percent, 1.0);
    assert_eq!(last.transferred_bytes, payload.len() as u64);
    assert!(events.len() >= 4);
    Ok(())
}
