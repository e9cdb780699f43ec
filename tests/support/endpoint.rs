#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;

/// One request as the endpoint received it.
#[derive(Debug, Clone)]
pub struct Captured {
    pub body: Vec<u8>,
    pub signature: Option<String>,
    pub event: Option<String>,
    pub content_type: Option<String>,
}

impl Captured {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

struct Inner {
    fail_first: usize,
    failure_status: StatusCode,
    hits: AtomicUsize,
    requests: Mutex<Vec<Captured>>,
}

/// A local webhook receiver on `127.0.0.1:0`.
///
/// Answers the first `fail_first` requests with `failure_status` and every
/// later one with 200.
#[derive(Clone)]
pub struct Endpoint {
    pub url: String,
    inner: Arc<Inner>,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn receive(
    State(inner): State<Arc<Inner>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    inner.requests.lock().unwrap().push(Captured {
        body: body.to_vec(),
        signature: header(&headers, "x-webhook-signature"),
        event: header(&headers, "x-webhook-event"),
        content_type: header(&headers, "content-type"),
    });
    let hit = inner.hits.fetch_add(1, Ordering::SeqCst);
    if hit < inner.fail_first {
        (inner.failure_status, format!("failure {}", hit + 1))
    } else {
        (StatusCode::OK, "accepted".to_string())
    }
}

impl Endpoint {
    pub async fn start() -> Self {
        Self::failing_first(0, 500).await
    }

    pub async fn always_failing(status: u16) -> Self {
        Self::failing_first(usize::MAX, status).await
    }

    pub async fn failing_first(fail_first: usize, status: u16) -> Self {
        let inner = Arc::new(Inner {
            fail_first,
            failure_status: StatusCode::from_u16(status).unwrap(),
            hits: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/hook", post(receive))
            .with_state(inner.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}/hook"),
            inner,
        }
    }

    /// An address nothing listens on.
    pub fn unreachable() -> String {
        "http://127.0.0.1:9/hook".to_string()
    }

    pub fn hits(&self) -> usize {
        self.inner.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Captured> {
        self.inner.requests.lock().unwrap().clone()
    }
}
