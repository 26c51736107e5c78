//! Local stand-in for an InfluxDB `/write` endpoint.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::Uri;
use axum::routing::post;
use axum::Router;
use execflux::point::PointFactory;
use execflux::point::TagSet;
use execflux::publisher::Endpoint;
use tokio::task::JoinHandle;

/// One request as seen by the server.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub uri: String,
    pub content_type: Option<String>,
    pub body: String,
}

struct MockState {
    /// Status per attempt; the last one repeats.
    script: Vec<StatusCode>,
    requests: Mutex<Vec<Recorded>>,
}

pub struct MockInflux {
    pub addr: SocketAddr,
    state: Arc<MockState>,
    handle: JoinHandle<()>,
}

async fn write(
    State(state): State<Arc<MockState>>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let mut requests = state.requests.lock().unwrap();
    let status = state
        .script
        .get(requests.len())
        .or(state.script.last())
        .copied()
        .unwrap_or(StatusCode::NO_CONTENT);
    requests.push(Recorded {
        uri: uri.to_string(),
        content_type: headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });
    status
}

impl MockInflux {
    /// Starts a server answering every write with `status`.
    pub async fn start(status: StatusCode) -> Self {
        Self::with_script(vec![status]).await
    }

    /// Starts a server answering the n-th write with `script[n]`.
    pub async fn with_script(script: Vec<StatusCode>) -> Self {
        let state = Arc::new(MockState {
            script,
            requests: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/write", post(write))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from_parts(Some(self.url().as_str()), Some("test"), None, None).unwrap()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }
}

impl Drop for MockInflux {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn factory() -> PointFactory {
    PointFactory::new("events", "test-host", &TagSet::parse("env=ci").unwrap()).unwrap()
}
