//! In-memory implementation of the test backend wire protocol.
//!
//! - `HEAD /files/<path>` → `200` with `Size: <int>`, or `404`.
//! - `GET /files/<path>` → `200 <bytes>`, or `404`.
//! - `POST /files/<path>` → `200`, body stored.
//! - `GET /list/<prefix>` → `200 ["<path>", ...]` (recursive, JSON).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::task::JoinHandle;

#[derive(Default)]
struct ServerState {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl ServerState {
    fn lock_files(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A test backend bound to an ephemeral localhost port; shuts down when
/// dropped.
pub struct TestBackendServer {
    address: SocketAddr,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl TestBackendServer {
    /// Bind to `127.0.0.1:0` and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot be bound.
    pub async fn start() -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route("/files/{*path}", get(get_file).post(post_file))
            .route("/list/{*prefix}", get(list_files))
            .with_state(Arc::clone(&state));
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self {
            address,
            state,
            task,
        })
    }

    /// The server's `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        self.address.to_string()
    }

    /// Seed a blob directly, bypassing HTTP.
    pub fn insert(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.state.lock_files().insert(path.into(), bytes.into());
    }

    /// Read a stored blob back, bypassing HTTP.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock_files().get(path).cloned()
    }
}

impl Drop for TestBackendServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn get_file(
    State(state): State<Arc<ServerState>>,
    method: Method,
    Path(path): Path<String>,
) -> Response {
    let Some(bytes) = state.lock_files().get(&path).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let size = [("Size", bytes.len().to_string())];
    if method == Method::HEAD {
        (StatusCode::OK, size).into_response()
    } else {
        (StatusCode::OK, size, bytes).into_response()
    }
}

async fn post_file(
    State(state): State<Arc<ServerState>>,
    Path(path): Path<String>,
    body: Bytes,
) -> StatusCode {
    state.lock_files().insert(path, body.to_vec());
    StatusCode::OK
}

async fn list_files(
    State(state): State<Arc<ServerState>>,
    Path(prefix): Path<String>,
) -> Response {
    let names: Vec<String> = state
        .lock_files()
        .keys()
        .filter(|name| name.starts_with(&prefix))
        .cloned()
        .collect();
    if names.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }
    axum::Json(names).into_response()
}
