//! Browser-room host.
//!
//! Serves an embedded harness page on `127.0.0.1` that loads the packaged
//! plugin and talks back over a WebSocket at `/bridge`. Only one page may
//! hold the bridge at a time; later connections get `409 Conflict`.

use crate::bridge::host::{LaunchRequest, RoomHandle, RoomHost};
use crate::config::LaunchSection;
use crate::errors::BridgeError;
use crate::room::Room;
use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    extract::{
        Path as UrlPath, State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use rust_embed::RustEmbed;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/assets/"]
struct Assets;

const HARNESS_PAGE: &str = "harness.html";

pub(crate) struct BrowserState {
    session_id: String,
    package_dir: PathBuf,
    connected: AtomicBool,
    to_room: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    from_room: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: CancellationToken,
    exited: CancellationToken,
}

impl BrowserState {
    /// State for one session plus the local end of its bridge.
    pub(crate) fn new(session_id: &str, package_dir: &Path) -> (Arc<Self>, RoomHandle) {
        let (to_room, from_local) = mpsc::unbounded_channel();
        let (to_local, from_room) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let exited = CancellationToken::new();

        let state = Arc::new(Self {
            session_id: session_id.to_string(),
            package_dir: package_dir.to_path_buf(),
            connected: AtomicBool::new(false),
            to_room: Mutex::new(Some(from_local)),
            from_room: to_local,
            shutdown: shutdown.clone(),
            exited: exited.clone(),
        });
        let handle = RoomHandle {
            room: Room::Browser,
            outgoing: to_room,
            incoming: from_room,
            shutdown,
            exited,
        };
        (state, handle)
    }
}

pub(crate) fn build_router(state: Arc<BrowserState>) -> Router {
    Router::new()
        .route("/", get(harness_handler))
        .route("/plugin/{*path}", get(plugin_handler))
        .route("/bridge", get(bridge_handler))
        .with_state(state)
}

async fn harness_handler(State(state): State<Arc<BrowserState>>) -> Response {
    match Assets::get(HARNESS_PAGE) {
        Some(content) => {
            let page = String::from_utf8_lossy(&content.data)
                .replace("{{session_id}}", &state.session_id);
            Html(page).into_response()
        }
        None => (StatusCode::NOT_FOUND, "Harness page not embedded").into_response(),
    }
}

fn is_safe_relative(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}

/// Serve a file from the package directory.
async fn plugin_handler(
    State(state): State<Arc<BrowserState>>,
    UrlPath(path): UrlPath<String>,
) -> Response {
    if path.is_empty() || !is_safe_relative(&path) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let file = state.package_dir.join(&path);
    match tokio::fs::read(&file).await {
        Ok(bytes) => {
            let mime = mime_guess::from_path(&file).first_or_octet_stream();
            (
                [(header::CONTENT_TYPE, mime.as_ref().to_string())],
                Body::from(bytes),
            )
                .into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn bridge_handler(
    State(state): State<Arc<BrowserState>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.connected.load(Ordering::SeqCst) {
        return (StatusCode::CONFLICT, "A page is already connected to this session").into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let to_room = state
        .to_room
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    let Some(to_room) = to_room else {
        return (StatusCode::CONFLICT, "A page is already connected to this session").into_response();
    };
    state.connected.store(true, Ordering::SeqCst);

    ws.on_upgrade(move |socket| run_bridge_socket(socket, state, to_room))
}

async fn run_bridge_socket(
    socket: WebSocket,
    state: Arc<BrowserState>,
    mut to_room: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    info!(session_id = %state.session_id, "browser room connected");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            frame = to_room.recv() => {
                let Some(frame) = frame else { break };
                let text = String::from_utf8_lossy(&frame).into_owned();
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if state.from_room.send(text.as_str().as_bytes().to_vec()).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "bridge socket error");
                        break;
                    }
                }
            }
            _ = state.shutdown.cancelled() => break,
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    info!(session_id = %state.session_id, "browser room disconnected");
    state.exited.cancel();
}

pub struct BrowserRoomHost {
    port: u16,
    open_browser: bool,
}

impl BrowserRoomHost {
    pub fn new(port: u16, open_browser: bool) -> Self {
        Self { port, open_browser }
    }

    pub fn from_config(launch: &LaunchSection) -> Self {
        Self::new(launch.browser_port, launch.open_browser)
    }
}

#[async_trait]
impl RoomHost for BrowserRoomHost {
    fn room(&self) -> Room {
        Room::Browser
    }

    async fn spawn_room(&self, request: &LaunchRequest) -> Result<RoomHandle, BridgeError> {
        let listener = TcpListener::bind(("127.0.0.1", self.port))
            .await
            .map_err(|e| BridgeError::SpawnFailed(format!("bind 127.0.0.1:{}: {}", self.port, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| BridgeError::SpawnFailed(e.to_string()))?;

        let (state, handle) = BrowserState::new(&request.session_id, &request.package.out_dir);
        let app = build_router(Arc::clone(&state));

        tokio::spawn(async move {
            let stop = state.shutdown.clone();
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
            {
                warn!(error = %e, "browser room server failed");
            }
            state.exited.cancel();
        });

        let url = format!("http://{}/", addr);
        info!(url = %url, session_id = %request.session_id, "browser room listening");
        if self.open_browser
            && let Err(e) = open::that(&url)
        {
            warn!(error = %e, url = %url, "could not open a browser, open the url manually");
        }

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn setup() -> (tempfile::TempDir, Arc<BrowserState>, RoomHandle) {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("main.bundle.js"), "console.log('main')").unwrap();
        std::fs::write(dir.path().join("manifest.json"), r#"{"main":"main.bundle.js"}"#).unwrap();
        let (state, handle) = BrowserState::new("session-42", dir.path());
        (dir, state, handle)
    }

    async fn get(state: &Arc<BrowserState>, uri: &str) -> Response {
        build_router(Arc::clone(state))
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_harness_page_carries_session_id() {
        let (_dir, state, _handle) = setup();
        let response = get(&state, "/").await;

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/html"));
        let body = body_text(response).await;
        assert!(body.contains("session-42"));
        assert!(!body.contains("{{session_id}}"));
    }

    #[tokio::test]
    async fn test_serves_package_files_with_mime_type() {
        let (_dir, state, _handle) = setup();
        let response = get(&state, "/plugin/main.bundle.js").await;

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
        assert!(content_type.contains("javascript"));
        assert_eq!(body_text(response).await, "console.log('main')");

        let response = get(&state, "/plugin/manifest.json").await;
        assert_eq!(
            response.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_missing_and_escaping_paths_are_not_found() {
        let (_dir, state, _handle) = setup();
        assert_eq!(get(&state, "/plugin/nope.js").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            get(&state, "/plugin/../secret").await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_second_bridge_connection_conflicts() {
        let (_dir, state, _handle) = setup();
        state.connected.store(true, Ordering::SeqCst);
        assert_eq!(get(&state, "/bridge").await.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_plain_get_on_bridge_is_rejected_without_claiming_it() {
        let (_dir, state, _handle) = setup();
        let status = get(&state, "/bridge").await.status();
        assert!(status.is_client_error());
        assert_ne!(status, StatusCode::CONFLICT);
        assert!(!state.connected.load(Ordering::SeqCst));
        assert!(state.to_room.lock().unwrap().is_some());
    }

    #[test]
    fn test_safe_relative_paths() {
        assert!(is_safe_relative("main.bundle.js"));
        assert!(is_safe_relative("assets/icon.png"));
        assert!(!is_safe_relative("../etc/passwd"));
        assert!(!is_safe_relative("/etc/passwd"));
    }

    #[tokio::test]
    async fn test_spawn_room_and_shutdown() {
        let dir = tempdir().unwrap();
        let host = BrowserRoomHost::new(0, false);
        let request = LaunchRequest {
            session_id: "s".into(),
            package: crate::build::package::PackageArtifact {
                out_dir: dir.path().to_path_buf(),
                manifest: dir.path().join("manifest.json"),
                main: dir.path().join("main.bundle.js"),
                ui: None,
            },
        };

        let handle = host.spawn_room(&request).await.unwrap();
        assert_eq!(handle.room, Room::Browser);
        handle.shutdown.cancel();
        handle.exited.cancelled().await;
    }
}
