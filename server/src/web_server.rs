//! Axum HTTP + WebSocket server: the full session API (spec §6), the
//! chunked text-stream transport, and the `/ws/buffers` / `/ws/input`
//! WebSocket transports. Every route except the ones in
//! `vt_core::auth::is_exempt` goes through the Auth Gate.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use vt_core::auth::{self, AuthRequest};
use vt_core::config::{self, Config};
use vt_core::error::{CoreError, ErrorPayload};
use vt_core::fanout::{BufferFanout, Cursor, TextStreamReader};
use vt_core::input::SessionInput;
use vt_core::session::{Session, SessionId, SessionManager, SessionSpec};
use vt_core::title::TitleMode;

#[derive(Clone)]
struct AppState {
    sessions: SessionManager,
    fanout: Arc<BufferFanout>,
    config: &'static Config,
}

struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let payload: ErrorPayload = (&self.0).into();
        (status, Json(payload)).into_response()
    }
}

/// Runs the Axum server: session API, text-stream, and WebSocket transports.
/// Binds to 127.0.0.1 only — this process is meant to sit behind a trusted
/// reverse proxy (or be reached over Tailscale) for anything beyond localhost.
pub async fn run_web_server(port: u16, sessions: SessionManager) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app_config = config::ensure_loaded();
    sessions.boot_scan().await?;

    let fanout = Arc::new(BufferFanout::new());
    tokio::spawn(Arc::clone(&fanout).run());

    let state = AppState { sessions, fanout, config: app_config };

    let app = Router::new()
        .route("/api/server/status", get(status_handler))
        .route("/api/sessions", get(list_sessions_handler).post(create_session_handler))
        .route(
            "/api/sessions/{id}",
            get(get_session_handler).patch(patch_session_handler).delete(delete_session_handler),
        )
        .route("/api/sessions/{id}/input", post(input_handler))
        .route("/api/sessions/{id}/resize", post(resize_handler))
        .route("/api/sessions/{id}/stream", get(stream_handler))
        .route("/ws/buffers", get(ws_buffers_handler))
        .route("/ws/input", get(ws_input_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    println!("[vibetunnel] http server listening on http://127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

fn has_any_proxy_header(headers: &HeaderMap) -> bool {
    ["x-forwarded-for", "x-forwarded-proto", "x-real-ip", "forwarded"]
        .iter()
        .any(|h| headers.contains_key(*h))
}

fn bearer_from_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

fn bearer_from_query(uri: &axum::http::Uri) -> Option<String> {
    let query = uri.query()?;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == "token").then(|| v.to_string())
    })
}

/// Auth Gate middleware (spec §4.9). Exempt paths pass straight through;
/// everything else must satisfy one method of the priority chain or gets a
/// 401 that never reveals which method failed.
async fn auth_gate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    if auth::is_exempt(req.uri().path()) {
        return next.run(req).await;
    }
    let headers = req.headers().clone();
    let auth_req = AuthRequest {
        peer_is_loopback: addr.ip().is_loopback(),
        tailscale_identity_header: headers
            .get("Tailscale-User-Login")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        has_any_proxy_header: has_any_proxy_header(&headers),
        local_shared_header: headers.get("X-VibeTunnel-Local").and_then(|v| v.to_str().ok()).map(|s| s.to_string()),
        bearer_header: bearer_from_header(&headers),
        bearer_query: bearer_from_query(req.uri()),
    };
    if auth::evaluate(state.config, &auth_req).is_some() {
        return next.run(req).await;
    }
    (
        StatusCode::UNAUTHORIZED,
        [("WWW-Authenticate", "Bearer realm=\"VibeTunnel\"")],
        Json(ErrorPayload { code: "unauthorized".into(), message: "authentication required".into() }),
    )
        .into_response()
}

#[derive(Serialize)]
struct ServerStatus {
    #[serde(rename = "macAppConnected")]
    mac_app_connected: bool,
    #[serde(rename = "isHQMode")]
    is_hq_mode: bool,
    version: String,
}

async fn status_handler() -> Json<ServerStatus> {
    Json(ServerStatus {
        mac_app_connected: false,
        is_hq_mode: false,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Deserialize)]
struct CreateSessionBody {
    command: Vec<String>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    title_mode: Option<TitleMode>,
    #[serde(default)]
    cols: Option<u16>,
    #[serde(default)]
    rows: Option<u16>,
}

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

async fn create_session_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<Session>, ApiError> {
    let working_dir = body
        .working_dir
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("/")));
    let spec = SessionSpec {
        command: body.command,
        working_dir,
        name: body.name,
        title_mode: body.title_mode.unwrap_or(TitleMode::Dynamic),
        cols: body.cols.unwrap_or(DEFAULT_COLS),
        rows: body.rows.unwrap_or(DEFAULT_ROWS),
    };
    let cols = spec.cols;
    let rows = spec.rows;
    let id = state.sessions.create(spec).await?;

    state.fanout.register(id, cols, rows).await;
    let mut live = state.sessions.subscribe_output(&id)?;
    let fanout = Arc::clone(&state.fanout);
    tokio::spawn(async move {
        loop {
            match live.recv().await {
                Ok(chunk) => fanout.feed(&id, &chunk.bytes).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        fanout.unregister(&id).await;
    });

    let session = state.sessions.get(&id).await?;
    Ok(Json(session))
}

async fn list_sessions_handler(State(state): State<AppState>) -> Json<Vec<Session>> {
    Json(state.sessions.list().await)
}

async fn get_session_handler(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Session>, ApiError> {
    let id = SessionId::parse(&id)?;
    Ok(Json(state.sessions.get(&id).await?))
}

#[derive(Deserialize)]
struct PatchSessionBody {
    name: Option<String>,
}

async fn patch_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PatchSessionBody>,
) -> Result<Json<Session>, ApiError> {
    let id = SessionId::parse(&id)?;
    if let Some(name) = body.name {
        state.sessions.update_name(&id, name).await?;
    }
    Ok(Json(state.sessions.get(&id).await?))
}

async fn delete_session_handler(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let id = SessionId::parse(&id)?;
    state.sessions.delete(&id).await?;
    state.fanout.unregister(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn input_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SessionInput>,
) -> Result<StatusCode, ApiError> {
    let id = SessionId::parse(&id)?;
    state.sessions.send_input(&id, &body.into_bytes()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ResizeBody {
    cols: u16,
    rows: u16,
}

async fn resize_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResizeBody>,
) -> Result<StatusCode, ApiError> {
    let id = SessionId::parse(&id)?;
    state.sessions.resize(&id, body.cols, body.rows).await?;
    state.fanout.resize(&id, body.cols, body.rows).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct StreamQuery {
    cursor: Option<u64>,
}

async fn stream_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    let id = SessionId::parse(&id)?;
    let journal = state.sessions.journal(&id)?;
    let live = state.sessions.subscribe_output(&id)?;
    let cursor = match query.cursor {
        Some(offset) => Cursor::Offset(offset),
        None => Cursor::Start,
    };
    let reader = TextStreamReader::attach(journal, live, cursor).await?;
    let stream = futures_util::stream::unfold(reader, |mut reader| async move {
        match reader.next_chunk().await {
            Ok(Some(bytes)) => Some((Ok::<_, std::io::Error>(bytes), reader)),
            _ => None,
        }
    });
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("Transfer-Encoding", "chunked")
        .body(Body::from_stream(stream))
        .unwrap())
}

async fn ws_buffers_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let rx = state.fanout.subscribe();
    ws.on_upgrade(move |socket| relay_buffer_frames(socket, rx))
}

async fn relay_buffer_frames(socket: WebSocket, mut rx: tokio::sync::broadcast::Receiver<bytes::Bytes>) {
    let (mut ws_tx, _ws_rx) = socket.split();
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if ws_tx.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[derive(Deserialize)]
struct WsInputQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn ws_input_handler(
    State(state): State<AppState>,
    Query(query): Query<WsInputQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match SessionId::parse(&query.session_id) {
        Ok(id) => ws.on_upgrade(move |socket| handle_input_socket(socket, id, state)),
        Err(_) => ws.on_upgrade(|mut socket| async move {
            let _ = socket.send(Message::Text("invalid sessionId".into())).await;
        }),
    }
}

async fn handle_input_socket(mut socket: WebSocket, id: SessionId, state: AppState) {
    while let Some(Ok(msg)) = socket.next().await {
        let frame = match msg {
            Message::Binary(b) => b.to_vec(),
            Message::Text(t) => t.as_bytes().to_vec(),
            Message::Close(_) => break,
            _ => continue,
        };
        let Some(input) = SessionInput::decode_ws_frame(&frame) else { continue };
        if let Err(e) = state.sessions.send_input(&id, &input.into_bytes()).await {
            let payload: ErrorPayload = (&e).into();
            let _ = socket.send(Message::Text(serde_json::to_string(&payload).unwrap_or_default().into())).await;
        }
    }
}
