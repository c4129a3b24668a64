//! Unix control-plane listener (spec §4.10): accepts connections on
//! `control_dir/api.sock`, verifies the peer is running as the same user,
//! and serves `ControlMessage` requests framed by `vt_core::control::ControlCodec`.

use std::path::Path;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Framed;

use vt_core::control::{
    ControlCodec, ControlMessage, ControlMessageType, GitEventNotifyPayload, GitFollowRequestPayload,
    GitFollowResponsePayload, StatusResponsePayload,
};
use vt_core::session::SessionManager;

#[cfg(unix)]
fn peer_is_same_user(stream: &UnixStream) -> bool {
    match nix::sys::socket::getsockopt(stream, nix::sys::socket::sockopt::PeerCredentials) {
        Ok(creds) => creds.uid() == nix::unistd::Uid::current().as_raw(),
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn peer_is_same_user(_stream: &UnixStream) -> bool {
    true
}

/// Bind `socket_path` and serve control-plane connections until the process
/// exits. A stale socket file from a previous run is removed before binding.
pub async fn run_control_server(
    socket_path: &Path,
    sessions: SessionManager,
    port: u16,
) -> std::io::Result<()> {
    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let listener = UnixListener::bind(socket_path)?;
    println!("[vibetunnel] control socket listening at {}", socket_path.display());

    loop {
        let (stream, _addr) = listener.accept().await?;
        if !peer_is_same_user(&stream) {
            eprintln!("[vibetunnel] control connection rejected: peer credential mismatch");
            continue;
        }
        let sessions = sessions.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, sessions, port).await {
                eprintln!("[vibetunnel] control connection error: {}", e);
            }
        });
    }
}

async fn handle_connection(
    stream: UnixStream,
    sessions: SessionManager,
    port: u16,
) -> std::io::Result<()> {
    let mut framed = Framed::new(stream, ControlCodec);
    while let Some(msg) = framed.next().await {
        let msg = msg?;
        let response = dispatch(msg, &sessions, port).await;
        framed.send(response).await?;
    }
    Ok(())
}

async fn dispatch(msg: ControlMessage, sessions: &SessionManager, port: u16) -> ControlMessage {
    match msg.kind {
        ControlMessageType::StatusRequest => {
            let session_count = sessions.list().await.len();
            ControlMessage::new(
                ControlMessageType::StatusResponse,
                &StatusResponsePayload {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    session_count,
                    port,
                },
            )
        }
        ControlMessageType::GitFollowRequest => {
            let Ok(req) = msg.decode_payload::<GitFollowRequestPayload>() else {
                return ControlMessage::error(&vt_core::error::CoreError::InvalidArgument(
                    "malformed git follow request".into(),
                ));
            };
            let repo_path = std::path::Path::new(&req.repo_path);
            let result = if req.enable {
                let branch = req.branch.clone().unwrap_or_default();
                vt_core::git::enable_follow(repo_path, &branch).await
            } else {
                vt_core::git::disable_follow(repo_path).await
            };
            if let Err(e) = result {
                return ControlMessage::error(&e);
            }
            let follow_mode = vt_core::git::follow_branch(repo_path).await;
            ControlMessage::new(ControlMessageType::GitFollowResponse, &GitFollowResponsePayload { follow_mode })
        }
        ControlMessageType::GitEventNotify => {
            let _ = msg.decode_payload::<GitEventNotifyPayload>();
            ControlMessage::new(ControlMessageType::GitEventAck, &serde_json::json!({}))
        }
        _ => ControlMessage::error(&vt_core::error::CoreError::InvalidArgument("unexpected message type".into())),
    }
}
