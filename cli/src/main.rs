//! `vt`: talks to a running vibetunnel server over its Unix control socket.
//! Exit codes: 0 clean, 1 startup failure (socket missing/connect error),
//! 2 runtime fatal (malformed usage or an ERROR response from the server).

use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use vt_core::config;
use vt_core::control::{
    ControlCodec, ControlMessage, ControlMessageType, GitFollowRequestPayload, StatusResponsePayload,
};

fn usage() -> ! {
    eprintln!("usage: vt status | vt follow <repo-path> [branch] | vt unfollow <repo-path>");
    std::process::exit(2);
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("[vt] failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let exit_code = rt.block_on(run(args));
    std::process::exit(exit_code);
}

async fn run(args: Vec<String>) -> i32 {
    let cfg = config::ensure_loaded();
    let socket_path = cfg.socket_path();

    let request = match build_request(&args) {
        Ok(msg) => msg,
        Err(code) => return code,
    };

    let stream = match UnixStream::connect(&socket_path).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[vt] could not connect to {}: {}", socket_path.display(), e);
            return 1;
        }
    };
    let mut framed = Framed::new(stream, ControlCodec);

    if let Err(e) = framed.send(request).await {
        eprintln!("[vt] failed to send request: {}", e);
        return 1;
    }

    match framed.next().await {
        Some(Ok(response)) => print_response(response),
        Some(Err(e)) => {
            eprintln!("[vt] malformed response: {}", e);
            2
        }
        None => {
            eprintln!("[vt] server closed the connection without responding");
            2
        }
    }
}

fn build_request(args: &[String]) -> Result<ControlMessage, i32> {
    match args[0].as_str() {
        "status" => Ok(ControlMessage::new(ControlMessageType::StatusRequest, &serde_json::json!({}))),
        "follow" => {
            let Some(repo_path) = args.get(1) else {
                eprintln!("[vt] follow requires a repo path");
                return Err(2);
            };
            Ok(ControlMessage::new(
                ControlMessageType::GitFollowRequest,
                &GitFollowRequestPayload { repo_path: repo_path.clone(), branch: args.get(2).cloned(), enable: true },
            ))
        }
        "unfollow" => {
            let Some(repo_path) = args.get(1) else {
                eprintln!("[vt] unfollow requires a repo path");
                return Err(2);
            };
            Ok(ControlMessage::new(
                ControlMessageType::GitFollowRequest,
                &GitFollowRequestPayload { repo_path: repo_path.clone(), branch: None, enable: false },
            ))
        }
        other => {
            eprintln!("[vt] unknown command: {}", other);
            Err(2)
        }
    }
}

fn print_response(msg: ControlMessage) -> i32 {
    match msg.kind {
        ControlMessageType::StatusResponse => match msg.decode_payload::<StatusResponsePayload>() {
            Ok(status) => {
                println!("version: {}", status.version);
                println!("sessions: {}", status.session_count);
                println!("port: {}", status.port);
                0
            }
            Err(e) => {
                eprintln!("[vt] malformed status response: {}", e);
                2
            }
        },
        ControlMessageType::GitFollowResponse => {
            match msg.decode_payload::<vt_core::control::GitFollowResponsePayload>() {
                Ok(resp) => {
                    match resp.follow_mode {
                        Some(branch) => println!("following: {}", branch),
                        None => println!("not following"),
                    }
                    0
                }
                Err(e) => {
                    eprintln!("[vt] malformed follow response: {}", e);
                    2
                }
            }
        }
        ControlMessageType::Error => {
            let message = msg
                .decode_payload::<vt_core::error::ErrorPayload>()
                .map(|p| p.to_string())
                .unwrap_or_else(|_| "unknown error".to_string());
            eprintln!("[vt] server error: {}", message);
            2
        }
        _ => {
            eprintln!("[vt] unexpected response type");
            2
        }
    }
}
