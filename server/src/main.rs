//! Standalone vibetunnel server binary: HTTP/WebSocket transport plus the
//! Unix control-plane socket, both driven by the same `SessionManager`.

use vt_core::config;
use vt_core::session::SessionManager;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cfg = config::ensure_loaded();
    println!("[vibetunnel] control dir: {}", cfg.control_dir.display());

    let sessions = SessionManager::new(cfg.control_dir.clone());
    let socket_path = cfg.socket_path();
    let port = cfg.port;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let control = vt_server::run_control_server(&socket_path, sessions.clone(), port);
        let http = vt_server::run_web_server(port, sessions);
        tokio::select! {
            res = control => res.map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
            res = http => res,
        }
    })
}
