//! vibetunnel server: Axum HTTP + WebSocket transport and the Unix
//! control-plane listener, both over `vt_core`.

mod control_server;
mod web_server;

pub use control_server::run_control_server;
pub use web_server::run_web_server;
