//! Global config singleton, loaded once from environment variables (spec §6).
//! `ensure_loaded()` is idempotent: the first caller does the work, later
//! callers (server binary, `vt` CLI, tests) get the same instance.

use std::path::PathBuf;
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Process-wide config, populated once from `VIBETUNNEL_*` env vars.
#[derive(Debug, Clone)]
pub struct Config {
    /// `$VIBETUNNEL_CONTROL_DIR`, default `~/.vibetunnel`. Holds `api.sock`,
    /// `config.json`, and one directory per session.
    pub control_dir: PathBuf,
    /// `VIBETUNNEL_USERNAME` / `VIBETUNNEL_PASSWORD` for the auth service's
    /// password-login path (spec §4.9 method 4).
    pub username: Option<String>,
    pub password: Option<String>,
    /// `VIBETUNNEL_DEBUG`: verbose logging.
    pub debug: bool,
    /// `VIBETUNNEL_DISABLE_PUSH_NOTIFICATIONS`: out of scope for the core,
    /// kept only so the env var is recognized and not mistaken for unknown.
    pub push_notifications_disabled: bool,
    /// `VIBETUNNEL_PORT`, default 4020.
    pub port: u16,
    /// Dev/local bypass: when true, every request authenticates as
    /// `no-auth-user` (spec §4.9 method 1).
    pub no_auth: bool,
    /// Shared "HQ bearer" secret accepted by the bearer-token auth method.
    pub hq_bearer_token: Option<String>,
    /// HMAC signing secret for auth-service-issued tokens (spec §4.9 method 4).
    pub auth_token_secret: String,
    /// Shared secret for `X-VibeTunnel-Local`, used by the local-bypass method.
    pub local_shared_token: Option<String>,
    pub allow_tailscale_auth: bool,
    pub allow_local_bypass: bool,
}

const DEFAULT_PORT: u16 = 4020;

/// Ensure config is loaded (idempotent). Reads env vars on first call; later
/// calls return the same instance.
pub fn ensure_loaded() -> &'static Config {
    CONFIG.get_or_init(load_from_env)
}

fn load_from_env() -> Config {
    let control_dir = std::env::var("VIBETUNNEL_CONTROL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_control_dir());

    let port = std::env::var("VIBETUNNEL_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let debug = env_flag("VIBETUNNEL_DEBUG");
    let push_notifications_disabled = env_flag("VIBETUNNEL_DISABLE_PUSH_NOTIFICATIONS");
    let no_auth = env_flag("VIBETUNNEL_NO_AUTH");
    let allow_tailscale_auth = env_flag("VIBETUNNEL_ALLOW_TAILSCALE_AUTH");
    let allow_local_bypass = std::env::var("VIBETUNNEL_ALLOW_LOCAL_BYPASS")
        .ok()
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(true);

    Config {
        control_dir,
        username: non_empty_env("VIBETUNNEL_USERNAME"),
        password: non_empty_env("VIBETUNNEL_PASSWORD"),
        debug,
        push_notifications_disabled,
        port,
        no_auth,
        hq_bearer_token: non_empty_env("VIBETUNNEL_HQ_TOKEN"),
        auth_token_secret: non_empty_env("VIBETUNNEL_AUTH_SECRET")
            .unwrap_or_else(|| "vibetunnel-dev-secret".to_string()),
        local_shared_token: non_empty_env("VIBETUNNEL_LOCAL_TOKEN"),
        allow_tailscale_auth,
        allow_local_bypass,
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

/// Default control dir: `~/.vibetunnel`.
fn default_control_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".vibetunnel")
}

impl Config {
    pub fn socket_path(&self) -> PathBuf {
        self.control_dir.join("api.sock")
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.control_dir.join(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_4020() {
        assert_eq!(DEFAULT_PORT, 4020);
    }

    #[test]
    fn socket_path_is_under_control_dir() {
        let cfg = Config {
            control_dir: PathBuf::from("/tmp/vt-test"),
            username: None,
            password: None,
            debug: false,
            push_notifications_disabled: false,
            port: DEFAULT_PORT,
            no_auth: false,
            hq_bearer_token: None,
            auth_token_secret: "s".into(),
            local_shared_token: None,
            allow_tailscale_auth: false,
            allow_local_bypass: true,
        };
        assert_eq!(cfg.socket_path(), PathBuf::from("/tmp/vt-test/api.sock"));
    }
}
