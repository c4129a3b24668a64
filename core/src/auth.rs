//! Auth Gate (spec §4.9): a priority chain of five authentication methods
//! evaluated in order, the first applicable one winning. No method here
//! talks to the network directly — the HTTP layer extracts headers/query
//! params and calls `evaluate`.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Path prefixes that never require authentication (spec §4.9). A trailing
/// `/` matches any suffix (`/api/auth/*`, `/push/*`); the rest must match
/// the request path exactly.
pub const EXEMPT_PATH_PREFIXES: &[&str] = &["/api/auth/", "/push/"];
pub const EXEMPT_PATHS: &[&str] = &["/logs", "/api/sessions/tailscale/status"];

pub fn is_exempt(path: &str) -> bool {
    EXEMPT_PATHS.contains(&path) || EXEMPT_PATH_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

/// Everything the Auth Gate needs from the transport layer, collected up
/// front so the evaluation logic itself has no axum/hyper dependency.
#[derive(Debug, Clone, Default)]
pub struct AuthRequest {
    pub peer_is_loopback: bool,
    pub tailscale_identity_header: Option<String>,
    pub has_any_proxy_header: bool,
    pub local_shared_header: Option<String>,
    pub bearer_header: Option<String>,
    pub bearer_query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    NoAuth,
    Tailscale,
    LocalBypass,
    Bearer,
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub user: String,
    pub method: AuthMethod,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    sub: String,
    exp: usize,
}

/// Evaluate the five-method priority chain. Returns `None` on failure — the
/// caller responds 401 with `WWW-Authenticate: Bearer` and must not reveal
/// which method was attempted or why it failed (spec §4.9 security note).
pub fn evaluate(cfg: &Config, req: &AuthRequest) -> Option<Identity> {
    // Method 1: no-auth mode. Every request authenticates as a fixed user.
    if cfg.no_auth {
        return Some(Identity { user: "no-auth-user".to_string(), method: AuthMethod::NoAuth });
    }

    // Method 2: Tailscale reverse-proxy identity. Only trusted from loopback
    // (the proxy terminates TLS and forwards locally) — a non-loopback peer
    // claiming this header is ignored outright, not merely downgraded.
    if cfg.allow_tailscale_auth && req.peer_is_loopback {
        if let Some(user) = &req.tailscale_identity_header {
            if !user.is_empty() {
                return Some(Identity { user: user.clone(), method: AuthMethod::Tailscale });
            }
        }
    }

    // Method 3: local bypass. Loopback peer, shared local token matches, and
    // critically no proxy header present at all — a request carrying proxy
    // headers is never eligible for bypass even if the token is right.
    if cfg.allow_local_bypass && req.peer_is_loopback && !req.has_any_proxy_header {
        if let (Some(expected), Some(got)) = (&cfg.local_shared_token, &req.local_shared_header) {
            if expected == got {
                return Some(Identity { user: "local-user".to_string(), method: AuthMethod::LocalBypass });
            }
        }
    }

    // Method 4: bearer token, either the shared HQ secret or a JWT signed
    // with the auth service's secret.
    if let Some(token) = &req.bearer_header {
        if let Some(identity) = verify_bearer(cfg, token) {
            return Some(identity);
        }
    }

    // Method 5: bearer token via query string (for clients — e.g. the
    // `/api/sessions/:id/stream` EventSource — that cannot set headers).
    if let Some(token) = &req.bearer_query {
        if let Some(identity) = verify_bearer(cfg, token) {
            return Some(identity);
        }
    }

    None
}

fn verify_bearer(cfg: &Config, token: &str) -> Option<Identity> {
    if let Some(expected) = &cfg.hq_bearer_token {
        if expected == token {
            return Some(Identity { user: "hq-user".to_string(), method: AuthMethod::Bearer });
        }
    }
    let key = DecodingKey::from_secret(cfg.auth_token_secret.as_bytes());
    let data = decode::<TokenClaims>(token, &key, &Validation::default()).ok()?;
    Some(Identity { user: data.claims.sub, method: AuthMethod::Bearer })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base_config() -> Config {
        Config {
            control_dir: PathBuf::from("/tmp/vt"),
            username: None,
            password: None,
            debug: false,
            push_notifications_disabled: false,
            port: 4020,
            no_auth: false,
            hq_bearer_token: Some("hq-secret".to_string()),
            auth_token_secret: "jwt-secret".to_string(),
            local_shared_token: Some("local-secret".to_string()),
            allow_tailscale_auth: true,
            allow_local_bypass: true,
        }
    }

    #[test]
    fn no_auth_mode_always_succeeds() {
        let mut cfg = base_config();
        cfg.no_auth = true;
        let identity = evaluate(&cfg, &AuthRequest::default()).unwrap();
        assert_eq!(identity.method, AuthMethod::NoAuth);
    }

    #[test]
    fn tailscale_header_ignored_from_non_loopback_peer() {
        let cfg = base_config();
        let req = AuthRequest {
            peer_is_loopback: false,
            tailscale_identity_header: Some("alice".to_string()),
            ..Default::default()
        };
        assert!(evaluate(&cfg, &req).is_none());
    }

    #[test]
    fn tailscale_header_accepted_from_loopback_peer() {
        let cfg = base_config();
        let req = AuthRequest {
            peer_is_loopback: true,
            tailscale_identity_header: Some("alice".to_string()),
            ..Default::default()
        };
        let identity = evaluate(&cfg, &req).unwrap();
        assert_eq!(identity.user, "alice");
        assert_eq!(identity.method, AuthMethod::Tailscale);
    }

    #[test]
    fn local_bypass_refused_if_any_proxy_header_present() {
        let cfg = base_config();
        let req = AuthRequest {
            peer_is_loopback: true,
            has_any_proxy_header: true,
            local_shared_header: Some("local-secret".to_string()),
            ..Default::default()
        };
        assert!(evaluate(&cfg, &req).is_none());
    }

    #[test]
    fn local_bypass_succeeds_without_proxy_headers() {
        let cfg = base_config();
        let req = AuthRequest {
            peer_is_loopback: true,
            has_any_proxy_header: false,
            local_shared_header: Some("local-secret".to_string()),
            ..Default::default()
        };
        let identity = evaluate(&cfg, &req).unwrap();
        assert_eq!(identity.method, AuthMethod::LocalBypass);
    }

    #[test]
    fn hq_bearer_token_matches_exactly() {
        let cfg = base_config();
        let req = AuthRequest { bearer_header: Some("hq-secret".to_string()), ..Default::default() };
        let identity = evaluate(&cfg, &req).unwrap();
        assert_eq!(identity.method, AuthMethod::Bearer);
    }

    #[test]
    fn bearer_query_is_tried_when_header_absent() {
        let cfg = base_config();
        let req = AuthRequest { bearer_query: Some("hq-secret".to_string()), ..Default::default() };
        assert!(evaluate(&cfg, &req).is_some());
    }

    #[test]
    fn unrecognized_request_is_rejected() {
        let cfg = base_config();
        assert!(evaluate(&cfg, &AuthRequest::default()).is_none());
    }

    #[test]
    fn exempt_paths_match_prefixes_and_exact_names() {
        assert!(is_exempt("/api/auth/login"));
        assert!(is_exempt("/push/subscribe"));
        assert!(is_exempt("/logs"));
        assert!(is_exempt("/api/sessions/tailscale/status"));
    }

    #[test]
    fn server_status_is_not_exempt() {
        assert!(!is_exempt("/api/server/status"));
    }

    #[test]
    fn unrelated_paths_are_not_exempt() {
        assert!(!is_exempt("/api/sessions"));
        assert!(!is_exempt("/health"));
    }
}
