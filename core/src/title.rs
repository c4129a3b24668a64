//! Title Injector: tracks working directory from inbound `cd` commands and
//! prepends OSC-2 title sequences to outbound chunks at prompt boundaries
//! (spec §4.3). Purely additive — never rewrites existing bytes.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::prompt::ends_with_prompt;

/// Matches `cd`, `cd <target>`, with quoted/relative/absolute/`~`/`~/`/empty
/// arguments. Anchored to a command boundary (start of line/buffer or after
/// `;`/`&&`/`|`) so it doesn't fire on `cdfoo` or inside a longer word.
static CD_COMMAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?:^|[;&|]\s*)cd(?:\s+(?:"([^"]*)"|'([^']*)'|(\S+)))?\s*(?:[;&|]|$)"#,
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleMode {
    Static,
    Dynamic,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Active,
}

const ROLLING_BUFFER_CAP: usize = 256;

/// Per-session title-tracking state, fed every inbound/outbound chunk.
pub struct TitleInjector {
    mode: TitleMode,
    cwd: PathBuf,
    command_name: String,
    session_name: Option<String>,
    rolling: Vec<u8>,
    activity: Activity,
    task_status: Option<String>,
}

impl TitleInjector {
    pub fn new(mode: TitleMode, working_dir: PathBuf, argv0: &str, session_name: Option<String>) -> Self {
        let command_name = Path::new(argv0)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(argv0)
            .to_string();
        Self {
            mode,
            cwd: working_dir,
            command_name,
            session_name,
            rolling: Vec::with_capacity(ROLLING_BUFFER_CAP),
            activity: Activity::Idle,
            task_status: None,
        }
    }

    pub fn set_activity(&mut self, activity: Activity, task_status: Option<String>) {
        self.activity = activity;
        self.task_status = task_status;
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// A session's display name can change after creation (e.g. via
    /// `PATCH /api/sessions/:id`); update what the title renders.
    pub fn set_session_name(&mut self, name: Option<String>) {
        self.session_name = name;
    }

    /// Observe inbound text destined for the PTY; updates `cwd` on `cd`.
    pub fn observe_input(&mut self, text: &str) {
        for cap in CD_COMMAND.captures_iter(text) {
            let target = cap
                .get(1)
                .or_else(|| cap.get(2))
                .or_else(|| cap.get(3))
                .map(|m| m.as_str());
            self.apply_cd(target);
        }
    }

    fn apply_cd(&mut self, target: Option<&str>) {
        let target = target.unwrap_or("").trim();
        let new_cwd = if target.is_empty() || target == "~" {
            home_dir()
        } else if let Some(rest) = target.strip_prefix("~/") {
            home_dir().join(rest)
        } else {
            let candidate = Path::new(target);
            if candidate.is_absolute() {
                candidate.to_path_buf()
            } else {
                self.cwd.join(candidate)
            }
        };
        self.cwd = normalize_lexically(&new_cwd);
    }

    /// Observe outbound bytes (pre-journal). If title mode is `dynamic` and
    /// the chunk ends at a prompt boundary, returns the bytes to prepend
    /// (an OSC-2 sequence) — `None` if nothing should be injected.
    pub fn maybe_inject(&mut self, outbound: &[u8]) -> Option<Vec<u8>> {
        self.rolling.extend_from_slice(outbound);
        if self.rolling.len() > ROLLING_BUFFER_CAP {
            let excess = self.rolling.len() - ROLLING_BUFFER_CAP;
            self.rolling.drain(..excess);
        }
        if self.mode != TitleMode::Dynamic {
            return None;
        }
        let window = String::from_utf8_lossy(&self.rolling);
        if !ends_with_prompt(&window) {
            return None;
        }
        let title = self.render_title();
        let mut seq = Vec::with_capacity(title.len() + 4);
        seq.push(0x1b);
        seq.extend_from_slice(b"]2;");
        seq.extend_from_slice(title.as_bytes());
        seq.push(0x07);
        Some(seq)
    }

    fn render_title(&self) -> String {
        let path = display_path(&self.cwd);
        let mut parts = Vec::new();
        if let Some(status) = &self.task_status {
            parts.push(format!("[{}]", status));
        } else if self.activity == Activity::Active {
            parts.push("●".to_string());
        }
        parts.push(path);
        parts.push(self.command_name.clone());
        if let Some(name) = &self.session_name {
            if !self.is_redundant_session_name(name) {
                parts.push(name.clone());
            }
        }
        parts.join(" · ")
    }

    fn is_redundant_session_name(&self, name: &str) -> bool {
        if name == self.command_name {
            return true;
        }
        let doubled = format!("{0} · {0}", self.command_name);
        if name == doubled {
            return true;
        }
        let auto_pattern = format!("{}(", self.command_name);
        name.starts_with(&auto_pattern)
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/"))
}

/// Lexical `..`/`.` normalization without touching the filesystem (cwd may
/// not exist from the server's point of view — it's the child's cwd).
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Render `cwd` with `$HOME` replaced by `~`.
fn display_path(cwd: &Path) -> String {
    let home = home_dir();
    let cwd_str = cwd.to_string_lossy();
    let home_str = home.to_string_lossy();
    if !home_str.is_empty() && cwd_str.as_ref() == home_str.as_ref() {
        "~".to_string()
    } else if !home_str.is_empty() {
        if let Some(rest) = cwd_str.strip_prefix(home_str.as_ref()) {
            if rest.is_empty() {
                "~".to_string()
            } else if rest.starts_with('/') {
                format!("~{}", rest)
            } else {
                cwd_str.into_owned()
            }
        } else {
            cwd_str.into_owned()
        }
    } else {
        cwd_str.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn injector(mode: TitleMode) -> TitleInjector {
        TitleInjector::new(mode, PathBuf::from("/home/user/project"), "/bin/bash", None)
    }

    #[test]
    fn cd_absolute_updates_cwd() {
        let mut t = injector(TitleMode::Dynamic);
        t.observe_input("cd /tmp\n");
        assert_eq!(t.cwd(), Path::new("/tmp"));
    }

    #[test]
    fn cd_relative_resolves_against_cwd() {
        let mut t = injector(TitleMode::Dynamic);
        t.observe_input("cd src\n");
        assert_eq!(t.cwd(), Path::new("/home/user/project/src"));
    }

    #[test]
    fn cd_tilde_resolves_home() {
        std::env::set_var("HOME", "/home/user");
        let mut t = injector(TitleMode::Dynamic);
        t.observe_input("cd ~/docs\n");
        assert_eq!(t.cwd(), Path::new("/home/user/docs"));
    }

    #[test]
    fn cd_bare_goes_home() {
        std::env::set_var("HOME", "/home/user");
        let mut t = injector(TitleMode::Dynamic);
        t.observe_input("cd\n");
        assert_eq!(t.cwd(), Path::new("/home/user"));
    }

    #[test]
    fn injection_only_at_prompt_boundary() {
        let mut t = injector(TitleMode::Dynamic);
        assert!(t.maybe_inject(b"running a long build...\n").is_none());
        assert!(t.maybe_inject(b"$").is_some());
    }

    #[test]
    fn static_mode_never_injects() {
        let mut t = injector(TitleMode::Static);
        assert!(t.maybe_inject(b"\n$").is_none());
    }

    #[test]
    fn redundant_session_name_is_omitted() {
        std::env::set_var("HOME", "/home/user");
        let mut t = TitleInjector::new(
            TitleMode::Dynamic,
            PathBuf::from("/home/user"),
            "/bin/bash",
            Some("bash".to_string()),
        );
        let seq = t.maybe_inject(b"\n$").unwrap();
        let s = String::from_utf8_lossy(&seq);
        assert_eq!(s.matches("bash").count(), 1);
    }
}
