//! Prompt/Activity Detector: pure, stateless predicates used by the Title
//! Injector and independently testable (spec §4.4). Memoized behind a small
//! bounded LRU so repeated calls on the same trailing chunk stay O(1)
//! amortized.

use std::sync::Mutex;

use lru::LruCache;
use once_cell::sync::Lazy;
use regex::Regex;

const CACHE_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Bash,
    Zsh,
    Fish,
    Root,
    PowerShell,
    Bracketed,
    Null,
}

static PROMPT_ONLY_CACHE: Lazy<Mutex<LruCache<String, bool>>> =
    Lazy::new(|| Mutex::new(LruCache::new(std::num::NonZeroUsize::new(CACHE_CAPACITY).unwrap())));
static ENDS_WITH_PROMPT_CACHE: Lazy<Mutex<LruCache<String, bool>>> =
    Lazy::new(|| Mutex::new(LruCache::new(std::num::NonZeroUsize::new(CACHE_CAPACITY).unwrap())));

// Trailing CSI color-reset ("\x1b[0m"-style) or color-set sequence.
static TRAILING_CSI: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m$").unwrap());
// Bracketed identity prefix: [user@host], [~/path], [HH:MM:SS].
static BRACKETED_IDENTITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[[^\]\n]{1,64}\]\s*").unwrap());
// The bare prompt glyph set named in spec §4.4.
static PROMPT_GLYPH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\$>#%❯➜]$").unwrap());

fn strip_trailing_csi(s: &str) -> &str {
    if let Some(m) = TRAILING_CSI.find(s) {
        &s[..m.start()]
    } else {
        s
    }
}

/// True if, after trimming whitespace and a trailing CSI reset/set, `s`
/// equals a bare prompt glyph, optionally preceded by a bracketed identity.
pub fn is_prompt_only(s: &str) -> bool {
    if let Some(&hit) = PROMPT_ONLY_CACHE.lock().unwrap().get(s) {
        return hit;
    }
    let result = is_prompt_only_uncached(s);
    PROMPT_ONLY_CACHE.lock().unwrap().put(s.to_string(), result);
    result
}

fn is_prompt_only_uncached(s: &str) -> bool {
    let trimmed = s.trim();
    let stripped = strip_trailing_csi(trimmed).trim_end();
    let without_identity = BRACKETED_IDENTITY.replace(stripped, "");
    PROMPT_GLYPH.is_match(without_identity.trim())
}

/// True if `s`, after stripping a trailing color CSI, ends with a
/// prompt-only segment preceded by a newline or start-of-buffer.
pub fn ends_with_prompt(s: &str) -> bool {
    if let Some(&hit) = ENDS_WITH_PROMPT_CACHE.lock().unwrap().get(s) {
        return hit;
    }
    let result = ends_with_prompt_uncached(s);
    ENDS_WITH_PROMPT_CACHE.lock().unwrap().put(s.to_string(), result);
    result
}

fn ends_with_prompt_uncached(s: &str) -> bool {
    let stripped = strip_trailing_csi(s);
    let trimmed_end = stripped.trim_end_matches([' ', '\t']);
    if trimmed_end.is_empty() {
        return false;
    }
    let last_line = match trimmed_end.rfind('\n') {
        Some(idx) => &trimmed_end[idx + 1..],
        None => trimmed_end,
    };
    is_prompt_only(last_line)
}

/// Classify the shell that produced a prompt-only segment. Multi-line REPL
/// prompts (`>>>`, `...`) and the Unicode λ/→ characters are intentionally
/// not detected, per spec §4.4.
pub fn shell_kind(s: &str) -> ShellKind {
    let trimmed = s.trim();
    let stripped = strip_trailing_csi(trimmed).trim();
    let without_identity = BRACKETED_IDENTITY.replace(stripped, "");
    let had_identity = without_identity != stripped;
    let glyph = without_identity.trim();

    match glyph {
        "#" => ShellKind::Root,
        ">" if looks_like_powershell(stripped) => ShellKind::PowerShell,
        "$" => {
            if had_identity {
                ShellKind::Bracketed
            } else {
                ShellKind::Bash
            }
        }
        "%" => ShellKind::Zsh,
        "❯" => ShellKind::Fish,
        "➜" => ShellKind::Zsh,
        _ if had_identity && PROMPT_GLYPH.is_match(glyph) => ShellKind::Bracketed,
        _ => ShellKind::Null,
    }
}

fn looks_like_powershell(s: &str) -> bool {
    s.to_uppercase().starts_with("PS ") || s == ">"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn bare_glyphs_are_prompt_only() {
        for glyph in ["$", ">", "#", "%", "❯", "➜"] {
            assert!(is_prompt_only(glyph), "glyph {glyph} should be prompt-only");
        }
    }

    #[test]
    fn bracketed_identity_prefix_is_still_prompt_only() {
        assert!(is_prompt_only("[user@host] $"));
        assert!(is_prompt_only("[~/path] %"));
        assert!(is_prompt_only("[12:30:00] ❯"));
    }

    #[test]
    fn trailing_color_reset_is_stripped() {
        assert!(is_prompt_only("$\x1b[0m"));
    }

    #[test]
    fn multiline_repl_prompts_are_not_detected() {
        assert!(!is_prompt_only(">>>"));
        assert!(!is_prompt_only("..."));
    }

    #[test]
    fn unicode_lambda_and_arrow_are_not_detected() {
        assert!(!is_prompt_only("λ"));
        assert!(!is_prompt_only("→"));
    }

    #[test]
    fn ends_with_prompt_requires_newline_or_start_boundary() {
        assert!(ends_with_prompt("some output\n$"));
        assert!(ends_with_prompt("$"));
        assert!(!ends_with_prompt("foo$bar"));
    }

    #[test]
    fn shell_kind_classifies_known_glyphs() {
        assert_eq!(shell_kind("$"), ShellKind::Bash);
        assert_eq!(shell_kind("#"), ShellKind::Root);
        assert_eq!(shell_kind("%"), ShellKind::Zsh);
        assert_eq!(shell_kind("❯"), ShellKind::Fish);
        assert_eq!(shell_kind("not a prompt"), ShellKind::Null);
    }

    #[test]
    fn repeated_calls_are_fast() {
        let s = "line one\nline two\n$";
        let start = Instant::now();
        for _ in 0..1000 {
            ends_with_prompt(s);
        }
        assert!(start.elapsed().as_millis() < 1, "1000 cached calls should complete under 1ms");
    }
}
