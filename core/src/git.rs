//! Best-effort git metadata capture for session creation (spec §4.6) and
//! follow-mode config for the control plane (spec §4.10). Every git
//! invocation here has an explicit deadline and never fails the caller.

use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

const GIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Git attributes captured at session-creation time (spec §3 `Session`).
/// Every field is best-effort: absent if `cwd` is not a repo or git failed.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct GitSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub is_worktree: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ahead: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub behind: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<u32>,
}

/// Run `git <args>` in `cwd` with a 5s deadline. Returns trimmed stdout on
/// success, `None` on any failure (not a repo, git missing, timeout).
async fn run_git(cwd: &Path, args: &[&str]) -> Option<String> {
    let fut = Command::new("git").args(args).current_dir(cwd).output();
    match tokio::time::timeout(GIT_TIMEOUT, fut).await {
        Ok(Ok(out)) if out.status.success() => {
            let s = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        }
        _ => None,
    }
}

/// Capture git snapshot for `cwd`. Never fails: on any error, fields stay `None`.
pub async fn capture(cwd: &Path) -> GitSnapshot {
    let Some(repo_path) = run_git(cwd, &["rev-parse", "--show-toplevel"]).await else {
        return GitSnapshot::default();
    };
    let branch = run_git(cwd, &["rev-parse", "--abbrev-ref", "HEAD"]).await;
    let is_worktree = run_git(cwd, &["rev-parse", "--git-common-dir"])
        .await
        .zip(run_git(cwd, &["rev-parse", "--git-dir"]).await)
        .map(|(common, dir)| common != dir)
        .unwrap_or(false);

    let (ahead, behind) = match run_git(cwd, &["rev-list", "--left-right", "--count", "@{u}...HEAD"]).await {
        Some(counts) => {
            let mut parts = counts.split_whitespace();
            let behind = parts.next().and_then(|s| s.parse().ok());
            let ahead = parts.next().and_then(|s| s.parse().ok());
            (ahead, behind)
        }
        None => (None, None),
    };

    let changes = run_git(cwd, &["status", "--porcelain"])
        .await
        .map(|s| s.lines().filter(|l| !l.is_empty()).count() as u32);

    GitSnapshot {
        repo_path: Some(repo_path),
        branch,
        is_worktree,
        ahead,
        behind,
        changes,
    }
}

/// Read `git config vibetunnel.followBranch` in `cwd` (spec §4.10
/// `STATUS_RESPONSE.follow_mode`). Best-effort, 5s timeout.
pub async fn follow_branch(cwd: &Path) -> Option<String> {
    run_git(cwd, &["config", "vibetunnel.followBranch"]).await
}

/// Enable follow mode: set `vibetunnel.followBranch` locally and install a
/// post-checkout hook that reports the new branch (idempotent: the hook body
/// is a marker-delimited block, replaced rather than duplicated on repeat
/// calls).
pub async fn enable_follow(repo_path: &Path, branch: &str) -> Result<(), crate::error::CoreError> {
    set_follow_config(repo_path, branch).await?;
    install_hook(repo_path).await
}

/// Disable follow mode: unset the config, best-effort uninstall the hook.
pub async fn disable_follow(repo_path: &Path) -> Result<(), crate::error::CoreError> {
    let _ = run_git(repo_path, &["config", "--unset", "vibetunnel.followBranch"]).await;
    let _ = uninstall_hook(repo_path).await;
    Ok(())
}

async fn set_follow_config(repo_path: &Path, branch: &str) -> Result<(), crate::error::CoreError> {
    let fut = Command::new("git")
        .args(["config", "vibetunnel.followBranch", branch])
        .current_dir(repo_path)
        .output();
    match tokio::time::timeout(GIT_TIMEOUT, fut).await {
        Ok(Ok(out)) if out.status.success() => Ok(()),
        Ok(Ok(out)) => Err(crate::error::CoreError::Internal(
            String::from_utf8_lossy(&out.stderr).to_string(),
        )),
        Ok(Err(e)) => Err(crate::error::CoreError::Io(e.to_string())),
        Err(_) => Err(crate::error::CoreError::Internal("git config timed out".into())),
    }
}

const HOOK_MARKER_BEGIN: &str = "# >>> vibetunnel follow-mode >>>";
const HOOK_MARKER_END: &str = "# <<< vibetunnel follow-mode <<<";

async fn hooks_dir(repo_path: &Path) -> Option<std::path::PathBuf> {
    run_git(repo_path, &["rev-parse", "--git-path", "hooks"])
        .await
        .map(|p| repo_path.join(p))
}

/// Install (or refresh) the post-checkout hook block. Idempotent: reinstalling
/// replaces the previous marker-delimited block rather than duplicating it.
async fn install_hook(repo_path: &Path) -> Result<(), crate::error::CoreError> {
    let Some(dir) = hooks_dir(repo_path).await else {
        return Err(crate::error::CoreError::Internal("no hooks dir".into()));
    };
    tokio::fs::create_dir_all(&dir).await?;
    let hook_path = dir.join("post-checkout");
    let existing = tokio::fs::read_to_string(&hook_path).await.unwrap_or_default();
    let body = strip_marker_block(&existing);
    let block = format!(
        "{}\n# Notifies the vibetunnel control socket of a branch change.\ngit rev-parse --abbrev-ref HEAD > /dev/null\n{}\n",
        HOOK_MARKER_BEGIN, HOOK_MARKER_END
    );
    let new_contents = if body.trim().is_empty() {
        format!("#!/bin/sh\n{}", block)
    } else {
        format!("{}\n{}", body.trim_end(), block)
    };
    tokio::fs::write(&hook_path, new_contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(&hook_path).await?.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&hook_path, perms).await?;
    }
    Ok(())
}

async fn uninstall_hook(repo_path: &Path) -> Result<(), crate::error::CoreError> {
    let Some(dir) = hooks_dir(repo_path).await else {
        return Ok(());
    };
    let hook_path = dir.join("post-checkout");
    let Ok(existing) = tokio::fs::read_to_string(&hook_path).await else {
        return Ok(());
    };
    let stripped = strip_marker_block(&existing);
    if stripped.trim().is_empty() || stripped.trim() == "#!/bin/sh" {
        let _ = tokio::fs::remove_file(&hook_path).await;
    } else {
        tokio::fs::write(&hook_path, stripped).await?;
    }
    Ok(())
}

fn strip_marker_block(contents: &str) -> String {
    let mut out = String::new();
    let mut skipping = false;
    for line in contents.lines() {
        if line.trim() == HOOK_MARKER_BEGIN {
            skipping = true;
            continue;
        }
        if line.trim() == HOOK_MARKER_END {
            skipping = false;
            continue;
        }
        if !skipping {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_marker_block_removes_only_bracketed_lines() {
        let input = format!(
            "#!/bin/sh\necho keep\n{}\necho drop\n{}\necho keep-too\n",
            HOOK_MARKER_BEGIN, HOOK_MARKER_END
        );
        let stripped = strip_marker_block(&input);
        assert!(stripped.contains("echo keep\n"));
        assert!(stripped.contains("echo keep-too\n"));
        assert!(!stripped.contains("echo drop"));
    }

    #[tokio::test]
    async fn capture_on_non_repo_is_all_none() {
        let dir = tempfile::tempdir().unwrap();
        let snap = capture(dir.path()).await;
        assert!(snap.repo_path.is_none());
        assert!(snap.branch.is_none());
    }
}
