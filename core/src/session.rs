//! Session data model and manager: owns one `PtySupervisor` + `Journal` per
//! live session, relays PTY output into both, and exposes the operations the
//! HTTP/control-plane layers need (spec §3, §4.6).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex as AsyncMutex, RwLock};

use crate::error::{CoreError, CoreResult};
use crate::git::GitSnapshot;
use crate::journal::{Journal, JournalHeader, SessionInfo};
use crate::pty::{self, PtyEvent, PtySpawnSpec, PtySupervisor};
use crate::title::{Activity, TitleInjector, TitleMode};

/// Unique session identifier (UUID v4), used in the API and WS query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| CoreError::InvalidArgument(format!("invalid session id: {s}")))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle status (spec §3). `Starting` covers the window between
/// `create()` returning and the PTY Supervisor's first `Started` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

/// Capacity of the per-session live-output broadcast channel. A lagging
/// subscriber that falls this far behind sees `RecvError::Lagged`, which the
/// fan-out layer treats as a cue to resync from the journal rather than a
/// fatal error.
pub const LIVE_BROADCAST_CAP: usize = 1024;

/// One chunk of PTY output as broadcast on a session's live channel,
/// tagged with its absolute starting position in the session's output
/// byte stream. The tag lets a subscriber that also catches up from the
/// journal (`vt_core::fanout::TextStreamReader`) tell which live chunks it
/// has already seen via catch-up, without relying on subscribe timing.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub offset: u64,
    pub bytes: Bytes,
}

/// Request body for `SessionManager::create` (spec §6 `POST /api/sessions`).
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    pub name: Option<String>,
    pub title_mode: TitleMode,
    pub cols: u16,
    pub rows: u16,
}

/// Session record as returned by the API (spec §3 `Session`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub name: Option<String>,
    pub title_mode: TitleMode,
    pub created_at: String,
    pub last_activity_at: String,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
    pub exit_code: Option<i32>,
    #[serde(flatten)]
    pub git: GitSnapshot,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

struct SessionHandle {
    info: RwLock<Session>,
    journal: Arc<Journal>,
    supervisor: PtySupervisor,
    title: AsyncMutex<TitleInjector>,
    output_tx: broadcast::Sender<OutputChunk>,
    output_len: std::sync::atomic::AtomicU64,
}

/// Registry of all sessions known to this process, live or exited. Cheap to
/// clone (an `Arc` internally) so both the HTTP and control-plane layers can
/// hold one.
#[derive(Clone)]
pub struct SessionManager {
    control_dir: PathBuf,
    sessions: Arc<DashMap<String, Arc<SessionHandle>>>,
}

impl SessionManager {
    pub fn new(control_dir: PathBuf) -> Self {
        Self { control_dir, sessions: Arc::new(DashMap::new()) }
    }

    /// Boot-time recovery scan (spec §4.6): any session directory left in
    /// `starting`/`running` did not survive a process restart. Mark it
    /// `exited` with no exit code rather than leaving a permanently-running
    /// ghost, and finalize its journal so `stream.log` stops accepting writes.
    pub async fn boot_scan(&self) -> CoreResult<()> {
        let mut entries = match tokio::fs::read_dir(&self.control_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let session_id = entry.file_name().to_string_lossy().into_owned();
            let dir = entry.path();
            if !dir.join("info.json").exists() {
                continue;
            }
            let Ok(journal) = Journal::reopen(&self.control_dir, &session_id).await else { continue };
            let Ok(mut info) = journal.read_info().await else { continue };
            if matches!(info.status, SessionStatus::Starting | SessionStatus::Running) {
                info.status = SessionStatus::Exited;
                info.last_activity_at = now_rfc3339();
                let _ = journal.update_info(&info).await;
                let _ = journal.finalize(None).await;
            }
        }
        Ok(())
    }

    /// Spawn a new PTY session and register it. Returns immediately once the
    /// journal exists and the PTY has been asked to spawn; `status` starts at
    /// `starting` and transitions to `running` once the supervisor reports
    /// its pid.
    pub async fn create(&self, spec: SessionSpec) -> CoreResult<SessionId> {
        if spec.command.is_empty() {
            return Err(CoreError::InvalidArgument("command must not be empty".into()));
        }
        if !(1..=1024).contains(&spec.cols) {
            return Err(CoreError::InvalidArgument("cols must be between 1 and 1024".into()));
        }
        if !(1..=1024).contains(&spec.rows) {
            return Err(CoreError::InvalidArgument("rows must be between 1 and 1024".into()));
        }
        match tokio::fs::metadata(&spec.working_dir).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(CoreError::InvalidArgument(format!(
                    "working_dir does not exist or is not a directory: {}",
                    spec.working_dir.display()
                )))
            }
        }
        let id = SessionId::new();
        let id_str = id.to_string();
        let created_at = now_rfc3339();
        let git = crate::git::capture(&spec.working_dir).await;

        let journal = Journal::create(
            &self.control_dir,
            &id_str,
            JournalHeader {
                version: 2,
                command: spec.command.clone(),
                working_dir: spec.working_dir.to_string_lossy().into_owned(),
                cols: spec.cols,
                rows: spec.rows,
                created_at: created_at.clone(),
            },
        )
        .await?;
        journal
            .update_info(&SessionInfo {
                status: SessionStatus::Starting,
                exit_code: None,
                last_activity_at: created_at.clone(),
                git: git.clone(),
            })
            .await?;
        let journal = Arc::new(journal);

        let (supervisor, events) = pty::spawn(PtySpawnSpec {
            command: spec.command.clone(),
            working_dir: spec.working_dir.clone(),
            cols: spec.cols,
            rows: spec.rows,
            session_id: id_str.clone(),
        })?;

        let (output_tx, _) = broadcast::channel(LIVE_BROADCAST_CAP);
        let title = TitleInjector::new(
            spec.title_mode,
            spec.working_dir.clone(),
            spec.command.first().map(|s| s.as_str()).unwrap_or(""),
            spec.name.clone(),
        );

        let session = Session {
            id: id_str.clone(),
            command: spec.command.clone(),
            working_dir: spec.working_dir.to_string_lossy().into_owned(),
            name: spec.name.clone(),
            title_mode: spec.title_mode,
            created_at,
            last_activity_at: now_rfc3339(),
            status: SessionStatus::Starting,
            pid: None,
            cols: spec.cols,
            rows: spec.rows,
            exit_code: None,
            git,
        };

        let handle = Arc::new(SessionHandle {
            info: RwLock::new(session),
            journal,
            supervisor,
            title: AsyncMutex::new(title),
            output_tx,
            output_len: std::sync::atomic::AtomicU64::new(0),
        });
        self.sessions.insert(id_str.clone(), Arc::clone(&handle));

        tokio::spawn(drive_session(handle, events));

        Ok(id)
    }

    fn handle(&self, id: &SessionId) -> CoreResult<Arc<SessionHandle>> {
        self.sessions
            .get(&id.to_string())
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| CoreError::NotFound(format!("session {id} not found")))
    }

    pub async fn get(&self, id: &SessionId) -> CoreResult<Session> {
        Ok(self.handle(id)?.info.read().await.clone())
    }

    pub async fn list(&self) -> Vec<Session> {
        let mut out = Vec::with_capacity(self.sessions.len());
        for entry in self.sessions.iter() {
            out.push(entry.value().info.read().await.clone());
        }
        out
    }

    pub async fn update_name(&self, id: &SessionId, name: String) -> CoreResult<()> {
        let handle = self.handle(id)?;
        handle.info.write().await.name = Some(name.clone());
        handle.title.lock().await.set_session_name(Some(name));
        Ok(())
    }

    pub async fn resize(&self, id: &SessionId, cols: u16, rows: u16) -> CoreResult<()> {
        let handle = self.handle(id)?;
        {
            let info = handle.info.read().await;
            if info.status == SessionStatus::Exited {
                return Err(CoreError::Gone(format!("session {id} has exited")));
            }
        }
        handle.supervisor.resize(cols, rows)?;
        handle.journal.append_resize(cols, rows).await?;
        let mut info = handle.info.write().await;
        info.cols = cols;
        info.rows = rows;
        Ok(())
    }

    /// Deliver input bytes to the child. Returns `Gone` once the session has
    /// exited — this 400 response is the signal existing clients use to
    /// transition their view (spec §7).
    pub async fn send_input(&self, id: &SessionId, input: &[u8]) -> CoreResult<()> {
        let handle = self.handle(id)?;
        {
            let info = handle.info.read().await;
            if info.status == SessionStatus::Exited {
                return Err(CoreError::Gone(format!("session {id} has exited")));
            }
        }
        handle.title.lock().await.observe_input(&String::from_utf8_lossy(input));
        handle.journal.append_input(input).await?;
        handle.supervisor.write_input(input.to_vec())?;
        handle.info.write().await.last_activity_at = now_rfc3339();
        Ok(())
    }

    /// Ask the child to exit (SIGTERM, then SIGKILL) and drop the session
    /// from the registry once the reaper has reported its exit.
    pub async fn delete(&self, id: &SessionId) -> CoreResult<()> {
        let handle = self.handle(id)?;
        handle.supervisor.kill().await?;
        self.sessions.remove(&id.to_string());
        Ok(())
    }

    pub fn subscribe_output(&self, id: &SessionId) -> CoreResult<broadcast::Receiver<OutputChunk>> {
        Ok(self.handle(id)?.output_tx.subscribe())
    }

    pub fn journal(&self, id: &SessionId) -> CoreResult<Arc<Journal>> {
        Ok(Arc::clone(&self.handle(id)?.journal))
    }

    pub fn control_dir(&self) -> &Path {
        &self.control_dir
    }
}

/// Background task: drains one session's PTY events into its journal,
/// live-output broadcast, and status info, until the process exits.
async fn drive_session(handle: Arc<SessionHandle>, mut events: tokio::sync::mpsc::Receiver<PtyEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PtyEvent::Started { pid } => {
                let mut info = handle.info.write().await;
                info.status = SessionStatus::Running;
                info.pid = Some(pid);
                info.last_activity_at = now_rfc3339();
                let snapshot = SessionInfo {
                    status: info.status,
                    exit_code: info.exit_code,
                    last_activity_at: info.last_activity_at.clone(),
                    git: info.git.clone(),
                };
                drop(info);
                let _ = handle.journal.update_info(&snapshot).await;
            }
            PtyEvent::Output(bytes) => {
                let injected = {
                    let mut title = handle.title.lock().await;
                    title.set_activity(Activity::Active, None);
                    title.maybe_inject(&bytes)
                };
                let mut out = bytes;
                if let Some(prefix) = injected {
                    let mut combined = prefix;
                    combined.extend_from_slice(&out);
                    out = combined;
                }
                let _ = handle.journal.append_output(&out).await;
                handle.info.write().await.last_activity_at = now_rfc3339();
                let bytes = Bytes::from(out);
                let offset = handle.output_len.fetch_add(bytes.len() as u64, std::sync::atomic::Ordering::SeqCst);
                let _ = handle.output_tx.send(OutputChunk { offset, bytes });
            }
            PtyEvent::Exited { exit_code } => {
                let mut info = handle.info.write().await;
                info.status = SessionStatus::Exited;
                info.exit_code = exit_code;
                info.last_activity_at = now_rfc3339();
                let snapshot = SessionInfo {
                    status: info.status,
                    exit_code: info.exit_code,
                    last_activity_at: info.last_activity_at.clone(),
                    git: info.git.clone(),
                };
                drop(info);
                let _ = handle.journal.update_info(&snapshot).await;
                let _ = handle.journal.finalize(exit_code).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_round_trips_through_display_and_parse() {
        let id = SessionId::new();
        let parsed = SessionId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn session_id_rejects_garbage() {
        assert!(SessionId::parse("not-a-uuid").is_err());
    }

    #[tokio::test]
    async fn boot_scan_on_empty_control_dir_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let control_dir = dir.path().join("does-not-exist-yet");
        let mgr = SessionManager::new(control_dir);
        mgr.boot_scan().await.unwrap();
        assert!(mgr.list().await.is_empty());
    }

    #[tokio::test]
    async fn get_on_unknown_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path().to_path_buf());
        let err = mgr.get(&SessionId::new()).await.unwrap_err();
        assert_eq!(err.kind(), "not-found");
    }

    fn test_spec(working_dir: PathBuf, cols: u16, rows: u16) -> SessionSpec {
        SessionSpec {
            command: vec!["/bin/echo".to_string()],
            working_dir,
            name: None,
            title_mode: TitleMode::None,
            cols,
            rows,
        }
    }

    #[tokio::test]
    async fn create_rejects_zero_cols() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path().join("control"));
        let err = mgr.create(test_spec(dir.path().to_path_buf(), 0, 24)).await.unwrap_err();
        assert_eq!(err.kind(), "invalid-argument");
    }

    #[tokio::test]
    async fn create_rejects_oversized_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path().join("control"));
        let err = mgr.create(test_spec(dir.path().to_path_buf(), 80, 1025)).await.unwrap_err();
        assert_eq!(err.kind(), "invalid-argument");
    }

    #[tokio::test]
    async fn create_rejects_missing_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path().join("control"));
        let missing = dir.path().join("does-not-exist");
        let err = mgr.create(test_spec(missing, 80, 24)).await.unwrap_err();
        assert_eq!(err.kind(), "invalid-argument");
    }
}
