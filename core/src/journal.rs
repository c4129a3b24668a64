//! Journal Store: append-only per-session directory holding `header.json`,
//! `stream.log` (asciinema v2-style), `info.json`, and an internal `stdin`
//! placeholder (spec §3, §4.1).

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::git::GitSnapshot;
use crate::session::SessionStatus;

/// Frame kind byte used in `stream.log` JSON arrays, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Output,
    Input,
    Resize,
    Exit,
}

impl FrameKind {
    fn as_str(self) -> &'static str {
        match self {
            FrameKind::Output => "o",
            FrameKind::Input => "i",
            FrameKind::Resize => "r",
            FrameKind::Exit => "x",
        }
    }
}

/// One decoded `stream.log` frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub t: f64,
    pub kind: FrameKind,
    pub payload: String,
}

/// `header.json` contents, written once at session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalHeader {
    pub version: u32,
    pub command: Vec<String>,
    pub working_dir: String,
    pub cols: u16,
    pub rows: u16,
    pub created_at: String,
}

/// Mutable `info.json` contents, rewritten on every status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub last_activity_at: String,
    #[serde(flatten)]
    pub git: GitSnapshot,
}

/// Flush a buffered write if either bound is crossed (spec §4.1).
const FLUSH_INTERVAL: Duration = Duration::from_millis(50);
const FLUSH_BYTES: usize = 16 * 1024;

struct WriterState {
    file: File,
    buffered: Vec<u8>,
    last_flush: Instant,
    sealed: bool,
}

/// One session's durable journal. Only the PTY Supervisor writes; many
/// readers may tail `stream.log` concurrently via `open_reader`.
pub struct Journal {
    dir: PathBuf,
    created_at: Instant,
    writer: Mutex<WriterState>,
}

impl Journal {
    /// Create a fresh journal directory: writes `header.json`, truncates
    /// `stream.log`, writes the asciinema header line, and `info.json` with
    /// `status=starting`.
    pub async fn create(
        control_dir: &Path,
        session_id: &str,
        header: JournalHeader,
    ) -> CoreResult<Self> {
        let dir = control_dir.join(session_id);
        tokio::fs::create_dir_all(&dir).await?;

        let header_json = serde_json::to_vec_pretty(&header)?;
        tokio::fs::write(dir.join("header.json"), header_json).await?;

        let info = SessionInfo {
            status: SessionStatus::Starting,
            exit_code: None,
            last_activity_at: header.created_at.clone(),
            git: GitSnapshot::default(),
        };
        write_info_atomic(&dir, &info).await?;

        // internal FIFO placeholder; this implementation delivers input via
        // an in-process channel (see SPEC_FULL.md §4.1), but the file is
        // still created so the on-disk layout matches the CLI's expectations.
        let _ = tokio::fs::File::create(dir.join("stdin")).await;

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(dir.join("stream.log"))
            .await?;
        let header_line = serde_json::json!({
            "version": header.version,
            "width": header.cols,
            "height": header.rows,
            "timestamp": header.created_at,
            "command": header.command,
        });
        let mut line = serde_json::to_vec(&header_line)?;
        line.push(b'\n');
        file.write_all(&line).await?;
        file.flush().await?;

        Ok(Journal {
            dir,
            created_at: Instant::now(),
            writer: Mutex::new(WriterState {
                file,
                buffered: Vec::new(),
                last_flush: Instant::now(),
                sealed: false,
            }),
        })
    }

    /// Re-open an existing journal directory found during the boot scan
    /// (spec §4.6). Appends to `stream.log` rather than truncating.
    pub async fn reopen(control_dir: &Path, session_id: &str) -> CoreResult<Self> {
        let dir = control_dir.join(session_id);
        let file = OpenOptions::new()
            .append(true)
            .open(dir.join("stream.log"))
            .await?;
        Ok(Journal {
            dir,
            created_at: Instant::now(),
            writer: Mutex::new(WriterState {
                file,
                buffered: Vec::new(),
                last_flush: Instant::now(),
                sealed: false,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn elapsed_secs(&self) -> f64 {
        self.created_at.elapsed().as_secs_f64()
    }

    async fn append_frame(&self, kind: FrameKind, payload_json: serde_json::Value) -> CoreResult<()> {
        let mut state = self.writer.lock().await;
        if state.sealed {
            return Ok(());
        }
        let t = self.elapsed_secs();
        let line = serde_json::json!([t, kind.as_str(), payload_json]);
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');
        state.buffered.extend_from_slice(&bytes);

        let should_flush = kind != FrameKind::Output
            || state.buffered.len() >= FLUSH_BYTES
            || state.last_flush.elapsed() >= FLUSH_INTERVAL;
        if should_flush {
            Self::flush_locked(&mut state).await?;
        }
        Ok(())
    }

    async fn flush_locked(state: &mut WriterState) -> CoreResult<()> {
        if !state.buffered.is_empty() {
            state.file.write_all(&state.buffered).await?;
            state.buffered.clear();
        }
        state.file.flush().await?;
        state.last_flush = Instant::now();
        Ok(())
    }

    /// Append an "o" frame (output bytes). Flushed on the bounded schedule.
    pub async fn append_output(&self, bytes: &[u8]) -> CoreResult<()> {
        let text = String::from_utf8_lossy(bytes).into_owned();
        self.append_frame(FrameKind::Output, serde_json::Value::String(text)).await
    }

    /// Append an "i" frame (input bytes), for replay/debugging parity with upstream input.
    pub async fn append_input(&self, bytes: &[u8]) -> CoreResult<()> {
        let text = String::from_utf8_lossy(bytes).into_owned();
        self.append_frame(FrameKind::Input, serde_json::Value::String(text)).await
    }

    /// Append an "r" frame (resize) immediately — never coalesced, since a
    /// late subscriber needs it to learn geometry.
    pub async fn append_resize(&self, cols: u16, rows: u16) -> CoreResult<()> {
        self.append_frame(FrameKind::Resize, serde_json::json!(format!("{}x{}", cols, rows)))
            .await
    }

    /// Seal the journal: append an optional "x" frame, flush, and mark
    /// `sealed` so no further writes land in `stream.log`.
    pub async fn finalize(&self, exit_code: Option<i32>) -> CoreResult<()> {
        {
            let mut state = self.writer.lock().await;
            if !state.sealed {
                let t = self.elapsed_secs();
                let line = serde_json::json!([t, "x", exit_code]);
                let mut bytes = serde_json::to_vec(&line)?;
                bytes.push(b'\n');
                state.buffered.extend_from_slice(&bytes);
                Self::flush_locked(&mut state).await?;
                state.sealed = true;
            }
        }
        Ok(())
    }

    /// Update `info.json` (status/exit_code/activity/git) via atomic write.
    pub async fn update_info(&self, info: &SessionInfo) -> CoreResult<()> {
        write_info_atomic(&self.dir, info).await
    }

    pub async fn read_info(&self) -> CoreResult<SessionInfo> {
        read_info(&self.dir).await
    }

    pub async fn read_header(&self) -> CoreResult<JournalHeader> {
        let data = tokio::fs::read(self.dir.join("header.json")).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Replay all persisted output-frame payloads from the start of
    /// `stream.log`, concatenated. Used for the replay-equivalence property
    /// (spec §8) and as the "catch-up" portion of `open_reader`.
    pub async fn replay_output(&self) -> CoreResult<Vec<u8>> {
        let frames = self.read_all_frames().await?;
        let mut out = Vec::new();
        for f in frames {
            if f.kind == FrameKind::Output {
                out.extend_from_slice(f.payload.as_bytes());
            }
        }
        Ok(out)
    }

    /// Read all frames currently persisted in `stream.log`, skipping the
    /// asciinema header line and any trailing partial (no final newline)
    /// frame left by a crash mid-write.
    pub async fn read_all_frames(&self) -> CoreResult<Vec<Frame>> {
        let mut file = File::open(self.dir.join("stream.log")).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;
        Ok(parse_frames(&contents))
    }

    /// Total output bytes persisted so far, in the same byte space as the
    /// live output broadcast — used as a subscriber cursor's upper bound
    /// when attaching "from the end" (spec §4.5). This is *not* the
    /// `stream.log` file length: that file also holds input/resize/exit
    /// frames wrapped in JSON, which a text-stream subscriber never sees.
    pub async fn current_output_len(&self) -> CoreResult<u64> {
        let frames = self.read_all_frames().await?;
        Ok(frames.iter().filter(|f| f.kind == FrameKind::Output).map(|f| f.payload.len() as u64).sum())
    }

    /// Decoded output bytes from logical offset `offset` (in the same byte
    /// space as `current_output_len`) to the current end of the journal.
    /// Replays every persisted frame to reconstruct the offset mapping,
    /// since output frames are interleaved with input/resize/exit frames
    /// in `stream.log` and are not separately indexed.
    pub async fn read_output_from(&self, offset: u64) -> CoreResult<Vec<u8>> {
        let frames = self.read_all_frames().await?;
        let mut out = Vec::new();
        let mut pos: u64 = 0;
        for f in frames {
            if f.kind != FrameKind::Output {
                continue;
            }
            let bytes = f.payload.as_bytes();
            let len = bytes.len() as u64;
            if pos + len > offset {
                let start = offset.saturating_sub(pos) as usize;
                out.extend_from_slice(&bytes[start..]);
            }
            pos += len;
        }
        Ok(out)
    }
}

fn parse_frames(contents: &str) -> Vec<Frame> {
    let mut out = Vec::new();
    for (i, line) in contents.lines().enumerate() {
        if i == 0 || line.trim().is_empty() {
            continue; // asciinema header line
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            break; // torn trailing write; stop rather than misparse
        };
        let Some(arr) = value.as_array() else { continue };
        if arr.len() != 3 {
            continue;
        }
        let Some(t) = arr[0].as_f64() else { continue };
        let kind = match arr[1].as_str() {
            Some("o") => FrameKind::Output,
            Some("i") => FrameKind::Input,
            Some("r") => FrameKind::Resize,
            Some("x") => FrameKind::Exit,
            _ => continue,
        };
        let payload = match &arr[2] {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out.push(Frame { t, kind, payload });
    }
    out
}

async fn write_info_atomic(dir: &Path, info: &SessionInfo) -> CoreResult<()> {
    let path = dir.join("info.json");
    let tmp = dir.join("info.json.tmp");
    let data = serde_json::to_vec_pretty(info)?;
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

async fn read_info(dir: &Path) -> CoreResult<SessionInfo> {
    let data = tokio::fs::read(dir.join("info.json")).await.map_err(|_| {
        CoreError::NotFound(format!("info.json missing in {}", dir.display()))
    })?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(cols: u16, rows: u16) -> JournalHeader {
        JournalHeader {
            version: 2,
            command: vec!["/bin/sh".into()],
            working_dir: "/tmp".into(),
            cols,
            rows,
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[tokio::test]
    async fn monotonic_timestamps_across_frames() {
        let dir = tempfile::tempdir().unwrap();
        let j = Journal::create(dir.path(), "s1", header(80, 24)).await.unwrap();
        j.append_output(b"hello").await.unwrap();
        j.append_resize(100, 40).await.unwrap();
        j.append_output(b"world").await.unwrap();
        let frames = j.read_all_frames().await.unwrap();
        for pair in frames.windows(2) {
            assert!(pair[1].t >= pair[0].t);
        }
    }

    #[tokio::test]
    async fn replay_equivalence_concatenates_output_frames() {
        let dir = tempfile::tempdir().unwrap();
        let j = Journal::create(dir.path(), "s1", header(80, 24)).await.unwrap();
        j.append_output(b"hello ").await.unwrap();
        j.append_output(b"world").await.unwrap();
        let replayed = j.replay_output().await.unwrap();
        assert_eq!(replayed, b"hello world");
    }

    #[tokio::test]
    async fn finalize_seals_stream_from_further_writes() {
        let dir = tempfile::tempdir().unwrap();
        let j = Journal::create(dir.path(), "s1", header(80, 24)).await.unwrap();
        j.append_output(b"before").await.unwrap();
        j.finalize(Some(0)).await.unwrap();
        j.append_output(b"after").await.unwrap();
        let replayed = j.replay_output().await.unwrap();
        assert_eq!(replayed, b"before");
    }

    #[tokio::test]
    async fn read_output_from_skips_non_output_frames() {
        let dir = tempfile::tempdir().unwrap();
        let j = Journal::create(dir.path(), "s1", header(80, 24)).await.unwrap();
        j.append_output(b"hello ").await.unwrap();
        j.append_resize(100, 40).await.unwrap();
        j.append_input(b"ls\n").await.unwrap();
        j.append_output(b"world").await.unwrap();
        let all = j.read_output_from(0).await.unwrap();
        assert_eq!(all, b"hello world");
        let tail = j.read_output_from(6).await.unwrap();
        assert_eq!(tail, b"world");
    }

    #[tokio::test]
    async fn current_output_len_counts_only_output_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let j = Journal::create(dir.path(), "s1", header(80, 24)).await.unwrap();
        j.append_output(b"hello").await.unwrap();
        j.append_resize(100, 40).await.unwrap();
        assert_eq!(j.current_output_len().await.unwrap(), 5);
    }
}
