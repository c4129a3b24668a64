//! PTY Supervisor: spawns an arbitrary command inside a pseudoterminal and
//! bridges its stdin/stdout to the rest of the system (spec §4.2). One
//! supervisor per session; the reaper thread is always armed and drives the
//! journal's finalize step regardless of how the process ends.

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{self, Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{CoreError, CoreResult};

/// Bytes allowed to be in flight to the child's stdin before `write_input`
/// starts rejecting with `Busy` (spec §4.2 backpressure).
const WRITE_HIGH_WATERMARK: usize = 64 * 1024;

/// Grace period between SIGTERM and SIGKILL on `kill()` (spec §4.2).
const KILL_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct PtySpawnSpec {
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub session_id: String,
}

/// Events emitted by a running supervisor, in order: exactly one `Started`
/// before any `Output`, then zero or more `Output`, then exactly one `Exited`.
#[derive(Debug)]
pub enum PtyEvent {
    Started { pid: u32 },
    Output(Vec<u8>),
    Exited { exit_code: Option<i32> },
}

pub type ResizeSender = sync::mpsc::Sender<(u16, u16)>;

/// Live handle to a spawned child. Cloned cheaply (its fields are all
/// `Arc`s) so the session layer can hold one per subscriber without
/// duplicating the underlying PTY.
#[derive(Clone)]
pub struct PtySupervisor {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    pending_bytes: Arc<AtomicUsize>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    resize_tx: ResizeSender,
    pid: Option<u32>,
}

/// Spawn `spec.command` in a PTY. Returns the supervisor and an event
/// channel; the caller (the session layer) is expected to drain events and
/// hand `Output` bytes to the journal and fan-out.
pub fn spawn(spec: PtySpawnSpec) -> CoreResult<(PtySupervisor, mpsc::Receiver<PtyEvent>)> {
    if spec.command.is_empty() {
        return Err(CoreError::InvalidArgument("command must not be empty".into()));
    }

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize { rows: spec.rows, cols: spec.cols, pixel_width: 0, pixel_height: 0 })
        .map_err(|e| CoreError::Internal(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&spec.command[0]);
    for arg in &spec.command[1..] {
        cmd.arg(arg);
    }
    cmd.cwd(&spec.working_dir);
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLUMNS", spec.cols.to_string());
    cmd.env("LINES", spec.rows.to_string());
    cmd.env("VIBETUNNEL_SESSION_ID", &spec.session_id);

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| CoreError::Internal(e.to_string()))?;
    let pid = child.process_id();

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| CoreError::Internal(e.to_string()))?;
    let writer = pair.master.take_writer().map_err(|e| CoreError::Internal(e.to_string()))?;
    let master = pair.master;

    let (tx, rx) = mpsc::channel::<PtyEvent>(256);
    let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();
    let child = Arc::new(Mutex::new(child));
    let pending_bytes = Arc::new(AtomicUsize::new(0));

    if let Some(pid) = pid {
        let _ = tx.blocking_send(PtyEvent::Started { pid });
    }

    let output_tx = tx.clone();
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.blocking_send(PtyEvent::Output(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    std::thread::spawn(move || {
        while let Ok((cols, rows)) = resize_rx.recv() {
            let size = PtySize { cols, rows, pixel_width: 0, pixel_height: 0 };
            let _ = master.resize(size);
        }
    });

    let reaper_child = Arc::clone(&child);
    std::thread::spawn(move || loop {
        let exit_code = {
            let mut guard = match reaper_child.lock() {
                Ok(g) => g,
                Err(_) => break,
            };
            match guard.try_wait() {
                Ok(None) => None,
                Ok(Some(status)) => Some(Some(status.exit_code() as i32)),
                Err(_) => Some(None),
            }
        };
        if let Some(code) = exit_code {
            let _ = tx.blocking_send(PtyEvent::Exited { exit_code: code });
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    });

    Ok((
        PtySupervisor {
            writer: Arc::new(Mutex::new(writer)),
            pending_bytes,
            child,
            resize_tx,
            pid,
        },
        rx,
    ))
}

impl PtySupervisor {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write input bytes to the child's stdin without blocking the caller.
    /// Rejects with `Busy` once more than `WRITE_HIGH_WATERMARK` bytes are
    /// already queued, rather than growing an unbounded buffer (spec §4.2).
    pub fn write_input(&self, bytes: Vec<u8>) -> CoreResult<()> {
        let pending = self.pending_bytes.load(Ordering::Acquire);
        if pending.saturating_add(bytes.len()) > WRITE_HIGH_WATERMARK {
            return Err(CoreError::Busy("pty input buffer full".into()));
        }
        self.pending_bytes.fetch_add(bytes.len(), Ordering::AcqRel);
        let writer = Arc::clone(&self.writer);
        let pending_bytes = Arc::clone(&self.pending_bytes);
        let len = bytes.len();
        std::thread::spawn(move || {
            if let Ok(mut w) = writer.lock() {
                let _ = w.write_all(&bytes);
                let _ = w.flush();
            }
            pending_bytes.fetch_sub(len, Ordering::AcqRel);
        });
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> CoreResult<()> {
        self.resize_tx
            .send((cols, rows))
            .map_err(|_| CoreError::Internal("pty resize channel closed".into()))
    }

    #[cfg(unix)]
    pub fn signal(&self, sig: nix::sys::signal::Signal) -> CoreResult<()> {
        let pid = self.pid.ok_or_else(|| CoreError::Internal("pty has no pid".into()))?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig)
            .map_err(|e| CoreError::Internal(e.to_string()))
    }

    /// SIGTERM, then SIGKILL after a 3s grace period if the process hasn't
    /// exited (spec §4.2). On non-Unix, falls back to a hard kill.
    pub async fn kill(&self) -> CoreResult<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let Some(pid) = self.pid else { return Ok(()) };
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            let child = Arc::clone(&self.child);
            let exited = tokio::task::spawn_blocking(move || {
                let deadline = std::time::Instant::now() + KILL_GRACE;
                loop {
                    if let Ok(mut guard) = child.lock() {
                        if matches!(guard.try_wait(), Ok(Some(_))) {
                            return true;
                        }
                    }
                    if std::time::Instant::now() >= deadline {
                        return false;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            })
            .await
            .unwrap_or(false);
            if !exited {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let mut guard = self
                .child
                .lock()
                .map_err(|_| CoreError::Internal("pty child mutex poisoned".into()))?;
            guard.kill().map_err(CoreError::from)
        }
    }
}
