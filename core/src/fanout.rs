//! Stream Fan-out (spec §4.5): the text-stream plane (chunked HTTP, one
//! reader per subscriber with a byte cursor into the journal) and the
//! buffer-snapshot plane (binary frames multiplexed over a single `/ws/buffers`
//! connection, coalesced to ~30Hz per session).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, Mutex};
use tokio::time::MissedTickBehavior;

use crate::error::{CoreError, CoreResult};
use crate::journal::Journal;
use crate::session::{OutputChunk, SessionId};
use crate::snapshot::{encode_frame, ScreenParser};

/// A subscriber reattaching to a session's text stream starts from one of
/// these cursors (spec §4.5).
#[derive(Debug, Clone, Copy)]
pub enum Cursor {
    Start,
    End,
    Offset(u64),
}

/// Per-subscriber disconnect threshold: if a reader falls this far behind
/// the journal's write position, it is dropped rather than let its backlog
/// grow without bound.
const TEXT_STREAM_HIGH_WATERMARK: u64 = 1024 * 1024;

/// One subscriber's view of a session's text stream. `next_chunk` yields
/// catch-up bytes from the journal first, then live bytes from the
/// broadcast channel, reporting `Busy` once it has fallen more than
/// `TEXT_STREAM_HIGH_WATERMARK` bytes behind.
///
/// Every `OutputChunk` on the live channel is tagged with its absolute
/// offset in the session's output byte stream, so a chunk already covered
/// by a catch-up read (queued in the broadcast channel before the reader
/// caught up to it) is recognized and dropped instead of replayed — the
/// exactly-once guarantee does not depend on subscribing after catch-up.
pub struct TextStreamReader {
    journal: Arc<Journal>,
    live: broadcast::Receiver<OutputChunk>,
    cursor: u64,
}

impl TextStreamReader {
    pub async fn attach(
        journal: Arc<Journal>,
        live: broadcast::Receiver<OutputChunk>,
        cursor: Cursor,
    ) -> CoreResult<Self> {
        let offset = match cursor {
            Cursor::Start => 0,
            Cursor::End => journal.current_output_len().await?,
            Cursor::Offset(o) => o,
        };
        Ok(Self { journal, live, cursor: offset })
    }

    /// Next chunk of output bytes, or `None` once the live channel closes
    /// (the session has exited and no more data will ever arrive).
    pub async fn next_chunk(&mut self) -> CoreResult<Option<Bytes>> {
        let backlog = self.journal.current_output_len().await?.saturating_sub(self.cursor);
        if backlog > TEXT_STREAM_HIGH_WATERMARK {
            return Err(CoreError::Busy("subscriber fell too far behind".into()));
        }
        if backlog > 0 {
            let bytes = self.journal.read_output_from(self.cursor).await?;
            self.cursor += bytes.len() as u64;
            if !bytes.is_empty() {
                return Ok(Some(Bytes::from(bytes)));
            }
        }
        loop {
            match self.live.recv().await {
                Ok(chunk) => {
                    let chunk_end = chunk.offset + chunk.bytes.len() as u64;
                    if chunk_end <= self.cursor {
                        // Already delivered via the catch-up read above.
                        continue;
                    }
                    let start = self.cursor.saturating_sub(chunk.offset) as usize;
                    self.cursor = chunk_end;
                    return Ok(Some(chunk.bytes.slice(start..)));
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Jump the cursor to the journal's current end and let
                    // the next catch-up read resync; safe because the
                    // journal itself never misses writes.
                    self.cursor = self.journal.current_output_len().await?;
                    return Ok(Some(Bytes::new()));
                }
            }
        }
    }
}

/// Coalescing interval for the buffer-snapshot plane (spec §4.5: ~30Hz).
const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(33);

struct SnapshotWorker {
    parser: ScreenParser,
}

/// Multiplexes buffer-snapshot frames for every registered session onto a
/// single outbound channel, as consumed by the `/ws/buffers` handler. One
/// `BufferFanout` is shared process-wide.
pub struct BufferFanout {
    sessions: Mutex<HashMap<String, SnapshotWorker>>,
    out_tx: broadcast::Sender<Bytes>,
}

const BUFFER_FANOUT_CAP: usize = 256;

impl BufferFanout {
    pub fn new() -> Self {
        let (out_tx, _) = broadcast::channel(BUFFER_FANOUT_CAP);
        Self { sessions: Mutex::new(HashMap::new()), out_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.out_tx.subscribe()
    }

    /// Register a session's initial geometry. Call once per session, before
    /// `feed`.
    pub async fn register(&self, id: SessionId, cols: u16, rows: u16) {
        self.sessions
            .lock()
            .await
            .insert(id.to_string(), SnapshotWorker { parser: ScreenParser::new(cols, rows) });
    }

    pub async fn unregister(&self, id: &SessionId) {
        self.sessions.lock().await.remove(&id.to_string());
    }

    pub async fn resize(&self, id: &SessionId, cols: u16, rows: u16) {
        if let Some(worker) = self.sessions.lock().await.get_mut(&id.to_string()) {
            worker.parser.resize(cols, rows);
        }
    }

    /// Feed raw PTY output into a session's parser. Does not itself emit a
    /// frame — emission happens on the fixed `SNAPSHOT_INTERVAL` tick, so
    /// bursts of output coalesce into one frame per tick.
    pub async fn feed(&self, id: &SessionId, bytes: &[u8]) {
        if let Some(worker) = self.sessions.lock().await.get_mut(&id.to_string()) {
            worker.parser.feed(bytes);
        }
    }

    /// Run the coalescing loop: every tick, emit one frame per session whose
    /// screen changed since the last tick. Intended to be spawned once as a
    /// long-lived task.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let mut sessions = self.sessions.lock().await;
            for (id, worker) in sessions.iter_mut() {
                if worker.parser.take_dirty() {
                    let snap = worker.parser.snapshot();
                    let frame = encode_frame(id, &snap);
                    let _ = self.out_tx.send(Bytes::from(frame));
                }
            }
        }
    }
}

impl Default for BufferFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_stream_reader_replays_then_follows_live() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(
            crate::journal::Journal::create(
                dir.path(),
                "s1",
                crate::journal::JournalHeader {
                    version: 2,
                    command: vec!["/bin/sh".into()],
                    working_dir: "/tmp".into(),
                    cols: 80,
                    rows: 24,
                    created_at: "2026-01-01T00:00:00Z".into(),
                },
            )
            .await
            .unwrap(),
        );
        journal.append_output(b"hello ").await.unwrap();
        let (tx, rx) = broadcast::channel(16);
        let mut reader = TextStreamReader::attach(Arc::clone(&journal), rx, Cursor::Start).await.unwrap();
        let first = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(&first[..], b"hello ");
        tx.send(OutputChunk { offset: 6, bytes: Bytes::from_static(b"world") }).unwrap();
        let second = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(&second[..], b"world");
    }

    #[tokio::test]
    async fn text_stream_reader_does_not_double_emit_overlap_with_catch_up() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(
            crate::journal::Journal::create(
                dir.path(),
                "s1",
                crate::journal::JournalHeader {
                    version: 2,
                    command: vec!["/bin/sh".into()],
                    working_dir: "/tmp".into(),
                    cols: 80,
                    rows: 24,
                    created_at: "2026-01-01T00:00:00Z".into(),
                },
            )
            .await
            .unwrap(),
        );
        // Simulate the race: the subscriber's broadcast receiver is created
        // (like `subscribe_output` is called before `attach`) before catch-up
        // runs, so output written and broadcast in that window is queued in
        // `live` *and* already reflected in the journal's output length by
        // the time the reader's first catch-up read runs.
        let (tx, rx) = broadcast::channel(16);
        journal.append_output(b"hello ").await.unwrap();
        tx.send(OutputChunk { offset: 0, bytes: Bytes::from_static(b"hello ") }).unwrap();
        journal.append_output(b"world").await.unwrap();
        tx.send(OutputChunk { offset: 6, bytes: Bytes::from_static(b"world") }).unwrap();
        drop(tx);

        let mut reader = TextStreamReader::attach(Arc::clone(&journal), rx, Cursor::Start).await.unwrap();
        let mut seen = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            seen.extend_from_slice(&chunk);
        }
        assert_eq!(seen, b"hello world");
    }

    #[tokio::test]
    async fn buffer_fanout_emits_nothing_before_feed() {
        let fanout = BufferFanout::new();
        let id = SessionId::new();
        fanout.register(id, 10, 2).await;
        let mut rx = fanout.subscribe();
        fanout.feed(&id, b"hi").await;
        // Draining without running the coalescing loop should not panic and
        // should simply time out with nothing received yet.
        let res = tokio::time::timeout(Duration::from_millis(10), rx.recv()).await;
        assert!(res.is_err());
    }
}
