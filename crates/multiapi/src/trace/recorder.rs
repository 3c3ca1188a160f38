use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{TraceEntry, TraceError, TraceKind};
use crate::registry::TraceMirror;

/// Entries waiting for the mirror before new ones are dropped
const MIRROR_QUEUE: usize = 1024;

/// Most entries handed to the mirror in one call
const MIRROR_BATCH: usize = 256;

/// Public view of the open debug session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub log_file: PathBuf,
}

struct SessionSink {
    file: File,
    /// Fed in file order; dropped when the session closes
    mirror: Option<mpsc::Sender<TraceEntry>>,
}

struct DebugSession {
    info: SessionInfo,
    started: Instant,
    /// Appends are serialized through this lock so concurrent records never interleave
    sink: Mutex<SessionSink>,
    mirror_writer: Mutex<Option<JoinHandle<()>>>,
}

impl DebugSession {
    async fn append(&self, entry: TraceEntry) -> Result<(), TraceError> {
        let mut line =
            serde_json::to_vec(&entry).map_err(|e| TraceError::Write(e.to_string()))?;
        line.push(b'\n');

        let mut sink = self.sink.lock().await;
        sink.file
            .write_all(&line)
            .await
            .map_err(|e| TraceError::Write(e.to_string()))?;
        sink.file
            .flush()
            .await
            .map_err(|e| TraceError::Write(e.to_string()))?;

        if let Some(mirror) = &sink.mirror {
            match mirror.try_send(entry) {
                Ok(()) => {}
                Err(TrySendError::Full(entry)) => tracing::warn!(
                    kind = entry.kind_name(),
                    "Mirror queue full, entry kept in trace file only"
                ),
                Err(TrySendError::Closed(_)) => {}
            }
        }
        Ok(())
    }

    /// Append `end`, then wait until the mirror has taken every queued entry
    async fn close(&self, end: TraceEntry) {
        if let Err(e) = self.append(end).await {
            tracing::warn!(error = %e, "Failed to write session end");
        }
        self.sink.lock().await.mirror.take();

        if let Some(writer) = self.mirror_writer.lock().await.take() {
            if let Err(e) = writer.await {
                tracing::warn!(error = %e, "Trace mirror writer stopped abnormally");
            }
        }
    }
}

/// Hand queued entries to `mirror` in batches until the session closes the queue
async fn drain_mirror(mirror: Arc<dyn TraceMirror>, mut queue: mpsc::Receiver<TraceEntry>) {
    let mut batch = Vec::with_capacity(MIRROR_BATCH);
    while queue.recv_many(&mut batch, MIRROR_BATCH).await > 0 {
        if let Err(e) = mirror.append_traces(&batch).await {
            tracing::warn!(
                entries = batch.len(),
                error = %e,
                "Failed to mirror trace entries to store"
            );
        }
        batch.clear();
    }
}

/// Append-only trace sink, live only while a debug session is open.
///
/// The trace file is written inline. The optional mirror is fed through a
/// bounded queue drained by a per-session task, so a slow mirror never
/// holds up the exchange being traced.
pub struct TraceRecorder {
    logs_dir: PathBuf,
    mirror: Option<Arc<dyn TraceMirror>>,
    session: RwLock<Option<Arc<DebugSession>>>,
}

impl TraceRecorder {
    pub fn new(logs_dir: impl Into<PathBuf>, mirror: Option<Arc<dyn TraceMirror>>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            mirror,
            session: RwLock::new(None),
        }
    }

    pub async fn is_active(&self) -> bool {
        self.session.read().await.is_some()
    }

    pub async fn session_info(&self) -> Option<SessionInfo> {
        self.session.read().await.as_ref().map(|s| s.info.clone())
    }

    /// Open a new session file and write its `session_start` entry.
    ///
    /// Beginning while a session is already open returns the open session.
    pub async fn begin(&self) -> Result<SessionInfo, TraceError> {
        let mut slot = self.session.write().await;
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.info.clone());
        }

        tokio::fs::create_dir_all(&self.logs_dir).await.map_err(|e| {
            TraceError::Init(format!(
                "cannot create {}: {}",
                self.logs_dir.display(),
                e
            ))
        })?;

        let started_at = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!(
            "{}-{}",
            started_at.format("%Y-%m-%dT%H-%M-%S-%3f"),
            &suffix[..8]
        );
        let log_file = self.logs_dir.join(format!("debug_session_{id}.json"));

        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&log_file)
            .await
            .map_err(|e| TraceError::Init(format!("cannot create {}: {}", log_file.display(), e)))?;

        let (mirror_tx, mirror_writer) = match &self.mirror {
            Some(mirror) => {
                let (tx, rx) = mpsc::channel(MIRROR_QUEUE);
                (Some(tx), Some(tokio::spawn(drain_mirror(Arc::clone(mirror), rx))))
            }
            None => (None, None),
        };

        let session = Arc::new(DebugSession {
            info: SessionInfo {
                id: id.clone(),
                started_at,
                log_file,
            },
            started: Instant::now(),
            sink: Mutex::new(SessionSink {
                file,
                mirror: mirror_tx,
            }),
            mirror_writer: Mutex::new(mirror_writer),
        });

        let start = TraceEntry {
            timestamp: started_at,
            kind: TraceKind::SessionStart {
                session_id: id,
                message: "Debug mode enabled".to_string(),
            },
        };
        session
            .append(start)
            .await
            .map_err(|e| TraceError::Init(e.to_string()))?;

        tracing::info!(
            session = %session.info.id,
            file = %session.info.log_file.display(),
            "Debug session started"
        );

        let info = session.info.clone();
        *slot = Some(session);
        Ok(info)
    }

    /// Append one entry; a no-op when no session is open.
    ///
    /// Write failures are logged and swallowed.
    pub async fn record(&self, entry: TraceEntry) {
        let slot = self.session.read().await;
        let Some(session) = slot.as_ref() else {
            return;
        };
        let kind = entry.kind_name();
        if let Err(e) = session.append(entry).await {
            tracing::warn!(kind, error = %e, "Trace entry dropped");
        }
    }

    /// Write `session_end` and close the session; returns its elapsed time.
    ///
    /// Returns once the mirror has received every entry of the session.
    /// Ending without an open session is a no-op.
    pub async fn end(&self) -> Option<Duration> {
        let session = self.session.write().await.take()?;

        let elapsed = session.started.elapsed();
        session
            .close(TraceEntry::now(TraceKind::SessionEnd {
                session_id: session.info.id.clone(),
                duration_secs: elapsed.as_secs(),
                duration: format!("{}s", elapsed.as_secs()),
                message: "Debug mode disabled".to_string(),
            }))
            .await;

        tracing::info!(
            session = %session.info.id,
            elapsed_secs = elapsed.as_secs(),
            "Debug session ended"
        );
        Some(elapsed)
    }
}
