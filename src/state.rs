// --- Shared state -----------------------------------------------------------
//
// Queue, play history, playback identity and the pending prefetch all live in
// one `RelayState` behind one tokio mutex. HTTP handlers and the orchestrator
// go through `SharedState`; nobody holds the guard across network I/O or a
// subprocess launch.

use serde::Serialize;
use thiserror::Error;
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::encoder::{MANIFEST, MASTER_MANIFEST};

const MAX_FAILURES: usize = 20;

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

/// What is on air right now.
///
/// `encoder_active` is true from a successful launch until the orchestrator
/// has confirmed the process exited or stopped it. `playing_id` is set before
/// the launch and cleared only after that confirmation.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PlaybackState {
    pub playing_id: Option<String>,
    pub is_default: bool,
    pub is_multi_variant: bool,
    pub encoder_active: bool,
    pub encoder_pid: Option<u32>,
    pub session: Option<Uuid>,
    pub started_at: Option<String>,
    /// Preempted and being stopped.
    pub stopping: bool,
    /// Popped from the queue and being fetched; not on air yet.
    pub preparing: Option<String>,
}

impl PlaybackState {
    pub fn clear(&mut self) {
        *self = PlaybackState::default();
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrefetchState {
    InFlight,
    Ready(PathBuf),
    Failed,
}

/// The single background pre-download slot.
pub struct PendingDownload {
    pub url: String,
    pub dest: PathBuf,
    pub outcome: watch::Receiver<PrefetchState>,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

impl PendingDownload {
    pub fn state(&self) -> PrefetchState {
        self.outcome.borrow().clone()
    }

    pub fn in_flight(&self) -> bool {
        self.state() == PrefetchState::InFlight
    }

    /// Cancel the transfer and detach the task; it exits on its own once the
    /// fetcher observes the cancellation.
    pub fn abandon(self) {
        self.cancel.cancel();
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FailedItem {
    pub url: String,
    pub reason: String,
    pub at: String,
}

#[derive(Default)]
pub struct RelayState {
    pub queue: VecDeque<String>,
    pub history: BTreeSet<String>,
    pub playback: PlaybackState,
    pub pending: Option<PendingDownload>,
    pub default_video: Option<PathBuf>,
    /// Set when the encoder cannot run at all (binary missing).
    pub encoder_fault: Option<String>,
    pub failures: VecDeque<FailedItem>,
    pub reject_duplicates: bool,
}

impl RelayState {
    pub fn record_failure(&mut self, url: &str, reason: impl Into<String>) {
        if self.failures.len() >= MAX_FAILURES {
            self.failures.pop_front();
        }
        self.failures.push_back(FailedItem { url: url.to_string(), reason: reason.into(), at: now_rfc3339() });
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Enqueued {
    /// 0-based position in the queue.
    pub position: usize,
    /// The URL was already queued (or is playing).
    pub duplicate: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("URL must not be empty")]
    Empty,
    #[error("URL must start with http:// or https://")]
    NotHttp,
    #[error("URL is already in the queue")]
    Duplicate,
}

#[derive(Clone, Debug, Serialize)]
pub struct PrefetchView {
    pub url: String,
    pub file: String,
    pub state: &'static str,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub queue: Vec<String>,
    pub play_history: Vec<String>,
    pub currently_playing: Option<String>,
    pub preparing: Option<String>,
    pub is_default: bool,
    pub encoder_running: bool,
    pub encoder_pid: Option<u32>,
    pub stopping: bool,
    pub multi_variant: bool,
    pub manifest: &'static str,
    pub session: Option<Uuid>,
    pub started_at: Option<String>,
    pub prefetch: Option<PrefetchView>,
    pub default_ready: bool,
    pub encoder_fault: Option<String>,
    pub recent_failures: Vec<FailedItem>,
}

#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<RelayState>>,
}

impl SharedState {
    pub fn new(reject_duplicates: bool) -> Self {
        Self { inner: Arc::new(Mutex::new(RelayState { reject_duplicates, ..RelayState::default() })) }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.inner.lock().await
    }

    pub async fn enqueue(&self, url: &str) -> Result<Enqueued, EnqueueError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(EnqueueError::Empty);
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(EnqueueError::NotHttp);
        }

        let mut s = self.inner.lock().await;
        let duplicate =
            s.queue.iter().any(|q| q == url) || (s.playback.playing_id.as_deref() == Some(url) && !s.playback.is_default);
        if duplicate && s.reject_duplicates {
            return Err(EnqueueError::Duplicate);
        }
        s.queue.push_back(url.to_string());
        Ok(Enqueued { position: s.queue.len() - 1, duplicate })
    }

    /// Remove every queued occurrence of `url`. Returns how many were removed.
    pub async fn remove(&self, url: &str) -> usize {
        let url = url.trim();
        let mut s = self.inner.lock().await;
        let before = s.queue.len();
        s.queue.retain(|q| q != url);
        before - s.queue.len()
    }

    pub async fn clear(&self) -> usize {
        let mut s = self.inner.lock().await;
        let n = s.queue.len();
        s.queue.clear();
        n
    }

    pub async fn clear_history(&self) -> usize {
        let mut s = self.inner.lock().await;
        let n = s.history.len();
        s.history.clear();
        n
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let s = self.inner.lock().await;
        let p = &s.playback;
        StatusSnapshot {
            queue: s.queue.iter().cloned().collect(),
            play_history: s.history.iter().cloned().collect(),
            currently_playing: p.playing_id.clone(),
            preparing: p.preparing.clone(),
            is_default: p.is_default,
            encoder_running: p.encoder_active,
            encoder_pid: p.encoder_pid,
            stopping: p.stopping,
            multi_variant: p.is_multi_variant,
            manifest: if p.is_multi_variant { MASTER_MANIFEST } else { MANIFEST },
            session: p.session,
            started_at: p.started_at.clone(),
            prefetch: s.pending.as_ref().map(|d| PrefetchView {
                url: d.url.clone(),
                file: d.dest.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
                state: match d.state() {
                    PrefetchState::InFlight => "in_flight",
                    PrefetchState::Ready(_) => "ready",
                    PrefetchState::Failed => "failed",
                },
            }),
            default_ready: s.default_video.is_some(),
            encoder_fault: s.encoder_fault.clone(),
            recent_failures: s.failures.iter().cloned().collect(),
        }
    }
}
