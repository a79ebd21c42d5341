// --- Playback orchestrator --------------------------------------------------
//
// One long-lived task decides, once per iteration, what should be on air:
//
//   encoder running, admin item, queue non-empty  -> prefetch the queue head
//   encoder running, default video, queue non-empty -> stop default, re-check now
//   encoder running otherwise                       -> steady, wait
//   encoder exited                                  -> record history, clear
//   encoder idle, queue non-empty                   -> pop head, fetch, play once
//   encoder idle, queue empty, default ready        -> loop the default video
//   encoder idle, nothing available                 -> idle, wait
//
// The admin queue always outranks the default video. A failed download is
// dropped, never requeued. Any error or panic inside an iteration stops the
// encoder, resets transient state and restarts the loop after a cooldown.

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::encoder::{Encoder, EncoderStatus, ExitInfo};
use crate::error::{EncoderStartError, FetchError};
use crate::fetcher::{cache_filename, Fetcher};
use crate::state::{now_rfc3339, PendingDownload, PrefetchState, RelayState, SharedState};

/// How long to sleep before the next iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pace {
    Immediate,
    Transition,
    /// Encoder running; also wakes early when it exits.
    Steady,
    Idle,
    Cooldown,
}

/// Loop-local bookkeeping that does not belong in shared state.
#[derive(Default)]
struct LoopCtx {
    /// Default video is skipped until this instant after it failed to play.
    default_hold: Option<Instant>,
    default_fetch: Option<JoinHandle<()>>,
}

impl LoopCtx {
    fn default_held(&self) -> bool {
        self.default_hold.is_some_and(|until| Instant::now() < until)
    }
}

pub struct Orchestrator {
    cfg: OrchestratorConfig,
    state: SharedState,
    fetcher: Arc<dyn Fetcher>,
    encoder: Arc<dyn Encoder>,
    shutdown: CancellationToken,
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

impl Orchestrator {
    pub fn new(
        cfg: OrchestratorConfig,
        state: SharedState,
        fetcher: Arc<dyn Fetcher>,
        encoder: Arc<dyn Encoder>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { cfg, state, fetcher, encoder, shutdown }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        info!("orchestrator started (video dir {})", self.cfg.video_dir.display());
        let mut ctx = LoopCtx { default_fetch: Some(self.spawn_default_fetch()), ..LoopCtx::default() };

        while !self.shutdown.is_cancelled() {
            let pace = match AssertUnwindSafe(self.tick(&mut ctx)).catch_unwind().await {
                Ok(Ok(pace)) => pace,
                Ok(Err(e)) => {
                    error!("orchestrator iteration failed: {e:#}");
                    self.recover().await;
                    Pace::Cooldown
                }
                Err(panic) => {
                    error!("orchestrator iteration panicked: {}", panic_message(panic.as_ref()));
                    self.recover().await;
                    Pace::Cooldown
                }
            };
            self.pause(pace).await;
        }

        info!("orchestrator shutting down");
        if let Some(task) = ctx.default_fetch.take() {
            task.abort();
        }
        let pending = self.state.lock().await.pending.take();
        if let Some(p) = pending {
            p.abandon();
        }
        self.encoder.stop().await;
        self.state.lock().await.playback.clear();
        info!("orchestrator stopped");
    }

    async fn pause(&self, pace: Pace) {
        let dur = match pace {
            Pace::Immediate => return,
            Pace::Transition => self.cfg.pace_transition,
            Pace::Steady => self.cfg.pace_steady,
            Pace::Idle => self.cfg.pace_idle,
            Pace::Cooldown => self.cfg.cooldown,
        };
        let wake_on_exit = pace == Pace::Steady;
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(dur) => {}
            _ = self.encoder.wait_exit(), if wake_on_exit => {}
        }
    }

    /// Defensive cleanup after a failed iteration.
    async fn recover(&self) {
        warn!("orchestrator recovering: stopping encoder and resetting state");
        if let Err(panic) = AssertUnwindSafe(self.encoder.stop()).catch_unwind().await {
            error!("encoder stop panicked during recovery: {}", panic_message(panic.as_ref()));
        }
        let mut s = self.state.lock().await;
        s.playback.clear();
        if let Some(p) = s.pending.take() {
            p.abandon();
        }
        warn!("orchestrator restarting in {:?}", self.cfg.cooldown);
    }

    fn cache_path(&self, url: &str) -> PathBuf {
        self.cfg.video_dir.join(cache_filename(url))
    }

    fn spawn_default_fetch(&self) -> JoinHandle<()> {
        let fetcher = self.fetcher.clone();
        let state = self.state.clone();
        let shutdown = self.shutdown.clone();
        let url = self.cfg.default_url.clone();
        let dest = self.cfg.video_dir.join(&self.cfg.default_filename);
        let retry = self.cfg.default_retry;

        tokio::spawn(async move {
            info!("fetching default video: {url}");
            loop {
                match fetcher.fetch(&url, &dest, &shutdown).await {
                    Ok(path) => {
                        info!("default video ready: {}", path.display());
                        state.lock().await.default_video = Some(path);
                        return;
                    }
                    Err(FetchError::Cancelled) => return,
                    Err(e) => warn!("default video unavailable ({e}); running queue-only, retrying in {retry:?}"),
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(retry) => {}
                }
            }
        })
    }

    async fn tick(&self, ctx: &mut LoopCtx) -> anyhow::Result<Pace> {
        match self.encoder.poll().await {
            EncoderStatus::Running => self.while_running().await,
            EncoderStatus::Exited(info) => {
                self.on_exit(ctx, info).await;
                self.select_next(ctx).await
            }
            EncoderStatus::Idle => self.select_next(ctx).await,
        }
    }

    async fn while_running(&self) -> anyhow::Result<Pace> {
        let mut s = self.state.lock().await;
        let head = s.queue.front().cloned();

        if s.playback.is_default {
            if head.is_none() {
                return Ok(Pace::Steady);
            }
            info!("queue has items; preempting the default video");
            s.playback.stopping = true;
            drop(s);

            self.encoder.stop().await;
            self.state.lock().await.playback.clear();
            return Ok(Pace::Immediate);
        }

        if let Some(head) = head {
            self.ensure_prefetch(&mut s, &head);
        }
        Ok(Pace::Steady)
    }

    /// Start a background download of `head` unless one was already
    /// attempted for it, or another download is still in flight.
    fn ensure_prefetch(&self, s: &mut RelayState, head: &str) {
        match &s.pending {
            Some(p) if p.url == head => return,
            Some(p) if p.in_flight() => return,
            _ => {}
        }
        if let Some(old) = s.pending.take() {
            old.abandon();
        }

        let dest = self.cache_path(head);
        let cancel = self.shutdown.child_token();
        let (tx, rx) = watch::channel(PrefetchState::InFlight);

        let fetcher = self.fetcher.clone();
        let url = head.to_string();
        let task_dest = dest.clone();
        let task_cancel = cancel.clone();
        debug!("prefetch start: {url}");
        let task = tokio::spawn(async move {
            let outcome = match fetcher.fetch(&url, &task_dest, &task_cancel).await {
                Ok(path) => {
                    info!("prefetch ready: {url}");
                    PrefetchState::Ready(path)
                }
                Err(e) => {
                    warn!("prefetch failed ({url}): {e}");
                    PrefetchState::Failed
                }
            };
            let _ = tx.send(outcome);
        });

        s.pending = Some(PendingDownload { url: head.to_string(), dest, outcome: rx, cancel, task });
    }

    async fn on_exit(&self, ctx: &mut LoopCtx, info: ExitInfo) {
        // Clears the tracked handle; the process is already gone.
        self.encoder.stop().await;

        let mut s = self.state.lock().await;
        let playback = std::mem::take(&mut s.playback);
        let Some(id) = playback.playing_id else {
            return;
        };

        if playback.is_default {
            if !info.success && !info.requested {
                warn!("default video encoder failed; holding default for {:?}", self.cfg.cooldown);
                ctx.default_hold = Some(Instant::now() + self.cfg.cooldown);
            }
            return;
        }

        if info.success || info.requested || !info.early {
            info!("finished: {id}");
            s.history.insert(id);
        } else {
            warn!("could not play {id}: encoder exited immediately (code {:?})", info.code);
            s.record_failure(&id, format!("encoder exited immediately (code {:?})", info.code));
        }
    }

    async fn select_next(&self, ctx: &mut LoopCtx) -> anyhow::Result<Pace> {
        let mut s = self.state.lock().await;

        if s.encoder_fault.is_some() {
            return Ok(Pace::Idle);
        }

        if let Some(url) = s.queue.pop_front() {
            info!("next from queue: {url}");
            let matched = if s.pending.as_ref().is_some_and(|p| p.url == url) { s.pending.take() } else { None };

            // A prefetch for something no longer queued is stale.
            if s.pending.as_ref().is_some_and(|p| !s.queue.contains(&p.url)) {
                if let Some(stale) = s.pending.take() {
                    debug!("discarding stale prefetch: {}", stale.url);
                    stale.abandon();
                }
            }
            s.playback.preparing = Some(url.clone());
            drop(s);

            let fetched = self.resolve(&url, matched).await;
            self.state.lock().await.playback.preparing = None;

            return match fetched {
                Ok(path) => self.launch(ctx, &url, path, false).await,
                Err(FetchError::Cancelled) => Ok(Pace::Immediate),
                Err(e) => {
                    warn!("skipping {url}: {e}");
                    self.state.lock().await.record_failure(&url, e.to_string());
                    Ok(Pace::Transition)
                }
            };
        }

        let default = match &s.default_video {
            Some(path) if !ctx.default_held() => path.clone(),
            _ => return Ok(Pace::Idle),
        };
        drop(s);

        info!("queue empty; looping the default video");
        let url = self.cfg.default_url.clone();
        self.launch(ctx, &url, default, true).await
    }

    /// Local file for `url`: a matching ready prefetch, else an inline fetch.
    async fn resolve(&self, url: &str, matched: Option<PendingDownload>) -> Result<PathBuf, FetchError> {
        if let Some(mut pending) = matched {
            if pending.in_flight() {
                debug!("waiting up to {:?} for prefetch of {url}", self.cfg.prefetch_wait);
                let settled = async {
                    let _ = pending.outcome.wait_for(|st| *st != PrefetchState::InFlight).await;
                };
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    _ = tokio::time::timeout(self.cfg.prefetch_wait, settled) => {}
                }
            }

            let state = pending.state();
            if let PrefetchState::Ready(path) = &state {
                if tokio::fs::metadata(path).await.is_ok_and(|m| m.len() > 0) {
                    info!("using prefetched file for {url}");
                    return Ok(path.clone());
                }
            }
            match state {
                PrefetchState::InFlight => {
                    warn!("prefetch of {url} not ready in time; fetching inline");
                    pending.cancel.cancel();
                    if tokio::time::timeout(Duration::from_secs(1), &mut pending.task).await.is_err() {
                        pending.task.abort();
                    }
                }
                PrefetchState::Failed => info!("prefetch of {url} had failed; retrying inline"),
                PrefetchState::Ready(_) => warn!("prefetched file for {url} vanished; fetching inline"),
            }
        }

        if self.shutdown.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        self.fetcher.fetch(url, &self.cache_path(url), &self.shutdown).await
    }

    async fn launch(&self, ctx: &mut LoopCtx, url: &str, path: PathBuf, is_default: bool) -> anyhow::Result<Pace> {
        {
            let mut s = self.state.lock().await;
            s.playback.clear();
            s.playback.playing_id = Some(url.to_string());
            s.playback.is_default = is_default;
            s.playback.session = Some(Uuid::new_v4());
            s.playback.started_at = Some(now_rfc3339());
        }

        match self.encoder.start(&path, is_default).await {
            Ok(launch) => {
                let mut s = self.state.lock().await;
                s.playback.encoder_active = true;
                s.playback.encoder_pid = launch.pid;
                s.playback.is_multi_variant = launch.multi_variant;
                if is_default {
                    info!("on air: default video (loop)");
                } else {
                    info!("on air: {url}");
                }
                Ok(Pace::Transition)
            }
            Err(e) => {
                let mut s = self.state.lock().await;
                s.playback.clear();
                if e.is_fatal() {
                    error!("{e}; playback disabled until the encoder is installed (HTTP stays up)");
                    s.encoder_fault = Some(e.to_string());
                    if !is_default {
                        s.queue.push_front(url.to_string());
                    }
                } else if is_default {
                    warn!("default video failed to start: {e}");
                    ctx.default_hold = Some(Instant::now() + self.cfg.cooldown);
                    if matches!(e, EncoderStartError::InputMissing(_)) {
                        s.default_video = None;
                        let refetch = ctx.default_fetch.as_ref().map_or(true, |t| t.is_finished());
                        if refetch {
                            ctx.default_fetch = Some(self.spawn_default_fetch());
                        }
                    }
                } else {
                    warn!("could not play {url}: {e}");
                    s.record_failure(url, e.to_string());
                }
                Ok(Pace::Transition)
            }
        }
    }
}
