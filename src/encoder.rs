// --- Encoder supervisor -----------------------------------------------------
//
// Owns the single ffmpeg process that turns a local video file into a live
// HLS segment set. At most one process is tracked at any time: `start` stops
// whatever is running before launching, and both paths hold the same lock.
//
// Each child is owned by a reaper task that blocks on `wait()` and publishes
// the exit through a watch channel, so exit detection never busy-polls the
// process. The reaper is also the only place that signals the child, which
// keeps the `Child` handle single-owner.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EncoderConfig;
use crate::error::EncoderStartError;

pub const MANIFEST: &str = "stream.m3u8";
pub const MASTER_MANIFEST: &str = "master.m3u8";

const STDERR_TAIL: usize = 40;

const NOTEWORTHY: &[&str] = &[
    "error",
    "fail",
    "invalid",
    "warning",
    "could not",
    "unable",
    "no such",
    "not found",
    "denied",
    "corrupt",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
    /// Exited on its own within the early-exit window after launch.
    pub early: bool,
    /// Exit followed a stop request from us.
    pub requested: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncoderStatus {
    /// Nothing tracked.
    Idle,
    Running,
    /// Tracked process has exited; `stop` clears it.
    Exited(ExitInfo),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncoderLaunch {
    pub pid: Option<u32>,
    pub multi_variant: bool,
}

#[async_trait]
pub trait Encoder: Send + Sync {
    /// Launch a new encode of `input`, stopping any tracked process first.
    async fn start(&self, input: &Path, looped: bool) -> Result<EncoderLaunch, EncoderStartError>;

    /// Stop and forget the tracked process. Safe to call when nothing runs.
    async fn stop(&self);

    /// Non-blocking liveness check.
    async fn poll(&self) -> EncoderStatus;

    /// Resolves once the tracked process exits. Never resolves when nothing
    /// is tracked.
    async fn wait_exit(&self);
}

/// Whether an ffmpeg stderr line is worth surfacing in the operator log.
pub fn is_noteworthy(line: &str) -> bool {
    let lc = line.to_ascii_lowercase();
    NOTEWORTHY.iter().any(|k| lc.contains(k))
}

/// Build the ffmpeg argument list for one playback attempt.
pub fn build_args(cfg: &EncoderConfig, input: &Path, looped: bool) -> Vec<String> {
    let out = &cfg.output_dir;
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into(), "-re".into()];
    if looped {
        args.extend(["-stream_loop".into(), "-1".into()]);
    }
    args.extend(["-i".into(), input.to_string_lossy().into_owned()]);

    let mut flags = String::from("delete_segments+omit_endlist+program_date_time");

    if cfg.ladder.is_empty() {
        // Single rendition: pass video through untouched, normalize audio.
        args.extend(
            ["-c:v", "copy", "-c:a", "aac", "-b:a", "128k", "-ac", "2", "-ar", "44100"]
                .into_iter()
                .map(String::from),
        );
    } else {
        let n = cfg.ladder.len();
        let mut graph = format!("[0:v]split={n}");
        for i in 0..n {
            graph.push_str(&format!("[s{i}]"));
        }
        for (i, tier) in cfg.ladder.iter().enumerate() {
            graph.push_str(&format!(";[s{i}]scale=-2:{}[v{i}]", tier.height));
        }
        args.extend(["-filter_complex".into(), graph]);

        for (i, tier) in cfg.ladder.iter().enumerate() {
            args.extend([
                "-map".into(),
                format!("[v{i}]"),
                format!("-c:v:{i}"),
                "libx264".into(),
                format!("-b:v:{i}"),
                format!("{}k", tier.video_kbps),
                format!("-maxrate:v:{i}"),
                format!("{}k", tier.video_kbps + tier.video_kbps / 10),
                format!("-bufsize:v:{i}"),
                format!("{}k", tier.video_kbps * 2),
            ]);
        }
        for (i, tier) in cfg.ladder.iter().enumerate() {
            args.extend([
                "-map".into(),
                "0:a:0?".into(),
                format!("-c:a:{i}"),
                "aac".into(),
                format!("-b:a:{i}"),
                format!("{}k", tier.audio_kbps),
            ]);
        }
        // Aligned keyframes so every rendition cuts segments at the same time.
        args.extend([
            "-preset".into(),
            "veryfast".into(),
            "-sc_threshold".into(),
            "0".into(),
            "-force_key_frames".into(),
            format!("expr:gte(t,n_forced*{})", cfg.segment_secs),
            "-ac".into(),
            "2".into(),
            "-ar".into(),
            "44100".into(),
        ]);
        flags.push_str("+independent_segments");
    }

    args.extend([
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        cfg.segment_secs.to_string(),
        "-hls_list_size".into(),
        cfg.window.to_string(),
        "-hls_flags".into(),
        flags,
    ]);

    if cfg.ladder.is_empty() {
        args.extend([
            "-hls_segment_filename".into(),
            out.join("segment%05d.ts").to_string_lossy().into_owned(),
            out.join(MANIFEST).to_string_lossy().into_owned(),
        ]);
    } else {
        let map = (0..cfg.ladder.len())
            .map(|i| format!("v:{i},a:{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        args.extend([
            "-master_pl_name".into(),
            MASTER_MANIFEST.into(),
            "-var_stream_map".into(),
            map,
            "-hls_segment_filename".into(),
            out.join("v%v").join("segment%05d.ts").to_string_lossy().into_owned(),
            out.join("v%v").join(MANIFEST).to_string_lossy().into_owned(),
        ]);
    }
    args
}

fn is_stream_artifact(name: &str) -> bool {
    name.ends_with(".ts") || name.ends_with(".m3u8") || name.ends_with(".tmp")
}

fn is_variant_dir(name: &str) -> bool {
    name.len() > 1 && name.starts_with('v') && name[1..].chars().all(|c| c.is_ascii_digit())
}

async fn remove_artifacts(dir: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await?.is_file() && is_stream_artifact(&name) {
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("could not remove stale segment {}: {e}", entry.path().display()),
            }
        }
    }
    Ok(removed)
}

/// Remove manifests and segments left over from a previous encode, in the
/// output directory and its variant sub-directories. Other files are kept.
pub async fn clear_output(dir: &Path) -> std::io::Result<usize> {
    tokio::fs::create_dir_all(dir).await?;
    let mut removed = remove_artifacts(dir).await?;

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await?.is_dir() && is_variant_dir(&name) {
            removed += remove_artifacts(&entry.path()).await?;
        }
    }
    Ok(removed)
}

enum Control {
    Terminate,
    Kill,
}

struct Tracked {
    pid: Option<u32>,
    input: PathBuf,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    control: mpsc::UnboundedSender<Control>,
    reaper: JoinHandle<()>,
}

impl Tracked {
    fn status(&self) -> EncoderStatus {
        if let Some(info) = *self.exit_rx.borrow() {
            return EncoderStatus::Exited(info);
        }
        if self.reaper.is_finished() {
            // Reaper went away without reporting; treat as an unknown exit.
            return EncoderStatus::Exited(ExitInfo { code: None, success: false, early: false, requested: false });
        }
        EncoderStatus::Running
    }
}

pub struct FfmpegSupervisor {
    cfg: EncoderConfig,
    shutdown: CancellationToken,
    tracked: tokio::sync::Mutex<Option<Tracked>>,
}

impl FfmpegSupervisor {
    pub fn new(cfg: EncoderConfig, shutdown: CancellationToken) -> Self {
        Self { cfg, shutdown, tracked: tokio::sync::Mutex::new(None) }
    }

    pub fn multi_variant(&self) -> bool {
        !self.cfg.ladder.is_empty()
    }

    /// Manifest viewers should load, relative to the output directory.
    pub fn manifest_name(&self) -> &'static str {
        if self.multi_variant() {
            MASTER_MANIFEST
        } else {
            MANIFEST
        }
    }

    async fn prepare_output(&self) {
        match clear_output(&self.cfg.output_dir).await {
            Ok(0) => {}
            Ok(n) => debug!("removed {n} stale stream files"),
            Err(e) => warn!("could not clean stream output dir {}: {e}", self.cfg.output_dir.display()),
        }
        for i in 0..self.cfg.ladder.len() {
            let dir = self.cfg.output_dir.join(format!("v{i}"));
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                warn!("could not create variant dir {}: {e}", dir.display());
            }
        }
    }
}

async fn wait_for_exit(rx: &mut watch::Receiver<Option<ExitInfo>>) {
    // An Err means the reaper is gone, which also means the child is gone.
    let _ = rx.wait_for(|s| s.is_some()).await;
}

async fn stop_tracked(mut t: Tracked, grace: Duration) {
    if let EncoderStatus::Exited(info) = t.status() {
        debug!("encoder (pid {:?}) already exited: {info:?}", t.pid);
        return;
    }

    info!("stopping encoder (pid {:?}, input {})", t.pid, t.input.display());
    let _ = t.control.send(Control::Terminate);
    if tokio::time::timeout(grace, wait_for_exit(&mut t.exit_rx)).await.is_ok() {
        info!("encoder stopped (terminate)");
        return;
    }

    warn!("encoder did not exit within {grace:?} of SIGTERM; killing");
    let _ = t.control.send(Control::Kill);
    match tokio::time::timeout(grace, wait_for_exit(&mut t.exit_rx)).await {
        Ok(()) => info!("encoder stopped (kill)"),
        Err(_) => {
            // Dropping the child inside the reaper kills it again and tokio
            // reaps it in the background.
            error!("encoder (pid {:?}) still alive after kill; abandoning handle", t.pid);
            t.reaper.abort();
        }
    }
}

fn send_terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain kill(2) on a pid we own and have not reaped yet.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            return;
        }
    }
    let _ = child.start_kill();
}

async fn reap(
    mut child: Child,
    mut control: mpsc::UnboundedReceiver<Control>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    tail: Arc<Mutex<VecDeque<String>>>,
    label: String,
    started: Instant,
    early_window: Duration,
) {
    let mut requested = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(ctl) = control.recv() => match ctl {
                Control::Terminate => {
                    requested = true;
                    send_terminate(&mut child);
                }
                Control::Kill => {
                    requested = true;
                    let _ = child.start_kill();
                }
            },
        }
    };

    let info = match status {
        Ok(status) => ExitInfo {
            code: status.code(),
            success: status.success(),
            early: started.elapsed() < early_window,
            requested,
        },
        Err(e) => {
            error!("waiting on encoder [{label}] failed: {e}");
            ExitInfo { code: None, success: false, early: false, requested }
        }
    };

    if info.success || info.requested {
        info!("encoder [{label}] exited (code {:?})", info.code);
    } else {
        warn!("encoder [{label}] exited with failure (code {:?})", info.code);
        if info.early {
            warn!(
                "encoder [{label}] died {:.1}s after launch; input is likely incompatible (codec/container)",
                started.elapsed().as_secs_f64()
            );
        }
        if let Ok(tail) = tail.lock() {
            for line in tail.iter() {
                warn!("  [ffmpeg {label}] {line}");
            }
        }
    }
    let _ = exit_tx.send(Some(info));
}

async fn drain_stderr(stderr: ChildStderr, label: String, tail: Arc<Mutex<VecDeque<String>>>, shutdown: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = lines.next_line() => next,
        };
        match next {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if is_noteworthy(line) {
                    warn!("[ffmpeg {label}] {line}");
                }
                if let Ok(mut t) = tail.lock() {
                    if t.len() >= STDERR_TAIL {
                        t.pop_front();
                    }
                    t.push_back(line.to_string());
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("reading ffmpeg stderr [{label}] failed: {e}");
                break;
            }
        }
    }
    debug!("ffmpeg stderr drain finished [{label}]");
}

#[async_trait]
impl Encoder for FfmpegSupervisor {
    async fn start(&self, input: &Path, looped: bool) -> Result<EncoderLaunch, EncoderStartError> {
        let input = std::path::absolute(input).unwrap_or_else(|_| input.to_path_buf());
        if !input.is_file() {
            return Err(EncoderStartError::InputMissing(input.display().to_string()));
        }

        let mut tracked = self.tracked.lock().await;
        if let Some(prev) = tracked.take() {
            stop_tracked(prev, self.cfg.stop_grace).await;
        }

        self.prepare_output().await;

        let args = build_args(&self.cfg, &input, looped);
        debug!("ffmpeg command: {} {}", self.cfg.ffmpeg, args.join(" "));

        let mut cmd = Command::new(&self.cfg.ffmpeg);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                error!("encoder binary '{}' not found; install ffmpeg or set RELAYCAST_FFMPEG", self.cfg.ffmpeg);
                return Err(EncoderStartError::BinaryNotFound(self.cfg.ffmpeg.clone()));
            }
            Err(e) => {
                error!("encoder launch failed for {}: {e}", input.display());
                return Err(EncoderStartError::LaunchFailure(e.to_string()));
            }
        };

        let pid = child.id();
        let label = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| input.display().to_string());
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL)));

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, label.clone(), tail.clone(), self.shutdown.clone()));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let reaper = tokio::spawn(reap(
            child,
            control_rx,
            exit_tx,
            tail,
            label.clone(),
            Instant::now(),
            self.cfg.early_exit_window,
        ));

        info!("encoder started (pid {pid:?}) input={label} loop={looped} variants={}", self.cfg.ladder.len().max(1));

        *tracked = Some(Tracked { pid, input, exit_rx, control: control_tx, reaper });

        Ok(EncoderLaunch { pid, multi_variant: self.multi_variant() })
    }

    async fn stop(&self) {
        let mut tracked = self.tracked.lock().await;
        if let Some(t) = tracked.take() {
            stop_tracked(t, self.cfg.stop_grace).await;
        }
    }

    async fn poll(&self) -> EncoderStatus {
        match self.tracked.lock().await.as_ref() {
            Some(t) => t.status(),
            None => EncoderStatus::Idle,
        }
    }

    async fn wait_exit(&self) {
        let rx = self.tracked.lock().await.as_ref().map(|t| t.exit_rx.clone());
        match rx {
            Some(mut rx) => wait_for_exit(&mut rx).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityTier;

    fn single_cfg(out: &Path) -> EncoderConfig {
        EncoderConfig { output_dir: out.to_path_buf(), ..EncoderConfig::default() }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn single_rendition_copies_video() {
        let cfg = single_cfg(Path::new("/srv/out"));
        let args = build_args(&cfg, Path::new("/srv/in.mp4"), false);

        assert!(has_pair(&args, "-c:v", "copy"));
        assert!(has_pair(&args, "-c:a", "aac"));
        assert!(has_pair(&args, "-hls_time", "4"));
        assert!(has_pair(&args, "-hls_list_size", "6"));
        assert!(has_pair(&args, "-i", "/srv/in.mp4"));
        assert!(!args.iter().any(|a| a == "-stream_loop"));
        assert_eq!(args.last().unwrap(), "/srv/out/stream.m3u8");

        let flags = &args[args.iter().position(|a| a == "-hls_flags").unwrap() + 1];
        assert!(flags.contains("delete_segments"));
        assert!(flags.contains("omit_endlist"));
    }

    #[test]
    fn looped_input_repeats_forever() {
        let cfg = single_cfg(Path::new("/srv/out"));
        let args = build_args(&cfg, Path::new("/srv/default.ts"), true);
        assert!(has_pair(&args, "-stream_loop", "-1"));
        let loop_at = args.iter().position(|a| a == "-stream_loop").unwrap();
        let input_at = args.iter().position(|a| a == "-i").unwrap();
        assert!(loop_at < input_at);
    }

    #[test]
    fn ladder_produces_master_playlist() {
        let mut cfg = single_cfg(Path::new("/srv/out"));
        cfg.ladder = vec![
            QualityTier { height: 720, video_kbps: 2800, audio_kbps: 128 },
            QualityTier { height: 480, video_kbps: 1400, audio_kbps: 96 },
        ];
        let args = build_args(&cfg, Path::new("/srv/in.mp4"), false);

        assert!(has_pair(&args, "-var_stream_map", "v:0,a:0 v:1,a:1"));
        assert!(has_pair(&args, "-master_pl_name", MASTER_MANIFEST));
        assert!(has_pair(&args, "-b:v:1", "1400k"));
        assert!(has_pair(&args, "-b:a:0", "128k"));
        assert!(!has_pair(&args, "-c:v", "copy"));
        let graph = &args[args.iter().position(|a| a == "-filter_complex").unwrap() + 1];
        assert_eq!(graph, "[0:v]split=2[s0][s1];[s0]scale=-2:720[v0];[s1]scale=-2:480[v1]");
        assert_eq!(args.last().unwrap(), "/srv/out/v%v/stream.m3u8");
    }

    #[test]
    fn stderr_filter_keeps_failures_only() {
        assert!(is_noteworthy("Error while decoding stream #0:1"));
        assert!(is_noteworthy("[hls @ 0x55] Failed to open segment"));
        assert!(is_noteworthy("Invalid data found when processing input"));
        assert!(!is_noteworthy("frame=  120 fps= 25 q=-1.0 size=N/A time=00:00:04.80"));
        assert!(!is_noteworthy("Stream mapping:"));
    }

    #[tokio::test]
    async fn clear_output_removes_only_stream_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path();
        std::fs::write(out.join("segment00001.ts"), b"x").unwrap();
        std::fs::write(out.join(MANIFEST), b"#EXTM3U").unwrap();
        std::fs::write(out.join("notes.txt"), b"keep").unwrap();
        std::fs::create_dir(out.join("v0")).unwrap();
        std::fs::write(out.join("v0").join("segment00002.ts"), b"x").unwrap();
        std::fs::create_dir(out.join("assets")).unwrap();
        std::fs::write(out.join("assets").join("logo.ts"), b"keep").unwrap();

        let removed = clear_output(out).await.unwrap();

        assert_eq!(removed, 3);
        assert!(out.join("notes.txt").exists());
        assert!(out.join("assets").join("logo.ts").exists());
        assert!(!out.join(MANIFEST).exists());
        assert!(!out.join("v0").join("segment00002.ts").exists());
    }

    #[tokio::test]
    async fn missing_input_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let sup = FfmpegSupervisor::new(single_cfg(dir.path()), CancellationToken::new());
        let err = sup.start(&dir.path().join("nope.mp4"), false).await.unwrap_err();
        assert!(matches!(err, EncoderStartError::InputMissing(_)));
        assert_eq!(sup.poll().await, EncoderStatus::Idle);
    }

    #[tokio::test]
    async fn missing_binary_is_reported_distinctly() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.mp4");
        std::fs::write(&input, b"x").unwrap();
        let mut cfg = single_cfg(&dir.path().join("out"));
        cfg.ffmpeg = "/nonexistent/relaycast-ffmpeg".into();
        let sup = FfmpegSupervisor::new(cfg, CancellationToken::new());

        let err = sup.start(&input, false).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(sup.poll().await, EncoderStatus::Idle);
    }

    #[tokio::test]
    async fn wait_exit_never_resolves_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let sup = FfmpegSupervisor::new(single_cfg(dir.path()), CancellationToken::new());
        let waited = tokio::time::timeout(Duration::from_millis(100), sup.wait_exit()).await;
        assert!(waited.is_err());
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        struct Rig {
            _dir: tempfile::TempDir,
            input: PathBuf,
            out: PathBuf,
            sup: FfmpegSupervisor,
        }

        /// Supervisor whose "ffmpeg" is a shell script with the given body.
        fn rig(body: &str) -> Rig {
            let dir = tempfile::tempdir().unwrap();
            let script = dir.path().join("fake-ffmpeg");
            std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

            let input = dir.path().join("in.mp4");
            std::fs::write(&input, b"not really video").unwrap();
            let out = dir.path().join("out");

            let cfg = EncoderConfig {
                ffmpeg: script.to_string_lossy().into_owned(),
                output_dir: out.clone(),
                stop_grace: Duration::from_millis(300),
                early_exit_window: Duration::from_secs(3),
                ..EncoderConfig::default()
            };
            let sup = FfmpegSupervisor::new(cfg, CancellationToken::new());
            Rig { _dir: dir, input, out, sup }
        }

        fn alive(pid: u32) -> bool {
            // SAFETY: signal 0 only checks for existence.
            unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
        }

        #[tokio::test]
        async fn start_then_stop() {
            let r = rig("exec sleep 30");
            let launch = r.sup.start(&r.input, false).await.unwrap();
            assert!(!launch.multi_variant);
            assert_eq!(r.sup.poll().await, EncoderStatus::Running);

            let started = Instant::now();
            r.sup.stop().await;
            assert!(started.elapsed() < Duration::from_secs(2));
            assert_eq!(r.sup.poll().await, EncoderStatus::Idle);

            // Idempotent.
            r.sup.stop().await;
            assert_eq!(r.sup.poll().await, EncoderStatus::Idle);
        }

        #[tokio::test]
        async fn stop_escalates_to_kill() {
            let r = rig("trap '' TERM\nwhile :; do sleep 1; done");
            let launch = r.sup.start(&r.input, true).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;

            let started = Instant::now();
            r.sup.stop().await;
            assert!(started.elapsed() >= Duration::from_millis(300));
            assert!(started.elapsed() < Duration::from_secs(3));
            assert_eq!(r.sup.poll().await, EncoderStatus::Idle);
            assert!(!alive(launch.pid.unwrap()));
        }

        #[tokio::test]
        async fn natural_exit_is_observed() {
            let r = rig("exit 3");
            r.sup.start(&r.input, false).await.unwrap();
            tokio::time::timeout(Duration::from_secs(5), r.sup.wait_exit()).await.unwrap();

            match r.sup.poll().await {
                EncoderStatus::Exited(info) => {
                    assert_eq!(info.code, Some(3));
                    assert!(!info.success);
                    assert!(info.early);
                    assert!(!info.requested);
                }
                other => panic!("expected exit, got {other:?}"),
            }

            r.sup.stop().await;
            assert_eq!(r.sup.poll().await, EncoderStatus::Idle);
        }

        #[tokio::test]
        async fn start_replaces_the_running_process() {
            let r = rig("exec sleep 30");
            let first = r.sup.start(&r.input, true).await.unwrap();
            let second = r.sup.start(&r.input, false).await.unwrap();

            assert_ne!(first.pid, second.pid);
            assert!(!alive(first.pid.unwrap()));
            assert!(alive(second.pid.unwrap()));
            assert_eq!(r.sup.poll().await, EncoderStatus::Running);
            r.sup.stop().await;
        }

        #[tokio::test]
        async fn start_clears_stale_segments() {
            let r = rig("exec sleep 30");
            std::fs::create_dir_all(&r.out).unwrap();
            std::fs::write(r.out.join("segment00009.ts"), b"old").unwrap();
            std::fs::write(r.out.join(MANIFEST), b"#EXTM3U").unwrap();

            r.sup.start(&r.input, false).await.unwrap();
            assert!(!r.out.join("segment00009.ts").exists());
            assert!(!r.out.join(MANIFEST).exists());
            r.sup.stop().await;
        }
    }
}
