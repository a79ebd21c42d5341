// Runtime configuration.
//
// Everything is read once from the environment at startup. The relay has no
// config file and no CLI flags: a systemd unit (or a shell) sets the handful
// of RELAYCAST_* variables it needs and the rest falls back to defaults that
// work out of the box on a single box.

use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_VIDEO_URL: &str = "https://www.dropbox.com/scl/fi/2w5ai1fda804zfruoj8yn/assets_staytuned0.ts?rlkey=jixrs4b1v3keu4q6hpebmbw5v&st=b1teebao&raw=1";
pub const DEFAULT_VIDEO_FILENAME: &str = "default_video.ts";

/// One rendition of the multi-variant ladder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QualityTier {
    pub height: u32,
    pub video_kbps: u32,
    pub audio_kbps: u32,
}

#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub ffmpeg: String,
    pub output_dir: PathBuf,
    pub segment_secs: u32,
    pub window: u32,
    /// Empty ladder = single rendition (video copy, audio re-encode).
    pub ladder: Vec<QualityTier>,
    /// How long `stop` waits after SIGTERM before escalating to a kill.
    pub stop_grace: Duration,
    /// A failing exit within this window after launch is reported as an
    /// incompatible input rather than a normal end of stream.
    pub early_exit_window: Duration,
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub video_dir: PathBuf,
    pub default_url: String,
    pub default_filename: String,
    pub prefetch_wait: Duration,
    pub default_retry: Duration,
    pub pace_transition: Duration,
    pub pace_steady: Duration,
    pub pace_idle: Duration,
    pub cooldown: Duration,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind: SocketAddr,
    pub fetch_timeout: Duration,
    pub reject_duplicates: bool,
    pub shutdown_grace: Duration,
    pub encoder: EncoderConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            output_dir: PathBuf::from("stream_output"),
            segment_secs: 4,
            window: 6,
            ladder: Vec::new(),
            stop_grace: Duration::from_secs(5),
            early_exit_window: Duration::from_secs(3),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            video_dir: PathBuf::from("videos"),
            default_url: DEFAULT_VIDEO_URL.into(),
            default_filename: DEFAULT_VIDEO_FILENAME.into(),
            prefetch_wait: Duration::from_secs(30),
            default_retry: Duration::from_secs(60),
            pace_transition: Duration::from_millis(500),
            pace_steady: Duration::from_secs(1),
            pace_idle: Duration::from_secs(3),
            cooldown: Duration::from_secs(5),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            fetch_timeout: Duration::from_secs(60),
            reject_duplicates: false,
            shutdown_grace: Duration::from_secs(10),
            encoder: EncoderConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_opt(key) {
        Some(v) => Ok(Some(v.parse::<T>().with_context(|| format!("invalid {key}: {v:?}"))?)),
        None => Ok(None),
    }
}

fn env_bool(key: &str) -> bool {
    matches!(
        env_opt(key).map(|v| v.to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

/// Parse a ladder like `720:2800:128,480:1400:96` (height:video_kbps:audio_kbps).
pub fn parse_ladder(raw: &str) -> anyhow::Result<Vec<QualityTier>> {
    let mut tiers = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let fields: Vec<&str> = part.split(':').map(str::trim).collect();
        let [h, v, a] = fields.as_slice() else {
            anyhow::bail!("quality tier {part:?} must be height:video_kbps:audio_kbps");
        };
        let tier = QualityTier {
            height: h.parse().with_context(|| format!("bad height in {part:?}"))?,
            video_kbps: v.parse().with_context(|| format!("bad video bitrate in {part:?}"))?,
            audio_kbps: a.parse().with_context(|| format!("bad audio bitrate in {part:?}"))?,
        };
        if tier.height == 0 || tier.video_kbps == 0 || tier.audio_kbps == 0 {
            anyhow::bail!("quality tier {part:?} has a zero field");
        }
        tiers.push(tier);
    }
    Ok(tiers)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Config::default();

        if let Some(bind) = env_parse::<SocketAddr>("RELAYCAST_BIND")? {
            cfg.bind = bind;
        }
        if let Some(secs) = env_parse::<u64>("RELAYCAST_FETCH_TIMEOUT_SECS")? {
            cfg.fetch_timeout = Duration::from_secs(secs.max(1));
        }
        cfg.reject_duplicates = env_bool("RELAYCAST_REJECT_DUPLICATES");

        let enc = &mut cfg.encoder;
        if let Some(ffmpeg) = env_opt("RELAYCAST_FFMPEG") {
            enc.ffmpeg = ffmpeg;
        }
        if let Some(dir) = env_opt("RELAYCAST_OUTPUT_DIR") {
            enc.output_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_parse::<u32>("RELAYCAST_SEGMENT_SECS")? {
            enc.segment_secs = secs.max(1);
        }
        if let Some(window) = env_parse::<u32>("RELAYCAST_WINDOW")? {
            enc.window = window.max(1);
        }
        if let Some(ladder) = env_opt("RELAYCAST_LADDER") {
            enc.ladder = parse_ladder(&ladder)?;
        }

        let orch = &mut cfg.orchestrator;
        if let Some(dir) = env_opt("RELAYCAST_VIDEO_DIR") {
            orch.video_dir = PathBuf::from(dir);
        }
        if let Some(url) = env_opt("RELAYCAST_DEFAULT_URL") {
            orch.default_url = url;
        }
        if let Some(name) = env_opt("RELAYCAST_DEFAULT_FILE") {
            orch.default_filename = name;
        }
        if let Some(secs) = env_parse::<u64>("RELAYCAST_PREFETCH_WAIT_SECS")? {
            orch.prefetch_wait = Duration::from_secs(secs);
        }

        Ok(cfg)
    }
}
