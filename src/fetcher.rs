// --- Fetcher ---------------------------------------------------------------
//
// Materializes a remote video into the local cache directory.
//
// The fetch is idempotent: a non-empty file at the destination is a cache hit
// and no request is made. Bytes are streamed into `<dest>.part` and renamed
// over the destination only once a non-empty body has been fully received, so
// an aborted transfer can never be mistaken for a good cached file later.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FetchError;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

const KNOWN_EXTENSIONS: &[&str] = &[".mp4", ".ts", ".mkv", ".avi", ".mov", ".wmv", ".flv", ".m3u8"];

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Download `url` to `dest`, returning the path of the playable file.
    ///
    /// `cancel` is checked while waiting for the response and for every body
    /// chunk; a cancelled fetch removes its partial file.
    async fn fetch(&self, url: &str, dest: &Path, cancel: &CancellationToken) -> Result<PathBuf, FetchError>;
}

/// Cache filename for a URL: `video_<sha1 prefix><ext>`.
///
/// The extension is kept only when it is a known container type, otherwise
/// `.mp4` is assumed (the encoder probes the real format anyway).
pub fn cache_filename(url: &str) -> String {
    let digest = Sha1::digest(url.as_bytes());
    let hashed = &hex::encode(digest)[..10];

    let path_part = url.split('?').next().unwrap_or(url);
    let base = path_part.rsplit('/').next().unwrap_or("");
    let ext = match base.rfind('.') {
        Some(idx) if idx > 0 => &base[idx..],
        _ => "",
    };

    let ext = if ext.is_empty() || ext.len() > 5 || !KNOWN_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
        ".mp4"
    } else {
        ext
    };
    format!("video_{hashed}{ext}")
}

/// Advisory Content-Type check. Cloud storage "raw" links routinely mislabel
/// media, so a false result only produces a warning.
pub fn is_likely_video(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("video") || ct.contains("mpegurl") || ct.contains("octet-stream") {
        return true;
    }
    !["text/html", "application/json"].iter().any(|bad| ct.contains(bad))
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client })
    }

    async fn download(&self, url: &str, part: &Path, cancel: &CancellationToken) -> Result<u64, FetchError> {
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            resp = self.client.get(url).send() => resp.map_err(FetchError::from_reqwest)?,
        };

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Network(format!("HTTP {status}")));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !is_likely_video(&content_type) {
            warn!("content-type {content_type:?} does not look like video ({url}); downloading anyway");
        }

        if let Some(parent) = part.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(part).await?;
        let mut stream = resp.bytes_stream();
        let mut total: u64 = 0;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk: Bytes = chunk.map_err(FetchError::from_reqwest)?;
            if chunk.is_empty() {
                continue;
            }
            file.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if total == 0 {
            return Err(FetchError::EmptyBody);
        }
        Ok(total)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path, cancel: &CancellationToken) -> Result<PathBuf, FetchError> {
        match tokio::fs::metadata(dest).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {
                debug!("cache hit: {}", dest.display());
                return Ok(dest.to_path_buf());
            }
            Ok(_) => warn!("cached file {} is empty; downloading again", dest.display()),
            Err(_) => {}
        }

        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        info!("download start: {url} -> {}", dest.display());
        let part = part_path(dest);

        match self.download(url, &part, cancel).await {
            Ok(bytes) => {
                tokio::fs::rename(&part, dest).await?;
                info!(
                    "download done: {} ({:.2} MB)",
                    dest.display(),
                    bytes as f64 / (1024.0 * 1024.0)
                );
                Ok(dest.to_path_buf())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                if let Ok(meta) = tokio::fs::metadata(dest).await {
                    if meta.len() == 0 {
                        let _ = tokio::fs::remove_file(dest).await;
                    }
                }
                warn!("download failed ({url}): {e}");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::State;
    use axum::http::{header, StatusCode};
    use axum::response::{IntoResponse, Redirect};
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    async fn video(State(hits): State<Arc<AtomicUsize>>) -> impl IntoResponse {
        hits.fetch_add(1, Ordering::SeqCst);
        ([(header::CONTENT_TYPE, "video/mp4")], vec![7u8; 100_000])
    }

    async fn html_page() -> impl IntoResponse {
        ([(header::CONTENT_TYPE, "text/html")], "<html>not really a video</html>")
    }

    async fn slow() -> impl IntoResponse {
        let stream = futures_util::stream::unfold(0u32, |n| async move {
            if n >= 200 {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            Some((Ok::<_, std::io::Error>(Bytes::from(vec![1u8; 1024])), n + 1))
        });
        Body::from_stream(stream)
    }

    async fn serve() -> (SocketAddr, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/video.mp4", get(video))
            .route("/moved", get(|| async { Redirect::temporary("/video.mp4") }))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route("/empty", get(|| async { StatusCode::OK }))
            .route("/page", get(html_page))
            .route("/slow", get(slow))
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, hits)
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn cache_filename_keeps_known_extensions() {
        let name = cache_filename("https://cdn.example.com/clips/intro.ts?token=abc");
        assert!(name.starts_with("video_"));
        assert!(name.ends_with(".ts"));
        assert_eq!(name.len(), "video_".len() + 10 + ".ts".len());
        assert!(cache_filename("https://x.test/a/MOVIE.MKV").ends_with(".MKV"));
    }

    #[test]
    fn cache_filename_falls_back_to_mp4() {
        assert!(cache_filename("https://x.test/watch").ends_with(".mp4"));
        assert!(cache_filename("https://x.test/file.txt").ends_with(".mp4"));
        assert!(cache_filename("https://x.test/file.toolong").ends_with(".mp4"));
    }

    #[test]
    fn cache_filename_is_stable_per_url() {
        assert_eq!(cache_filename("https://x.test/a.mp4"), cache_filename("https://x.test/a.mp4"));
        assert_ne!(cache_filename("https://x.test/a.mp4"), cache_filename("https://x.test/b.mp4"));
    }

    #[test]
    fn content_type_classifier_is_lenient() {
        assert!(is_likely_video("video/mp4"));
        assert!(is_likely_video("application/vnd.apple.mpegurl"));
        assert!(is_likely_video("application/octet-stream"));
        assert!(is_likely_video(""));
        assert!(is_likely_video("binary/whatever"));
        assert!(!is_likely_video("text/html; charset=utf-8"));
        assert!(!is_likely_video("application/json"));
    }

    #[tokio::test]
    async fn second_fetch_is_a_cache_hit() {
        let (addr, hits) = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.mp4");
        let url = format!("http://{addr}/video.mp4");
        let cancel = CancellationToken::new();

        let first = fetcher().fetch(&url, &dest, &cancel).await.unwrap();
        let second = fetcher().fetch(&url, &dest, &cancel).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 100_000);
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn existing_file_needs_no_network() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("cached.mp4");
        std::fs::write(&dest, b"already here").unwrap();

        // Nothing listens on this port; a network call would fail.
        let got = fetcher()
            .fetch("http://127.0.0.1:9/unreachable.mp4", &dest, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(got, dest);
    }

    #[tokio::test]
    async fn redirects_are_followed() {
        let (addr, hits) = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("moved.mp4");
        fetcher()
            .fetch(&format!("http://{addr}/moved"), &dest, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn http_error_leaves_no_file() {
        let (addr, _) = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing.mp4");
        let err = fetcher()
            .fetch(&format!("http://{addr}/missing"), &dest, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network(msg) if msg.contains("404")));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn empty_body_is_an_error() {
        let (addr, _) = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("empty.mp4");
        let err = fetcher()
            .fetch(&format!("http://{addr}/empty"), &dest, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::EmptyBody));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn suspicious_content_type_still_downloads() {
        let (addr, _) = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("page.mp4");
        fetcher()
            .fetch(&format!("http://{addr}/page"), &dest, &CancellationToken::new())
            .await
            .unwrap();
        assert!(std::fs::metadata(&dest).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn connection_refused_is_a_network_error() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("refused.mp4");
        let err = fetcher()
            .fetch("http://127.0.0.1:9/x.mp4", &dest, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network(_)), "got {err:?}");
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_transfer() {
        let (addr, _) = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("slow.mp4");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = fetcher()
            .fetch(&format!("http://{addr}/slow"), &dest, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }
}
