// --- HTTP surface -----------------------------------------------------------
//
// Thin plumbing over `SharedState`: the admin API mutates the queue, viewers
// poll status and pull HLS files from the encoder's output directory. No
// handler ever touches the encoder or the fetcher directly.

use axum::{
    extract::{Path as UrlPath, State},
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use sysinfo::System;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::state::{EnqueueError, SharedState, StatusSnapshot};

const INDEX_HTML: &str = include_str!("../static/index.html");
const ADMIN_HTML: &str = include_str!("../static/admin.html");

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub relay: SharedState,
    pub output_dir: PathBuf,
    pub sys: Arc<tokio::sync::Mutex<System>>,
}

#[derive(Deserialize)]
struct UrlReq {
    url: String,
}

#[derive(Serialize)]
struct SystemInfo {
    name: String,
    version: String,
    arch: String,
    hostname: Option<String>,
    cpu_model: String,
    cpu_cores: usize,
    load_1m: f32,
    load_5m: f32,
    load_15m: f32,
    mem_total_mb: u64,
    mem_used_mb: u64,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { Html(INDEX_HTML) }))
        .route("/admin", get(|| async { Html(ADMIN_HTML) }))
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/status", get(status))
        .route("/api/v1/queue/add", post(api_queue_add))
        .route("/api/v1/queue/remove", post(api_queue_remove))
        .route("/api/v1/queue/clear", post(api_queue_clear))
        .route("/api/v1/history/clear", post(api_history_clear))
        .route("/api/v1/system/info", get(system_info))
        .route("/stream/*path", get(stream_file))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn status(State(st): State<AppState>) -> Json<StatusSnapshot> {
    Json(st.relay.snapshot().await)
}

async fn api_queue_add(
    State(st): State<AppState>,
    Json(req): Json<UrlReq>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    match st.relay.enqueue(&req.url).await {
        Ok(added) => {
            if added.duplicate {
                info!("queued (duplicate) at #{}: {}", added.position, req.url.trim());
            } else {
                info!("queued at #{}: {}", added.position, req.url.trim());
            }
            Ok(Json(json!({"ok": true, "duplicate": added.duplicate, "position": added.position})))
        }
        Err(e) => {
            let code = match e {
                EnqueueError::Duplicate => StatusCode::CONFLICT,
                EnqueueError::Empty | EnqueueError::NotHttp => StatusCode::BAD_REQUEST,
            };
            Err((code, Json(json!({"ok": false, "error": e.to_string()}))))
        }
    }
}

async fn api_queue_remove(State(st): State<AppState>, Json(req): Json<UrlReq>) -> Json<serde_json::Value> {
    let removed = st.relay.remove(&req.url).await;
    info!("removed {removed} queue entr{} for {}", if removed == 1 { "y" } else { "ies" }, req.url.trim());
    Json(json!({"ok": true, "removed": removed}))
}

async fn api_queue_clear(State(st): State<AppState>) -> Json<serde_json::Value> {
    let removed = st.relay.clear().await;
    info!("queue cleared ({removed} items)");
    Json(json!({"ok": true, "removed": removed}))
}

async fn api_history_clear(State(st): State<AppState>) -> Json<serde_json::Value> {
    let removed = st.relay.clear_history().await;
    info!("play history cleared ({removed} items)");
    Json(json!({"ok": true, "removed": removed}))
}

async fn system_info(State(st): State<AppState>) -> Json<SystemInfo> {
    let mut sys = st.sys.lock().await;
    sys.refresh_cpu_all();
    sys.refresh_memory();

    let cpu_model = sys
        .cpus()
        .first()
        .map(|c| c.brand().to_string())
        .unwrap_or_else(|| "Unknown CPU".to_string());
    let la = System::load_average();

    Json(SystemInfo {
        name: "Relaycast".to_string(),
        version: st.version.clone(),
        arch: std::env::consts::ARCH.to_string(),
        hostname: System::host_name(),
        cpu_model,
        cpu_cores: sys.cpus().len(),
        load_1m: la.one as f32,
        load_5m: la.five as f32,
        load_15m: la.fifteen as f32,
        mem_total_mb: sys.total_memory() / (1024 * 1024),
        mem_used_mb: sys.used_memory() / (1024 * 1024),
    })
}

/// Map a request path onto a file under `root`. Anything that is not a
/// plain relative path (`..`, absolute, drive prefixes) is refused.
pub fn resolve_stream_path(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel);
    let mut out = root.to_path_buf();
    let mut any = false;
    for comp in rel.components() {
        match comp {
            Component::Normal(part) => {
                out.push(part);
                any = true;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    any.then_some(out)
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("m4s") => "video/iso.segment",
        Some("mp4") => "video/mp4",
        Some("aac") => "audio/aac",
        _ => "application/octet-stream",
    }
}

async fn stream_file(State(st): State<AppState>, UrlPath(rel): UrlPath<String>) -> Response {
    let Some(path) = resolve_stream_path(&st.output_dir, &rel) else {
        debug!("refused stream path: {rel:?}");
        return StatusCode::FORBIDDEN.into_response();
    };

    if !tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let body = match tokio::fs::read(&path).await {
        Ok(b) => b,
        // Rotated away between the check and the read.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            debug!("stream read failed for {}: {e}", path.display());
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut resp = body.into_response();
    let h = resp.headers_mut();
    h.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type_for(&path)));
    h.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache, no-store, must-revalidate, max-age=0"));
    h.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    h.insert(header::EXPIRES, HeaderValue::from_static("0"));
    resp
}
