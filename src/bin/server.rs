//! The outward HTTP API: control operations over `StreamManager` (add,
//! remove, list, get) plus static file serving for HLS playlists and
//! segments.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use dash2hls::config::{StreamConfig, StreamInfo};
use dash2hls::error::ConverterError;
use dash2hls::fetch::HttpFetcher;
use dash2hls::manager::StreamManager;

/// Convert encrypted DASH streams to HLS and serve the result over HTTP.
#[derive(Parser, Debug)]
#[command(name = "dash2hls-server")]
struct Args {
    /// TCP port to listen on.
    #[arg(long, default_value_t = 8000)]
    port: u16,
    /// Base directory under which each stream's output tree is created.
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct AddStreamRequest {
    mpd_url: String,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    key_map: Option<HashMap<String, String>>,
    #[serde(default)]
    mp4decrypt_path: Option<String>,
    #[serde(default)]
    representation_id: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    poll_interval: Option<f64>,
    #[serde(default)]
    window_size: Option<usize>,
    #[serde(default)]
    history_size: Option<usize>,
    #[serde(default)]
    headers: Option<HashMap<String, String>>,
    #[serde(default)]
    output_dir: Option<PathBuf>,
}

impl From<AddStreamRequest> for StreamConfig {
    fn from(req: AddStreamRequest) -> Self {
        StreamConfig {
            mpd_url: req.mpd_url,
            key: req.key,
            kid: req.kid,
            key_map: req.key_map,
            mp4decrypt_path: req.mp4decrypt_path,
            representation_id: req.representation_id,
            label: req.label,
            poll_interval: req.poll_interval.unwrap_or(dash2hls::config::DEFAULT_POLL_INTERVAL),
            window_size: req.window_size.unwrap_or(dash2hls::config::DEFAULT_WINDOW_SIZE),
            history_size: req.history_size.unwrap_or(dash2hls::config::DEFAULT_HISTORY_SIZE),
            headers: req.headers,
            output_dir: req.output_dir,
        }
    }
}

#[derive(Debug, Serialize)]
struct AddStreamResponse {
    stream_id: String,
    hls_url: String,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: message.into() })).into_response()
}

async fn add_stream(State(manager): State<Arc<StreamManager>>, Json(req): Json<AddStreamRequest>) -> Response {
    let config: StreamConfig = req.into();
    match manager.add_stream(config).await {
        Ok(stream_id) => (
            StatusCode::CREATED,
            Json(AddStreamResponse {
                hls_url: format!("/hls/{stream_id}/master.m3u8"),
                stream_id,
                status: "starting",
            }),
        )
            .into_response(),
        Err(ConverterError::Configuration(msg)) => error_response(StatusCode::BAD_REQUEST, msg),
        Err(e) => {
            warn!("failed to add stream: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn remove_stream(State(manager): State<Arc<StreamManager>>, AxumPath(id): AxumPath<String>) -> Response {
    if manager.remove_stream(&id).await {
        StatusCode::OK.into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "stream not found")
    }
}

#[derive(Debug, Serialize)]
struct StreamsResponse {
    streams: Vec<StreamInfo>,
}

async fn list_streams(State(manager): State<Arc<StreamManager>>) -> Json<StreamsResponse> {
    Json(StreamsResponse { streams: manager.list_streams().await })
}

async fn get_stream(State(manager): State<Arc<StreamManager>>, AxumPath(id): AxumPath<String>) -> Response {
    match manager.get(&id).await {
        Some(info) => Json(info).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "stream not found"),
    }
}

fn mime_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("m4s") | Some("mp4") | Some("ts") => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Serve a file from a stream's output tree. Rejects (as a generic 404,
/// never disclosing the filesystem path) anything that resolves outside
/// the stream's output root.
async fn serve_hls(State(manager): State<Arc<StreamManager>>, AxumPath((id, file_path)): AxumPath<(String, String)>) -> Response {
    let Some(root) = manager.output_path(&id).await else {
        return error_response(StatusCode::NOT_FOUND, "stream not found");
    };

    let Ok(root_canonical) = root.canonicalize() else {
        return error_response(StatusCode::NOT_FOUND, "file not found");
    };
    let requested = root.join(&file_path);
    let Ok(requested_canonical) = requested.canonicalize() else {
        return error_response(StatusCode::NOT_FOUND, "file not found");
    };
    if !requested_canonical.starts_with(&root_canonical) {
        return error_response(StatusCode::NOT_FOUND, "file not found");
    }
    if !requested_canonical.is_file() {
        return error_response(StatusCode::NOT_FOUND, "file not found");
    }

    match tokio::fs::read(&requested_canonical).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, mime_for(&requested_canonical))], bytes).into_response(),
        Err(e) => {
            warn!("failed to read {}: {e}", requested_canonical.display());
            error_response(StatusCode::NOT_FOUND, "file not found")
        }
    }
}

fn build_router(manager: Arc<StreamManager>) -> Router {
    Router::new()
        .route("/streams", post(add_stream).get(list_streams))
        .route("/streams/{id}", get(get_stream).delete(remove_stream))
        .route("/hls/{id}/{*file_path}", get(serve_hls))
        .with_state(manager)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let fetcher = Arc::new(HttpFetcher::new(&[])?);
    let manager = Arc::new(StreamManager::new(&args.output_dir, fetcher));

    let app = build_router(manager);
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("dash2hls-server listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use dash2hls::error::Result;
    use dash2hls::fetch::SegmentFetcher;

    struct StaticFetcher;

    #[async_trait]
    impl SegmentFetcher for StaticFetcher {
        async fn fetch_text(&self, _url: &str, _extra_headers: &[(String, String)]) -> Result<String> {
            Ok(r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT4S">
  <Period>
    <AdaptationSet mimeType="video/mp4">
      <Representation id="v0" bandwidth="100000">
        <SegmentTemplate media="$Number$.m4s" initialization="init.mp4"
                         startNumber="1" duration="4" timescale="1"/>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#
                .to_string())
        }

        async fn fetch_bytes(&self, _url: &str, _extra_headers: &[(String, String)]) -> Result<Bytes> {
            Ok(Bytes::from_static(b"ftypmp42mock-init-or-segment"))
        }
    }

    async fn spawn_test_server() -> (String, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(StreamManager::new(dir.path(), Arc::new(StaticFetcher)));
        let app = build_router(manager);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), dir)
    }

    #[tokio::test]
    async fn add_list_get_remove_roundtrip() {
        let (base, _dir) = spawn_test_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/streams"))
            .json(&serde_json::json!({"mpd_url": "https://cdn.example.com/manifest.mpd"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: serde_json::Value = resp.json().await.unwrap();
        let stream_id = body["stream_id"].as_str().unwrap().to_string();

        let list: serde_json::Value = client.get(format!("{base}/streams")).send().await.unwrap().json().await.unwrap();
        assert_eq!(list["streams"].as_array().unwrap().len(), 1);

        let get_resp = client.get(format!("{base}/streams/{stream_id}")).send().await.unwrap();
        assert_eq!(get_resp.status(), StatusCode::OK);

        let del_resp = client.delete(format!("{base}/streams/{stream_id}")).send().await.unwrap();
        assert_eq!(del_resp.status(), StatusCode::OK);

        let missing = client.get(format!("{base}/streams/{stream_id}")).send().await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_stream_returns_404() {
        let (base, _dir) = spawn_test_server().await;
        let client = reqwest::Client::new();
        let resp = client.get(format!("{base}/streams/does-not-exist")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = client.delete(format!("{base}/streams/does-not-exist")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn mime_types_match_the_three_hls_content_kinds() {
        assert_eq!(mime_for(std::path::Path::new("master.m3u8")), "application/vnd.apple.mpegurl");
        assert_eq!(mime_for(std::path::Path::new("init.mp4")), "video/mp4");
        assert_eq!(mime_for(std::path::Path::new("5.m4s")), "video/mp4");
        assert_eq!(mime_for(std::path::Path::new("notes.txt")), "application/octet-stream");
    }

    #[tokio::test]
    async fn path_traversal_outside_stream_root_is_rejected() {
        let (base, dir) = spawn_test_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/streams"))
            .json(&serde_json::json!({"mpd_url": "https://cdn.example.com/manifest.mpd"}))
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        let stream_id = body["stream_id"].as_str().unwrap().to_string();

        let secret = dir.path().join("secret.txt");
        tokio::fs::write(&secret, b"do not serve me").await.unwrap();

        // Percent-encoded so the HTTP client's own URL normalization doesn't
        // collapse the dot segments before the request ever reaches the server.
        let resp = client.get(format!("{base}/hls/{stream_id}/%2e%2e/secret.txt")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
