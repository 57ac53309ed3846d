//! Per-stream configuration and the status/info snapshot exposed to callers.
//!
//! These types double as the outward HTTP API's request/response DTOs,
//! hence the `serde` derives on all of them.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL: f64 = 4.0;
pub const DEFAULT_WINDOW_SIZE: usize = 6;
pub const DEFAULT_HISTORY_SIZE: usize = 128;

/// Lifecycle status of a single DASH -> HLS conversion session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Initializing,
    Starting,
    Running,
    Completed,
    Stopped,
    Error,
}

impl Default for StreamStatus {
    fn default() -> Self {
        StreamStatus::Initializing
    }
}

/// Immutable configuration for one stream session, for its whole lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub mpd_url: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub key_map: Option<HashMap<String, String>>,
    #[serde(default)]
    pub mp4decrypt_path: Option<String>,
    #[serde(default)]
    pub representation_id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

fn default_poll_interval() -> f64 {
    DEFAULT_POLL_INTERVAL
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

fn default_history_size() -> usize {
    DEFAULT_HISTORY_SIZE
}

impl StreamConfig {
    /// Headers as the ordered pairs `fetch::HttpFetcher` expects.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .as_ref()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

/// A point-in-time snapshot of a session, returned by `StreamSession::info`
/// and serialized directly by the outward HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub stream_id: String,
    pub mpd_url: String,
    pub status: StreamStatus,
    pub hls_url: String,
    pub output_dir: PathBuf,
    pub is_live: bool,
    pub representation_id: Option<String>,
    pub bandwidth: Option<u64>,
    pub codecs: Option<String>,
    pub resolution: Option<(u64, u64)>,
    pub error: Option<String>,
    pub label: Option<String>,
    pub last_sequence: Option<u64>,
    pub audio_representation_id: Option<String>,
    pub audio_bandwidth: Option<u64>,
    pub audio_codecs: Option<String>,
}
