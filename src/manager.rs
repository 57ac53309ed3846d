//! `StreamManager`: the process-wide registry of `StreamSession`s. A
//! `tokio::sync::Mutex` guards the session map, serializing add/remove;
//! reads don't hold the lock longer than the snapshot copy needs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::config::{StreamConfig, StreamInfo};
use crate::error::Result;
use crate::fetch::SegmentFetcher;
use crate::session::StreamSession;

pub struct StreamManager {
    base_output_dir: PathBuf,
    fetcher: Arc<dyn SegmentFetcher>,
    sessions: Mutex<HashMap<String, Arc<StreamSession>>>,
}

impl StreamManager {
    pub fn new(base_output_dir: impl Into<PathBuf>, fetcher: Arc<dyn SegmentFetcher>) -> Self {
        StreamManager {
            base_output_dir: base_output_dir.into(),
            fetcher,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Generate a stream id, build and start its session, and register it —
    /// all under the registry lock so concurrent adds never collide.
    /// Configuration errors (bad key material, unresolvable decrypt tool)
    /// surface synchronously; the session is never registered.
    pub async fn add_stream(&self, config: StreamConfig) -> Result<String> {
        let stream_id = Uuid::new_v4().to_string();
        let session = Arc::new(StreamSession::new(stream_id.clone(), config, &self.base_output_dir)?);
        session.start(Arc::clone(&self.fetcher))?;

        let mut sessions = self.sessions.lock().await;
        sessions.insert(stream_id.clone(), session);
        info!(stream = %stream_id, "added stream");
        Ok(stream_id)
    }

    /// Stop and remove a stream. Returns `false` if the id is unknown.
    pub async fn remove_stream(&self, stream_id: &str) -> bool {
        let session = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(stream_id)
        };
        match session {
            Some(session) => {
                session.stop().await;
                info!(stream = %stream_id, "removed stream");
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, stream_id: &str) -> Option<StreamInfo> {
        let sessions = self.sessions.lock().await;
        sessions.get(stream_id).map(|s| s.info())
    }

    pub async fn list_streams(&self) -> Vec<StreamInfo> {
        let sessions = self.sessions.lock().await;
        sessions.values().map(|s| s.info()).collect()
    }

    /// The output directory a stream writes under, for the outward file
    /// server to resolve requested paths against. Callers must still reject
    /// paths that escape this root.
    pub async fn output_path(&self, stream_id: &str) -> Option<PathBuf> {
        let sessions = self.sessions.lock().await;
        sessions.get(stream_id).map(|s| s.output_dir.clone())
    }

    pub fn base_output_dir(&self) -> &Path {
        &self.base_output_dir
    }
}
