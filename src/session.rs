//! `StreamSession`: the per-stream pipeline (manifest -> select -> ensure
//! init -> diff new segments -> fetch -> decrypt -> write) and its lifecycle
//! (`start`/`stop`/`info`). The running pipeline is a cancellable `tokio`
//! task; a `Notify`-backed stop signal lets a sleeping poll wake immediately
//! on shutdown instead of waiting out its interval.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{StreamConfig, StreamInfo, StreamStatus};
use crate::decryption::Decryptor;
use crate::error::{ConverterError, Result};
use crate::fetch::SegmentFetcher;
use crate::hls::{MultiVariantHlsWriter, TrackType};
use crate::manifest::{self, Manifest, Representation};

#[derive(Debug, Clone, Default)]
struct RepresentationMeta {
    id: String,
    bandwidth: u64,
    codecs: Option<String>,
    resolution: Option<(u64, u64)>,
}

impl From<&Representation> for RepresentationMeta {
    fn from(rep: &Representation) -> Self {
        RepresentationMeta {
            id: rep.id.clone(),
            bandwidth: rep.bandwidth,
            codecs: rep.codecs.clone(),
            resolution: match (rep.width, rep.height) {
                (Some(w), Some(h)) => Some((w, h)),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Default)]
struct SharedState {
    status: StreamStatus,
    error: Option<String>,
    is_live: bool,
    video: Option<RepresentationMeta>,
    audio: Option<RepresentationMeta>,
    last_sequence_video: Option<u64>,
    last_sequence_audio: Option<u64>,
}

/// FIFO + set bookkeeping for one track's already-processed segment
/// numbers, bounded at `history_size`.
struct TrackHistory {
    queue: VecDeque<u64>,
    seen: HashSet<u64>,
    last_sequence: Option<u64>,
    history_size: usize,
}

impl TrackHistory {
    fn new(history_size: usize) -> Self {
        TrackHistory {
            queue: VecDeque::new(),
            seen: HashSet::new(),
            last_sequence: None,
            history_size,
        }
    }

    /// Segments not yet seen and newer than the last processed sequence.
    fn collect_new<'a>(&self, segments: &'a [crate::manifest::Segment]) -> Vec<&'a crate::manifest::Segment> {
        segments
            .iter()
            .filter(|seg| {
                if self.seen.contains(&seg.number) {
                    return false;
                }
                match self.last_sequence {
                    Some(last) => seg.number > last,
                    None => true,
                }
            })
            .collect()
    }

    fn mark_processed(&mut self, number: u64) {
        self.last_sequence = Some(number);
        if self.seen.insert(number) {
            self.queue.push_back(number);
        }
        while self.queue.len() > self.history_size {
            if let Some(oldest) = self.queue.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }
}

/// Pick the configured/highest-bandwidth video and audio representations.
///
/// `representation_id`, if set, matches the first representation by ID
/// regardless of track type; if that match is audio-only, it fills the
/// audio slot (and auto audio-selection is skipped) rather than the video
/// slot.
fn select_representations(manifest: &Manifest, representation_id: Option<&str>) -> (Option<Representation>, Option<Representation>) {
    let id_matched = representation_id.and_then(|id| manifest.representations.iter().find(|r| r.id == id).cloned());

    let mut video = None;
    let mut audio = None;
    if let Some(rep) = id_matched {
        if rep.is_audio && !rep.is_video {
            audio = Some(rep);
        } else {
            video = Some(rep);
        }
    }
    if video.is_none() {
        video = manifest
            .representations
            .iter()
            .filter(|r| r.is_video)
            .max_by_key(|r| r.bandwidth)
            .cloned();
    }
    if audio.is_none() {
        audio = manifest
            .representations
            .iter()
            .filter(|r| r.is_audio)
            .max_by_key(|r| r.bandwidth)
            .cloned();
    }
    (video, audio)
}

struct RunContext {
    id: String,
    config: StreamConfig,
    output_dir: PathBuf,
    shared: Arc<Mutex<SharedState>>,
    stop_notify: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

fn record_error(shared: &Mutex<SharedState>, message: impl Into<String>) {
    let message = message.into();
    let mut st = shared.lock().unwrap();
    st.status = StreamStatus::Error;
    st.error = Some(message);
}

async fn sleep_or_stop(ctx: &RunContext, seconds: f64) {
    if seconds <= 0.0 {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {}
        _ = ctx.stop_notify.notified() => {}
    }
}

/// Download, decrypt, and write the init segment for one track, if it
/// hasn't been written yet.
async fn ensure_init(
    ctx: &RunContext,
    fetcher: &dyn SegmentFetcher,
    decryptor: &Decryptor,
    writer: &mut MultiVariantHlsWriter,
    name: &str,
    track_type: TrackType,
    rep: &Representation,
    single_track: bool,
) -> Result<()> {
    writer.ensure_variant(name, track_type, rep.bandwidth, rep.codecs.clone(), resolution_of(rep), single_track)?;
    if writer.is_init_written(name) {
        return Ok(());
    }
    info!(stream = %ctx.id, track = name, url = %rep.init_url, "downloading init segment");
    let payload = fetcher.fetch_bytes(&rep.init_url, &ctx.config.header_pairs()).await?;
    let plaintext = decryptor.decrypt(&payload, rep.default_kid.as_deref()).await?;
    writer.write_init(name, &plaintext)?;
    info!(stream = %ctx.id, track = name, "init segment written");
    Ok(())
}

fn resolution_of(rep: &Representation) -> Option<(u64, u64)> {
    match (rep.width, rep.height) {
        (Some(w), Some(h)) => Some((w, h)),
        _ => None,
    }
}

/// Download, decrypt, and write every new segment for one track in order,
/// stopping early if a stop signal arrives mid-sequence.
async fn process_track_segments(
    ctx: &RunContext,
    fetcher: &dyn SegmentFetcher,
    decryptor: &Decryptor,
    writer: &mut MultiVariantHlsWriter,
    history: &mut TrackHistory,
    name: &str,
    rep: &Representation,
) -> Result<bool> {
    let new_segments = history.collect_new(&rep.segments);
    if new_segments.is_empty() {
        return Ok(false);
    }

    let mut processed_any = false;
    for segment in new_segments {
        if ctx.stopped.load(Ordering::SeqCst) {
            break;
        }
        let payload = fetcher.fetch_bytes(&segment.url, &ctx.config.header_pairs()).await?;
        let plaintext = decryptor.decrypt(&payload, rep.default_kid.as_deref()).await?;
        writer.add_segment(name, segment.number, segment.duration, &plaintext)?;
        history.mark_processed(segment.number);
        processed_any = true;

        let mut st = ctx.shared.lock().unwrap();
        if name == "video" {
            st.last_sequence_video = Some(segment.number);
        } else {
            st.last_sequence_audio = Some(segment.number);
        }
        drop(st);
        tracing::debug!(stream = %ctx.id, track = name, sequence = segment.number, "processed segment");
    }
    Ok(processed_any)
}

/// One manifest poll: fetch, parse, select representations, ensure init
/// segments, fetch and process new media segments. Returns `Ok(true)` when
/// the stream has reached VOD completion.
#[allow(clippy::too_many_arguments)]
async fn poll_once(
    ctx: &RunContext,
    fetcher: &dyn SegmentFetcher,
    decryptor: &Decryptor,
    writer: &mut MultiVariantHlsWriter,
    histories: &mut std::collections::HashMap<String, TrackHistory>,
    manifest: &Manifest,
) -> Result<bool> {
    let (video_rep, audio_rep) = select_representations(manifest, ctx.config.representation_id.as_deref());
    if video_rep.is_none() && audio_rep.is_none() {
        return Err(ConverterError::RepresentationNotFound(
            "no matching video or audio representation in manifest".to_string(),
        ));
    }
    let single_track = video_rep.is_some() != audio_rep.is_some();

    {
        let mut st = ctx.shared.lock().unwrap();
        st.video = video_rep.as_ref().map(RepresentationMeta::from);
        st.audio = audio_rep.as_ref().map(RepresentationMeta::from);
    }

    if let Some(rep) = &video_rep {
        ensure_init(ctx, fetcher, decryptor, writer, "video", TrackType::Video, rep, single_track).await?;
    }
    if let Some(rep) = &audio_rep {
        ensure_init(ctx, fetcher, decryptor, writer, "audio", TrackType::Audio, rep, single_track).await?;
    }

    let mut processed_any = false;
    if let Some(rep) = &video_rep {
        let history = histories.entry("video".to_string()).or_insert_with(|| TrackHistory::new(ctx.config.history_size));
        processed_any |= process_track_segments(ctx, fetcher, decryptor, writer, history, "video", rep).await?;
    }
    if let Some(rep) = &audio_rep {
        let history = histories.entry("audio".to_string()).or_insert_with(|| TrackHistory::new(ctx.config.history_size));
        processed_any |= process_track_segments(ctx, fetcher, decryptor, writer, history, "audio", rep).await?;
    }

    if processed_any {
        ctx.shared.lock().unwrap().status = StreamStatus::Running;
    }

    if !manifest.is_live {
        let track_complete = |rep: &Option<Representation>, history: &std::collections::HashMap<String, TrackHistory>, name: &str| -> bool {
            let Some(rep) = rep else { return true };
            let Some(last) = rep.segments.last() else { return true };
            history.get(name).and_then(|h| h.last_sequence).map(|s| s >= last.number).unwrap_or(false)
        };
        let video_complete = track_complete(&video_rep, histories, "video");
        let audio_complete = track_complete(&audio_rep, histories, "audio");
        if video_complete && audio_complete {
            writer.finalize()?;
            ctx.shared.lock().unwrap().status = StreamStatus::Completed;
            info!(stream = %ctx.id, "stream completed");
            return Ok(true);
        }
    }

    Ok(false)
}

async fn run_loop(ctx: RunContext, fetcher: Arc<dyn SegmentFetcher>, decryptor: Decryptor) {
    let mut writer: Option<MultiVariantHlsWriter> = None;
    let mut histories: std::collections::HashMap<String, TrackHistory> = std::collections::HashMap::new();

    while !ctx.stopped.load(Ordering::SeqCst) {
        let mpd_text = match fetcher.fetch_text(&ctx.config.mpd_url, &ctx.config.header_pairs()).await {
            Ok(t) => t,
            Err(e) => {
                record_error(&ctx.shared, format!("failed to fetch manifest: {e}"));
                sleep_or_stop(&ctx, ctx.config.poll_interval).await;
                continue;
            }
        };

        let manifest = match manifest::parse(&mpd_text, &ctx.config.mpd_url) {
            Ok(m) => m,
            Err(e) => {
                record_error(&ctx.shared, format!("failed to parse manifest: {e}"));
                sleep_or_stop(&ctx, ctx.config.poll_interval).await;
                continue;
            }
        };
        ctx.shared.lock().unwrap().is_live = manifest.is_live;

        if writer.is_none() {
            writer = Some(MultiVariantHlsWriter::new(ctx.output_dir.clone(), manifest.is_live, ctx.config.window_size));
        }

        let poll_interval = manifest.min_update_period.unwrap_or(ctx.config.poll_interval);

        match poll_once(&ctx, fetcher.as_ref(), &decryptor, writer.as_mut().unwrap(), &mut histories, &manifest).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => record_error(&ctx.shared, e.to_string()),
        }

        sleep_or_stop(&ctx, poll_interval).await;
    }

    let mut st = ctx.shared.lock().unwrap();
    if !matches!(st.status, StreamStatus::Error | StreamStatus::Completed) {
        st.status = StreamStatus::Stopped;
    }
}

/// Owns one DASH -> HLS conversion pipeline end to end.
pub struct StreamSession {
    pub id: String,
    pub config: StreamConfig,
    pub output_dir: PathBuf,
    shared: Arc<Mutex<SharedState>>,
    stop_notify: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSession {
    pub fn new(id: String, config: StreamConfig, base_output_dir: &std::path::Path) -> Result<Self> {
        let output_dir = config.output_dir.clone().unwrap_or_else(|| base_output_dir.join(&id));
        std::fs::create_dir_all(&output_dir).map_err(|e| ConverterError::io(e, format!("creating {}", output_dir.display())))?;
        Ok(StreamSession {
            id,
            config,
            output_dir,
            shared: Arc::new(Mutex::new(SharedState::default())),
            stop_notify: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }

    /// Build the decryptor and launch the pipeline task. Configuration
    /// errors (bad key material, unresolvable decrypt tool) surface
    /// synchronously here and the session never starts.
    pub fn start(&self, fetcher: Arc<dyn SegmentFetcher>) -> Result<()> {
        let decryptor = Decryptor::build(
            self.config.key.as_deref(),
            self.config.kid.as_deref(),
            self.config.key_map.as_ref(),
            self.config.mp4decrypt_path.as_deref(),
        )
        .map_err(|e| {
            record_error(&self.shared, format!("failed to initialize decryptor: {e}"));
            e
        })?;

        self.shared.lock().unwrap().status = StreamStatus::Starting;
        let ctx = RunContext {
            id: self.id.clone(),
            config: self.config.clone(),
            output_dir: self.output_dir.clone(),
            shared: Arc::clone(&self.shared),
            stop_notify: Arc::clone(&self.stop_notify),
            stopped: Arc::clone(&self.stopped),
        };
        let handle = tokio::spawn(run_loop(ctx, fetcher, decryptor));
        *self.task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Signal the stop event, cancel the running task, and await its exit.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(stream = %self.id, "pipeline task panicked: {e}");
                }
            }
        }
        self.shared.lock().unwrap().status = StreamStatus::Stopped;
    }

    /// Snapshot the session's current state for the outward API.
    pub fn info(&self) -> StreamInfo {
        let st = self.shared.lock().unwrap();
        let last_sequence = st.last_sequence_video.or(st.last_sequence_audio);
        StreamInfo {
            stream_id: self.id.clone(),
            mpd_url: self.config.mpd_url.clone(),
            status: st.status,
            hls_url: format!("/hls/{}/master.m3u8", self.id),
            output_dir: self.output_dir.clone(),
            is_live: st.is_live,
            representation_id: st.video.as_ref().map(|v| v.id.clone()),
            bandwidth: st.video.as_ref().map(|v| v.bandwidth),
            codecs: st.video.as_ref().and_then(|v| v.codecs.clone()).or_else(|| st.audio.as_ref().and_then(|a| a.codecs.clone())),
            resolution: st.video.as_ref().and_then(|v| v.resolution),
            error: st.error.clone(),
            label: self.config.label.clone(),
            last_sequence,
            audio_representation_id: st.audio.as_ref().map(|a| a.id.clone()),
            audio_bandwidth: st.audio.as_ref().map(|a| a.bandwidth),
            audio_codecs: st.audio.as_ref().and_then(|a| a.codecs.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Segment;
    use pretty_assertions::assert_eq;

    fn seg(n: u64) -> Segment {
        Segment { url: format!("https://cdn.example.com/{n}.m4s"), duration: 2.0, number: n }
    }

    #[test]
    fn dedup_across_polls() {
        let mut history = TrackHistory::new(64);
        let poll1 = [seg(5), seg(6), seg(7)];
        let new1 = history.collect_new(&poll1);
        assert_eq!(new1.len(), 3);
        for s in &new1 {
            history.mark_processed(s.number);
        }

        let poll2 = [seg(6), seg(7), seg(8)];
        let new2 = history.collect_new(&poll2);
        let numbers: Vec<u64> = new2.iter().map(|s| s.number).collect();
        assert_eq!(numbers, vec![8]);
        history.mark_processed(8);

        assert_eq!(history.last_sequence, Some(8));
    }

    #[test]
    fn history_evicts_beyond_bound_without_reintroducing_old_numbers() {
        let mut history = TrackHistory::new(3);
        for n in 1..=5u64 {
            history.mark_processed(n);
        }
        assert_eq!(history.queue.len(), 3);
        assert!(!history.seen.contains(&1));
        assert!(!history.seen.contains(&2));
        assert!(history.seen.contains(&5));
    }

    fn make_rep(id: &str, is_video: bool, is_audio: bool, bandwidth: u64) -> Representation {
        Representation {
            id: id.to_string(),
            bandwidth,
            codecs: None,
            mime_type: None,
            width: None,
            height: None,
            init_url: String::new(),
            segments: vec![],
            is_video,
            is_audio,
            default_kid: None,
        }
    }

    fn make_manifest(reps: Vec<Representation>) -> Manifest {
        Manifest {
            base_url: "https://cdn.example.com/".to_string(),
            media_presentation_duration: None,
            representations: reps,
            is_live: false,
            min_update_period: None,
        }
    }

    #[test]
    fn selects_highest_bandwidth_video_and_audio() {
        let manifest = make_manifest(vec![
            make_rep("v0", true, false, 500_000),
            make_rep("v1", true, false, 1_500_000),
            make_rep("a0", false, true, 64_000),
            make_rep("a1", false, true, 128_000),
        ]);
        let (video, audio) = select_representations(&manifest, None);
        assert_eq!(video.unwrap().id, "v1");
        assert_eq!(audio.unwrap().id, "a1");
    }

    #[test]
    fn representation_id_audio_only_fills_audio_slot_and_video_autoselects() {
        let manifest = make_manifest(vec![
            make_rep("v0", true, false, 500_000),
            make_rep("a0", false, true, 64_000),
            make_rep("a1", false, true, 128_000),
        ]);
        let (video, audio) = select_representations(&manifest, Some("a0"));
        assert_eq!(video.unwrap().id, "v0");
        assert_eq!(audio.unwrap().id, "a0");
    }

    #[test]
    fn representation_id_video_match_is_honored_over_bandwidth() {
        let manifest = make_manifest(vec![
            make_rep("v0", true, false, 500_000),
            make_rep("v1", true, false, 1_500_000),
        ]);
        let (video, _audio) = select_representations(&manifest, Some("v0"));
        assert_eq!(video.unwrap().id, "v0");
    }
}
