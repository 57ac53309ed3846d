//! A library for converting encrypted MPEG-DASH live and on-demand streams
//! into playable HLS output in real time.
//!
//! For each DASH source, described by an MPD manifest URL, this crate
//! discovers the best video and audio representations, polls the manifest
//! for new media segments, downloads and decrypts them, and maintains a
//! sliding-window HLS master playlist plus per-track media playlists and
//! segment files on disk.
//!
//! The crate is organized leaves-first as a flat `src/*.rs`
//! parser-plus-downloader layout:
//!
//! - [`duration`] — ISO 8601 / `xs:duration` parsing.
//! - [`template`] — `$Variable$` / `$Variable%0Wd$` substitution.
//! - [`manifest`] — the MPD parser: base-URL resolution, element
//!   classification, default-KID resolution, into a flattened
//!   [`manifest::Manifest`]/[`manifest::Representation`] model.
//! - [`segments`] — `SegmentTemplate`/`SegmentList`/`SegmentBase`
//!   resolution into concrete segment URLs.
//! - [`fetch`] — the HTTP collaborator that downloads manifest text and
//!   segment bytes.
//! - [`decryption`] — the CENC decryptor, pass-through or backed by an
//!   external `mp4decrypt`-shaped binary.
//! - [`hls`] — the HLS window writer: per-track media playlists, a
//!   sliding segment window in live mode, and the master playlist.
//! - [`config`] — [`config::StreamConfig`], [`config::StreamInfo`],
//!   [`config::StreamStatus`].
//! - [`session`] — [`session::StreamSession`], the per-stream pipeline.
//! - [`manager`] — [`manager::StreamManager`], the multi-stream registry.
//!
//! This crate does not itself expose the outward HTTP API or CLI; those
//! live in the `dash2hls-server` and `dash2hls-cli` binaries and consume
//! this library's public surface.

pub mod config;
pub mod decryption;
pub mod duration;
pub mod error;
pub mod fetch;
pub mod hls;
pub mod manager;
pub mod manifest;
pub mod segments;
pub mod session;
pub mod template;

pub use config::{StreamConfig, StreamInfo, StreamStatus};
pub use error::{ConverterError, Result};
pub use manager::StreamManager;
pub use session::StreamSession;
