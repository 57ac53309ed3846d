//! Parsing of DASH MPD manifests into the flattened `Manifest`/`Representation`/
//! `Segment` data model the rest of the pipeline consumes.
//!
//! The raw serde structs mirror the MPD schema's `MPD`/`Period`/
//! `AdaptationSet`/`Representation` elements and their segment-addressing
//! children; parsing then classifies each representation, resolves its
//! default KID, and walks the `BaseURL` hierarchy down to an absolute URL.

use std::collections::HashMap;

use serde::Deserialize;
use url::Url;

use crate::duration::parse_xs_duration;
use crate::error::{ConverterError, Result};
use crate::segments::resolve_segments;

// ---------------------------------------------------------------------
// Raw XML structs (one-to-one with the MPD schema elements we need)
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone, Default)]
pub struct XmlS {
    pub t: Option<i64>,
    #[serde(default)]
    pub d: i64,
    pub r: Option<i64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct XmlSegmentTimeline {
    #[serde(rename = "S", default)]
    pub segments: Vec<XmlS>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct XmlInitialization {
    pub sourceURL: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct XmlSegmentTemplate {
    pub initialization: Option<String>,
    pub media: Option<String>,
    pub SegmentTimeline: Option<XmlSegmentTimeline>,
    pub startNumber: Option<u64>,
    pub duration: Option<u64>,
    pub timescale: Option<u64>,
    pub presentationTimeOffset: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct XmlBaseURL {
    #[serde(rename = "$value")]
    pub base: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct XmlSegmentBase {
    #[serde(rename = "Initialization")]
    pub initialization: Option<XmlInitialization>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct XmlSegmentURL {
    pub media: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct XmlSegmentList {
    pub duration: Option<f64>,
    pub startNumber: Option<u64>,
    pub timescale: Option<u64>,
    #[serde(rename = "Initialization")]
    pub initialization: Option<XmlInitialization>,
    #[serde(rename = "SegmentURL", default)]
    pub segment_urls: Vec<XmlSegmentURL>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct XmlContentProtection {
    #[serde(flatten)]
    pub extra_attrs: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct XmlRepresentation {
    pub id: Option<String>,
    pub mimeType: Option<String>,
    pub contentType: Option<String>,
    pub codecs: Option<String>,
    pub bandwidth: Option<u64>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub BaseURL: Option<XmlBaseURL>,
    pub SegmentTemplate: Option<XmlSegmentTemplate>,
    pub SegmentBase: Option<XmlSegmentBase>,
    pub SegmentList: Option<XmlSegmentList>,
    #[serde(rename = "ContentProtection", default)]
    pub content_protections: Vec<XmlContentProtection>,
    #[serde(flatten)]
    pub extra_attrs: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct XmlAdaptationSet {
    pub mimeType: Option<String>,
    pub contentType: Option<String>,
    pub codecs: Option<String>,
    pub BaseURL: Option<XmlBaseURL>,
    pub SegmentTemplate: Option<XmlSegmentTemplate>,
    #[serde(rename = "Representation", default)]
    pub representations: Vec<XmlRepresentation>,
    #[serde(rename = "ContentProtection", default)]
    pub content_protections: Vec<XmlContentProtection>,
    #[serde(flatten)]
    pub extra_attrs: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct XmlPeriod {
    pub duration: Option<String>,
    pub BaseURL: Option<XmlBaseURL>,
    pub SegmentTemplate: Option<XmlSegmentTemplate>,
    #[serde(rename = "AdaptationSet", default)]
    pub adaptation_sets: Vec<XmlAdaptationSet>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct XmlMPD {
    #[serde(rename = "type")]
    pub mpdtype: Option<String>,
    pub mediaPresentationDuration: Option<String>,
    pub minimumUpdatePeriod: Option<String>,
    pub BaseURL: Option<XmlBaseURL>,
    pub SegmentTemplate: Option<XmlSegmentTemplate>,
    #[serde(rename = "Period", default)]
    pub periods: Vec<XmlPeriod>,
}

// ---------------------------------------------------------------------
// Flattened output model
// ---------------------------------------------------------------------

/// A single addressable media segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub url: String,
    pub duration: f64,
    pub number: u64,
}

/// One encoded rendition of a media track.
#[derive(Debug, Clone)]
pub struct Representation {
    pub id: String,
    pub bandwidth: u64,
    pub codecs: Option<String>,
    pub mime_type: Option<String>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub init_url: String,
    pub segments: Vec<Segment>,
    pub is_video: bool,
    pub is_audio: bool,
    pub default_kid: Option<String>,
}

/// A parsed MPD manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub base_url: String,
    pub media_presentation_duration: Option<f64>,
    pub representations: Vec<Representation>,
    pub is_live: bool,
    pub min_update_period: Option<f64>,
}

/// Merged `SegmentTemplate` context, after applying hierarchical inheritance
/// (MPD -> Period -> AdaptationSet -> Representation, child overrides
/// parent).
#[derive(Debug, Clone, Default)]
pub(crate) struct MergedTemplate {
    pub initialization: Option<String>,
    pub media: Option<String>,
    pub timeline: Option<XmlSegmentTimeline>,
    pub start_number: u64,
    pub duration: Option<u64>,
    pub timescale: u64,
    pub presentation_time_offset: u64,
}

fn merge_template(levels: [Option<&XmlSegmentTemplate>; 4]) -> Option<MergedTemplate> {
    if levels.iter().all(Option::is_none) {
        return None;
    }
    let mut merged = MergedTemplate {
        start_number: 1,
        timescale: 1,
        ..Default::default()
    };
    for level in levels.into_iter().flatten() {
        if let Some(v) = &level.initialization {
            merged.initialization = Some(v.clone());
        }
        if let Some(v) = &level.media {
            merged.media = Some(v.clone());
        }
        if let Some(v) = &level.SegmentTimeline {
            merged.timeline = Some(v.clone());
        }
        if let Some(v) = level.startNumber {
            merged.start_number = v;
        }
        if let Some(v) = level.duration {
            merged.duration = Some(v);
        }
        if let Some(v) = level.timescale {
            merged.timescale = if v == 0 { 1 } else { v };
        }
        if let Some(v) = level.presentationTimeOffset {
            merged.presentation_time_offset = v;
        }
    }
    Some(merged)
}

fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://") || s.starts_with("file://")
}

fn join_base(current: &Url, child: Option<&str>) -> Result<Url> {
    match child {
        Some(s) if !s.is_empty() => {
            if is_absolute_url(s) {
                Url::parse(s).map_err(|e| ConverterError::Parsing(format!("invalid BaseURL {s}: {e}")))
            } else {
                current
                    .join(s)
                    .map_err(|e| ConverterError::Parsing(format!("resolving BaseURL {s}: {e}")))
            }
        }
        _ => Ok(current.clone()),
    }
}

fn looks_like_subtitle_mime(mime: &str) -> bool {
    let lower = mime.to_lowercase();
    lower.contains("ttml") || lower.contains("vtt") || lower.contains("srt") || lower.contains("text")
}

fn adaptation_set_is_media(a: &XmlAdaptationSet) -> bool {
    if let Some(ct) = &a.contentType {
        if ct != "audio" && ct != "video" {
            return false;
        }
    }
    if let Some(mime) = &a.mimeType {
        if looks_like_subtitle_mime(mime) {
            return false;
        }
    }
    true
}

/// Classify a representation as audio, video, or neither, by substring match
/// on the representation's own MIME/contentType, falling back to the parent
/// adaptation set's.
fn classify(rep: &XmlRepresentation, aset: &XmlAdaptationSet) -> (bool, bool) {
    let mime = rep.mimeType.as_deref().or(aset.mimeType.as_deref()).unwrap_or("");
    let ct = rep.contentType.as_deref().or(aset.contentType.as_deref()).unwrap_or("");
    let is_video = mime.contains("video") || ct.contains("video");
    let is_audio = mime.contains("audio") || ct.contains("audio");
    (is_video, is_audio)
}

const CENC_DEFAULT_KID_KEYS: [&str; 3] = [
    "{urn:mpeg:cenc:2013}default_KID",
    "cenc:default_KID",
    "default_KID",
];

fn attr_default_kid(attrs: &HashMap<String, String>) -> Option<String> {
    for key in CENC_DEFAULT_KID_KEYS {
        if let Some(v) = attrs.get(key) {
            return Some(normalize_kid(v));
        }
    }
    None
}

pub(crate) fn normalize_kid(s: &str) -> String {
    s.replace('-', "").to_lowercase()
}

fn resolve_default_kid(rep: &XmlRepresentation, aset: &XmlAdaptationSet) -> Option<String> {
    if let Some(kid) = attr_default_kid(&rep.extra_attrs) {
        return Some(kid);
    }
    for cp in &rep.content_protections {
        if let Some(kid) = attr_default_kid(&cp.extra_attrs) {
            return Some(kid);
        }
    }
    if let Some(kid) = attr_default_kid(&aset.extra_attrs) {
        return Some(kid);
    }
    for cp in &aset.content_protections {
        if let Some(kid) = attr_default_kid(&cp.extra_attrs) {
            return Some(kid);
        }
    }
    None
}

/// Parse an MPD manifest, provided as an XML string and its source URL.
pub fn parse(xml: &str, mpd_url: &str) -> Result<Manifest> {
    let mpd_url_parsed = Url::parse(mpd_url)
        .map_err(|e| ConverterError::Parsing(format!("invalid MPD URL {mpd_url}: {e}")))?;
    let mut mpd_base = mpd_url_parsed.clone();
    if let Ok(mut segs) = mpd_base.path_segments_mut() {
        segs.pop();
        segs.push("");
    }

    let mpd: XmlMPD = quick_xml::de::from_str(xml)
        .map_err(|e| ConverterError::Parsing(format!("parsing MPD XML: {e}")))?;

    let mpd_base = join_base(&mpd_base, mpd.BaseURL.as_ref().map(|b| b.base.as_str()))?;

    let is_live = mpd
        .mpdtype
        .as_deref()
        .map(|t| t.eq_ignore_ascii_case("dynamic"))
        .unwrap_or(false);
    let media_duration = mpd
        .mediaPresentationDuration
        .as_deref()
        .map(parse_xs_duration);
    let min_update_period = mpd.minimumUpdatePeriod.as_deref().map(parse_xs_duration);

    let mut representations = Vec::new();

    for period in &mpd.periods {
        let period_base = join_base(&mpd_base, period.BaseURL.as_ref().map(|b| b.base.as_str()))?;
        let period_duration = period.duration.as_deref().map(parse_xs_duration);
        let total_duration = period_duration.or(media_duration);

        for aset in &period.adaptation_sets {
            if !adaptation_set_is_media(aset) {
                continue;
            }
            let aset_base = join_base(&period_base, aset.BaseURL.as_ref().map(|b| b.base.as_str()))?;

            for rep in &aset.representations {
                let (is_video, is_audio) = classify(rep, aset);
                if !is_video && !is_audio {
                    continue;
                }

                let rep_base = join_base(&aset_base, rep.BaseURL.as_ref().map(|b| b.base.as_str()))?;
                let default_kid = resolve_default_kid(rep, aset);
                let bandwidth = rep.bandwidth.unwrap_or(0);
                let rep_id = rep.id.clone().unwrap_or_default();

                let merged_template = merge_template([
                    mpd.SegmentTemplate.as_ref(),
                    period.SegmentTemplate.as_ref(),
                    aset.SegmentTemplate.as_ref(),
                    rep.SegmentTemplate.as_ref(),
                ]);

                let Some((init_url, segments)) = resolve_segments(
                    &rep_base,
                    &rep_id,
                    bandwidth,
                    merged_template.as_ref(),
                    rep.SegmentList.as_ref(),
                    rep.SegmentBase.as_ref(),
                    total_duration,
                    is_live,
                ) else {
                    // No usable addressing scheme: skip this representation silently.
                    continue;
                };

                representations.push(Representation {
                    id: rep_id,
                    bandwidth,
                    codecs: rep.codecs.clone().or_else(|| aset.codecs.clone()),
                    mime_type: rep.mimeType.clone().or_else(|| aset.mimeType.clone()),
                    width: rep.width,
                    height: rep.height,
                    init_url,
                    segments,
                    is_video,
                    is_audio,
                    default_kid,
                });
            }
        }
    }

    Ok(Manifest {
        base_url: mpd_base.to_string(),
        media_presentation_duration: media_duration,
        representations,
        is_live,
        min_update_period,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn kid_normalization_strips_dashes_and_lowercases() {
        assert_eq!(normalize_kid("AB-CD-EF"), "abcdef");
        assert_eq!(normalize_kid("0123456789ABCDEF"), "0123456789abcdef");
    }

    #[test]
    fn zero_padded_number_template() {
        let xml = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT8S">
  <Period>
    <AdaptationSet mimeType="video/mp4">
      <Representation id="v0" bandwidth="500000">
        <SegmentTemplate media="video/$Number%02d$.m4s" initialization="video/init.mp4"
                         startNumber="1" duration="96" timescale="24"/>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let manifest = parse(xml, "https://cdn.example.com/stream/manifest.mpd").unwrap();
        assert_eq!(manifest.representations.len(), 1);
        let rep = &manifest.representations[0];
        assert_eq!(rep.init_url, "https://cdn.example.com/stream/video/init.mp4");
        assert_eq!(rep.segments.len(), 2);
        assert_eq!(rep.segments[0].url, "https://cdn.example.com/stream/video/01.m4s");
        assert_eq!(rep.segments[1].url, "https://cdn.example.com/stream/video/02.m4s");
        assert!((rep.segments[0].duration - 4.0).abs() < 1e-9);
    }

    #[test]
    fn segment_timeline_live() {
        let xml = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic">
  <Period>
    <AdaptationSet mimeType="video/mp4">
      <Representation id="v0" bandwidth="500000">
        <SegmentTemplate media="video/$Time$.m4s" initialization="video/init.mp4"
                         startNumber="1" timescale="48000">
          <SegmentTimeline>
            <S t="0" d="48000" r="2"/>
          </SegmentTimeline>
        </SegmentTemplate>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let manifest = parse(xml, "https://cdn.example.com/stream/manifest.mpd").unwrap();
        let rep = &manifest.representations[0];
        assert_eq!(rep.segments.len(), 3);
        assert_eq!(rep.segments[0].number, 1);
        assert_eq!(rep.segments[2].number, 3);
        for seg in &rep.segments {
            assert!((seg.duration - 1.0).abs() < 1e-9);
        }
        assert_eq!(rep.segments[0].url, "https://cdn.example.com/stream/video/0.m4s");
        assert_eq!(rep.segments[1].url, "https://cdn.example.com/stream/video/48000.m4s");
        assert_eq!(rep.segments[2].url, "https://cdn.example.com/stream/video/96000.m4s");
    }

    #[test]
    fn subtitle_adaptation_sets_are_skipped() {
        let xml = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT8S">
  <Period>
    <AdaptationSet mimeType="application/ttml+xml" contentType="text">
      <Representation id="s0" bandwidth="1000">
        <SegmentTemplate media="sub/$Number$.vtt" initialization="sub/init.mp4"
                         startNumber="1" duration="8" timescale="1"/>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let manifest = parse(xml, "https://cdn.example.com/stream/manifest.mpd").unwrap();
        assert!(manifest.representations.is_empty());
    }

    #[test]
    fn default_kid_from_representation_content_protection() {
        let xml = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT8S">
  <Period>
    <AdaptationSet mimeType="video/mp4">
      <Representation id="v0" bandwidth="500000">
        <ContentProtection schemeIdUri="urn:mpeg:dash:mp4protection:2011" cenc:default_KID="ab-cd-ef-00-00-00-00-00-00-00-00-00-00-00-00-00" xmlns:cenc="urn:mpeg:cenc:2013"/>
        <SegmentTemplate media="video/$Number$.m4s" initialization="video/init.mp4"
                         startNumber="1" duration="8" timescale="1"/>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let manifest = parse(xml, "https://cdn.example.com/stream/manifest.mpd").unwrap();
        let rep = &manifest.representations[0];
        assert_eq!(rep.default_kid.as_deref(), Some("abcdef000000000000000000000000"));
    }
}
