//! Resolution of the four DASH segment-addressing schemes
//! (`SegmentTemplate` timeline- or duration-driven, `SegmentList`,
//! `SegmentBase`) into `(init_url, Vec<Segment>)`.

use url::Url;

use crate::manifest::{MergedTemplate, Segment, XmlSegmentBase, XmlSegmentList};
use crate::template::{resolve_url_template, TemplateParams};

/// `r = -1` in a live `SegmentTimeline` means "repeat until the end of the
/// period". Projecting that exactly would require the period's end time and
/// the current wall clock, neither of which is always available, so we
/// repeat a bounded number of times instead of treating it as unbounded.
const LIVE_TIMELINE_UNBOUNDED_REPEAT: i64 = 30;
/// Fallback segment count for duration-driven `SegmentTemplate` when no
/// period/media duration is known (live manifests without `@duration`).
const DURATION_FALLBACK_SEGMENT_COUNT: u64 = 200;

fn resolve_init_url(base: &Url, template: &str, rep_id: &str, bandwidth: u64) -> String {
    let params = TemplateParams {
        representation_id: Some(rep_id),
        number: Some(0),
        time: Some(0),
        bandwidth: Some(bandwidth),
    };
    let filled = resolve_url_template(template, &params);
    base.join(&filled)
        .map(|u| u.to_string())
        .unwrap_or(filled)
}

fn resolve_media_url(base: &Url, template: &str, rep_id: &str, number: u64, time: u64, bandwidth: u64) -> String {
    let params = TemplateParams {
        representation_id: Some(rep_id),
        number: Some(number),
        time: Some(time),
        bandwidth: Some(bandwidth),
    };
    let filled = resolve_url_template(template, &params);
    base.join(&filled).map(|u| u.to_string()).unwrap_or(filled)
}

fn resolve_timeline(
    base: &Url,
    media_template: &str,
    rep_id: &str,
    bandwidth: u64,
    timeline: &crate::manifest::XmlSegmentTimeline,
    timescale: u64,
    start_number: u64,
    presentation_time_offset: u64,
    is_live: bool,
) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut time: i64 = 0;
    let mut number = start_number;

    for s in &timeline.segments {
        if let Some(t) = s.t {
            time = t;
        }
        let d = s.d;
        let repeat_count = match s.r {
            None | Some(0) => 0,
            Some(r) if r > 0 => r,
            // r == -1 (or any other negative value): repeat to end of period.
            Some(_) => {
                if is_live {
                    LIVE_TIMELINE_UNBOUNDED_REPEAT
                } else {
                    0
                }
            }
        };

        for _ in 0..=repeat_count {
            let presented_time = time - presentation_time_offset as i64;
            let url = resolve_media_url(base, media_template, rep_id, number, presented_time.max(0) as u64, bandwidth);
            segments.push(Segment {
                url,
                duration: d as f64 / timescale as f64,
                number,
            });
            time += d;
            number += 1;
        }
    }

    segments
}

fn resolve_duration_driven(
    base: &Url,
    media_template: &str,
    rep_id: &str,
    bandwidth: u64,
    duration: u64,
    timescale: u64,
    start_number: u64,
    total_duration: Option<f64>,
) -> Vec<Segment> {
    if duration == 0 {
        return Vec::new();
    }
    let segment_duration = duration as f64 / timescale as f64;
    let count = match total_duration {
        Some(total) if segment_duration > 0.0 => ((total / segment_duration).ceil() as u64).max(1),
        _ => DURATION_FALLBACK_SEGMENT_COUNT,
    };

    let mut segments = Vec::with_capacity(count as usize);
    let mut time: u64 = 0;
    for i in 0..count {
        let number = start_number + i;
        let url = resolve_media_url(base, media_template, rep_id, number, time, bandwidth);
        segments.push(Segment {
            url,
            duration: segment_duration,
            number,
        });
        time += duration;
    }
    segments
}

fn resolve_segment_list(base: &Url, list: &XmlSegmentList) -> (String, Vec<Segment>) {
    let init_url = list
        .initialization
        .as_ref()
        .and_then(|i| i.sourceURL.as_deref())
        .map(|s| base.join(s).map(|u| u.to_string()).unwrap_or_else(|_| s.to_string()))
        .unwrap_or_default();

    let list_duration = list.duration.unwrap_or(1.0);
    let timescale = list.timescale.unwrap_or(1).max(1) as f64;
    let start_number = list.startNumber.unwrap_or(1);

    let segments = list
        .segment_urls
        .iter()
        .enumerate()
        .filter_map(|(idx, s)| {
            let media = s.media.as_deref()?;
            let url = base.join(media).map(|u| u.to_string()).unwrap_or_else(|_| media.to_string());
            Some(Segment {
                url,
                duration: list_duration / timescale,
                number: start_number + idx as u64,
            })
        })
        .collect();

    (init_url, segments)
}

fn resolve_segment_base(base: &Url, seg_base: &XmlSegmentBase, total_duration: Option<f64>) -> (String, Vec<Segment>) {
    let init_url = seg_base
        .initialization
        .as_ref()
        .and_then(|i| i.sourceURL.as_deref())
        .map(|s| base.join(s).map(|u| u.to_string()).unwrap_or_else(|_| s.to_string()))
        .unwrap_or_default();

    let segments = vec![Segment {
        url: base.to_string(),
        duration: total_duration.unwrap_or(0.0),
        number: 1,
    }];

    (init_url, segments)
}

/// Resolve whichever segment-addressing scheme is present for a single
/// representation. Returns `None` when no scheme yields a usable init URL +
/// segment list (caller skips the representation).
#[allow(clippy::too_many_arguments)]
pub(crate) fn resolve_segments(
    rep_base: &Url,
    rep_id: &str,
    bandwidth: u64,
    merged_template: Option<&MergedTemplate>,
    segment_list: Option<&XmlSegmentList>,
    segment_base: Option<&XmlSegmentBase>,
    total_duration: Option<f64>,
    is_live: bool,
) -> Option<(String, Vec<Segment>)> {
    if let Some(tpl) = merged_template {
        let media_template = tpl.media.as_deref()?;
        let init_url = tpl
            .initialization
            .as_deref()
            .map(|t| resolve_init_url(rep_base, t, rep_id, bandwidth))
            .unwrap_or_default();

        let segments = if let Some(timeline) = &tpl.timeline {
            resolve_timeline(
                rep_base,
                media_template,
                rep_id,
                bandwidth,
                timeline,
                tpl.timescale,
                tpl.start_number,
                tpl.presentation_time_offset,
                is_live,
            )
        } else if let Some(duration) = tpl.duration {
            resolve_duration_driven(
                rep_base,
                media_template,
                rep_id,
                bandwidth,
                duration,
                tpl.timescale,
                tpl.start_number,
                total_duration,
            )
        } else {
            Vec::new()
        };

        return Some((init_url, segments));
    }

    if let Some(list) = segment_list {
        return Some(resolve_segment_list(rep_base, list));
    }

    if let Some(sb) = segment_base {
        return Some(resolve_segment_base(rep_base, sb, total_duration));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{XmlS, XmlSegmentTimeline};
    use pretty_assertions::assert_eq;

    fn base() -> Url {
        Url::parse("https://cdn.example.com/stream/").unwrap()
    }

    #[test]
    fn timeline_repeat_expands_r_plus_one_segments() {
        let timeline = XmlSegmentTimeline {
            segments: vec![XmlS { t: Some(0), d: 48_000, r: Some(2) }],
        };
        let segs = resolve_timeline(&base(), "$Time$.m4s", "v0", 1000, &timeline, 48_000, 1, 0, true);
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].number, 1);
        assert_eq!(segs[1].number, 2);
        assert_eq!(segs[2].number, 3);
        for s in &segs {
            assert!((s.duration - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn timeline_reset_on_explicit_t() {
        let timeline = XmlSegmentTimeline {
            segments: vec![
                XmlS { t: Some(0), d: 10, r: Some(1) },
                XmlS { t: Some(100), d: 10, r: None },
            ],
        };
        let segs = resolve_timeline(&base(), "$Time$.m4s", "v0", 1000, &timeline, 10, 1, 0, false);
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[2].url, "https://cdn.example.com/stream/100.m4s");
    }

    #[test]
    fn negative_repeat_bounded_on_live_zero_on_vod() {
        let timeline = XmlSegmentTimeline {
            segments: vec![XmlS { t: Some(0), d: 10, r: Some(-1) }],
        };
        let live = resolve_timeline(&base(), "$Time$.m4s", "v0", 1000, &timeline, 10, 1, 0, true);
        assert_eq!(live.len(), LIVE_TIMELINE_UNBOUNDED_REPEAT as usize + 1);
        let vod = resolve_timeline(&base(), "$Time$.m4s", "v0", 1000, &timeline, 10, 1, 0, false);
        assert_eq!(vod.len(), 1);
    }

    #[test]
    fn duration_driven_count_from_total_duration() {
        let segs = resolve_duration_driven(&base(), "$Number$.m4s", "v0", 1000, 96, 24, 1, Some(8.0));
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].number, 1);
        assert_eq!(segs[1].number, 2);
    }

    #[test]
    fn duration_driven_fallback_when_total_unknown() {
        let segs = resolve_duration_driven(&base(), "$Number$.m4s", "v0", 1000, 96, 24, 1, None);
        assert_eq!(segs.len(), DURATION_FALLBACK_SEGMENT_COUNT as usize);
    }
}
