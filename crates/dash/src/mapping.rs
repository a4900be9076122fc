// MPD → presentation model mapping and segment-index construction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use base64::Engine as _;
use bytes::Bytes;
use tracing::{debug, warn};
use url::Url;

use presentation::{
    ByteRange, DrmInfo, InitData, InitSegmentReference, KeyId, Period, Presentation,
    PresentationTimeline, SegmentIndex, SegmentIndexHandle, SegmentReference, Stream, StreamId,
    StreamType, Variant, VariantId,
};

use crate::error::DashError;
use crate::mpd::{
    self, AdaptationSet, ContentProtection, Mpd, Representation, SegmentTemplate,
};
use crate::template::{fill_template, TemplateValues};

const WIDEVINE_UUID: &str = "edef8ba9-79d6-4ace-a3c8-27dcd51d21ed";
const PLAYREADY_UUID: &str = "9a04f079-9840-4286-ab92-e65be0885f95";
const CLEARKEY_UUID: &str = "e2719d58-a985-b3c9-781a-b030af78d30e";
const MP4_PROTECTION_SCHEME: &str = "urn:mpeg:dash:mp4protection:2011";
const TRICK_MODE_SCHEME: &str = "http://dashif.org/guidelines/trickmode";

/// Default presentation delay when the MPD suggests none.
const DEFAULT_PRESENTATION_DELAY: f64 = 10.0;

/// Allocates stable stream ids keyed by representation id so streams keep
/// their identity across manifest updates.
#[derive(Debug, Default)]
pub struct StreamIdAllocator {
    next: StreamId,
    by_key: HashMap<String, StreamId>,
}

impl StreamIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id_for(&mut self, key: &str) -> StreamId {
        if let Some(id) = self.by_key.get(key) {
            return *id;
        }
        let id = self.next;
        self.next += 1;
        self.by_key.insert(key.to_string(), id);
        id
    }
}

/// A deferred `SegmentBase@indexRange` fetch the engine must resolve before
/// the stream's segment index exists.
#[derive(Debug, Clone)]
pub struct SidxJob {
    pub stream_id: StreamId,
    pub uris: Vec<String>,
    pub index_range: ByteRange,
    pub init_segment: Option<Arc<InitSegmentReference>>,
    pub presentation_time_offset: f64,
}

/// A DASH `EventStream` event mapped into presentation time.
#[derive(Debug, Clone)]
pub struct DashEventRegion {
    pub scheme_id_uri: String,
    pub value: String,
    pub id: String,
    pub start_time: f64,
    pub end_time: f64,
    pub message_data: Option<String>,
}

#[derive(Debug)]
pub struct MappedPeriod {
    pub period: Period,
    pub sidx_jobs: Vec<SidxJob>,
    pub regions: Vec<DashEventRegion>,
}

#[derive(Debug)]
pub struct MappedManifest {
    pub presentation: Presentation,
    pub sidx_jobs: Vec<SidxJob>,
    pub regions: Vec<DashEventRegion>,
    /// `minimumUpdatePeriod` in seconds, when the MPD asks to be refreshed.
    pub min_update_period: Option<f64>,
    /// `(scheme, value)` pairs from `UTCTiming` elements, in document order.
    pub utc_timings: Vec<(String, Option<String>)>,
}

/// Maps a parsed MPD into the presentation model.
///
/// Pure except for reading `clock` to bound live template expansion; all
/// deferred I/O is returned as [`SidxJob`]s.
pub fn map_mpd(
    mpd: &Mpd,
    manifest_uri: &str,
    allocator: &mut StreamIdAllocator,
    clock: Arc<dyn presentation::Clock>,
) -> Result<MappedManifest, DashError> {
    if mpd.periods.is_empty() {
        return Err(DashError::NoPeriods);
    }

    let timeline = build_timeline(mpd, clock)?;
    let mut presentation = Presentation::new(timeline);
    presentation.min_buffer_time = mpd
        .minBufferTime
        .as_deref()
        .and_then(|v| mpd::parse_xs_duration(v).ok())
        .unwrap_or(0.0);

    let mpd_bases = resolve_bases(&[manifest_uri.to_string()], &mpd.base_urls);

    // Period start inference: @start, else previous start + previous
    // duration, else 0 for the first period.
    let mut inferred_start = 0.0f64;
    let mut mapped_periods = Vec::new();
    for (index, period) in mpd.periods.iter().enumerate() {
        let start = match period.start.as_deref() {
            Some(value) => mpd::parse_xs_duration(value)?,
            None => inferred_start,
        };
        let declared_duration = period
            .duration
            .as_deref()
            .map(mpd::parse_xs_duration)
            .transpose()?;
        let duration = declared_duration.unwrap_or_else(|| {
            match mpd.periods.get(index + 1).and_then(|next| next.start.as_deref()) {
                Some(next_start) => mpd::parse_xs_duration(next_start)
                    .map(|next| next - start)
                    .unwrap_or(f64::INFINITY),
                None => presentation.timeline.duration() - start,
            }
        });
        inferred_start = start + duration;

        let period_id = period
            .id
            .clone()
            .unwrap_or_else(|| format!("__period_{index}"));
        let mapped = map_period(
            period,
            &period_id,
            start,
            duration,
            &mpd_bases,
            &presentation.timeline,
            allocator,
        )?;
        mapped_periods.push(mapped);
    }

    let mut sidx_jobs = Vec::new();
    let mut regions = Vec::new();
    for mapped in mapped_periods {
        sidx_jobs.extend(mapped.sidx_jobs);
        regions.extend(mapped.regions);
        presentation.periods.push(mapped.period);
    }

    // A static MPD without an explicit duration gets the maximum observed
    // segment end; the timeline only ever shrinks, so start from infinity.
    if !mpd.is_dynamic() && mpd.mediaPresentationDuration.is_none() {
        let observed = presentation
            .periods
            .iter()
            .map(|p| {
                let index_end = p
                    .streams
                    .values()
                    .filter_map(|s| {
                        s.index
                            .with(|i| i.references().last().map(|r| r.end_time))
                            .flatten()
                    })
                    .fold(0.0f64, f64::max);
                p.start_time + index_end
            })
            .fold(0.0f64, f64::max);
        if observed > 0.0 {
            presentation.timeline.set_duration(observed);
        }
    }

    // Track the largest declared or observed segment duration.
    if let Some(value) = mpd.maxSegmentDuration.as_deref() {
        presentation
            .timeline
            .notify_max_segment_duration(mpd::parse_xs_duration(value)?);
    }
    let observed_max = presentation
        .periods
        .iter()
        .flat_map(|p| p.streams.values())
        .filter_map(|s| {
            s.index
                .with(|i| {
                    i.references()
                        .iter()
                        .map(|r| r.duration())
                        .fold(0.0f64, f64::max)
                })
        })
        .fold(0.0f64, f64::max);
    presentation.timeline.notify_max_segment_duration(observed_max);

    Ok(MappedManifest {
        presentation,
        sidx_jobs,
        regions,
        min_update_period: mpd
            .minimumUpdatePeriod
            .as_deref()
            .and_then(|v| mpd::parse_xs_duration(v).ok()),
        utc_timings: mpd
            .utc_timings
            .iter()
            .filter_map(|t| t.schemeIdUri.clone().map(|s| (s, t.value.clone())))
            .collect(),
    })
}

fn build_timeline(
    mpd: &Mpd,
    clock: Arc<dyn presentation::Clock>,
) -> Result<PresentationTimeline, DashError> {
    if mpd.is_dynamic() {
        let start = match mpd.availabilityStartTime.as_deref() {
            Some(value) => mpd::parse_xs_datetime(value)?,
            None => chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
        };
        let availability = mpd
            .timeShiftBufferDepth
            .as_deref()
            .map(mpd::parse_xs_duration)
            .transpose()?
            .unwrap_or(f64::INFINITY);
        let min_buffer = mpd
            .minBufferTime
            .as_deref()
            .and_then(|v| mpd::parse_xs_duration(v).ok())
            .unwrap_or(0.0);
        let delay = match mpd.suggestedPresentationDelay.as_deref() {
            Some(value) => mpd::parse_xs_duration(value)?,
            None if min_buffer > 0.0 => 1.5 * min_buffer,
            None => DEFAULT_PRESENTATION_DELAY,
        };
        Ok(PresentationTimeline::new_live(start, availability, delay).with_clock(clock))
    } else {
        let duration = mpd
            .mediaPresentationDuration
            .as_deref()
            .map(mpd::parse_xs_duration)
            .transpose()?
            .unwrap_or(f64::INFINITY);
        Ok(PresentationTimeline::new_static(duration).with_clock(clock))
    }
}

/// Resolves child BaseURL elements against an ordered parent fallback list.
fn resolve_bases(parents: &[String], children: &[mpd::BaseUrl]) -> Vec<String> {
    if children.is_empty() {
        return parents.to_vec();
    }
    let mut out = Vec::new();
    for child in children {
        if child.base.is_empty() {
            continue;
        }
        let mut resolved_any = false;
        for parent in parents {
            match Url::parse(parent).and_then(|p| p.join(&child.base)) {
                Ok(url) => {
                    resolved_any = true;
                    let url = url.to_string();
                    if !out.contains(&url) {
                        out.push(url);
                    }
                }
                Err(e) => warn!(base = %child.base, error = %e, "Unresolvable BaseURL"),
            }
            // An absolute child resolves identically against every parent.
            if resolved_any && Url::parse(&child.base).is_ok() {
                break;
            }
        }
    }
    if out.is_empty() {
        parents.to_vec()
    } else {
        out
    }
}

struct SetClass {
    stream_type: StreamType,
    trick_mode_for: Option<i64>,
}

fn classify_set(set: &AdaptationSet) -> Option<SetClass> {
    let content_type = set.contentType.as_deref().or_else(|| {
        set.mimeType
            .as_deref()
            .and_then(|m| m.split('/').next())
    });
    let stream_type = match content_type {
        Some("audio") => StreamType::Audio,
        Some("video") => StreamType::Video,
        Some("text") | Some("application") => StreamType::Text,
        _ => {
            // Fall back to the first representation's mime type.
            let mime = set
                .representations
                .first()
                .and_then(|r| r.mimeType.as_deref())?;
            match mime.split('/').next()? {
                "audio" => StreamType::Audio,
                "video" => StreamType::Video,
                _ => StreamType::Text,
            }
        }
    };
    let trick_mode_for = set
        .essential_properties
        .iter()
        .chain(set.roles.iter())
        .find(|r| r.schemeIdUri.as_deref() == Some(TRICK_MODE_SCHEME))
        .and_then(|r| r.value.as_deref())
        .and_then(|v| v.parse().ok());
    Some(SetClass {
        stream_type,
        trick_mode_for,
    })
}

fn map_period(
    period: &mpd::Period,
    period_id: &str,
    start: f64,
    duration: f64,
    mpd_bases: &[String],
    timeline: &PresentationTimeline,
    allocator: &mut StreamIdAllocator,
) -> Result<MappedPeriod, DashError> {
    if period.adaptations.is_empty() {
        return Err(DashError::EmptyPeriod(period_id.to_string()));
    }
    let period_bases = resolve_bases(mpd_bases, &period.base_urls);

    let mut out = Period {
        id: period_id.to_string(),
        start_time: start,
        streams: BTreeMap::new(),
        variants: Vec::new(),
        text_streams: Vec::new(),
    };
    let mut sidx_jobs = Vec::new();
    let mut seen_rep_ids = HashSet::new();

    // (set index, stream ids, drm infos, language, primary) per class.
    let mut audio_groups: Vec<(Vec<StreamId>, Vec<DrmInfo>, String, bool)> = Vec::new();
    let mut video_groups: Vec<(Vec<StreamId>, Vec<DrmInfo>)> = Vec::new();
    let mut trick_sets: Vec<(Option<i64>, Vec<StreamId>)> = Vec::new();
    let mut main_video_set_ids: Vec<(Option<i64>, Vec<StreamId>)> = Vec::new();

    for (set_index, set) in period.adaptations.iter().enumerate() {
        let Some(class) = classify_set(set) else {
            debug!(period = period_id, set_index, "Skipping unclassifiable adaptation set");
            continue;
        };
        if set.representations.is_empty() {
            return Err(DashError::EmptyAdaptationSet(period_id.to_string()));
        }
        let set_bases = resolve_bases(&period_bases, &set.base_urls);
        let drm_infos = map_content_protection(&set.content_protections);
        let default_key_id = find_default_key_id(&set.content_protections);
        let encrypted = !set.content_protections.is_empty();
        let language = set.lang.clone().unwrap_or_default();
        let primary = set
            .roles
            .iter()
            .any(|r| r.value.as_deref() == Some("main"));
        let roles: Vec<String> = set
            .roles
            .iter()
            .filter_map(|r| r.value.clone())
            .collect();

        let mut set_stream_ids = Vec::new();
        for (rep_index, rep) in set.representations.iter().enumerate() {
            let rep_key = match rep.id.clone() {
                Some(id) => format!("{period_id}/{id}"),
                None => format!("{period_id}/__set{set_index}_rep{rep_index}"),
            };
            if !seen_rep_ids.insert(rep_key.clone()) {
                return Err(DashError::DuplicateRepresentationId(
                    rep.id.clone().unwrap_or(rep_key),
                ));
            }
            let stream_id = allocator.id_for(&rep_key);
            let stream = map_representation(
                rep,
                set,
                class.stream_type,
                stream_id,
                &set_bases,
                start,
                duration,
                timeline,
                &language,
                &roles,
                primary,
                encrypted,
                default_key_id.clone(),
                &mut sidx_jobs,
            )?;
            set_stream_ids.push(stream_id);
            out.streams.insert(stream_id, stream);
        }

        match class.stream_type {
            StreamType::Audio => {
                audio_groups.push((set_stream_ids, drm_infos, language, primary))
            }
            StreamType::Video => {
                if class.trick_mode_for.is_some() {
                    trick_sets.push((class.trick_mode_for, set_stream_ids));
                } else {
                    main_video_set_ids.push((set.id, set_stream_ids.clone()));
                    video_groups.push((set_stream_ids, drm_infos));
                }
            }
            StreamType::Text => out.text_streams.extend(set_stream_ids),
        }
    }

    // Attach trick-mode renditions to their main video streams by index.
    for (target_set_id, trick_ids) in &trick_sets {
        let target = main_video_set_ids
            .iter()
            .find(|(id, _)| id == target_set_id)
            .or(main_video_set_ids.first());
        if let Some((_, main_ids)) = target {
            for (i, main_id) in main_ids.iter().enumerate() {
                let trick = trick_ids.get(i).or_else(|| trick_ids.last());
                if let (Some(trick_id), Some(stream)) = (trick, out.streams.get_mut(main_id)) {
                    stream.trick_mode_video = Some(*trick_id);
                }
            }
        }
    }

    build_variants(&mut out, &audio_groups, &video_groups);

    let regions = map_event_streams(period, start, duration);

    Ok(MappedPeriod {
        period: out,
        sidx_jobs,
        regions,
    })
}

/// Crosses audio and video streams into variants, summing bandwidth.
fn build_variants(
    period: &mut Period,
    audio_groups: &[(Vec<StreamId>, Vec<DrmInfo>, String, bool)],
    video_groups: &[(Vec<StreamId>, Vec<DrmInfo>)],
) {
    let mut next_variant_id: VariantId = 0;
    let mut push = |period: &mut Period,
                    audio: Option<StreamId>,
                    video: Option<StreamId>,
                    drm_infos: Vec<DrmInfo>,
                    language: String,
                    primary: bool| {
        let bandwidth = audio
            .and_then(|id| period.stream(id))
            .map(|s| s.bandwidth)
            .unwrap_or(0)
            + video
                .and_then(|id| period.stream(id))
                .map(|s| s.bandwidth)
                .unwrap_or(0);
        period.variants.push(Variant {
            id: next_variant_id,
            language,
            primary,
            bandwidth,
            audio,
            video,
            drm_infos,
            allowed_by_application: true,
            allowed_by_key_system: true,
        });
        next_variant_id += 1;
    };

    match (audio_groups.is_empty(), video_groups.is_empty()) {
        (false, false) => {
            for (audio_ids, audio_drm, language, primary) in audio_groups {
                for audio_id in audio_ids {
                    for (video_ids, video_drm) in video_groups {
                        for video_id in video_ids {
                            let drm = merge_drm(audio_drm, video_drm);
                            push(
                                period,
                                Some(*audio_id),
                                Some(*video_id),
                                drm,
                                language.clone(),
                                *primary,
                            );
                        }
                    }
                }
            }
        }
        (false, true) => {
            for (audio_ids, audio_drm, language, primary) in audio_groups {
                for audio_id in audio_ids {
                    push(
                        period,
                        Some(*audio_id),
                        None,
                        audio_drm.clone(),
                        language.clone(),
                        *primary,
                    );
                }
            }
        }
        (true, false) => {
            for (video_ids, video_drm) in video_groups {
                for video_id in video_ids {
                    push(period, None, Some(*video_id), video_drm.clone(), String::new(), false);
                }
            }
        }
        (true, true) => {}
    }
}

fn merge_drm(a: &[DrmInfo], b: &[DrmInfo]) -> Vec<DrmInfo> {
    let mut out: Vec<DrmInfo> = a.to_vec();
    for info in b {
        if !out.iter().any(|o| o.key_system == info.key_system) {
            out.push(info.clone());
        }
    }
    out
}

fn key_system_for_uuid(uuid: &str) -> Option<&'static str> {
    match uuid.to_ascii_lowercase().as_str() {
        WIDEVINE_UUID => Some("com.widevine.alpha"),
        PLAYREADY_UUID => Some("com.microsoft.playready"),
        CLEARKEY_UUID => Some("org.w3.clearkey"),
        _ => None,
    }
}

fn map_content_protection(protections: &[ContentProtection]) -> Vec<DrmInfo> {
    let default_kid = find_default_key_id(protections);
    let mut out = Vec::new();
    for protection in protections {
        let Some(scheme) = protection.schemeIdUri.as_deref() else {
            continue;
        };
        let Some(uuid) = scheme
            .strip_prefix("urn:uuid:")
            .or_else(|| scheme.strip_prefix("URN:UUID:"))
        else {
            continue;
        };
        let Some(key_system) = key_system_for_uuid(uuid) else {
            debug!(scheme, "Unrecognized content protection scheme");
            continue;
        };
        let mut info = DrmInfo {
            key_system: key_system.to_string(),
            ..Default::default()
        };
        for pssh in &protection.pssh {
            let Some(text) = pssh.content.as_deref() else {
                continue;
            };
            match base64::engine::general_purpose::STANDARD.decode(text.trim()) {
                Ok(data) => info.init_data.push(InitData {
                    data: Bytes::from(data),
                    init_data_type: "cenc".to_string(),
                    key_id: default_kid.clone(),
                }),
                Err(e) => warn!(error = %e, "Undecodable cenc:pssh; ignoring"),
            }
        }
        if let Some(kid) = &default_kid {
            info.key_ids.push(kid.clone());
        }
        out.push(info);
    }
    out
}

fn find_default_key_id(protections: &[ContentProtection]) -> Option<KeyId> {
    protections
        .iter()
        .filter(|p| {
            p.schemeIdUri
                .as_deref()
                .map(|s| s.eq_ignore_ascii_case(MP4_PROTECTION_SCHEME))
                .unwrap_or(false)
                || p.default_kid.is_some()
        })
        .filter_map(|p| p.default_kid.as_deref())
        .find_map(KeyId::from_uuid)
}

#[allow(clippy::too_many_arguments)]
fn map_representation(
    rep: &Representation,
    set: &AdaptationSet,
    stream_type: StreamType,
    stream_id: StreamId,
    set_bases: &[String],
    period_start: f64,
    period_duration: f64,
    timeline: &PresentationTimeline,
    language: &str,
    roles: &[String],
    primary: bool,
    encrypted: bool,
    key_id: Option<KeyId>,
    sidx_jobs: &mut Vec<SidxJob>,
) -> Result<Stream, DashError> {
    let rep_label = rep.id.clone().unwrap_or_else(|| format!("#{stream_id}"));
    let mime_type = rep
        .mimeType
        .clone()
        .or_else(|| set.mimeType.clone())
        .ok_or(DashError::MissingAttribute {
            id: rep_label.clone(),
            attribute: "mimeType",
        })?;
    let codecs = rep
        .codecs
        .clone()
        .or_else(|| set.codecs.clone())
        .unwrap_or_default();
    let bandwidth = rep.bandwidth.unwrap_or(0);
    let frame_rate = rep
        .frameRate
        .as_deref()
        .or(set.frameRate.as_deref())
        .and_then(mpd::parse_frame_rate);
    let channels_count = rep
        .AudioChannelConfiguration
        .as_ref()
        .or(set.AudioChannelConfiguration.as_ref())
        .and_then(|c| c.value.as_deref())
        .and_then(|v| v.parse().ok());

    let rep_bases = resolve_bases(set_bases, &rep.base_urls);

    let mut stream = Stream {
        id: stream_id,
        stream_type,
        mime_type,
        codecs,
        bandwidth,
        width: rep.width,
        height: rep.height,
        frame_rate,
        channels_count,
        language: language.to_string(),
        label: set.label.clone(),
        kind: match stream_type {
            StreamType::Text => Some("subtitle".to_string()),
            _ => None,
        },
        roles: roles.to_vec(),
        primary,
        encrypted,
        key_id,
        init_segment: None,
        presentation_time_offset: 0.0,
        trick_mode_video: None,
        index: SegmentIndexHandle::new(),
    };

    let template = rep
        .SegmentTemplate
        .as_ref()
        .map(|t| t.inherit(set.SegmentTemplate.as_ref()))
        .or_else(|| set.SegmentTemplate.clone());

    if let Some(template) = template {
        build_template_index(
            &template,
            rep,
            &rep_label,
            &rep_bases,
            period_start,
            period_duration,
            timeline,
            &mut stream,
        )?;
    } else if let Some(list) = &rep.SegmentList {
        build_list_index(list, &rep_bases, period_duration, &mut stream)?;
    } else if let Some(base) = &rep.SegmentBase {
        let index_range = base
            .indexRange
            .as_deref()
            .ok_or(DashError::MissingAttribute {
                id: rep_label.clone(),
                attribute: "indexRange",
            })
            .and_then(|r| mpd::parse_range_attribute(r))?;
        let timescale = base.timescale.unwrap_or(1).max(1);
        let pto = base.presentationTimeOffset.unwrap_or(0) as f64 / timescale as f64;
        stream.presentation_time_offset = pto;
        stream.init_segment = base.initialization.as_ref().map(|init| {
            let uris = match init.sourceURL.as_deref() {
                Some(source) => resolve_relative(&rep_bases, source),
                None => rep_bases.to_vec(),
            };
            let byte_range = init
                .range
                .as_deref()
                .and_then(|r| mpd::parse_range_attribute(r).ok())
                .map(|(first, last)| ByteRange::new(first, Some(last)));
            Arc::new(InitSegmentReference::new(uris, byte_range))
        });
        sidx_jobs.push(SidxJob {
            stream_id,
            uris: rep_bases.to_vec(),
            index_range: ByteRange::new(index_range.0, Some(index_range.1)),
            init_segment: stream.init_segment.clone(),
            presentation_time_offset: pto,
        });
    } else {
        // Single-segment representation: the whole resource is one segment.
        let duration = if period_duration.is_finite() {
            period_duration
        } else {
            timeline.duration()
        };
        stream.index.set(SegmentIndex::new(vec![
            SegmentReference::with_uris(0, 0.0, duration, rep_bases.to_vec(), None, None),
        ]));
    }

    Ok(stream)
}

fn resolve_relative(bases: &[String], relative: &str) -> Vec<String> {
    let mut out = Vec::new();
    for base in bases {
        if let Ok(url) = Url::parse(base).and_then(|b| b.join(relative)) {
            let url = url.to_string();
            if !out.contains(&url) {
                out.push(url);
            }
        }
    }
    if out.is_empty() {
        vec![relative.to_string()]
    } else {
        out
    }
}

#[allow(clippy::too_many_arguments)]
fn build_template_index(
    template: &SegmentTemplate,
    rep: &Representation,
    rep_label: &str,
    bases: &[String],
    period_start: f64,
    period_duration: f64,
    timeline: &PresentationTimeline,
    stream: &mut Stream,
) -> Result<(), DashError> {
    let timescale = template.timescale.unwrap_or(1).max(1);
    let start_number = template.startNumber.unwrap_or(1);
    let pto_units = template.presentationTimeOffset.unwrap_or(0);
    let pto = pto_units as f64 / timescale as f64;
    stream.presentation_time_offset = pto;

    let media = template
        .media
        .as_deref()
        .ok_or(DashError::MissingAttribute {
            id: rep_label.to_string(),
            attribute: "media",
        })?;

    if let Some(init) = template.initialization.as_deref() {
        let filled = fill_template(
            init,
            &TemplateValues {
                representation_id: rep.id.as_deref(),
                bandwidth: rep.bandwidth,
                number: None,
                time: None,
            },
        );
        stream.init_segment = Some(Arc::new(InitSegmentReference::new(
            resolve_relative(bases, &filled),
            None,
        )));
    }

    let make_reference = |position: u64,
                          number: u64,
                          time_units: Option<u64>,
                          start: f64,
                          end: f64| {
        let filled = fill_template(
            media,
            &TemplateValues {
                representation_id: rep.id.as_deref(),
                bandwidth: rep.bandwidth,
                number: Some(number),
                time: time_units,
            },
        );
        let uris = resolve_relative(bases, &filled);
        SegmentReference::with_uris(position, start, end, uris, None, stream.init_segment.clone())
    };

    let mut references = Vec::new();
    if let Some(timeline_el) = &template.SegmentTimeline {
        // Explicit timeline: expand S elements, r = -1 runs to the next S@t
        // or the period end.
        let mut time = timeline_el
            .segments
            .first()
            .and_then(|s| s.t)
            .unwrap_or(pto_units);
        let mut position = start_number;
        for (i, s) in timeline_el.segments.iter().enumerate() {
            if let Some(t) = s.t {
                time = t;
            }
            let repeat = match s.r.unwrap_or(0) {
                r if r >= 0 => r as u64 + 1,
                _ => {
                    // Open-ended repeat.
                    let until_units = match timeline_el.segments.get(i + 1).and_then(|n| n.t) {
                        Some(next_t) => next_t,
                        None if period_duration.is_finite() => {
                            (period_duration * timescale as f64) as u64 + pto_units
                        }
                        None => {
                            let edge = timeline.segment_availability_end() - period_start;
                            ((edge.max(0.0) * timescale as f64) as u64).max(time)
                        }
                    };
                    until_units.saturating_sub(time).div_ceil(s.d.max(1))
                }
            };
            for _ in 0..repeat {
                let start = (time as f64 - pto_units as f64) / timescale as f64;
                let end = (time as f64 + s.d as f64 - pto_units as f64) / timescale as f64;
                references.push(make_reference(position, position, Some(time), start, end));
                time += s.d;
                position += 1;
            }
        }
    } else {
        let segment_duration_units = template.duration.ok_or(DashError::MissingAttribute {
            id: rep_label.to_string(),
            attribute: "duration",
        })?;
        let segment_duration = segment_duration_units as f64 / timescale as f64;
        // Period-relative window to describe. VOD covers the whole period;
        // live covers only the availability window plus one segment of
        // lookahead, refined by the driver on every refresh.
        let (window_start, window_end) = if period_duration.is_finite() {
            (0.0, period_duration)
        } else {
            (
                (timeline.segment_availability_start() - period_start).max(0.0),
                (timeline.segment_availability_end() - period_start).max(0.0) + segment_duration,
            )
        };
        let first_ordinal = (window_start / segment_duration).floor().max(0.0) as u64;
        let last_ordinal = (window_end / segment_duration).ceil().max(0.0) as u64;
        for ordinal in first_ordinal..last_ordinal {
            let number = start_number + ordinal;
            let start = ordinal as f64 * segment_duration;
            let end = start + segment_duration;
            references.push(make_reference(number, number, None, start, end));
        }
    }

    let mut index = SegmentIndex::new(references);
    index.fit(period_duration);
    stream.index.set(index);
    Ok(())
}

fn build_list_index(
    list: &mpd::SegmentList,
    bases: &[String],
    period_duration: f64,
    stream: &mut Stream,
) -> Result<(), DashError> {
    let timescale = list.timescale.unwrap_or(1).max(1);
    let pto = list.presentationTimeOffset.unwrap_or(0) as f64 / timescale as f64;
    stream.presentation_time_offset = pto;
    let segment_duration = list
        .duration
        .map(|d| d as f64 / timescale as f64)
        .unwrap_or_else(|| {
            if list.segment_urls.is_empty() || !period_duration.is_finite() {
                0.0
            } else {
                period_duration / list.segment_urls.len() as f64
            }
        });

    stream.init_segment = list.initialization.as_ref().map(|init| {
        let uris = match init.sourceURL.as_deref() {
            Some(source) => resolve_relative(bases, source),
            None => bases.to_vec(),
        };
        let byte_range = init
            .range
            .as_deref()
            .and_then(|r| mpd::parse_range_attribute(r).ok())
            .map(|(first, last)| ByteRange::new(first, Some(last)));
        Arc::new(InitSegmentReference::new(uris, byte_range))
    });

    let mut references = Vec::new();
    for (i, segment_url) in list.segment_urls.iter().enumerate() {
        let uris = match segment_url.media.as_deref() {
            Some(media) => resolve_relative(bases, media),
            None => bases.to_vec(),
        };
        let byte_range = segment_url
            .mediaRange
            .as_deref()
            .map(mpd::parse_range_attribute)
            .transpose()?
            .map(|(first, last)| ByteRange::new(first, Some(last)));
        let start = i as f64 * segment_duration;
        references.push(SegmentReference::with_uris(
            i as u64,
            start,
            start + segment_duration,
            uris,
            byte_range,
            stream.init_segment.clone(),
        ));
    }
    let mut index = SegmentIndex::new(references);
    index.fit(period_duration);
    stream.index.set(index);
    Ok(())
}

fn map_event_streams(period: &mpd::Period, start: f64, duration: f64) -> Vec<DashEventRegion> {
    let mut regions = Vec::new();
    for stream in &period.event_streams {
        let Some(scheme) = stream.schemeIdUri.clone() else {
            continue;
        };
        let timescale = stream.timescale.unwrap_or(1).max(1) as f64;
        for event in &stream.events {
            let offset = event.presentationTime.unwrap_or(0) as f64 / timescale;
            let event_duration = event.duration.unwrap_or(0) as f64 / timescale;
            let region_start = start + offset;
            let region_end = (region_start + event_duration).min(
                if duration.is_finite() { start + duration } else { f64::INFINITY },
            );
            regions.push(DashEventRegion {
                scheme_id_uri: scheme.clone(),
                value: stream.value.clone().unwrap_or_default(),
                id: event.id.clone().unwrap_or_default(),
                start_time: region_start,
                end_time: region_end,
                message_data: event
                    .messageData
                    .clone()
                    .or_else(|| event.content.clone()),
            });
        }
    }
    regions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpd::parse_mpd;
    use presentation::SystemClock;

    fn map(xml: &str) -> MappedManifest {
        let mpd = parse_mpd(xml).unwrap();
        let mut allocator = StreamIdAllocator::new();
        map_mpd(&mpd, "https://cdn.example/live/manifest.mpd", &mut allocator, Arc::new(SystemClock))
            .unwrap()
    }

    const TWO_PERIOD_VOD: &str = r#"<MPD type="static" mediaPresentationDuration="PT40S" minBufferTime="PT2S">
      <Period id="p1" start="PT0S" duration="PT20S">
        <AdaptationSet contentType="video" mimeType="video/mp4" codecs="avc1.4d401f">
          <Representation id="v1" bandwidth="600000" width="1280" height="720">
            <SegmentTemplate media="p1/v1/$Number$.m4s" initialization="p1/v1/init.mp4"
                             duration="10" timescale="1" startNumber="1"/>
          </Representation>
        </AdaptationSet>
        <AdaptationSet contentType="audio" mimeType="audio/mp4" codecs="mp4a.40.2" lang="en">
          <Role schemeIdUri="urn:mpeg:dash:role:2011" value="main"/>
          <Representation id="a1" bandwidth="128000">
            <SegmentTemplate media="p1/a1/$Number$.m4s" initialization="p1/a1/init.mp4"
                             duration="10" timescale="1" startNumber="1"/>
          </Representation>
        </AdaptationSet>
      </Period>
      <Period id="p2" start="PT20S">
        <AdaptationSet contentType="video" mimeType="video/mp4" codecs="avc1.4d401f">
          <Representation id="v2" bandwidth="600000">
            <SegmentTemplate media="p2/v2/$Number$.m4s" initialization="p2/v2/init.mp4"
                             duration="10" timescale="1" startNumber="1"/>
          </Representation>
        </AdaptationSet>
        <AdaptationSet contentType="audio" mimeType="audio/mp4" codecs="mp4a.40.2" lang="en">
          <Representation id="a2" bandwidth="128000">
            <SegmentTemplate media="p2/a2/$Number$.m4s" initialization="p2/a2/init.mp4"
                             duration="10" timescale="1" startNumber="1"/>
          </Representation>
        </AdaptationSet>
      </Period>
    </MPD>"#;

    #[test]
    fn maps_two_period_vod() {
        let mapped = map(TWO_PERIOD_VOD);
        let p = &mapped.presentation;
        assert!(!p.timeline.is_live());
        assert_eq!(p.timeline.duration(), 40.0);
        assert_eq!(p.periods.len(), 2);
        assert_eq!(p.periods[1].start_time, 20.0);
        assert_eq!(p.period_duration(0), 20.0);
        assert_eq!(p.periods[0].variants.len(), 1);
        let variant = &p.periods[0].variants[0];
        assert_eq!(variant.bandwidth, 728_000);
        assert_eq!(variant.language, "en");
        assert!(variant.primary);

        // Each stream gets a two-segment index covering the period.
        let video = p.periods[0].stream(variant.video.unwrap()).unwrap();
        let refs: Vec<_> = video.index.with(|i| i.references().to_vec()).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].start_time, 0.0);
        assert_eq!(refs[1].end_time, 20.0);
        assert_eq!(
            refs[1].uris()[0],
            "https://cdn.example/live/p1/v1/2.m4s"
        );
        assert_eq!(
            video.init_segment.as_ref().unwrap().uris[0],
            "https://cdn.example/live/p1/v1/init.mp4"
        );
    }

    #[test]
    fn stream_ids_are_stable_across_remaps() {
        let mpd = parse_mpd(TWO_PERIOD_VOD).unwrap();
        let mut allocator = StreamIdAllocator::new();
        let clock: Arc<dyn presentation::Clock> = Arc::new(SystemClock);
        let first = map_mpd(&mpd, "https://x/m.mpd", &mut allocator, clock.clone()).unwrap();
        let second = map_mpd(&mpd, "https://x/m.mpd", &mut allocator, clock).unwrap();
        let ids = |m: &MappedManifest| -> Vec<StreamId> {
            m.presentation.periods[0].streams.keys().copied().collect()
        };
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn segment_timeline_expands_repeats() {
        let mapped = map(r#"<MPD type="static" mediaPresentationDuration="PT14S">
          <Period id="p0">
            <AdaptationSet contentType="video" mimeType="video/mp4">
              <Representation id="v0" bandwidth="1">
                <SegmentTemplate media="s-$Time$.m4s" timescale="1000">
                  <SegmentTimeline>
                    <S t="0" d="4000" r="2"/>
                    <S d="2000"/>
                  </SegmentTimeline>
                </SegmentTemplate>
              </Representation>
            </AdaptationSet>
          </Period>
        </MPD>"#);
        let period = &mapped.presentation.periods[0];
        let stream = period.streams.values().next().unwrap();
        let refs: Vec<_> = stream.index.with(|i| i.references().to_vec()).unwrap();
        assert_eq!(refs.len(), 4);
        assert_eq!(refs[2].start_time, 8.0);
        assert_eq!(refs[3].end_time, 14.0);
        assert!(refs[3].uris()[0].ends_with("s-12000.m4s"));
    }

    #[test]
    fn segment_base_defers_to_sidx_job() {
        let mapped = map(r#"<MPD type="static" mediaPresentationDuration="PT10S">
          <Period id="p0">
            <AdaptationSet contentType="audio" mimeType="audio/mp4">
              <Representation id="a0" bandwidth="96000">
                <BaseURL>audio.mp4</BaseURL>
                <SegmentBase indexRange="612-999" timescale="48000">
                  <Initialization range="0-611"/>
                </SegmentBase>
              </Representation>
            </AdaptationSet>
          </Period>
        </MPD>"#);
        assert_eq!(mapped.sidx_jobs.len(), 1);
        let job = &mapped.sidx_jobs[0];
        assert_eq!(job.index_range, ByteRange::new(612, Some(999)));
        assert_eq!(job.uris[0], "https://cdn.example/live/audio.mp4");
        let init = job.init_segment.as_ref().unwrap();
        assert_eq!(init.byte_range, Some(ByteRange::new(0, Some(611))));
        // Index is not created until the job resolves.
        let stream = mapped.presentation.periods[0].streams.values().next().unwrap();
        assert!(!stream.index.is_created());
    }

    #[test]
    fn duplicate_representation_ids_rejected() {
        let mpd = parse_mpd(r#"<MPD type="static" mediaPresentationDuration="PT10S">
          <Period id="p0">
            <AdaptationSet contentType="video" mimeType="video/mp4">
              <Representation id="v0" bandwidth="1">
                <SegmentTemplate media="a-$Number$.m4s" duration="5"/>
              </Representation>
              <Representation id="v0" bandwidth="2">
                <SegmentTemplate media="b-$Number$.m4s" duration="5"/>
              </Representation>
            </AdaptationSet>
          </Period>
        </MPD>"#).unwrap();
        let mut allocator = StreamIdAllocator::new();
        let result = map_mpd(&mpd, "https://x/m.mpd", &mut allocator, Arc::new(SystemClock));
        assert!(matches!(result, Err(DashError::DuplicateRepresentationId(_))));
    }

    #[test]
    fn no_periods_rejected() {
        let mpd = parse_mpd(r#"<MPD type="static"></MPD>"#).unwrap();
        let mut allocator = StreamIdAllocator::new();
        assert!(matches!(
            map_mpd(&mpd, "https://x/m.mpd", &mut allocator, Arc::new(SystemClock)),
            Err(DashError::NoPeriods)
        ));
    }

    #[test]
    fn widevine_content_protection_maps_to_drm_info() {
        let mapped = map(r#"<MPD type="static" mediaPresentationDuration="PT10S">
          <Period id="p0">
            <AdaptationSet contentType="video" mimeType="video/mp4">
              <ContentProtection schemeIdUri="urn:mpeg:dash:mp4protection:2011" value="cenc"
                                 cenc:default_KID="21EC2020-3AEA-4069-A2DD-08002B30309D"/>
              <ContentProtection schemeIdUri="urn:uuid:EDEF8BA9-79D6-4ACE-A3C8-27DCD51D21ED">
                <cenc:pssh>cHNzaC1kYXRh</cenc:pssh>
              </ContentProtection>
              <Representation id="v0" bandwidth="1">
                <SegmentTemplate media="s-$Number$.m4s" duration="5"/>
              </Representation>
            </AdaptationSet>
          </Period>
        </MPD>"#);
        let variant = &mapped.presentation.periods[0].variants[0];
        assert_eq!(variant.drm_infos.len(), 1);
        let info = &variant.drm_infos[0];
        assert_eq!(info.key_system, "com.widevine.alpha");
        assert_eq!(&info.init_data[0].data[..], b"pssh-data");
        assert_eq!(info.key_ids[0].to_hex(), "21ec20203aea4069a2dd08002b30309d");
        let stream = mapped.presentation.periods[0]
            .stream(variant.video.unwrap())
            .unwrap();
        assert!(stream.encrypted);
        assert_eq!(
            stream.key_id.as_ref().unwrap().to_hex(),
            "21ec20203aea4069a2dd08002b30309d"
        );
    }

    #[test]
    fn trick_mode_set_attaches_to_main_video() {
        let mapped = map(r#"<MPD type="static" mediaPresentationDuration="PT10S">
          <Period id="p0">
            <AdaptationSet id="1" contentType="video" mimeType="video/mp4">
              <Representation id="v0" bandwidth="1000">
                <SegmentTemplate media="v-$Number$.m4s" duration="5"/>
              </Representation>
            </AdaptationSet>
            <AdaptationSet id="2" contentType="video" mimeType="video/mp4">
              <EssentialProperty schemeIdUri="http://dashif.org/guidelines/trickmode" value="1"/>
              <Representation id="t0" bandwidth="100">
                <SegmentTemplate media="t-$Number$.m4s" duration="5"/>
              </Representation>
            </AdaptationSet>
          </Period>
        </MPD>"#);
        let period = &mapped.presentation.periods[0];
        // Trick-mode set forms no variants of its own.
        assert_eq!(period.variants.len(), 1);
        let video = period.stream(period.variants[0].video.unwrap()).unwrap();
        let trick_id = video.trick_mode_video.expect("trick stream attached");
        assert_eq!(period.stream(trick_id).unwrap().bandwidth, 100);
    }

    #[test]
    fn event_streams_map_to_regions() {
        let mapped = map(r#"<MPD type="static" mediaPresentationDuration="PT30S">
          <Period id="p0" start="PT10S">
            <EventStream schemeIdUri="urn:example:ad" value="break" timescale="1000">
              <Event id="1" presentationTime="2000" duration="5000"/>
            </EventStream>
            <AdaptationSet contentType="video" mimeType="video/mp4">
              <Representation id="v0" bandwidth="1">
                <SegmentTemplate media="s-$Number$.m4s" duration="5"/>
              </Representation>
            </AdaptationSet>
          </Period>
        </MPD>"#);
        assert_eq!(mapped.regions.len(), 1);
        let region = &mapped.regions[0];
        assert_eq!(region.start_time, 12.0);
        assert_eq!(region.end_time, 17.0);
        assert_eq!(region.scheme_id_uri, "urn:example:ad");
    }
}
