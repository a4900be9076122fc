// Serde model for the subset of the MPD schema the core consumes.
//
// Deserialization is delegated to quick-xml; serde ignores unknown fields,
// so the model only needs to cover what the mapping layer reads.

#![allow(non_snake_case)]

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::DashError;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BaseUrl {
    #[serde(rename = "$value", default)]
    pub base: String,
    pub serviceLocation: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S {
    pub t: Option<u64>,
    pub d: u64,
    pub r: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SegmentTimeline {
    #[serde(rename = "S", default)]
    pub segments: Vec<S>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Initialization {
    pub sourceURL: Option<String>,
    pub range: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SegmentTemplate {
    pub initialization: Option<String>,
    pub media: Option<String>,
    pub SegmentTimeline: Option<SegmentTimeline>,
    pub startNumber: Option<u64>,
    pub duration: Option<u64>,
    pub timescale: Option<u64>,
    pub presentationTimeOffset: Option<u64>,
    pub availabilityTimeOffset: Option<f64>,
}

impl SegmentTemplate {
    /// Overlays `self` (the more specific level) on `base`.
    pub fn inherit(&self, base: Option<&SegmentTemplate>) -> SegmentTemplate {
        let Some(base) = base else {
            return self.clone();
        };
        SegmentTemplate {
            initialization: self.initialization.clone().or_else(|| base.initialization.clone()),
            media: self.media.clone().or_else(|| base.media.clone()),
            SegmentTimeline: self
                .SegmentTimeline
                .clone()
                .or_else(|| base.SegmentTimeline.clone()),
            startNumber: self.startNumber.or(base.startNumber),
            duration: self.duration.or(base.duration),
            timescale: self.timescale.or(base.timescale),
            presentationTimeOffset: self.presentationTimeOffset.or(base.presentationTimeOffset),
            availabilityTimeOffset: self.availabilityTimeOffset.or(base.availabilityTimeOffset),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SegmentBase {
    #[serde(rename = "Initialization")]
    pub initialization: Option<Initialization>,
    pub timescale: Option<u64>,
    pub presentationTimeOffset: Option<u64>,
    pub indexRange: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SegmentUrl {
    pub media: Option<String>,
    pub mediaRange: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SegmentList {
    pub duration: Option<u64>,
    pub timescale: Option<u64>,
    pub presentationTimeOffset: Option<u64>,
    #[serde(rename = "Initialization")]
    pub initialization: Option<Initialization>,
    #[serde(rename = "SegmentURL", default)]
    pub segment_urls: Vec<SegmentUrl>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Pssh {
    #[serde(rename = "$value")]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContentProtection {
    pub schemeIdUri: Option<String>,
    pub value: Option<String>,
    #[serde(rename = "cenc:default_KID")]
    pub default_kid: Option<String>,
    #[serde(rename = "cenc:pssh", default)]
    pub pssh: Vec<Pssh>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Role {
    pub schemeIdUri: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AudioChannelConfiguration {
    pub schemeIdUri: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Representation {
    pub id: Option<String>,
    pub bandwidth: Option<u64>,
    pub mimeType: Option<String>,
    pub codecs: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frameRate: Option<String>,
    pub audioSamplingRate: Option<u64>,
    #[serde(rename = "BaseURL", default)]
    pub base_urls: Vec<BaseUrl>,
    pub AudioChannelConfiguration: Option<AudioChannelConfiguration>,
    pub SegmentTemplate: Option<SegmentTemplate>,
    pub SegmentBase: Option<SegmentBase>,
    pub SegmentList: Option<SegmentList>,
    #[serde(rename = "ContentProtection", default)]
    pub content_protections: Vec<ContentProtection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdaptationSet {
    pub id: Option<i64>,
    pub contentType: Option<String>,
    pub lang: Option<String>,
    pub label: Option<String>,
    pub mimeType: Option<String>,
    pub codecs: Option<String>,
    pub frameRate: Option<String>,
    #[serde(rename = "BaseURL", default)]
    pub base_urls: Vec<BaseUrl>,
    pub SegmentTemplate: Option<SegmentTemplate>,
    pub AudioChannelConfiguration: Option<AudioChannelConfiguration>,
    #[serde(rename = "Role", default)]
    pub roles: Vec<Role>,
    #[serde(rename = "EssentialProperty", default)]
    pub essential_properties: Vec<Role>,
    #[serde(rename = "ContentProtection", default)]
    pub content_protections: Vec<ContentProtection>,
    #[serde(rename = "Representation", default)]
    pub representations: Vec<Representation>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Event {
    pub id: Option<String>,
    pub presentationTime: Option<u64>,
    pub duration: Option<u64>,
    pub messageData: Option<String>,
    #[serde(rename = "$value")]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventStream {
    pub schemeIdUri: Option<String>,
    pub value: Option<String>,
    pub timescale: Option<u64>,
    #[serde(rename = "Event", default)]
    pub events: Vec<Event>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Period {
    pub id: Option<String>,
    pub start: Option<String>,
    pub duration: Option<String>,
    #[serde(rename = "BaseURL", default)]
    pub base_urls: Vec<BaseUrl>,
    pub SegmentTemplate: Option<SegmentTemplate>,
    #[serde(rename = "EventStream", default)]
    pub event_streams: Vec<EventStream>,
    #[serde(rename = "AdaptationSet", default)]
    pub adaptations: Vec<AdaptationSet>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UtcTiming {
    pub schemeIdUri: Option<String>,
    pub value: Option<String>,
}

/// The root node of a parsed MPD manifest.
#[derive(Debug, Deserialize, Clone)]
pub struct Mpd {
    #[serde(rename = "type")]
    pub mpdtype: Option<String>,
    pub profiles: Option<String>,
    pub minBufferTime: Option<String>,
    pub minimumUpdatePeriod: Option<String>,
    pub timeShiftBufferDepth: Option<String>,
    pub mediaPresentationDuration: Option<String>,
    pub maxSegmentDuration: Option<String>,
    pub suggestedPresentationDelay: Option<String>,
    pub availabilityStartTime: Option<String>,
    pub publishTime: Option<String>,
    #[serde(rename = "BaseURL", default)]
    pub base_urls: Vec<BaseUrl>,
    #[serde(rename = "UTCTiming", default)]
    pub utc_timings: Vec<UtcTiming>,
    #[serde(rename = "Period", default)]
    pub periods: Vec<Period>,
}

impl Mpd {
    pub fn is_dynamic(&self) -> bool {
        self.mpdtype.as_deref() == Some("dynamic")
    }
}

/// Parses an MPD manifest from an XML string.
pub fn parse_mpd(xml: &str) -> Result<Mpd, DashError> {
    quick_xml::de::from_str(xml).map_err(|e| DashError::InvalidXml(e.to_string()))
}

/// Parses an `xs:duration` string (e.g. `PT1H2M3.5S`) into seconds.
pub fn parse_xs_duration(value: &str) -> Result<f64, DashError> {
    let err = || DashError::InvalidDuration(value.to_string());
    let mut rest = value.strip_prefix('P').ok_or_else(err)?;
    let mut in_time = false;
    let mut seconds = 0.0f64;
    if rest.is_empty() {
        return Err(err());
    }
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('T') {
            in_time = true;
            rest = after;
            continue;
        }
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(err)?;
        let (number, tail) = rest.split_at(split);
        let number: f64 = number.parse().map_err(|_| err())?;
        let designator = tail.chars().next().ok_or_else(err)?;
        seconds += match (designator, in_time) {
            ('Y', false) => number * 365.0 * 86_400.0,
            ('M', false) => number * 30.0 * 86_400.0,
            ('W', false) => number * 7.0 * 86_400.0,
            ('D', false) => number * 86_400.0,
            ('H', true) => number * 3_600.0,
            ('M', true) => number * 60.0,
            ('S', true) => number,
            _ => return Err(err()),
        };
        rest = &tail[1..];
    }
    Ok(seconds)
}

/// Parses an `xs:dateTime` string into a UTC timestamp.
pub fn parse_xs_datetime(value: &str) -> Result<DateTime<Utc>, DashError> {
    // `availabilityStartTime` commonly omits the timezone; treat that as UTC.
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| naive.and_utc())
        })
        .map_err(|_| DashError::InvalidDateTime(value.to_string()))
}

/// Parses a `first-last` byte range attribute.
pub fn parse_range_attribute(value: &str) -> Result<(u64, u64), DashError> {
    let err = || DashError::InvalidByteRange(value.to_string());
    let (first, last) = value.split_once('-').ok_or_else(err)?;
    let first = first.trim().parse().map_err(|_| err())?;
    let last = last.trim().parse().map_err(|_| err())?;
    if last < first {
        return Err(err());
    }
    Ok((first, last))
}

/// Parses a `frameRate` attribute, either `num/den` or a plain number.
pub fn parse_frame_rate(value: &str) -> Option<f64> {
    if let Some((num, den)) = value.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den == 0.0 {
            return None;
        }
        Some(num / den)
    } else {
        value.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_static_mpd() {
        let xml = r#"<?xml version="1.0"?>
            <MPD type="static" mediaPresentationDuration="PT40S" minBufferTime="PT2S">
              <Period id="p0" start="PT0S">
                <AdaptationSet contentType="video" mimeType="video/mp4">
                  <Representation id="v0" bandwidth="600000" codecs="avc1.4d401f" width="1280" height="720">
                    <SegmentTemplate media="v0-$Number$.m4s" initialization="v0-init.mp4"
                                     duration="10" timescale="1" startNumber="1"/>
                  </Representation>
                </AdaptationSet>
              </Period>
            </MPD>"#;
        let mpd = parse_mpd(xml).unwrap();
        assert!(!mpd.is_dynamic());
        assert_eq!(mpd.periods.len(), 1);
        let rep = &mpd.periods[0].adaptations[0].representations[0];
        assert_eq!(rep.id.as_deref(), Some("v0"));
        assert_eq!(rep.bandwidth, Some(600_000));
        assert_eq!(rep.width, Some(1280));
        let template = rep.SegmentTemplate.as_ref().unwrap();
        assert_eq!(template.duration, Some(10));
        assert_eq!(template.startNumber, Some(1));
    }

    #[test]
    fn parses_segment_timeline_and_content_protection() {
        let xml = r#"<MPD type="dynamic" availabilityStartTime="2024-01-01T00:00:00Z"
                          timeShiftBufferDepth="PT2M" minimumUpdatePeriod="PT5S">
              <Period id="p0">
                <AdaptationSet contentType="video">
                  <ContentProtection schemeIdUri="urn:mpeg:dash:mp4protection:2011" value="cenc"
                                     cenc:default_KID="21EC2020-3AEA-4069-A2DD-08002B30309D"/>
                  <ContentProtection schemeIdUri="urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed">
                    <cenc:pssh>AAAAOnBzc2g=</cenc:pssh>
                  </ContentProtection>
                  <Representation id="v0" bandwidth="1000">
                    <SegmentTemplate media="s-$Time$.m4s" timescale="1000">
                      <SegmentTimeline>
                        <S t="0" d="4000" r="2"/>
                        <S d="2000"/>
                      </SegmentTimeline>
                    </SegmentTemplate>
                  </Representation>
                </AdaptationSet>
              </Period>
            </MPD>"#;
        let mpd = parse_mpd(xml).unwrap();
        assert!(mpd.is_dynamic());
        let set = &mpd.periods[0].adaptations[0];
        assert_eq!(set.content_protections.len(), 2);
        assert!(set.content_protections[0]
            .default_kid
            .as_deref()
            .unwrap()
            .starts_with("21EC2020"));
        assert_eq!(
            set.content_protections[1].pssh[0].content.as_deref(),
            Some("AAAAOnBzc2g=")
        );
        let timeline = set.representations[0]
            .SegmentTemplate
            .as_ref()
            .unwrap()
            .SegmentTimeline
            .as_ref()
            .unwrap();
        assert_eq!(timeline.segments.len(), 2);
        assert_eq!(timeline.segments[0].r, Some(2));
    }

    #[test]
    fn rejects_invalid_xml() {
        assert!(matches!(
            parse_mpd("<MPD><Period></MPD>"),
            Err(DashError::InvalidXml(_))
        ));
    }

    #[test]
    fn xs_duration_forms() {
        assert_eq!(parse_xs_duration("PT10S").unwrap(), 10.0);
        assert_eq!(parse_xs_duration("PT1M30S").unwrap(), 90.0);
        assert_eq!(parse_xs_duration("PT1H").unwrap(), 3600.0);
        assert_eq!(parse_xs_duration("P1DT1S").unwrap(), 86_401.0);
        assert_eq!(parse_xs_duration("PT0.5S").unwrap(), 0.5);
        assert!(parse_xs_duration("10S").is_err());
        assert!(parse_xs_duration("P").is_err());
    }

    #[test]
    fn xs_datetime_with_and_without_zone() {
        let with_zone = parse_xs_datetime("2024-01-01T00:00:10Z").unwrap();
        let without_zone = parse_xs_datetime("2024-01-01T00:00:10").unwrap();
        assert_eq!(with_zone, without_zone);
        assert!(parse_xs_datetime("yesterday").is_err());
    }

    #[test]
    fn range_attribute() {
        assert_eq!(parse_range_attribute("0-499").unwrap(), (0, 499));
        assert!(parse_range_attribute("500-100").is_err());
        assert!(parse_range_attribute("500").is_err());
    }

    #[test]
    fn frame_rate_fractional() {
        assert_eq!(parse_frame_rate("30"), Some(30.0));
        assert_eq!(parse_frame_rate("30000/1001").unwrap().round(), 30.0);
        assert_eq!(parse_frame_rate("x"), None);
    }

    #[test]
    fn segment_template_inheritance_prefers_specific_level() {
        let set_level = SegmentTemplate {
            media: Some("set-$Number$.m4s".into()),
            timescale: Some(1000),
            startNumber: Some(1),
            ..Default::default()
        };
        let rep_level = SegmentTemplate {
            media: Some("rep-$Number$.m4s".into()),
            ..Default::default()
        };
        let merged = rep_level.inherit(Some(&set_level));
        assert_eq!(merged.media.as_deref(), Some("rep-$Number$.m4s"));
        assert_eq!(merged.timescale, Some(1000));
        assert_eq!(merged.startNumber, Some(1));
    }
}
