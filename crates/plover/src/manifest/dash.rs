// DASH manifest driver: fetches and refreshes the MPD, synchronizes the
// clock, and resolves deferred `sidx` indexes. Pure mapping lives in the
// `dash` crate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dash::{map_mpd, parse_mpd, parse_sidx, MappedManifest, SidxJob, StreamIdAllocator};
use presentation::{SegmentIndex, SegmentReference, StreamId};

use crate::config::ManifestConfig;
use crate::error::PlayerError;
use crate::events::TimelineRegion;
use crate::manifest::{ManifestParser, ParserHost, SegmentIndexCreator, SharedPresentation};
use crate::net::{Request, RequestType};

#[derive(Default)]
struct DashParserState {
    uri: String,
    host: Option<Arc<dyn ParserHost>>,
    presentation: Option<SharedPresentation>,
    allocator: StreamIdAllocator,
    sidx_jobs: HashMap<StreamId, SidxJob>,
    known_regions: HashSet<String>,
    clock_offset_ms: Option<i64>,
}

pub struct DashManifestParser {
    config: ManifestConfig,
    token: CancellationToken,
    state: Arc<Mutex<DashParserState>>,
}

impl DashManifestParser {
    pub fn new(config: ManifestConfig, token: CancellationToken) -> Self {
        Self {
            config,
            token,
            state: Arc::new(Mutex::new(DashParserState::default())),
        }
    }

    async fn fetch_and_map(
        &self,
        uri: &str,
        host: &Arc<dyn ParserHost>,
    ) -> Result<MappedManifest, PlayerError> {
        let response = host
            .networking()
            .request(
                RequestType::Manifest,
                Request::get(vec![uri.to_string()], self.config.retry.clone()),
                &self.token,
            )
            .await?;
        let text = String::from_utf8_lossy(&response.data).into_owned();
        let mpd = parse_mpd(&text)?;

        // Synchronize the wall clock once per load for live content.
        let clock_offset = if mpd.is_dynamic() {
            let existing = self.state.lock().clock_offset_ms;
            match existing {
                Some(offset) => Some(offset),
                None => self.sync_clock(&mpd, host).await,
            }
        } else {
            None
        };

        let mut allocator = std::mem::take(&mut self.state.lock().allocator);
        let result = map_mpd(&mpd, &response.uri, &mut allocator, host.clock());
        self.state.lock().allocator = allocator;
        let mut mapped = result.map_err(PlayerError::from)?;

        if let Some(offset) = clock_offset {
            mapped.presentation.timeline.set_clock_offset(offset);
            self.state.lock().clock_offset_ms = Some(offset);
        }
        if let Some(window) = self.config.availability_window_override {
            mapped
                .presentation
                .timeline
                .set_segment_availability_duration(window);
        }
        for period in &mut mapped.presentation.periods {
            host.filter_new_period(period);
        }
        Ok(mapped)
    }

    /// Resolves a clock offset from `UTCTiming` (or the configured sync
    /// URI). Failure is tolerated; the local clock is used instead.
    async fn sync_clock(&self, mpd: &dash::Mpd, host: &Arc<dyn ParserHost>) -> Option<i64> {
        let mut sources: Vec<(String, Option<String>)> = mpd
            .utc_timings
            .iter()
            .filter_map(|t| t.schemeIdUri.clone().map(|s| (s, t.value.clone())))
            .collect();
        if sources.is_empty() {
            if let Some(uri) = &self.config.dash.clock_sync_uri {
                sources.push((
                    "urn:mpeg:dash:utc:http-xsdate:2014".to_string(),
                    Some(uri.clone()),
                ));
            }
        }

        for (scheme, value) in sources {
            let result = match scheme.as_str() {
                "urn:mpeg:dash:utc:direct:2014" => value
                    .as_deref()
                    .and_then(|v| dash::mpd::parse_xs_datetime(v).ok())
                    .map(|server_now| {
                        (server_now - host.clock().now()).num_milliseconds()
                    }),
                "urn:mpeg:dash:utc:http-xsdate:2014" | "urn:mpeg:dash:utc:http-iso:2014" => {
                    let Some(uri) = value.clone() else { continue };
                    let request = Request::get(vec![uri], self.config.retry.clone());
                    match host
                        .networking()
                        .request(RequestType::Timing, request, &self.token)
                        .await
                    {
                        Ok(response) => {
                            let body = String::from_utf8_lossy(&response.data);
                            dash::mpd::parse_xs_datetime(body.trim())
                                .ok()
                                .map(|server_now| {
                                    (server_now - host.clock().now()).num_milliseconds()
                                })
                        }
                        Err(error) => {
                            debug!(error = %error, "Clock sync request failed");
                            None
                        }
                    }
                }
                other => {
                    debug!(scheme = other, "Unsupported UTCTiming scheme");
                    None
                }
            };
            if let Some(offset) = result {
                info!(offset_ms = offset, "Clock synchronized");
                return Some(offset);
            }
        }
        None
    }

    /// Installs a freshly mapped manifest into the shared presentation,
    /// carrying over indexes that were created on demand.
    fn install(&self, mapped: MappedManifest, host: &Arc<dyn ParserHost>) {
        let mut state = self.state.lock();
        state.sidx_jobs = mapped
            .sidx_jobs
            .into_iter()
            .map(|job| (job.stream_id, job))
            .collect();

        let mut new_presentation = mapped.presentation;
        if let Some(shared) = &state.presentation {
            let old = shared.read();
            for period in &mut new_presentation.periods {
                let Some(old_period) = old.periods.iter().find(|p| p.id == period.id) else {
                    continue;
                };
                for (stream_id, stream) in period.streams.iter_mut() {
                    if stream.index.is_created() {
                        continue;
                    }
                    if let Some(old_stream) = old_period.stream(*stream_id) {
                        if old_stream.index.is_created() {
                            stream.index = old_stream.index.clone();
                        }
                    }
                }
            }
            drop(old);
            *shared.write() = new_presentation;
        } else {
            state.presentation = Some(Arc::new(parking_lot::RwLock::new(new_presentation)));
        }

        // Evict references that slid out of the availability window.
        if let Some(shared) = &state.presentation {
            let presentation = shared.read();
            if presentation.timeline.is_live() {
                let availability_start = presentation.timeline.segment_availability_start();
                for period in &presentation.periods {
                    let in_period = availability_start - period.start_time;
                    if in_period <= 0.0 {
                        continue;
                    }
                    for stream in period.streams.values() {
                        stream.index.with_mut(|index| index.evict(in_period));
                    }
                }
            }
        }

        for region in mapped.regions {
            if state.known_regions.insert(region_key(&region)) {
                host.on_timeline_region_added(TimelineRegion {
                    scheme_id_uri: region.scheme_id_uri,
                    value: region.value,
                    id: region.id,
                    start_time: region.start_time,
                    end_time: region.end_time,
                    event_data: region.message_data,
                });
            }
        }
    }

    fn spawn_refresh_loop(&self, period_seconds: f64, host: Arc<dyn ParserHost>) {
        let parser = DashManifestParser {
            config: self.config.clone(),
            token: self.token.clone(),
            state: self.state.clone(),
        };
        let token = self.token.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs_f64(period_seconds.max(1.0));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                if let Err(error) = parser.update().await {
                    warn!(error = %error, "Manifest refresh failed");
                    host.on_error(error.into_recoverable());
                }
            }
        });
    }
}

#[async_trait]
impl SegmentIndexCreator for DashManifestParser {
    async fn create_segment_index(&self, stream_id: StreamId) -> Result<(), PlayerError> {
        let (job, handle, networking) = {
            let state = self.state.lock();
            let Some(shared) = &state.presentation else {
                return Ok(());
            };
            let presentation = shared.read();
            let Some(stream) = presentation
                .periods
                .iter()
                .find_map(|p| p.stream(stream_id))
            else {
                return Ok(());
            };
            if stream.index.is_created() {
                return Ok(());
            }
            let Some(job) = state.sidx_jobs.get(&stream_id).cloned() else {
                return Ok(());
            };
            let networking = state.host.as_ref().map(|h| h.networking());
            (job, stream.index.clone(), networking)
        };
        let Some(networking) = networking else {
            return Ok(());
        };

        let request = Request::get(job.uris.clone(), self.config.retry.clone())
            .with_header("range", job.index_range.to_http_range());
        let response = networking
            .request(RequestType::Segment, request, &self.token)
            .await?;

        let entries = parse_sidx(&response.data, job.index_range.start).map_err(PlayerError::from)?;
        let pto = job.presentation_time_offset;
        let references: Vec<SegmentReference> = entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| {
                SegmentReference::with_uris(
                    i as u64,
                    entry.start_time - pto,
                    entry.end_time - pto,
                    job.uris.clone(),
                    Some(presentation::ByteRange::new(
                        entry.start_byte,
                        Some(entry.end_byte),
                    )),
                    job.init_segment.clone(),
                )
            })
            .collect();
        debug!(stream_id, segments = references.len(), "Built sidx segment index");
        handle.set(SegmentIndex::new(references));
        Ok(())
    }
}

#[async_trait]
impl ManifestParser for DashManifestParser {
    async fn start(
        &self,
        uri: &str,
        host: Arc<dyn ParserHost>,
    ) -> Result<SharedPresentation, PlayerError> {
        {
            let mut state = self.state.lock();
            state.uri = uri.to_string();
            state.host = Some(host.clone());
        }
        let mapped = self.fetch_and_map(uri, &host).await?;
        let min_update_period = mapped.min_update_period;
        self.install(mapped, &host);
        if let Some(period) = min_update_period {
            self.spawn_refresh_loop(period, host.clone());
        }
        Ok(self
            .state
            .lock()
            .presentation
            .clone()
            .expect("installed above"))
    }

    async fn stop(&self) {
        self.token.cancel();
        // Drop the host reference so the parser cannot keep the player's
        // load state alive after unload.
        self.state.lock().host = None;
    }

    async fn update(&self) -> Result<(), PlayerError> {
        let (uri, host) = {
            let state = self.state.lock();
            (state.uri.clone(), state.host.clone())
        };
        let Some(host) = host else {
            return Ok(());
        };
        let mapped = self.fetch_and_map(&uri, &host).await?;
        self.install(mapped, &host);
        host.on_manifest_updated();
        Ok(())
    }
}

fn region_key(region: &dash::mapping::DashEventRegion) -> String {
    format!(
        "{}|{}|{}|{}",
        region.scheme_id_uri, region.id, region.start_time, region.end_time
    )
}
