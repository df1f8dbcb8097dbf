//! Trajectory consolidation for location-based pursuit game telemetry.
//!
//! Every participant reports GPS fixes at its own irregular cadence. This crate
//! resamples those tracks onto one shared time grid, derives per-grid-point
//! signals (connectivity, cumulative distance, hunter/prey proximity) and merges
//! the result back into an annotated, time-ordered event stream per entity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

pub mod connectivity;
pub mod distance;
pub mod grid;
pub mod ingest;
pub mod interp;
pub mod proximity;
pub mod reconstruct;

pub use connectivity::{flag_connectivity, ConnectivityFlags};
pub use distance::{cumulative_distance, great_circle_m, CumulativeDistance, EARTH_RADIUS_M};
pub use grid::{align, TimeGrid};
pub use interp::{interpolate, InterpolatedTrack, Pchip};
pub use proximity::{detect_intervals, CaptureTimes, ProximityInterval, RunningInterval};
pub use reconstruct::{reconstruct_events, AnnotatedEvent};

#[derive(Error, Debug)]
pub enum GridError {
    #[error("no entities supplied")]
    NoEntities,
    #[error("track for entity '{entity_id}' is empty")]
    EmptyTrack { entity_id: String },
    #[error("tracks do not overlap: window would start at {overlap_start} but ends at {overlap_end}")]
    NoOverlap { overlap_start: i64, overlap_end: i64 },
    #[error("entity '{entity_id}' has {distinct} distinct timestamp(s); at least 2 are needed to interpolate")]
    InsufficientSamples { entity_id: String, distinct: usize },
    #[error("malformed sample for entity '{entity_id}' at {timestamp}: {reason}")]
    MalformedSample {
        entity_id: String,
        timestamp: i64,
        reason: String,
    },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("failed to parse game log: {0}")]
    LogParse(String),
    #[error("failed to parse GPX: {0}")]
    GpxParse(String),
    #[error("failed to write GPX: {0}")]
    GpxWrite(String),
}

impl GridError {
    /// True for failures that leave no usable observation window.
    pub fn is_alignment(&self) -> bool {
        matches!(
            self,
            GridError::NoEntities | GridError::EmptyTrack { .. } | GridError::NoOverlap { .. }
        )
    }

    /// Pipeline stage the error was raised in.
    pub fn stage(&self) -> &'static str {
        match self {
            GridError::NoEntities | GridError::EmptyTrack { .. } | GridError::NoOverlap { .. } => {
                "align"
            }
            GridError::InsufficientSamples { .. } => "interpolate",
            GridError::InvalidParameter(_) => "config",
            GridError::MalformedSample { .. }
            | GridError::LogParse(_)
            | GridError::GpxParse(_) => "load",
            GridError::GpxWrite(_) => "export",
        }
    }
}

/// Descriptive fields that do not vary continuously between fixes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_color: Option<String>,
}

/// One validated fix. Built only through [`RawSample::new`] or [`RawSample::with_meta`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RawSample {
    pub entity_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub lat: f64,
    pub lon: f64,
    #[serde(flatten)]
    pub meta: SampleMeta,
}

impl RawSample {
    pub fn new(
        entity_id: impl Into<String>,
        timestamp: i64,
        lat: f64,
        lon: f64,
    ) -> Result<Self, GridError> {
        Self::with_meta(entity_id, timestamp, lat, lon, SampleMeta::default())
    }

    /// Build a sample, rejecting coordinates that are not finite or lie off the globe.
    pub fn with_meta(
        entity_id: impl Into<String>,
        timestamp: i64,
        lat: f64,
        lon: f64,
        meta: SampleMeta,
    ) -> Result<Self, GridError> {
        let entity_id = entity_id.into();
        let reason = if !lat.is_finite() || !lon.is_finite() {
            Some("latitude and longitude must be finite")
        } else if lat.abs() > 90.0 {
            Some("latitude outside [-90, 90]")
        } else if lon.abs() > 180.0 {
            Some("longitude outside [-180, 180]")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(GridError::MalformedSample {
                entity_id,
                timestamp,
                reason: reason.to_string(),
            });
        }
        Ok(Self {
            entity_id,
            timestamp,
            lat,
            lon,
            meta,
        })
    }
}

/// All raw samples of one entity, ordered ascending by timestamp.
///
/// Sorting is stable, so samples sharing a timestamp keep their arrival order.
/// Duplicates are retained here; stages that need strictly increasing time
/// collapse them themselves.
#[derive(Clone, Debug, Serialize)]
pub struct Track {
    entity_id: String,
    samples: Vec<RawSample>,
}

impl Track {
    pub fn new(entity_id: impl Into<String>, mut samples: Vec<RawSample>) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        Self {
            entity_id: entity_id.into(),
            samples,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn samples(&self) -> &[RawSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn first_timestamp(&self) -> Option<i64> {
        self.samples.first().map(|s| s.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.samples.last().map(|s| s.timestamp)
    }

    pub fn distinct_timestamps(&self) -> usize {
        let mut count = 0;
        let mut prev: Option<i64> = None;
        for sample in &self.samples {
            if prev != Some(sample.timestamp) {
                count += 1;
                prev = Some(sample.timestamp);
            }
        }
        count
    }
}

/// Tracks keyed by entity id. Ordered so every artifact iterates entities identically.
pub type TrackSet = BTreeMap<String, Track>;

/// What to do with an entity whose track cannot support interpolation.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SparseTrackPolicy {
    #[default]
    Fail,
    Exclude,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub time_step_ms: i64,
    pub inactive_after_ms: i64,
    /// Hunter/prey closeness threshold in degrees scaled by 1000. Not meters.
    pub proximity_threshold: f64,
    pub sparse_tracks: SparseTrackPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            time_step_ms: 1000,
            inactive_after_ms: 30_000,
            proximity_threshold: 0.5,
            sparse_tracks: SparseTrackPolicy::Fail,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), GridError> {
        if self.time_step_ms <= 0 {
            return Err(GridError::InvalidParameter(format!(
                "time_step_ms must be > 0 (got {})",
                self.time_step_ms
            )));
        }
        if self.inactive_after_ms < 0 {
            return Err(GridError::InvalidParameter(format!(
                "inactive_after_ms must be >= 0 (got {})",
                self.inactive_after_ms
            )));
        }
        if !self.proximity_threshold.is_finite() || self.proximity_threshold <= 0.0 {
            return Err(GridError::InvalidParameter(format!(
                "proximity_threshold must be a positive number (got {})",
                self.proximity_threshold
            )));
        }
        Ok(())
    }

    /// SHA-256 of the JSON encoding, used to tag output artifacts.
    pub fn fingerprint(&self) -> Result<String, GridError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| GridError::InvalidParameter(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

/// Every artifact of one pipeline run.
#[derive(Clone, Debug, Serialize)]
pub struct Consolidation {
    pub grid: TimeGrid,
    pub interpolated: BTreeMap<String, InterpolatedTrack>,
    pub connectivity: BTreeMap<String, ConnectivityFlags>,
    pub distance: BTreeMap<String, CumulativeDistance>,
    pub intervals: Vec<ProximityInterval>,
    pub events: BTreeMap<String, Vec<AnnotatedEvent>>,
    /// Entities dropped under [`SparseTrackPolicy::Exclude`].
    pub excluded: Vec<String>,
}

struct EntitySignals {
    interpolated: InterpolatedTrack,
    connectivity: ConnectivityFlags,
    distance: CumulativeDistance,
}

/// Run the full pipeline over one game's tracks.
pub fn consolidate(
    tracks: &TrackSet,
    captures: &CaptureTimes,
    running: RunningInterval,
    config: &PipelineConfig,
) -> Result<Consolidation, GridError> {
    config.validate()?;
    if tracks.is_empty() {
        return Err(GridError::NoEntities);
    }

    let (usable, excluded) = apply_sparse_policy(tracks, config.sparse_tracks)?;
    if usable.is_empty() {
        return Err(GridError::NoEntities);
    }

    let grid = align(&usable, config.time_step_ms)?;
    debug!(
        entities = usable.len(),
        points = grid.len(),
        "aligned tracks onto [{}, {})",
        grid.offset,
        grid.end
    );

    let signals = per_entity_signals(&usable, &grid, config)?;

    let mut interpolated = BTreeMap::new();
    let mut connectivity = BTreeMap::new();
    let mut distance = BTreeMap::new();
    let mut events = BTreeMap::new();
    for ((entity_id, track), signal) in usable.iter().zip(signals.into_iter()) {
        let stream = reconstruct_events(
            track,
            &signal.interpolated,
            &signal.connectivity,
            &signal.distance,
            &grid,
        );
        events.insert(entity_id.clone(), stream);
        interpolated.insert(entity_id.clone(), signal.interpolated);
        connectivity.insert(entity_id.clone(), signal.connectivity);
        distance.insert(entity_id.clone(), signal.distance);
    }

    let intervals = detect_intervals(
        &interpolated,
        &grid,
        captures,
        running,
        config.proximity_threshold,
    );

    Ok(Consolidation {
        grid,
        interpolated,
        connectivity,
        distance,
        intervals,
        events,
        excluded,
    })
}

fn apply_sparse_policy(
    tracks: &TrackSet,
    policy: SparseTrackPolicy,
) -> Result<(TrackSet, Vec<String>), GridError> {
    let mut usable = TrackSet::new();
    let mut excluded = Vec::new();
    for (entity_id, track) in tracks {
        let distinct = track.distinct_timestamps();
        // Empty tracks are an alignment failure regardless of policy.
        if !track.is_empty() && distinct < 2 {
            match policy {
                SparseTrackPolicy::Fail => {
                    return Err(GridError::InsufficientSamples {
                        entity_id: entity_id.clone(),
                        distinct,
                    })
                }
                SparseTrackPolicy::Exclude => {
                    warn!(entity = %entity_id, distinct, "excluding entity with too few samples");
                    excluded.push(entity_id.clone());
                    continue;
                }
            }
        }
        usable.insert(entity_id.clone(), track.clone());
    }
    Ok((usable, excluded))
}

fn entity_signals(
    track: &Track,
    grid: &TimeGrid,
    config: &PipelineConfig,
) -> Result<EntitySignals, GridError> {
    let interpolated = interpolate(track, grid)?;
    let connectivity = flag_connectivity(track, grid, config.inactive_after_ms);
    let distance = cumulative_distance(&interpolated);
    Ok(EntitySignals {
        interpolated,
        connectivity,
        distance,
    })
}

#[cfg(feature = "parallel")]
fn per_entity_signals(
    tracks: &TrackSet,
    grid: &TimeGrid,
    config: &PipelineConfig,
) -> Result<Vec<EntitySignals>, GridError> {
    use rayon::prelude::*;
    let ordered: Vec<&Track> = tracks.values().collect();
    ordered
        .par_iter()
        .map(|track| entity_signals(track, grid, config))
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn per_entity_signals(
    tracks: &TrackSet,
    grid: &TimeGrid,
    config: &PipelineConfig,
) -> Result<Vec<EntitySignals>, GridError> {
    tracks
        .values()
        .map(|track| entity_signals(track, grid, config))
        .collect()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
