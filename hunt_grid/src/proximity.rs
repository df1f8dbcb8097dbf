//! Hunter/prey proximity intervals.
//!
//! An entity is a hunter from the moment it is captured (the game's first
//! hunter counts as captured at 0) and prey until then. Grid points where any
//! hunter is close to any prey are merged into maximal runs, and only runs lying
//! entirely inside the game's running interval are kept.
//!
//! Closeness uses a degree-scaled planar pseudo-metric,
//! `sqrt((1000 dlat)^2 + (1000 dlon)^2)`. It is not a distance in meters and
//! its effective radius shrinks in longitude away from the equator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{InterpolatedTrack, TimeGrid};

/// Capture time per entity. Entities without an entry were never captured.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaptureTimes(BTreeMap<String, i64>);

impl CaptureTimes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_hunter(entity_id: impl Into<String>) -> Self {
        let mut captures = Self::new();
        captures.set_initial_hunter(entity_id);
        captures
    }

    pub fn record_capture(&mut self, entity_id: impl Into<String>, timestamp: i64) {
        self.0.insert(entity_id.into(), timestamp);
    }

    /// The initial hunter is treated as captured at time zero.
    pub fn set_initial_hunter(&mut self, entity_id: impl Into<String>) {
        self.0.insert(entity_id.into(), 0);
    }

    pub fn captured_at(&self, entity_id: &str) -> Option<i64> {
        self.0.get(entity_id).copied()
    }

    pub fn is_hunter_at(&self, entity_id: &str, t: i64) -> bool {
        matches!(self.captured_at(entity_id), Some(captured) if captured <= t)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(id, &t)| (id.as_str(), t))
    }
}

/// Window during which the game was actually in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningInterval {
    pub start: i64,
    pub end: i64,
}

impl RunningInterval {
    pub fn unbounded() -> Self {
        Self {
            start: i64::MIN,
            end: i64::MAX,
        }
    }

    /// Full containment, bounds inclusive.
    pub fn contains(&self, interval: &ProximityInterval) -> bool {
        self.start <= interval.start && interval.end <= self.end
    }
}

/// Inclusive span of consecutive grid timestamps with a hunter near a prey.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProximityInterval {
    pub start: i64,
    pub end: i64,
}

pub fn approx_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    let d_lat = (a.0 - b.0) * 1000.0;
    let d_lon = (a.1 - b.1) * 1000.0;
    (d_lat * d_lat + d_lon * d_lon).sqrt()
}

/// Per grid point: is any hunter within `threshold` of any prey.
pub fn interesting_mask(
    tracks: &BTreeMap<String, InterpolatedTrack>,
    grid: &TimeGrid,
    captures: &CaptureTimes,
    threshold: f64,
) -> Vec<bool> {
    grid.timestamps
        .iter()
        .enumerate()
        .map(|(idx, &t)| {
            let (hunters, prey): (Vec<_>, Vec<_>) = tracks
                .iter()
                .partition(|(entity_id, _)| captures.is_hunter_at(entity_id, t));
            // any qualifying pair will do, stop at the first
            hunters.iter().any(|(_, hunter)| {
                prey.iter().any(|(_, runner)| {
                    approx_distance(hunter.position(idx), runner.position(idx)) < threshold
                })
            })
        })
        .collect()
}

/// Collapse a per-point mask into maximal runs of grid timestamps.
pub fn merge_runs(grid: &TimeGrid, mask: &[bool]) -> Vec<ProximityInterval> {
    let mut intervals = Vec::new();
    let mut open: Option<ProximityInterval> = None;
    for (&t, &hit) in grid.timestamps.iter().zip(mask.iter()) {
        open = match (open, hit) {
            (None, true) => Some(ProximityInterval { start: t, end: t }),
            (Some(run), true) => Some(ProximityInterval { end: t, ..run }),
            (Some(run), false) => {
                intervals.push(run);
                None
            }
            (None, false) => None,
        };
    }
    if let Some(run) = open {
        intervals.push(run);
    }
    intervals
}

/// Drop every interval not fully inside `running`. Partial overlaps are discarded, not clipped.
pub fn within_running(
    intervals: Vec<ProximityInterval>,
    running: RunningInterval,
) -> Vec<ProximityInterval> {
    intervals
        .into_iter()
        .filter(|interval| running.contains(interval))
        .collect()
}

pub fn detect_intervals(
    tracks: &BTreeMap<String, InterpolatedTrack>,
    grid: &TimeGrid,
    captures: &CaptureTimes,
    running: RunningInterval,
    threshold: f64,
) -> Vec<ProximityInterval> {
    let mask = interesting_mask(tracks, grid, captures, threshold);
    let runs = merge_runs(grid, &mask);
    let total = runs.len();
    let kept = within_running(runs, running);
    debug!(
        runs = total,
        kept = kept.len(),
        "proximity intervals inside running window"
    );
    kept
}
