use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{GridError, TrackSet};

/// Equidistant timestamps shared by every entity.
///
/// `offset` is the start of the common observation window. Numeric stages work
/// on `timestamp - offset` so that epoch-sized millisecond values never enter
/// floating point arithmetic directly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeGrid {
    pub offset: i64,
    /// Exclusive upper bound of the observation window.
    pub end: i64,
    pub step_ms: i64,
    pub timestamps: Vec<i64>,
}

impl TimeGrid {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn first(&self) -> Option<i64> {
        self.timestamps.first().copied()
    }

    pub fn last(&self) -> Option<i64> {
        self.timestamps.last().copied()
    }

    /// Grid timestamps relative to the window start.
    pub fn offsets(&self) -> Vec<f64> {
        self.timestamps
            .iter()
            .map(|&t| (t - self.offset) as f64)
            .collect()
    }
}

/// Compute the common observation window of all tracks and lay a grid over it.
///
/// The window runs from the latest first sample to the earliest last sample.
/// Points are `offset + k * step_ms` for `k < floor(span / step_ms)`, so a window
/// narrower than one step produces an empty grid rather than an error.
pub fn align(tracks: &TrackSet, step_ms: i64) -> Result<TimeGrid, GridError> {
    if step_ms <= 0 {
        return Err(GridError::InvalidParameter(format!(
            "time step must be > 0 ms (got {})",
            step_ms
        )));
    }
    if tracks.is_empty() {
        return Err(GridError::NoEntities);
    }

    let mut overlap_start = i64::MIN;
    let mut overlap_end = i64::MAX;
    for (entity_id, track) in tracks {
        let (Some(first), Some(last)) = (track.first_timestamp(), track.last_timestamp()) else {
            return Err(GridError::EmptyTrack {
                entity_id: entity_id.clone(),
            });
        };
        overlap_start = overlap_start.max(first);
        overlap_end = overlap_end.min(last);
    }

    if overlap_start > overlap_end {
        return Err(GridError::NoOverlap {
            overlap_start,
            overlap_end,
        });
    }

    let count = (overlap_end - overlap_start) / step_ms;
    let timestamps: Vec<i64> = (0..count).map(|k| overlap_start + k * step_ms).collect();
    debug!(
        overlap_start,
        overlap_end,
        step_ms,
        points = timestamps.len(),
        "built time grid"
    );

    Ok(TimeGrid {
        offset: overlap_start,
        end: overlap_end,
        step_ms,
        timestamps,
    })
}
