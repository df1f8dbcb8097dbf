use serde::{Deserialize, Serialize};

use crate::{
    ConnectivityFlags, CumulativeDistance, InterpolatedTrack, RawSample, SampleMeta, TimeGrid,
    Track,
};

/// A raw or grid-synthesized sample carrying the derived signals.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedEvent {
    pub entity_id: String,
    pub timestamp: i64,
    pub lat: f64,
    pub lon: f64,
    #[serde(flatten)]
    pub meta: SampleMeta,
    pub is_interpolated: bool,
    pub is_connection_active: bool,
    pub cumulative_distance: f64,
}

impl AnnotatedEvent {
    fn observed(sample: &RawSample, cumulative_distance: f64) -> Self {
        Self {
            entity_id: sample.entity_id.clone(),
            timestamp: sample.timestamp,
            lat: sample.lat,
            lon: sample.lon,
            meta: sample.meta.clone(),
            is_interpolated: false,
            is_connection_active: true,
            cumulative_distance,
        }
    }
}

/// Merge one entity's raw samples with its grid points into a single ascending stream.
///
/// Both inputs are already ordered, so this is a single merge walk. A raw sample
/// at the same timestamp as a grid point is emitted first, and the grid point
/// then inherits its metadata. Raw samples carry the most recent cumulative
/// distance, which is 0 before the grid starts and the final grid value after
/// it ends.
pub fn reconstruct_events(
    track: &Track,
    interpolated: &InterpolatedTrack,
    connectivity: &ConnectivityFlags,
    distance: &CumulativeDistance,
    grid: &TimeGrid,
) -> Vec<AnnotatedEvent> {
    let samples = track.samples();
    let mut events = Vec::with_capacity(samples.len() + grid.len());
    let mut next = 0usize;
    let mut travelled = 0.0;

    let positions = interpolated.lat.iter().zip(interpolated.lon.iter());
    let signals = connectivity.0.iter().zip(distance.0.iter());
    for ((&t, (&lat, &lon)), (&active, &dist)) in grid.timestamps.iter().zip(positions).zip(signals)
    {
        while next < samples.len() && samples[next].timestamp <= t {
            events.push(AnnotatedEvent::observed(&samples[next], travelled));
            next += 1;
        }
        let meta = next
            .checked_sub(1)
            .and_then(|idx| samples.get(idx))
            .map(|s| s.meta.clone())
            .unwrap_or_default();
        travelled = dist;
        events.push(AnnotatedEvent {
            entity_id: track.entity_id().to_string(),
            timestamp: t,
            lat,
            lon,
            meta,
            is_interpolated: true,
            is_connection_active: active,
            cumulative_distance: travelled,
        });
    }

    for sample in &samples[next..] {
        events.push(AnnotatedEvent::observed(sample, travelled));
    }
    events
}
