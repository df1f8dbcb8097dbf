use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::InterpolatedTrack;

/// Mean earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Running total of distance travelled along the grid, in meters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CumulativeDistance(pub Array1<f64>);

impl CumulativeDistance {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.0.last().copied().unwrap_or(0.0)
    }
}

/// Project degrees onto a sphere of radius [`EARTH_RADIUS_M`].
pub fn to_cartesian(lat_deg: f64, lon_deg: f64) -> [f64; 3] {
    let (lat, lon) = (lat_deg.to_radians(), lon_deg.to_radians());
    [
        EARTH_RADIUS_M * lat.cos() * lon.cos(),
        EARTH_RADIUS_M * lat.cos() * lon.sin(),
        EARTH_RADIUS_M * lat.sin(),
    ]
}

fn chord(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dx = b[0] - a[0];
    let dy = b[1] - a[1];
    let dz = b[2] - a[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Sum straight-line chords between consecutive grid points.
///
/// Consecutive grid points are meters apart, where the chord and the great
/// circle arc agree far below GPS noise.
pub fn cumulative_distance(track: &InterpolatedTrack) -> CumulativeDistance {
    let mut out = Vec::with_capacity(track.len());
    let mut total = 0.0;
    let mut prev: Option<[f64; 3]> = None;
    for (&lat, &lon) in track.lat.iter().zip(track.lon.iter()) {
        let here = to_cartesian(lat, lon);
        if let Some(before) = prev {
            total += chord(before, here);
        }
        out.push(total);
        prev = Some(here);
    }
    CumulativeDistance(Array1::from_vec(out))
}

/// Haversine distance in meters.
pub fn great_circle_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let to_rad = |deg: f64| deg.to_radians();
    let dlat = to_rad(lat2 - lat1);
    let dlon = to_rad(lon2 - lon1);
    let a = (dlat / 2.0).sin().powi(2)
        + to_rad(lat1).cos() * to_rad(lat2).cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}
