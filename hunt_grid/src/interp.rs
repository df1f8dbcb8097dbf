//! Shape-preserving resampling of tracks onto the time grid.
//!
//! Latitude and longitude are treated as independent planar functions of time
//! and interpolated with a piecewise cubic Hermite (PCHIP) scheme: derivative
//! estimates are chosen so the curve never overshoots between two samples
//! unless the samples themselves turn there. Inter-sample distances are tiny
//! compared to the earth radius, so no spherical correction is applied.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::{GridError, RawSample, TimeGrid, Track};

/// Per-entity positions, index-aligned with the [`TimeGrid`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterpolatedTrack {
    pub lat: Array1<f64>,
    pub lon: Array1<f64>,
}

impl InterpolatedTrack {
    pub fn len(&self) -> usize {
        self.lat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lat.is_empty()
    }

    /// `(lat, lon)` at grid index `idx`.
    pub fn position(&self, idx: usize) -> (f64, f64) {
        (self.lat[idx], self.lon[idx])
    }
}

/// Monotone piecewise cubic Hermite interpolant.
#[derive(Clone, Debug)]
pub struct Pchip {
    xs: Vec<f64>,
    ys: Vec<f64>,
    slopes: Vec<f64>,
}

impl Pchip {
    /// `xs` must be strictly increasing and hold at least two knots.
    pub fn new(xs: Vec<f64>, ys: Vec<f64>) -> Result<Self, GridError> {
        if xs.len() != ys.len() {
            return Err(GridError::InvalidParameter(format!(
                "knot count mismatch: {} x values, {} y values",
                xs.len(),
                ys.len()
            )));
        }
        if xs.len() < 2 {
            return Err(GridError::InvalidParameter(
                "PCHIP needs at least two knots".into(),
            ));
        }
        if xs.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(GridError::InvalidParameter(
                "PCHIP knots must be strictly increasing".into(),
            ));
        }
        let slopes = pchip_slopes(&xs, &ys);
        Ok(Self { xs, ys, slopes })
    }

    pub fn domain(&self) -> (f64, f64) {
        (self.xs[0], self.xs[self.xs.len() - 1])
    }

    /// Evaluate at a single point. Points outside the domain extend the end cubic.
    pub fn evaluate(&self, x: f64) -> f64 {
        let upper = self.xs.partition_point(|&k| k < x);
        let interval = upper.saturating_sub(1).min(self.xs.len() - 2);
        self.hermite(interval, x)
    }

    /// Evaluate at ascending query points with a single forward pass over the knots.
    pub fn evaluate_sorted(&self, queries: &[f64]) -> Vec<f64> {
        let last_interval = self.xs.len() - 2;
        let mut interval = 0usize;
        queries
            .iter()
            .map(|&x| {
                while interval < last_interval && x > self.xs[interval + 1] {
                    interval += 1;
                }
                self.hermite(interval, x)
            })
            .collect()
    }

    fn hermite(&self, k: usize, x: f64) -> f64 {
        let h = self.xs[k + 1] - self.xs[k];
        let t = (x - self.xs[k]) / h;
        let t2 = t * t;
        let t3 = t2 * t;
        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + t;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;
        h00 * self.ys[k]
            + h10 * h * self.slopes[k]
            + h01 * self.ys[k + 1]
            + h11 * h * self.slopes[k + 1]
    }
}

fn sign(v: f64) -> i8 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}

fn pchip_slopes(xs: &[f64], ys: &[f64]) -> Vec<f64> {
    let n = xs.len();
    let h: Vec<f64> = xs.windows(2).map(|w| w[1] - w[0]).collect();
    let delta: Vec<f64> = (0..n - 1).map(|k| (ys[k + 1] - ys[k]) / h[k]).collect();

    if n == 2 {
        return vec![delta[0], delta[0]];
    }

    let mut slopes = vec![0.0; n];
    for k in 1..n - 1 {
        let (m0, m1) = (delta[k - 1], delta[k]);
        if sign(m0) * sign(m1) <= 0 {
            // local extremum or flat segment
            continue;
        }
        let w1 = 2.0 * h[k] + h[k - 1];
        let w2 = h[k] + 2.0 * h[k - 1];
        slopes[k] = (w1 + w2) / (w1 / m0 + w2 / m1);
    }
    slopes[0] = edge_slope(h[0], h[1], delta[0], delta[1]);
    slopes[n - 1] = edge_slope(h[n - 2], h[n - 3], delta[n - 2], delta[n - 3]);
    slopes
}

/// One-sided three-point end slope, clamped to keep the end interval monotone.
fn edge_slope(h0: f64, h1: f64, m0: f64, m1: f64) -> f64 {
    let d = ((2.0 * h0 + h1) * m0 - h0 * m1) / (h0 + h1);
    if sign(d) != sign(m0) {
        0.0
    } else if sign(m0) != sign(m1) && d.abs() > 3.0 * m0.abs() {
        3.0 * m0
    } else {
        d
    }
}

/// Knots for interpolation: when several samples share a timestamp the last one wins.
fn knots(samples: &[RawSample]) -> Vec<&RawSample> {
    let mut out: Vec<&RawSample> = Vec::with_capacity(samples.len());
    for sample in samples {
        match out.last_mut() {
            Some(prev) if prev.timestamp == sample.timestamp => *prev = sample,
            _ => out.push(sample),
        }
    }
    out
}

/// Resample one entity's track onto the grid.
pub fn interpolate(track: &Track, grid: &TimeGrid) -> Result<InterpolatedTrack, GridError> {
    let knots = knots(track.samples());
    if knots.len() < 2 {
        return Err(GridError::InsufficientSamples {
            entity_id: track.entity_id().to_string(),
            distinct: knots.len(),
        });
    }

    let xs: Vec<f64> = knots
        .iter()
        .map(|s| (s.timestamp - grid.offset) as f64)
        .collect();
    let lat = Pchip::new(xs.clone(), knots.iter().map(|s| s.lat).collect())?;
    let lon = Pchip::new(xs, knots.iter().map(|s| s.lon).collect())?;

    let queries = grid.offsets();
    Ok(InterpolatedTrack {
        lat: Array1::from_vec(lat.evaluate_sorted(&queries)),
        lon: Array1::from_vec(lon.evaluate_sorted(&queries)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::track;

    fn grid(offset: i64, timestamps: Vec<i64>) -> TimeGrid {
        TimeGrid {
            offset,
            end: timestamps.last().copied().unwrap_or(offset) + 1,
            step_ms: 1,
            timestamps,
        }
    }

    #[test]
    fn test_linear_data_is_reproduced() {
        let p = Pchip::new(vec![0.0, 1.0, 3.0, 4.0], vec![1.0, 3.0, 7.0, 9.0]).unwrap();
        for x in [0.0, 0.5, 2.0, 3.7, 4.0] {
            assert!((p.evaluate(x) - (1.0 + 2.0 * x)).abs() < 1e-12, "x={}", x);
        }
    }

    #[test]
    fn test_no_overshoot_between_samples() {
        // Step-like data where a natural cubic spline rings.
        let xs = vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let ys = vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let p = Pchip::new(xs, ys).unwrap();
        let queries: Vec<f64> = (0..=500).map(|i| i as f64 / 100.0).collect();
        let values = p.evaluate_sorted(&queries);
        assert!(values.iter().all(|&v| (-1e-12..=1.0 + 1e-12).contains(&v)));
        assert!(values.windows(2).all(|w| w[1] >= w[0] - 1e-12));
    }

    #[test]
    fn test_local_extremum_stays_at_sample() {
        let p = Pchip::new(vec![0.0, 1.0, 2.0], vec![0.0, 5.0, 0.0]).unwrap();
        let peak = (0..=200)
            .map(|i| p.evaluate(i as f64 / 100.0))
            .fold(f64::MIN, f64::max);
        assert!((peak - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_sorted_and_single_evaluation_agree() {
        let p = Pchip::new(vec![0.0, 2.0, 3.0, 7.0], vec![4.0, 1.0, 1.5, 6.0]).unwrap();
        let queries = vec![0.0, 0.3, 2.0, 2.5, 3.0, 6.9, 7.0];
        let sorted = p.evaluate_sorted(&queries);
        for (x, y) in queries.iter().zip(sorted.iter()) {
            assert!((p.evaluate(*x) - y).abs() < 1e-12);
        }
        assert_eq!(p.domain(), (0.0, 7.0));
    }

    #[test]
    fn test_rejects_bad_knots() {
        assert!(Pchip::new(vec![0.0], vec![1.0]).is_err());
        assert!(Pchip::new(vec![0.0, 0.0], vec![1.0, 2.0]).is_err());
        assert!(Pchip::new(vec![0.0, 1.0], vec![1.0]).is_err());
    }

    #[test]
    fn test_on_grid_track_round_trips() {
        let base = 1_716_561_247_000;
        let points: Vec<(i64, f64, f64)> = (0..20)
            .map(|k| {
                let t = base + k * 1_000;
                let f = k as f64;
                (t, 49.0 + (f * 0.37).sin() * 1e-3, 12.09 + f * f * 1e-5)
            })
            .collect();
        let tr = track("e", &points);
        let g = grid(base, points.iter().map(|p| p.0).collect());
        let out = interpolate(&tr, &g).unwrap();
        for (i, &(_, lat, lon)) in points.iter().enumerate() {
            assert!((out.lat[i] - lat).abs() <= 1e-9);
            assert!((out.lon[i] - lon).abs() <= 1e-9);
        }
    }

    #[test]
    fn test_duplicate_timestamps_keep_last() {
        let tr = track(
            "e",
            &[(0, 1.0, 1.0), (1_000, 2.0, 2.0), (1_000, 3.0, 3.0), (2_000, 3.0, 3.0)],
        );
        let out = interpolate(&tr, &grid(0, vec![0, 1_000, 2_000])).unwrap();
        assert_eq!(out.position(1), (3.0, 3.0));
    }

    #[test]
    fn test_too_few_distinct_samples() {
        let tr = track("e", &[(5, 1.0, 1.0), (5, 2.0, 2.0)]);
        let err = interpolate(&tr, &grid(5, vec![5])).unwrap_err();
        assert!(matches!(
            err,
            GridError::InsufficientSamples { distinct: 1, .. }
        ));
        assert_eq!(err.stage(), "interpolate");
    }

    #[test]
    fn test_empty_grid_gives_empty_track() {
        let tr = track("e", &[(0, 1.0, 1.0), (10, 2.0, 2.0)]);
        let out = interpolate(&tr, &grid(0, Vec::new())).unwrap();
        assert!(out.is_empty());
    }
}
