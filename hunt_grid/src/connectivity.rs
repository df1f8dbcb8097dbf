use serde::{Deserialize, Serialize};

use crate::{TimeGrid, Track};

/// Per grid point: did the entity report recently enough to count as connected.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectivityFlags(pub Vec<bool>);

impl ConnectivityFlags {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<bool> {
        self.0.get(idx).copied()
    }

    pub fn active_count(&self) -> usize {
        self.0.iter().filter(|&&active| active).count()
    }
}

/// Flag each grid point whose latest preceding raw sample is at most
/// `inactive_after_ms` old.
///
/// Both the track and the grid are ascending, so one forward pointer over the
/// raw samples serves every grid point. A grid point before the first raw
/// sample has nothing to lean on and is flagged inactive.
pub fn flag_connectivity(track: &Track, grid: &TimeGrid, inactive_after_ms: i64) -> ConnectivityFlags {
    let samples = track.samples();
    let mut next = 0usize;
    let mut latest: Option<i64> = None;

    let flags = grid
        .timestamps
        .iter()
        .map(|&t| {
            while next < samples.len() && samples[next].timestamp <= t {
                latest = Some(samples[next].timestamp);
                next += 1;
            }
            match latest {
                Some(seen) => t - seen <= inactive_after_ms,
                None => false,
            }
        })
        .collect();
    ConnectivityFlags(flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::track;

    fn grid(timestamps: Vec<i64>) -> TimeGrid {
        TimeGrid {
            offset: timestamps.first().copied().unwrap_or(0),
            end: timestamps.last().copied().unwrap_or(0) + 1,
            step_ms: 1,
            timestamps,
        }
    }

    #[test]
    fn test_gap_threshold() {
        let tr = track("e", &[(0, 0.0, 0.0), (40_000, 0.0, 0.0)]);
        let flags = flag_connectivity(&tr, &grid(vec![20_000, 30_000, 35_000]), 30_000);
        assert_eq!(flags.0, vec![true, true, false]);
    }

    #[test]
    fn test_fresh_sample_reactivates() {
        let tr = track(
            "e",
            &[(0, 0.0, 0.0), (50_000, 0.0, 0.0), (51_000, 0.0, 0.0), (200_000, 0.0, 0.0)],
        );
        let ts: Vec<i64> = (0..20).map(|k| k * 10_000).collect();
        let flags = flag_connectivity(&tr, &grid(ts.clone()), 30_000);
        for (i, &t) in ts.iter().enumerate() {
            let seen = tr
                .samples()
                .iter()
                .rev()
                .find(|s| s.timestamp <= t)
                .map(|s| s.timestamp)
                .unwrap();
            assert_eq!(flags.get(i), Some(t - seen <= 30_000), "t={}", t);
        }
        assert_eq!(flags.active_count(), 4 + 4);
    }

    #[test]
    fn test_grid_point_before_first_sample_is_inactive() {
        let tr = track("e", &[(1_000, 0.0, 0.0), (2_000, 0.0, 0.0)]);
        let flags = flag_connectivity(&tr, &grid(vec![0, 1_000]), 30_000);
        assert_eq!(flags.0, vec![false, true]);
    }

    #[test]
    fn test_exact_threshold_is_active() {
        let tr = track("e", &[(0, 0.0, 0.0), (100, 0.0, 0.0)]);
        let flags = flag_connectivity(&tr, &grid(vec![0, 50, 99]), 99);
        assert_eq!(flags.0, vec![true, true, true]);
        let zero = flag_connectivity(&tr, &grid(vec![0, 1]), 0);
        assert_eq!(zero.0, vec![true, false]);
    }

    #[test]
    fn test_empty_grid() {
        let tr = track("e", &[(0, 0.0, 0.0), (10, 0.0, 0.0)]);
        assert!(flag_connectivity(&tr, &grid(Vec::new()), 5).is_empty());
    }
}
