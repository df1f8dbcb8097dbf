//! Game export ingestion and GPX interchange.
//!
//! The game server exports a status log (`regular_status_update.json`, newest
//! row first), a capture log (`team_caught.json`) and nothing else. These
//! helpers turn those exports into the typed inputs of [`crate::consolidate`].

use std::collections::BTreeMap;
use std::io::{Cursor, Write};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use geo_types::Point;
use gpx::{Gpx, GpxVersion, TrackSegment, Waypoint};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use time::OffsetDateTime;

use crate::{CaptureTimes, GridError, RawSample, RunningInterval, SampleMeta, Track, TrackSet};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    pub timestamp: i64,
}

/// One row of the status log. Unknown columns are carried through untouched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusEntry {
    pub active_user: String,
    pub current_location: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_color: Option<String>,
    /// Server-side log time, `YYYY-MM-DD HH:MM:SS.fff` in UTC.
    #[serde(default, rename = "timestamp", skip_serializing_if = "Option::is_none")]
    pub logged_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl StatusEntry {
    fn to_sample(&self) -> Result<RawSample, GridError> {
        let location = &self.current_location;
        let (Some(lat), Some(lon)) = (location.lat, location.lon) else {
            return Err(GridError::MalformedSample {
                entity_id: self.active_user.clone(),
                timestamp: location.timestamp,
                reason: "missing latitude or longitude".into(),
            });
        };
        RawSample::with_meta(
            self.active_user.clone(),
            location.timestamp,
            lat,
            lon,
            SampleMeta {
                game_state: self.game_state.clone(),
                team_role: self.team_role.clone(),
                team_color: self.team_color.clone(),
            },
        )
    }

    /// Log time in epoch milliseconds, falling back to the fix time.
    pub fn logged_at_ms(&self) -> Result<i64, GridError> {
        match self.logged_at.as_deref() {
            Some(text) => parse_log_time(text),
            None => Ok(self.current_location.timestamp),
        }
    }
}

pub fn parse_status_log(input: &[u8]) -> Result<Vec<StatusEntry>, GridError> {
    serde_json::from_slice(input).map_err(|e| GridError::LogParse(e.to_string()))
}

/// Group status rows by `active_user`, keeping log order within each user.
pub fn group_entries(entries: Vec<StatusEntry>) -> BTreeMap<String, Vec<StatusEntry>> {
    let mut by_user: BTreeMap<String, Vec<StatusEntry>> = BTreeMap::new();
    for entry in entries {
        by_user
            .entry(entry.active_user.clone())
            .or_default()
            .push(entry);
    }
    by_user
}

/// Build validated, time-sorted tracks from status rows.
pub fn tracks_from_entries(entries: &[StatusEntry]) -> Result<TrackSet, GridError> {
    let mut samples: BTreeMap<String, Vec<RawSample>> = BTreeMap::new();
    for entry in entries {
        let sample = entry.to_sample()?;
        samples
            .entry(sample.entity_id.clone())
            .or_default()
            .push(sample);
    }
    Ok(samples
        .into_iter()
        .map(|(entity_id, rows)| {
            let track = Track::new(entity_id.clone(), rows);
            (entity_id, track)
        })
        .collect())
}

#[derive(Clone, Debug, Deserialize)]
struct CaptureRow {
    timestamp: String,
    runaway_active_user: String,
    hunter_active_user: String,
}

/// Read the capture log. The hunter of the last row started the game as hunter.
pub fn parse_capture_log(input: &[u8]) -> Result<CaptureTimes, GridError> {
    let rows: Vec<CaptureRow> =
        serde_json::from_slice(input).map_err(|e| GridError::LogParse(e.to_string()))?;
    let mut captures = CaptureTimes::new();
    for row in &rows {
        captures.record_capture(row.runaway_active_user.clone(), parse_log_time(&row.timestamp)?);
    }
    if let Some(first_round) = rows.last() {
        captures.set_initial_hunter(first_round.hunter_active_user.clone());
    }
    Ok(captures)
}

/// Derive hunter start times from status rows when no capture log exists.
///
/// Each user's earliest `HUNTER` fix is the moment it turned hunter. The
/// earliest of those opened the game as hunter and is recorded at 0.
pub fn captures_from_status(entries: &[StatusEntry]) -> CaptureTimes {
    let mut first_hunting: BTreeMap<&str, i64> = BTreeMap::new();
    for entry in entries
        .iter()
        .filter(|entry| entry.team_role.as_deref() == Some("HUNTER"))
    {
        let t = entry.current_location.timestamp;
        first_hunting
            .entry(entry.active_user.as_str())
            .and_modify(|first| *first = (*first).min(t))
            .or_insert(t);
    }

    let opening = first_hunting.values().min().copied();
    let mut captures = CaptureTimes::new();
    for (user, t) in first_hunting {
        if Some(t) == opening {
            captures.set_initial_hunter(user);
        } else {
            captures.record_capture(user, t);
        }
    }
    captures
}

/// Parse a server log time as UTC epoch milliseconds, truncated to whole seconds.
pub fn parse_log_time(text: &str) -> Result<i64, GridError> {
    let trimmed = text.trim();
    let utc = match NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f") {
        Ok(naive) => Utc.from_utc_datetime(&naive),
        Err(_) => DateTime::parse_from_rfc3339(trimmed)
            .map_err(|e| GridError::LogParse(format!("bad log time '{}': {}", text, e)))?
            .with_timezone(&Utc),
    };
    Ok(utc.timestamp() * 1000)
}

/// Find when the game was running: oldest `RUNNING` row to the next `OVER` row.
///
/// `entries` must be in log order (newest first).
pub fn running_interval(entries: &[StatusEntry]) -> Result<Option<RunningInterval>, GridError> {
    let mut start: Option<i64> = None;
    for entry in entries.iter().rev() {
        match (start, entry.game_state.as_deref()) {
            (None, Some("RUNNING")) => start = Some(entry.logged_at_ms()?),
            (Some(start), Some("OVER")) => {
                return Ok(Some(RunningInterval {
                    start,
                    end: entry.logged_at_ms()?,
                }))
            }
            _ => {}
        }
    }
    Ok(None)
}

/// Read every timed track point of a GPX document as one entity's track.
pub fn parse_gpx_track(input: &[u8], entity_id: &str) -> Result<Track, GridError> {
    let mut cursor = Cursor::new(input);
    let doc = gpx::read(&mut cursor).map_err(|e| GridError::GpxParse(e.to_string()))?;
    let mut samples = Vec::new();

    for track in doc.tracks {
        for segment in track.segments {
            for point in segment.points {
                if let Some(time) = point.time {
                    let iso = time
                        .format()
                        .map_err(|e| GridError::GpxParse(e.to_string()))?;
                    let utc = DateTime::parse_from_rfc3339(&iso)
                        .map_err(|e| GridError::GpxParse(e.to_string()))?
                        .with_timezone(&Utc);
                    let geo = point.point();
                    samples.push(RawSample::new(
                        entity_id,
                        utc.timestamp_millis(),
                        geo.y(),
                        geo.x(),
                    )?);
                }
            }
        }
    }
    Ok(Track::new(entity_id, samples))
}

/// Write all tracks as one GPX 1.1 document, one `<trk>` per entity.
pub fn write_gpx<W: Write>(tracks: &TrackSet, writer: W) -> Result<(), GridError> {
    let mut doc = Gpx {
        version: GpxVersion::Gpx11,
        creator: Some("hunt_grid".to_string()),
        ..Default::default()
    };
    for (entity_id, track) in tracks {
        let mut segment = TrackSegment::new();
        for sample in track.samples() {
            let mut waypoint = Waypoint::new(Point::new(sample.lon, sample.lat));
            let at = OffsetDateTime::from_unix_timestamp_nanos(
                i128::from(sample.timestamp) * 1_000_000,
            )
            .map_err(|e| GridError::GpxWrite(e.to_string()))?;
            waypoint.time = Some(at.into());
            segment.points.push(waypoint);
        }
        let mut gpx_track = gpx::Track::new();
        gpx_track.name = Some(entity_id.clone());
        gpx_track.segments.push(segment);
        doc.tracks.push(gpx_track);
    }
    gpx::write(&doc, writer).map_err(|e| GridError::GpxWrite(e.to_string()))
}
