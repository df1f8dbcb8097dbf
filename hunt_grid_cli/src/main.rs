use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use hunt_grid::ingest::{
    captures_from_status, group_entries, parse_capture_log, parse_gpx_track, parse_status_log, running_interval,
    tracks_from_entries, write_gpx, StatusEntry,
};
use hunt_grid::{
    consolidate, great_circle_m, CaptureTimes, Consolidation, PipelineConfig, RunningInterval,
    SparseTrackPolicy, TimeGrid, TrackSet,
};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const LOG_BY_USER_DIR: &str = "log-by-user";
const STATUS_LOG: &str = "log-export/regular_status_update.json";
const CAPTURE_LOG: &str = "log-export/team_caught.json";
const RUNNING_INTERVAL_FILE: &str = "running_interval.json";

#[derive(Parser, Debug)]
#[command(author, version, about = "Pursuit game trajectory consolidation CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Align, interpolate and annotate all tracks of one game
    Consolidate(ConsolidateArgs),
    /// Split a status log into one JSON file per user
    Split(SplitArgs),
    /// Export the raw tracks of a game as a combined GPX file
    ExportGpx(ExportGpxArgs),
    /// Summarize per-entity sampling quality
    Diagnose(DiagnoseArgs),
}

#[derive(Parser, Debug)]
struct InputArgs {
    /// Game directory (contains log-by-user/ and/or log-export/)
    #[arg(value_hint = ValueHint::DirPath)]
    game_dir: PathBuf,

    /// Read tracks from GPX files (one per entity, named <entity>.gpx) instead of JSON logs
    #[arg(long, value_hint = ValueHint::DirPath)]
    gpx_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ConsolidateArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Output directory (defaults to <game_dir>/log-interpol)
    #[arg(short, long, value_hint = ValueHint::DirPath)]
    out: Option<PathBuf>,

    /// Optional pipeline config JSON; flags below override it
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Grid spacing in milliseconds
    #[arg(long)]
    time_step: Option<i64>,

    /// Connectivity threshold in milliseconds
    #[arg(long)]
    inactive_after: Option<i64>,

    /// Hunter/prey threshold in degrees x 1000
    #[arg(long)]
    proximity_threshold: Option<f64>,

    /// Drop entities with fewer than two distinct fixes instead of failing
    #[arg(long, action = ArgAction::SetTrue)]
    exclude_sparse: bool,

    /// Skip writing per-entity event streams
    #[arg(long, action = ArgAction::SetTrue)]
    no_events: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct SplitArgs {
    /// Status log to split
    #[arg(value_hint = ValueHint::FilePath)]
    status_log: PathBuf,

    /// Output directory for <user>.json files
    #[arg(short, long, value_hint = ValueHint::DirPath)]
    out: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ExportGpxArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Output GPX path
    #[arg(short, long, default_value = "combined.gpx", value_hint = ValueHint::FilePath)]
    out: PathBuf,

    /// Also write one <entity>.gpx per track into this directory
    #[arg(long, value_hint = ValueHint::DirPath)]
    per_entity: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct DiagnoseArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Output report path (`-` for stdout)
    #[arg(short, long, default_value = "track_diagnostics.txt", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Consolidate(args) => args.verbose,
        Command::Split(args) => args.verbose,
        Command::ExportGpx(args) => args.verbose,
        Command::Diagnose(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Consolidate(args) => handle_consolidate(args),
        Command::Split(args) => handle_split(args),
        Command::ExportGpx(args) => handle_export_gpx(args),
        Command::Diagnose(args) => handle_diagnose(args),
    }
}

fn build_config(args: &ConsolidateArgs) -> Result<PipelineConfig> {
    let mut config = match args.config.as_ref() {
        Some(path) => load_config(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(step) = args.time_step {
        config.time_step_ms = step;
    }
    if let Some(inactive) = args.inactive_after {
        config.inactive_after_ms = inactive;
    }
    if let Some(threshold) = args.proximity_threshold {
        config.proximity_threshold = threshold;
    }
    if args.exclude_sparse {
        config.sparse_tracks = SparseTrackPolicy::Exclude;
    }
    config.validate()?;
    Ok(config)
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not a valid config", path.display()))
}

fn handle_consolidate(args: ConsolidateArgs) -> Result<()> {
    let config = build_config(&args)?;
    let game_dir = &args.input.game_dir;
    let out_dir = args
        .out
        .clone()
        .unwrap_or_else(|| game_dir.join("log-interpol"));

    let t_load = Instant::now();
    let tracks = load_tracks(&args.input)?;
    let captures = load_captures(game_dir)?;
    let running = load_running_interval(game_dir)?;
    if args.profile || args.verbose {
        info!(
            "Load stage: {:.1} ms ({} entities)",
            t_load.elapsed().as_secs_f64() * 1000.0,
            tracks.len()
        );
    }

    let t_compute = Instant::now();
    let result = consolidate(&tracks, &captures, running, &config)
        .with_context(|| format!("failed to consolidate {}", game_dir.display()))?;
    if args.profile || args.verbose {
        info!(
            "Compute stage: {:.1} ms ({} grid points)",
            t_compute.elapsed().as_secs_f64() * 1000.0,
            result.grid.len()
        );
    }
    if result.grid.is_empty() {
        warn!("Observation window is narrower than one time step; artifacts are empty");
    }
    for entity in &result.excluded {
        warn!("Excluded {} (fewer than two distinct fixes)", entity);
    }
    info!(
        "Consolidated {} entities onto {} grid points, {} proximity interval(s)",
        result.interpolated.len(),
        result.grid.len(),
        result.intervals.len()
    );

    let t_write = Instant::now();
    write_outputs(&result, &config, &out_dir, !args.no_events)?;
    if args.profile || args.verbose {
        info!(
            "Write stage: {:.1} ms",
            t_write.elapsed().as_secs_f64() * 1000.0
        );
    }
    info!("Wrote artifacts: {}", out_dir.display());
    Ok(())
}

fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry?.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(extension))
            .unwrap_or(false);
        if matches && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn read_status_file(path: &Path) -> Result<Vec<StatusEntry>> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_status_log(&data).with_context(|| format!("failed to parse {}", path.display()))
}

fn load_tracks(input: &InputArgs) -> Result<TrackSet> {
    if let Some(gpx_dir) = input.gpx_dir.as_ref() {
        let files = list_files(gpx_dir, "gpx")?;
        if files.is_empty() {
            return Err(anyhow!("no .gpx files in {}", gpx_dir.display()));
        }
        let tracks = files
            .par_iter()
            .map(|path| -> Result<(String, hunt_grid::Track)> {
                let entity_id = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .ok_or_else(|| anyhow!("unusable file name {}", path.display()))?
                    .to_string();
                let data =
                    fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
                let track = parse_gpx_track(&data, &entity_id)
                    .with_context(|| format!("failed to parse {}", path.display()))?;
                Ok((entity_id, track))
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(tracks.into_iter().collect());
    }

    let entries = load_status_entries(&input.game_dir)?;
    if entries.is_empty() {
        return Err(anyhow!("no status rows found under {}", input.game_dir.display()));
    }
    Ok(tracks_from_entries(&entries)?)
}

/// Status rows from `log-by-user/`, or from the combined status log when that is absent.
fn load_status_entries(game_dir: &Path) -> Result<Vec<StatusEntry>> {
    let per_user = game_dir.join(LOG_BY_USER_DIR);
    if !per_user.is_dir() {
        return read_status_file(&game_dir.join(STATUS_LOG));
    }
    let files = list_files(&per_user, "json")?;
    debug!("Reading {} per-user logs from {}", files.len(), per_user.display());
    let chunks = files
        .par_iter()
        .map(|path| read_status_file(path))
        .collect::<Result<Vec<_>>>()?;
    Ok(chunks.into_iter().flatten().collect())
}

fn load_captures(game_dir: &Path) -> Result<CaptureTimes> {
    let path = game_dir.join(CAPTURE_LOG);
    if !path.is_file() {
        let has_status =
            game_dir.join(LOG_BY_USER_DIR).is_dir() || game_dir.join(STATUS_LOG).is_file();
        let captures = if has_status {
            captures_from_status(&load_status_entries(game_dir)?)
        } else {
            CaptureTimes::new()
        };
        if captures.is_empty() {
            warn!(
                "No capture log at {} and no HUNTER rows; every entity is treated as prey",
                path.display()
            );
        } else {
            info!(
                "No capture log at {}; derived {} hunter start times from status rows",
                path.display(),
                captures.len()
            );
        }
        return Ok(captures);
    }
    let data = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let captures =
        parse_capture_log(&data).with_context(|| format!("failed to parse {}", path.display()))?;
    debug!("Loaded {} capture entries", captures.len());
    Ok(captures)
}

fn load_running_interval(game_dir: &Path) -> Result<RunningInterval> {
    let path = game_dir.join(RUNNING_INTERVAL_FILE);
    if path.is_file() {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        return serde_json::from_str(&text)
            .with_context(|| format!("{} is not a valid running interval", path.display()));
    }
    let status = game_dir.join(STATUS_LOG);
    if status.is_file() {
        if let Some(running) = running_interval(&read_status_file(&status)?)? {
            info!("Running interval from status log: [{}, {}]", running.start, running.end);
            return Ok(running);
        }
    }
    warn!("No running interval found; proximity intervals are not filtered");
    Ok(RunningInterval::unbounded())
}

#[derive(Serialize)]
struct Manifest<'a> {
    config: &'a PipelineConfig,
    config_sha256: String,
    overlap_start: i64,
    overlap_end: i64,
    step_ms: i64,
    grid_points: usize,
    entities: Vec<&'a str>,
    excluded: &'a [String],
    proximity_intervals: usize,
}

fn write_outputs(
    result: &Consolidation,
    config: &PipelineConfig,
    out_dir: &Path,
    with_events: bool,
) -> Result<()> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let mut positions: Vec<(String, Vec<String>)> = Vec::new();
    for (entity, track) in &result.interpolated {
        positions.push((format!("{}.lat", entity), track.lat.iter().map(fmt_coord).collect()));
        positions.push((format!("{}.lon", entity), track.lon.iter().map(fmt_coord).collect()));
    }
    write_grid_csv(&result.grid, &positions, &out_dir.join("grid.csv"))?;

    let connectivity: Vec<(String, Vec<String>)> = result
        .connectivity
        .iter()
        .map(|(entity, flags)| (entity.clone(), flags.0.iter().map(bool::to_string).collect()))
        .collect();
    write_grid_csv(&result.grid, &connectivity, &out_dir.join("connectivity.csv"))?;

    let distance: Vec<(String, Vec<String>)> = result
        .distance
        .iter()
        .map(|(entity, dist)| (entity.clone(), dist.0.iter().map(|v| format!("{:.3}", v)).collect()))
        .collect();
    write_grid_csv(&result.grid, &distance, &out_dir.join("distance.csv"))?;

    write_json(&out_dir.join("interesting_timestamps.json"), &result.intervals)?;

    if with_events {
        let events_dir = out_dir.join("events");
        fs::create_dir_all(&events_dir)
            .with_context(|| format!("failed to create {}", events_dir.display()))?;
        for (entity, events) in &result.events {
            write_json(&events_dir.join(format!("{}.json", entity)), events)?;
        }
    }

    let manifest = Manifest {
        config,
        config_sha256: config.fingerprint()?,
        overlap_start: result.grid.offset,
        overlap_end: result.grid.end,
        step_ms: result.grid.step_ms,
        grid_points: result.grid.len(),
        entities: result.interpolated.keys().map(String::as_str).collect(),
        excluded: &result.excluded,
        proximity_intervals: result.intervals.len(),
    };
    write_json(&out_dir.join("manifest.json"), &manifest)
}

fn fmt_coord(value: &f64) -> String {
    format!("{:.8}", value)
}

fn write_grid_csv(grid: &TimeGrid, columns: &[(String, Vec<String>)], path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_grid_rows(grid, columns, &mut writer)
}

fn write_grid_rows<W: Write>(
    grid: &TimeGrid,
    columns: &[(String, Vec<String>)],
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    let mut header = Vec::with_capacity(columns.len() + 1);
    header.push("timestamp".to_string());
    header.extend(columns.iter().map(|(name, _)| name.clone()));
    writer.write_record(&header)?;

    for (idx, t) in grid.timestamps.iter().enumerate() {
        let mut row = Vec::with_capacity(columns.len() + 1);
        row.push(t.to_string());
        for (name, values) in columns {
            let cell = values
                .get(idx)
                .ok_or_else(|| anyhow!("column {} is shorter than the grid", name))?;
            row.push(cell.clone());
        }
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .with_context(|| format!("failed to write {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

fn handle_split(args: SplitArgs) -> Result<()> {
    let entries = read_status_file(&args.status_log)?;
    let grouped = group_entries(entries);
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    for (user, rows) in &grouped {
        write_json(&args.out.join(format!("{}.json", user)), rows)?;
    }
    info!(
        "Split {} into {} user logs under {}",
        args.status_log.display(),
        grouped.len(),
        args.out.display()
    );
    Ok(())
}

fn handle_export_gpx(args: ExportGpxArgs) -> Result<()> {
    let tracks = load_tracks(&args.input)?;
    let file = File::create(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    write_gpx(&tracks, BufWriter::new(file))
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    info!("Wrote GPX with {} tracks: {}", tracks.len(), args.out.display());

    if let Some(dir) = args.per_entity.as_ref() {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        for (entity, track) in &tracks {
            let single = TrackSet::from([(entity.clone(), track.clone())]);
            let path = dir.join(format!("{}.gpx", entity));
            let file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            write_gpx(&single, BufWriter::new(file))
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        info!("Wrote {} per-entity GPX files: {}", tracks.len(), dir.display());
    }
    Ok(())
}

#[derive(Clone, Debug, Default)]
struct TrackStats {
    samples: usize,
    distinct: usize,
    first: Option<i64>,
    last: Option<i64>,
    max_gap_ms: i64,
    max_jump_m: f64,
}

fn track_stats(track: &hunt_grid::Track) -> TrackStats {
    let samples = track.samples();
    let mut stats = TrackStats {
        samples: samples.len(),
        distinct: track.distinct_timestamps(),
        first: track.first_timestamp(),
        last: track.last_timestamp(),
        ..TrackStats::default()
    };
    for pair in samples.windows(2) {
        stats.max_gap_ms = stats.max_gap_ms.max(pair[1].timestamp - pair[0].timestamp);
        let jump = great_circle_m(pair[0].lat, pair[0].lon, pair[1].lat, pair[1].lon);
        if jump > stats.max_jump_m {
            stats.max_jump_m = jump;
        }
    }
    stats
}

fn diagnose_report(tracks: &TrackSet) -> String {
    let stats: BTreeMap<&str, TrackStats> = tracks
        .iter()
        .map(|(entity, track)| (entity.as_str(), track_stats(track)))
        .collect();

    let mut report = String::new();
    let window_start = stats.values().filter_map(|s| s.first).max();
    let window_end = stats.values().filter_map(|s| s.last).min();
    report.push_str(&format!("entities: {}\n", stats.len()));
    match (window_start, window_end) {
        (Some(start), Some(end)) if start <= end => report.push_str(&format!(
            "overlap: [{}, {}] ({:.1} s)\n",
            start,
            end,
            (end - start) as f64 / 1000.0
        )),
        _ => report.push_str("overlap: none\n"),
    }
    report.push('\n');

    for (entity, s) in &stats {
        report.push_str(&format!("ENTITY: {}\n", entity));
        report.push_str(&format!("  samples: {}\n", s.samples));
        report.push_str(&format!(
            "  duplicate_timestamps: {}\n",
            s.samples - s.distinct
        ));
        if let (Some(first), Some(last)) = (s.first, s.last) {
            report.push_str(&format!("  first: {}\n  last: {}\n", first, last));
            report.push_str(&format!("  timespan_s: {:.1}\n", (last - first) as f64 / 1000.0));
        }
        report.push_str(&format!("  max_gap_s: {:.1}\n", s.max_gap_ms as f64 / 1000.0));
        report.push_str(&format!("  max_jump_m: {:.1}\n", s.max_jump_m));
        if s.distinct < 2 {
            report.push_str("  warning: too few fixes to interpolate\n");
        }
        report.push('\n');
    }
    report
}

fn handle_diagnose(args: DiagnoseArgs) -> Result<()> {
    let tracks = load_tracks(&args.input)?;
    let report = diagnose_report(&tracks);
    if args.output.as_os_str() == "-" {
        io::stdout().write_all(report.as_bytes())?;
    } else {
        fs::write(&args.output, report)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Diagnostic report written: {}", args.output.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hunt_grid::{RawSample, Track};

    const USER_A: &str = r#"[
        {"active_user": "a", "current_location": {"lat": 49.0000, "lon": 12.0000, "timestamp": 0},
         "game_state": "RUNNING", "team_role": "HUNTER"},
        {"active_user": "a", "current_location": {"lat": 49.0000, "lon": 12.0002, "timestamp": 20000},
         "game_state": "RUNNING", "team_role": "HUNTER"},
        {"active_user": "a", "current_location": {"lat": 49.0000, "lon": 12.0004, "timestamp": 40000},
         "game_state": "RUNNING", "team_role": "HUNTER"}
    ]"#;

    const USER_B: &str = r#"[
        {"active_user": "b", "current_location": {"lat": 49.0000, "lon": 12.0100, "timestamp": 0},
         "game_state": "RUNNING", "team_role": "RUNAWAYS"},
        {"active_user": "b", "current_location": {"lat": 49.0000, "lon": 12.0003, "timestamp": 20000},
         "game_state": "RUNNING", "team_role": "RUNAWAYS"},
        {"active_user": "b", "current_location": {"lat": 49.0000, "lon": 12.0005, "timestamp": 40000},
         "game_state": "RUNNING", "team_role": "RUNAWAYS"}
    ]"#;

    const CAPTURES: &str = r#"[
        {"timestamp": "2024-05-24 14:40:00.000", "runaway_active_user": "c", "hunter_active_user": "a"}
    ]"#;

    fn game_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let by_user = dir.path().join(LOG_BY_USER_DIR);
        fs::create_dir_all(&by_user).unwrap();
        fs::write(by_user.join("a.json"), USER_A).unwrap();
        fs::write(by_user.join("b.json"), USER_B).unwrap();
        fs::create_dir_all(dir.path().join("log-export")).unwrap();
        fs::write(dir.path().join(CAPTURE_LOG), CAPTURES).unwrap();
        fs::write(
            dir.path().join(RUNNING_INTERVAL_FILE),
            r#"{"start": 0, "end": 40000}"#,
        )
        .unwrap();
        dir
    }

    fn consolidate_args(game_dir: &Path, out: &Path) -> ConsolidateArgs {
        ConsolidateArgs {
            input: InputArgs {
                game_dir: game_dir.to_path_buf(),
                gpx_dir: None,
            },
            out: Some(out.to_path_buf()),
            config: None,
            time_step: Some(10_000),
            inactive_after: None,
            proximity_threshold: None,
            exclude_sparse: false,
            no_events: false,
            verbose: false,
            profile: false,
        }
    }

    #[test]
    fn test_consolidate_writes_artifacts() {
        let dir = game_dir();
        let out = dir.path().join("out");
        handle_consolidate(consolidate_args(dir.path(), &out)).unwrap();

        let grid = fs::read_to_string(out.join("grid.csv")).unwrap();
        let mut lines = grid.lines();
        assert_eq!(lines.next(), Some("timestamp,a.lat,a.lon,b.lat,b.lon"));
        assert_eq!(lines.count(), 4);

        let connectivity = fs::read_to_string(out.join("connectivity.csv")).unwrap();
        assert!(connectivity.starts_with("timestamp,a,b\n0,true,true\n"));

        let intervals: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.join("interesting_timestamps.json")).unwrap())
                .unwrap();
        assert_eq!(intervals, serde_json::json!([{"start": 20000, "end": 30000}]));

        let events: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.join("events").join("b.json")).unwrap())
                .unwrap();
        assert_eq!(events.as_array().map(|e| e.len()), Some(7));
        assert_eq!(events[1]["is_interpolated"], true);
        assert_eq!(events[1]["team_role"], "RUNAWAYS");

        let manifest: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.join("manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest["grid_points"], 4);
        assert_eq!(manifest["entities"], serde_json::json!(["a", "b"]));
        assert_eq!(manifest["config"]["time_step_ms"], 10000);
        assert_eq!(manifest["config_sha256"].as_str().map(str::len), Some(64));
    }

    #[test]
    fn test_status_rows_stand_in_for_missing_capture_log() {
        let dir = game_dir();
        fs::remove_file(dir.path().join(CAPTURE_LOG)).unwrap();
        let captures = load_captures(dir.path()).unwrap();
        assert_eq!(captures.iter().collect::<Vec<_>>(), vec![("a", 0)]);

        let out = dir.path().join("out");
        handle_consolidate(consolidate_args(dir.path(), &out)).unwrap();
        let intervals: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.join("interesting_timestamps.json")).unwrap())
                .unwrap();
        assert_eq!(intervals, serde_json::json!([{"start": 20000, "end": 30000}]));

        let empty = tempfile::tempdir().unwrap();
        assert!(load_captures(empty.path()).unwrap().is_empty());
    }

    #[test]
    fn test_export_gpx_per_entity() {
        let dir = game_dir();
        let combined = dir.path().join("combined.gpx");
        let per_entity = dir.path().join("gpx");
        handle_export_gpx(ExportGpxArgs {
            input: InputArgs {
                game_dir: dir.path().to_path_buf(),
                gpx_dir: None,
            },
            out: combined.clone(),
            per_entity: Some(per_entity.clone()),
            verbose: false,
        })
        .unwrap();
        assert_eq!(fs::read_to_string(&combined).unwrap().matches("<trk>").count(), 2);
        assert_eq!(list_files(&per_entity, "gpx").unwrap().len(), 2);
        let single = fs::read(per_entity.join("b.gpx")).unwrap();
        let track = parse_gpx_track(&single, "b").unwrap();
        assert_eq!(track.len(), 3);
        assert_eq!(track.first_timestamp(), Some(0));
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        fs::write(
            &config_path,
            r#"{"time_step_ms": 5000, "inactive_after_ms": 10000}"#,
        )
        .unwrap();
        let mut args = consolidate_args(dir.path(), dir.path());
        args.config = Some(config_path);
        args.time_step = Some(2000);
        args.exclude_sparse = true;
        let config = build_config(&args).unwrap();
        assert_eq!(config.time_step_ms, 2000);
        assert_eq!(config.inactive_after_ms, 10_000);
        assert_eq!(config.sparse_tracks, SparseTrackPolicy::Exclude);

        args.time_step = Some(0);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_running_interval_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            load_running_interval(dir.path()).unwrap(),
            RunningInterval::unbounded()
        );
        fs::create_dir_all(dir.path().join("log-export")).unwrap();
        fs::write(
            dir.path().join(STATUS_LOG),
            r#"[
                {"active_user": "a", "current_location": {"lat": 1.0, "lon": 1.0, "timestamp": 3},
                 "game_state": "OVER", "timestamp": "2024-05-24 14:49:50.000"},
                {"active_user": "a", "current_location": {"lat": 1.0, "lon": 1.0, "timestamp": 2},
                 "game_state": "RUNNING", "timestamp": "2024-05-24 14:34:10.000"}
            ]"#,
        )
        .unwrap();
        assert_eq!(
            load_running_interval(dir.path()).unwrap(),
            RunningInterval {
                start: 1_716_561_250_000,
                end: 1_716_562_190_000
            }
        );
    }

    #[test]
    fn test_split_writes_one_file_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("status.json");
        let combined = format!(
            "[{},{}]",
            USER_A.trim().trim_start_matches('[').trim_end_matches(']'),
            USER_B.trim().trim_start_matches('[').trim_end_matches(']')
        );
        fs::write(&log, combined).unwrap();
        let out = dir.path().join("by-user");
        handle_split(SplitArgs {
            status_log: log,
            out: out.clone(),
            verbose: false,
        })
        .unwrap();
        assert_eq!(list_files(&out, "json").unwrap().len(), 2);
        let a = read_status_file(&out.join("a.json")).unwrap();
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_grid_rows_reject_short_columns() {
        let grid = TimeGrid {
            offset: 0,
            end: 20,
            step_ms: 10,
            timestamps: vec![0, 10],
        };
        let columns = vec![("x".to_string(), vec!["1".to_string()])];
        let mut writer = csv::Writer::from_writer(Vec::new());
        assert!(write_grid_rows(&grid, &columns, &mut writer).is_err());
    }

    #[test]
    fn test_diagnose_report() {
        let mut tracks = TrackSet::new();
        tracks.insert(
            "a".into(),
            Track::new(
                "a",
                vec![
                    RawSample::new("a", 0, 0.0, 0.0).unwrap(),
                    RawSample::new("a", 0, 0.0, 0.0).unwrap(),
                    RawSample::new("a", 45_000, 0.0, 1.0).unwrap(),
                ],
            ),
        );
        tracks.insert(
            "b".into(),
            Track::new("b", vec![RawSample::new("b", 10_000, 0.0, 0.0).unwrap()]),
        );
        let report = diagnose_report(&tracks);
        assert!(report.contains("entities: 2"));
        assert!(report.contains("overlap: [10000, 10000] (0.0 s)"));
        assert!(report.contains("duplicate_timestamps: 1"));
        assert!(report.contains("max_gap_s: 45.0"));
        assert!(report.contains("warning: too few fixes to interpolate"));
    }
}
