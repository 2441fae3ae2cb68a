use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::{fmt, fs, io};

use chrono::{DateTime, NaiveDateTime, Utc};
use clap::Parser;
use serde::Serialize;

use smgrstat_core::stats::Histogram;
use smgrstat_core::storage::{
    BucketRecord, RelfileRecord, SegmentFile, SegmentKind, StorageError, list_segments,
    parse_segment_name, read_bucket, read_relfile,
};
use smgrstat_core::store::StatsEntry;

const PERCENTILES: [f64; 3] = [0.50, 0.95, 0.99];

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "smgrstatd-dump", about = "Inspect smgrstat history files")]
struct Cli {
    /// Path to a segment file or a history directory
    path: Option<PathBuf>,

    /// Number of entries shown per bucket, busiest first (0 = all)
    #[arg(long, default_value = "20")]
    top: usize,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum DumpError {
    /// Path is neither a directory nor a `.zst` segment.
    UnknownInput(PathBuf),
    /// `.zst` file whose name does not follow the segment naming scheme.
    NotSegment(PathBuf),
    Segment { path: PathBuf, source: StorageError },
    ListDir { path: PathBuf, source: io::Error },
    Json(serde_json::Error),
}

impl fmt::Display for DumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DumpError::UnknownInput(p) => write!(f, "Unknown file type: {}", p.display()),
            DumpError::NotSegment(p) => write!(f, "Not a segment file name: {}", p.display()),
            DumpError::Segment { path, source } => write!(f, "{}: {source}", path.display()),
            DumpError::ListDir { path, source } => {
                write!(f, "Cannot read {}: {source}", path.display())
            }
            DumpError::Json(e) => write!(f, "JSON output failed: {e}"),
        }
    }
}

impl std::error::Error for DumpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DumpError::Segment { source, .. } => Some(source),
            DumpError::ListDir { source, .. } => Some(source),
            DumpError::Json(e) => Some(e),
            DumpError::UnknownInput(_) | DumpError::NotSegment(_) => None,
        }
    }
}

impl From<serde_json::Error> for DumpError {
    fn from(e: serde_json::Error) -> Self {
        DumpError::Json(e)
    }
}

fn main() {
    let cli = Cli::parse();
    let path = cli.path.clone().unwrap_or_else(|| PathBuf::from("."));

    let result = if path.is_dir() {
        dump_directory(&path, &cli)
    } else if has_ext(&path, "zst") {
        dump_segment(&path, &cli)
    } else {
        Err(DumpError::UnknownInput(path.clone()))
    };

    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn has_ext(path: &Path, ext: &str) -> bool {
    path.extension().and_then(OsStr::to_str) == Some(ext)
}

// ── Formatting helpers ───────────────────────────────────────────────────────

fn human_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    let b = bytes as f64;
    if b >= MIB {
        format!("{:.1} MiB", b / MIB)
    } else if b >= KIB {
        format!("{:.1} KiB", b / KIB)
    } else {
        format!("{bytes} B")
    }
}

fn fmt_micros(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp_micros(ts)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn fmt_naive(ts: &NaiveDateTime) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn fmt_latency(us: Option<f64>) -> String {
    match us {
        None => "-".to_string(),
        Some(v) if v >= 1_000_000.0 => format!("{:.1}s", v / 1_000_000.0),
        Some(v) if v >= 1_000.0 => format!("{:.1}ms", v / 1_000.0),
        Some(v) => format!("{v:.0}us"),
    }
}

fn pct(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn display_name(e: &StatsEntry) -> String {
    if !e.meta.valid {
        return "?".to_string();
    }
    if e.meta.nspname.is_empty() {
        e.meta.relname.clone()
    } else {
        format!("{}.{}", e.meta.nspname, e.meta.relname)
    }
}

/// Percentile estimates; the histogram always has the expected bin count.
fn percentiles(h: &Histogram) -> Vec<Option<f64>> {
    PERCENTILES
        .iter()
        .map(|&p| h.percentile(p).ok().flatten())
        .collect()
}

fn busiest_first(entries: &[StatsEntry], top: usize) -> Vec<&StatsEntry> {
    let mut sorted: Vec<&StatsEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| std::cmp::Reverse(e.read_blocks + e.write_blocks + e.extend_blocks));
    if top > 0 {
        sorted.truncate(top);
    }
    sorted
}

// ── JSON output types ────────────────────────────────────────────────────────

#[derive(Serialize)]
struct LatencyJson {
    count: u64,
    min_us: Option<u64>,
    max_us: u64,
    mean_us: Option<f64>,
    p50_us: Option<f64>,
    p95_us: Option<f64>,
    p99_us: Option<f64>,
}

impl From<&Histogram> for LatencyJson {
    fn from(h: &Histogram) -> Self {
        let p = percentiles(h);
        Self {
            count: h.count,
            min_us: h.min_us(),
            max_us: h.max_us,
            mean_us: h.mean_us(),
            p50_us: p[0],
            p95_us: p[1],
            p99_us: p[2],
        }
    }
}

#[derive(Serialize)]
struct EntryJson {
    key: String,
    name: String,
    relkind: Option<char>,
    reads: u64,
    read_blocks: u64,
    writes: u64,
    write_blocks: u64,
    extends: u64,
    extend_blocks: u64,
    truncates: u64,
    fsyncs: u64,
    sequential_reads: u64,
    random_reads: u64,
    sequential_writes: u64,
    random_writes: u64,
    read_latency: LatencyJson,
    write_latency: LatencyJson,
    read_iat_cv: f64,
    write_iat_cv: f64,
    mean_read_run: f64,
    mean_write_run: f64,
    active_seconds: u32,
    first_access: String,
    last_access: String,
}

impl From<&StatsEntry> for EntryJson {
    fn from(e: &StatsEntry) -> Self {
        Self {
            key: e.key.to_string(),
            name: display_name(e),
            relkind: e.meta.relkind.map(|k| k.code()),
            reads: e.reads,
            read_blocks: e.read_blocks,
            writes: e.writes,
            write_blocks: e.write_blocks,
            extends: e.extends,
            extend_blocks: e.extend_blocks,
            truncates: e.truncates,
            fsyncs: e.fsyncs,
            sequential_reads: e.sequential_reads,
            random_reads: e.random_reads,
            sequential_writes: e.sequential_writes,
            random_writes: e.random_writes,
            read_latency: LatencyJson::from(&e.read_timing),
            write_latency: LatencyJson::from(&e.write_timing),
            read_iat_cv: e.read_burst.iat.coefficient_of_variation(),
            write_iat_cv: e.write_burst.iat.coefficient_of_variation(),
            mean_read_run: e.read_runs.mean,
            mean_write_run: e.write_runs.mean,
            active_seconds: e.active_seconds,
            first_access: fmt_micros(e.first_access),
            last_access: fmt_micros(e.last_access),
        }
    }
}

#[derive(Serialize)]
struct BucketJson {
    file: String,
    bucket_id: u64,
    collected_at: String,
    entry_count: usize,
    entries: Vec<EntryJson>,
}

#[derive(Serialize)]
struct AssocJson {
    old: String,
    new: String,
    fork: &'static str,
    is_redo: bool,
    name: Option<String>,
}

#[derive(Serialize)]
struct RelfileJson {
    file: String,
    bucket_id: u64,
    collected_at: String,
    assocs: Vec<AssocJson>,
}

#[derive(Serialize)]
struct SegmentJson {
    file: String,
    kind: &'static str,
    bucket_id: u64,
    written_at: String,
    size: u64,
}

#[derive(Serialize)]
struct DirectoryJson {
    path: String,
    buckets: usize,
    relfile_segments: usize,
    total_size: u64,
    first: Option<String>,
    last: Option<String>,
    segments: Vec<SegmentJson>,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), DumpError> {
    let text = serde_json::to_string_pretty(value)?;
    println!("{text}");
    Ok(())
}

fn kind_name(kind: SegmentKind) -> &'static str {
    match kind {
        SegmentKind::Bucket => "bucket",
        SegmentKind::Relfile => "relfile",
    }
}

// ── Segment files ────────────────────────────────────────────────────────────

fn dump_segment(path: &Path, cli: &Cli) -> Result<(), DumpError> {
    let name = path.file_name().and_then(OsStr::to_str).unwrap_or_default();
    let Some((kind, _, _)) = parse_segment_name(name) else {
        return Err(DumpError::NotSegment(path.to_path_buf()));
    };
    let segment_err = |source| DumpError::Segment {
        path: path.to_path_buf(),
        source,
    };
    match kind {
        SegmentKind::Bucket => {
            let record = read_bucket(path).map_err(segment_err)?;
            dump_bucket(path, &record, cli)
        }
        SegmentKind::Relfile => {
            let record = read_relfile(path).map_err(segment_err)?;
            dump_relfile(path, &record, cli)
        }
    }
}

fn dump_bucket(path: &Path, record: &BucketRecord, cli: &Cli) -> Result<(), DumpError> {
    let shown = busiest_first(&record.entries, cli.top);
    if cli.json {
        return print_json(&BucketJson {
            file: path.display().to_string(),
            bucket_id: record.bucket_id,
            collected_at: fmt_micros(record.collected_at),
            entry_count: record.entries.len(),
            entries: shown.into_iter().map(EntryJson::from).collect(),
        });
    }

    println!("File:       {}", path.display());
    println!("Bucket:     {}", record.bucket_id);
    println!("Collected:  {}", fmt_micros(record.collected_at));
    println!("Entries:    {}", record.entries.len());
    println!();
    println!(
        "  {:<22} {:<28} {:>8} {:>8} {:>6} {:>8} {:>8} {:>8} {:>8} {:>6}",
        "Key", "Relation", "Reads", "Writes", "Seq%", "R p50", "R p99", "W p50", "W p99", "Active"
    );
    println!("  {}", "─".repeat(132));
    for e in shown {
        let r = percentiles(&e.read_timing);
        let w = percentiles(&e.write_timing);
        let seq = pct(e.sequential_reads + e.sequential_writes, e.reads + e.writes);
        println!(
            "  {:<22} {:<28} {:>8} {:>8} {:>5.1}% {:>8} {:>8} {:>8} {:>8} {:>5}s",
            e.key.to_string(),
            display_name(e),
            e.reads,
            e.writes,
            seq,
            fmt_latency(r[0]),
            fmt_latency(r[2]),
            fmt_latency(w[0]),
            fmt_latency(w[2]),
            e.active_seconds
        );
    }
    Ok(())
}

fn dump_relfile(path: &Path, record: &RelfileRecord, cli: &Cli) -> Result<(), DumpError> {
    let assocs: Vec<AssocJson> = record
        .assocs
        .iter()
        .map(|a| AssocJson {
            old: a.old.to_string(),
            new: a.new.to_string(),
            fork: a.fork.name(),
            is_redo: a.is_redo,
            name: a
                .identity
                .as_ref()
                .map(|m| format!("{}.{}", m.nspname, m.relname)),
        })
        .collect();

    if cli.json {
        return print_json(&RelfileJson {
            file: path.display().to_string(),
            bucket_id: record.bucket_id,
            collected_at: fmt_micros(record.collected_at),
            assocs,
        });
    }

    println!("File:       {}", path.display());
    println!("Bucket:     {}", record.bucket_id);
    println!("Collected:  {}", fmt_micros(record.collected_at));
    println!("Assocs:     {}", assocs.len());
    println!();
    for a in &assocs {
        println!(
            "  {:<22} -> {:<22} {:<5} {}{}",
            a.old,
            a.new,
            a.fork,
            a.name.as_deref().unwrap_or("?"),
            if a.is_redo { " (redo)" } else { "" }
        );
    }
    Ok(())
}

// ── Directory ────────────────────────────────────────────────────────────────

fn dump_directory(dir: &Path, cli: &Cli) -> Result<(), DumpError> {
    let segments = list_segments(dir).map_err(|source| DumpError::ListDir {
        path: dir.to_path_buf(),
        source,
    })?;
    let count = |kind: SegmentKind| segments.iter().filter(|s| s.kind == kind).count();
    let total_size: u64 = segments.iter().map(|s| s.size).sum();
    let first = segments.first().map(|s| fmt_naive(&s.written_at));
    let last = segments.last().map(|s| fmt_naive(&s.written_at));

    if cli.json {
        return print_json(&DirectoryJson {
            path: dir.display().to_string(),
            buckets: count(SegmentKind::Bucket),
            relfile_segments: count(SegmentKind::Relfile),
            total_size,
            first,
            last,
            segments: segments.iter().map(segment_json).collect(),
        });
    }

    println!("Directory:  {}", dir.display());
    println!(
        "Segments:   {} buckets, {} relfile",
        count(SegmentKind::Bucket),
        count(SegmentKind::Relfile)
    );
    println!("Total size: {}", human_bytes(total_size));
    if let (Some(first), Some(last)) = (first, last) {
        println!("Range:      {first} .. {last}");
    }
    println!();
    for s in &segments {
        let entries = match s.kind {
            SegmentKind::Bucket => read_bucket(&s.path)
                .map(|r| format!("{} entries", r.entries.len()))
                .unwrap_or_else(|e| format!("unreadable: {e}")),
            SegmentKind::Relfile => read_relfile(&s.path)
                .map(|r| format!("{} assocs", r.assocs.len()))
                .unwrap_or_else(|e| format!("unreadable: {e}")),
        };
        println!(
            "  {:<44} {:>10} {}",
            file_name(&s.path),
            human_bytes(s.size),
            entries
        );
    }

    // Leftover temp files mean a write was interrupted.
    let stale = fs::read_dir(dir)
        .map(|rd| {
            rd.flatten()
                .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
                .count()
        })
        .unwrap_or(0);
    if stale > 0 {
        println!("\n  {stale} leftover .tmp file(s)");
    }
    Ok(())
}

fn segment_json(s: &SegmentFile) -> SegmentJson {
    SegmentJson {
        file: file_name(&s.path),
        kind: kind_name(s.kind),
        bucket_id: s.bucket_id,
        written_at: fmt_naive(&s.written_at),
        size: s.size,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(OsStr::to_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use smgrstat_core::store::{ForkNumber, ObjectKey, RelFileLocator};

    fn entry(rel: u32, read_blocks: u64) -> StatsEntry {
        let key = ObjectKey::new(RelFileLocator::new(1663, 5, rel), ForkNumber::Main);
        let mut e = StatsEntry::new(key);
        e.read_blocks = read_blocks;
        e
    }

    #[test]
    fn test_busiest_first() {
        let entries = vec![entry(1, 5), entry(2, 50), entry(3, 10)];
        let top: Vec<u32> = busiest_first(&entries, 2)
            .iter()
            .map(|e| e.key.locator.rel_number)
            .collect();
        assert_eq!(top, vec![2, 3]);
        assert_eq!(busiest_first(&entries, 0).len(), 3);
    }

    #[test]
    fn test_fmt_latency() {
        assert_eq!(fmt_latency(None), "-");
        assert_eq!(fmt_latency(Some(512.0)), "512us");
        assert_eq!(fmt_latency(Some(2048.0)), "2.0ms");
        assert_eq!(fmt_latency(Some(2_097_152.0)), "2.1s");
    }

    #[test]
    fn test_latency_json_percentiles() {
        let mut h = Histogram::new();
        for v in [10, 20, 30, 4000] {
            h.record(v);
        }
        let j = LatencyJson::from(&h);
        assert_eq!(j.count, 4);
        assert_eq!(j.min_us, Some(10));
        assert_eq!(j.p50_us, Some(16.0));
        assert_eq!(j.p99_us, Some(2048.0));
    }

    #[test]
    fn test_dump_errors() {
        let cli = Cli {
            path: None,
            top: 0,
            json: false,
        };
        let err = dump_segment(Path::new("/nowhere/notes.zst"), &cli).unwrap_err();
        assert!(matches!(err, DumpError::NotSegment(_)));
        assert_eq!(err.to_string(), "Not a segment file name: /nowhere/notes.zst");

        let err = dump_directory(Path::new("/nowhere/at/all"), &cli).unwrap_err();
        assert!(matches!(err, DumpError::ListDir { .. }));
        assert!(std::error::Error::source(&err).is_some());

        let err = DumpError::Segment {
            path: PathBuf::from("b.zst"),
            source: StorageError::Corrupt("bad crc".into()),
        };
        assert_eq!(err.to_string(), "b.zst: corrupt segment: bad crc");
    }
}
