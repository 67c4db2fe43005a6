//! Crash signal extraction: scan the tail of the gateway's error logs for
//! crash signatures and count those stamped inside the trailing window.
//!
//! Matching lines whose timestamp cannot be parsed are ignored rather than
//! counted. A gateway that is not running at all adds one signal on its own
//! so a silently dead process still escalates.

use chrono::{DateTime, Datelike, Duration, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::LazyLock;

/// Upper bound on bytes read from the end of a log file.
const MAX_TAIL_BYTES: u64 = 1024 * 1024;

/// Windows longer than ten years are clamped.
const MAX_WINDOW_SECS: u64 = 10 * 365 * 24 * 3600;

/// Crash counts for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashWindow {
    pub threshold: u32,
    pub window_secs: u64,
    pub observed_count: u32,
}

impl CrashWindow {
    pub fn exceeded(&self) -> bool {
        self.observed_count >= self.threshold
    }
}

static CRASH_SIGNATURES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // fatal termination
        Regex::new(r"(?i)\bfatal\b").unwrap(),
        // out of memory
        Regex::new(r"(?i)out of memory").unwrap(),
        Regex::new(r"\bOOM\b").unwrap(),
        // abnormal signal
        Regex::new(r"(?i)\bSIG(KILL|SEGV|ABRT|TERM|BUS)\b").unwrap(),
        Regex::new(r"(?i)segmentation fault").unwrap(),
        Regex::new(r"(?i)killed by signal").unwrap(),
        // port conflict
        Regex::new(r"(?i)EADDRINUSE|address already in use").unwrap(),
        // uncaught fault
        Regex::new(r"(?i)uncaught ?exception").unwrap(),
        Regex::new(r"(?i)unhandled ?(promise )?rejection").unwrap(),
        Regex::new(r"panicked at").unwrap(),
        Regex::new(r"(?i)not currently running").unwrap(),
    ]
});

/// Whether a log line carries any crash signature.
pub fn is_crash_line(line: &str) -> bool {
    CRASH_SIGNATURES.iter().any(|p| p.is_match(line))
}

/// One accepted timestamp layout: where to find it in a line and how to read it.
struct TimestampFormat {
    name: &'static str,
    pattern: Regex,
    parse: fn(&str, DateTime<Utc>) -> Option<DateTime<Utc>>,
}

fn local_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_rfc3339(s: &str, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_iso_local(s: &str, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let normalized = s.replacen('T', " ", 1);
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())
        .and_then(local_to_utc)
}

fn parse_syslog(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let year = now.with_timezone(&Local).year();
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    let parsed = NaiveDateTime::parse_from_str(&format!("{year} {collapsed}"), "%Y %b %d %H:%M:%S")
        .ok()
        .and_then(local_to_utc)?;
    // No year in the line: a date well past "now" belongs to last year.
    if parsed > now + Duration::days(1) {
        let naive = NaiveDateTime::parse_from_str(
            &format!("{} {collapsed}", year - 1),
            "%Y %b %d %H:%M:%S",
        )
        .ok()?;
        local_to_utc(naive)
    } else {
        Some(parsed)
    }
}

fn parse_epoch(s: &str, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let digits: String = s.chars().filter(char::is_ascii_digit).collect();
    let value: i64 = digits.parse().ok()?;
    match digits.len() {
        13 => DateTime::from_timestamp_millis(value),
        10 => DateTime::from_timestamp(value, 0),
        _ => None,
    }
}

/// Accepted layouts, tried in order; the first that parses wins.
static TIMESTAMP_FORMATS: LazyLock<Vec<TimestampFormat>> = LazyLock::new(|| {
    vec![
        TimestampFormat {
            name: "rfc3339",
            pattern: Regex::new(
                r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})",
            )
            .unwrap(),
            parse: parse_rfc3339,
        },
        TimestampFormat {
            name: "iso-local-t",
            pattern: Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?").unwrap(),
            parse: parse_iso_local,
        },
        TimestampFormat {
            name: "iso-local-space",
            pattern: Regex::new(r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(\.\d+)?").unwrap(),
            parse: parse_iso_local,
        },
        TimestampFormat {
            name: "syslog",
            pattern: Regex::new(
                r"\b(Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec) +\d{1,2} \d{2}:\d{2}:\d{2}\b",
            )
            .unwrap(),
            parse: parse_syslog,
        },
        TimestampFormat {
            name: "epoch",
            pattern: Regex::new(r"(\[\d{13}\]|\[\d{10}\]|\bts=\d{13}\b|\bts=\d{10}\b)").unwrap(),
            parse: parse_epoch,
        },
    ]
});

/// Extract the first recognizable timestamp from a log line.
pub fn parse_timestamp(line: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    for format in TIMESTAMP_FORMATS.iter() {
        if let Some(m) = format.pattern.find(line) {
            if let Some(ts) = (format.parse)(m.as_str(), now) {
                tracing::trace!(format = format.name, %ts, "parsed log timestamp");
                return Some(ts);
            }
        }
    }
    None
}

/// Count crash lines stamped within `[now - window_secs, now]`.
pub fn count_crash_lines<S: AsRef<str>>(lines: &[S], now: DateTime<Utc>, window_secs: u64) -> u32 {
    let window_start = now - Duration::seconds(window_secs.min(MAX_WINDOW_SECS) as i64);
    let mut count = 0u32;
    for line in lines {
        let line = line.as_ref();
        if !is_crash_line(line) {
            continue;
        }
        match parse_timestamp(line, now) {
            Some(ts) if ts >= window_start && ts <= now => count += 1,
            Some(_) => {}
            None => tracing::trace!(line, "crash line without parsable timestamp ignored"),
        }
    }
    count
}

/// Compute the crash window for this run from pre-read log lines.
pub fn crash_window<S: AsRef<str>>(
    lines: &[S],
    running: bool,
    now: DateTime<Utc>,
    threshold: u32,
    window_secs: u64,
) -> CrashWindow {
    let mut observed_count = count_crash_lines(lines, now, window_secs);
    if !running {
        observed_count = observed_count.saturating_add(1);
    }
    CrashWindow {
        threshold,
        window_secs,
        observed_count,
    }
}

/// Read the last `n` lines of a file, looking at most `MAX_TAIL_BYTES` back.
pub fn tail_lines(path: &Path, n: usize) -> std::io::Result<Vec<String>> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(MAX_TAIL_BYTES);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);

    let mut lines: Vec<&str> = text.lines().collect();
    if start > 0 && !lines.is_empty() {
        // First line is probably cut in half.
        lines.remove(0);
    }
    let skip = lines.len().saturating_sub(n);
    Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
}

/// Expand glob patterns into existing files, in pattern order.
pub fn resolve_logs(patterns: &[String]) -> Vec<std::path::PathBuf> {
    let mut paths = Vec::new();
    for pattern in patterns {
        match glob::glob(pattern) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    if entry.is_file() && !paths.contains(&entry) {
                        paths.push(entry);
                    }
                }
            }
            Err(e) => tracing::warn!(pattern, error = %e, "invalid log glob pattern"),
        }
    }
    paths
}

/// Tail every log matched by `patterns`, concatenated. Unreadable files are skipped.
pub fn tail_logs(patterns: &[String], n: usize) -> Vec<String> {
    let mut all = Vec::new();
    for path in resolve_logs(patterns) {
        match tail_lines(&path, n) {
            Ok(lines) => all.extend(lines),
            Err(e) => tracing::debug!(path = %path.display(), error = %e, "failed to tail log"),
        }
    }
    all
}
