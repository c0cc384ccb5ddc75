//! Extraction pattern catalogue
//!
//! Recognises device-generated files on a managed volume and names them in
//! the archive:
//!
//! | Kind       | Where             | Archive name                                          |
//! |------------|-------------------|-------------------------------------------------------|
//! | Flight log | root, `DEMO/`     | `demo/YYYY-MM-DD_[flight-N_]<name>`                    |
//! | Snapshot   | root, `SNAP/`     | `snapshots/YYYY-MM-DD_HHMMSS_<name>` or `<name>`       |
//! | Logbook    | anywhere          | `logbook/<start>[_to_<end>]_logbook_<rows>entries.csv` |

use chrono::{DateTime, NaiveDate, Utc};
use efisync_core::{config::MediaConfig, domain::RecordPath};
use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::SyncError;

/// Header names that hold a logbook entry's date
const DATE_COLUMNS: &[&str] = &["date", "flight_date", "Date", "Flight Date"];

/// Accepted date formats, tried in order
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y", "%Y%m%d"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractKind {
    FlightLog,
    Snapshot,
    Logbook,
}

/// Date range and entry count read from a logbook CSV
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogbookSummary {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub rows: usize,
}

pub struct PatternCatalogue {
    flight_log: Regex,
    snap: Regex,
    screenshot: Regex,
    demo_dir: String,
    snapshot_dir: String,
    logbook_dir: String,
}

fn compile(pattern: &str) -> Result<Regex, SyncError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| SyncError::InvalidPattern(format!("{pattern}: {e}")))
}

fn parent_dir(path: &RecordPath) -> &str {
    path.as_str()
        .rsplit_once('/')
        .map_or("", |(parent, _)| parent)
}

fn extension_is(name: &str, ext: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(_, e)| e.eq_ignore_ascii_case(ext))
}

impl PatternCatalogue {
    pub fn new(config: &MediaConfig) -> Result<Self, SyncError> {
        Ok(Self {
            flight_log: compile(r"^DEMO-(\d{8})-(\d{6})(?:\+(\d+))?\.LOG$")?,
            snap: compile(r"^SNAP_(\d{8})_(\d{6})\.png$")?,
            screenshot: compile(
                r"^Screenshot_(\d{4})-(\d{2})-(\d{2})_(\d{2})-(\d{2})-(\d{2})\.png$",
            )?,
            demo_dir: config.demo_dir.clone(),
            snapshot_dir: config.snapshot_dir.clone(),
            logbook_dir: config.logbook_dir.clone(),
        })
    }

    /// Kind of a file at `path` (relative to the volume root), if any
    #[must_use]
    pub fn classify(&self, path: &RecordPath) -> Option<ExtractKind> {
        let name = path.file_name();
        let parent = parent_dir(path);
        if (parent.is_empty() || parent.eq_ignore_ascii_case("DEMO"))
            && self.flight_log.is_match(name)
        {
            return Some(ExtractKind::FlightLog);
        }
        if (parent.is_empty() || parent.eq_ignore_ascii_case("SNAP")) && extension_is(name, "png")
        {
            return Some(ExtractKind::Snapshot);
        }
        let lower = name.to_ascii_lowercase();
        if extension_is(name, "csv")
            && (lower.contains("logbook") || lower.contains("log") || lower.contains("flight"))
        {
            return Some(ExtractKind::Logbook);
        }
        None
    }

    /// Archive path of an extracted file
    ///
    /// `content` is only read for logbooks; `modified` stands in when a
    /// logbook has no usable date column.
    pub fn archive_name(
        &self,
        kind: ExtractKind,
        path: &RecordPath,
        content: Option<&str>,
        modified: DateTime<Utc>,
    ) -> Result<RecordPath, SyncError> {
        let name = path.file_name();
        let relative = match kind {
            ExtractKind::FlightLog => {
                let caps = self.flight_log.captures(name);
                let date = caps
                    .as_ref()
                    .and_then(|c| NaiveDate::parse_from_str(&c[1], "%Y%m%d").ok());
                let flight = caps
                    .as_ref()
                    .and_then(|c| c.get(3))
                    .map(|n| format!("flight-{}_", n.as_str()))
                    .unwrap_or_default();
                match date {
                    Some(date) => format!("{}/{}_{flight}{name}", self.demo_dir, date.format("%Y-%m-%d")),
                    None => format!("{}/{name}", self.demo_dir),
                }
            }
            ExtractKind::Snapshot => match self.snapshot_stamp(name) {
                Some((date, time)) => format!("{}/{date}_{time}_{name}", self.snapshot_dir),
                None => format!("{}/{name}", self.snapshot_dir),
            },
            ExtractKind::Logbook => {
                let summary = logbook_summary(content.unwrap_or_default());
                let fallback = modified.date_naive();
                let start = summary.start.unwrap_or(fallback);
                let end = summary.end.unwrap_or(start);
                let range = if end > start {
                    format!("{}_to_{}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d"))
                } else {
                    start.format("%Y-%m-%d").to_string()
                };
                format!(
                    "{}/{range}_logbook_{}entries.csv",
                    self.logbook_dir, summary.rows
                )
            }
        };
        Ok(RecordPath::new(relative)?)
    }

    /// `(YYYY-MM-DD, HHMMSS)` from a snapshot name
    fn snapshot_stamp(&self, name: &str) -> Option<(String, String)> {
        if let Some(c) = self.snap.captures(name) {
            let date = NaiveDate::parse_from_str(&c[1], "%Y%m%d").ok()?;
            return Some((date.format("%Y-%m-%d").to_string(), c[2].to_string()));
        }
        let c = self.screenshot.captures(name)?;
        let date = NaiveDate::parse_from_str(&format!("{}-{}-{}", &c[1], &c[2], &c[3]), "%Y-%m-%d")
            .ok()?;
        Some((
            date.format("%Y-%m-%d").to_string(),
            format!("{}{}{}", &c[4], &c[5], &c[6]),
        ))
    }
}

/// `path` with `-n` inserted before its extension
pub fn suffixed(path: &RecordPath, n: u32) -> Result<RecordPath, SyncError> {
    let raw = path.as_str();
    let name_start = raw.rfind('/').map_or(0, |i| i + 1);
    let renamed = match raw[name_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let dot = name_start + dot;
            format!("{}-{n}{}", &raw[..dot], &raw[dot..])
        }
        _ => format!("{raw}-{n}"),
    };
    Ok(RecordPath::new(renamed)?)
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

/// Date range and data-row count of a logbook CSV
///
/// The date column is found by header name; rows with a missing or
/// unparseable date still count as entries.
#[must_use]
pub fn logbook_summary(content: &str) -> LogbookSummary {
    let mut summary = LogbookSummary {
        start: None,
        end: None,
        rows: 0,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());
    let column = match reader.headers() {
        Ok(headers) => headers.iter().position(|h| DATE_COLUMNS.contains(&h)),
        Err(e) => {
            debug!(error = %e, "Unreadable logbook header");
            return summary;
        }
    };

    for row in reader.records() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                debug!(error = %e, "Skipping malformed logbook row");
                continue;
            }
        };
        summary.rows += 1;
        let Some(date) = column.and_then(|i| row.get(i)).and_then(parse_date) else {
            continue;
        };
        summary.start = Some(summary.start.map_or(date, |s| s.min(date)));
        summary.end = Some(summary.end.map_or(date, |e| e.max(date)));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn catalogue() -> PatternCatalogue {
        PatternCatalogue::new(&MediaConfig::default()).unwrap()
    }

    fn rp(s: &str) -> RecordPath {
        RecordPath::new(s).unwrap()
    }

    fn modified() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_classify() {
        let c = catalogue();
        assert_eq!(c.classify(&rp("DEMO-20240101-101500.LOG")), Some(ExtractKind::FlightLog));
        assert_eq!(c.classify(&rp("DEMO/demo-20240101-101500+2.log")), Some(ExtractKind::FlightLog));
        assert_eq!(c.classify(&rp("other/DEMO-20240101-101500.LOG")), None);
        assert_eq!(c.classify(&rp("SNAP/shot.PNG")), Some(ExtractKind::Snapshot));
        assert_eq!(c.classify(&rp("deep/shot.png")), None);
        assert_eq!(c.classify(&rp("exports/MyLogbook.csv")), Some(ExtractKind::Logbook));
        assert_eq!(c.classify(&rp("flights.csv")), Some(ExtractKind::Logbook));
        assert_eq!(c.classify(&rp("prices.csv")), None);
        assert_eq!(c.classify(&rp("notes.txt")), None);
        assert_eq!(c.classify(&rp("NAV.DB")), None);
    }

    #[test]
    fn test_flight_log_names() {
        let c = catalogue();
        let plain = c
            .archive_name(ExtractKind::FlightLog, &rp("DEMO/DEMO-20240101-101500.LOG"), None, modified())
            .unwrap();
        assert_eq!(plain.as_str(), "demo/2024-01-01_DEMO-20240101-101500.LOG");

        let numbered = c
            .archive_name(ExtractKind::FlightLog, &rp("DEMO-20240102-090000+3.LOG"), None, modified())
            .unwrap();
        assert_eq!(numbered.as_str(), "demo/2024-01-02_flight-3_DEMO-20240102-090000+3.LOG");
    }

    #[test]
    fn test_snapshot_names() {
        let c = catalogue();
        let snap = c
            .archive_name(ExtractKind::Snapshot, &rp("SNAP/SNAP_20240105_142233.png"), None, modified())
            .unwrap();
        assert_eq!(snap.as_str(), "snapshots/2024-01-05_142233_SNAP_20240105_142233.png");

        let shot = c
            .archive_name(
                ExtractKind::Snapshot,
                &rp("Screenshot_2024-02-10_07-05-01.png"),
                None,
                modified(),
            )
            .unwrap();
        assert_eq!(shot.as_str(), "snapshots/2024-02-10_070501_Screenshot_2024-02-10_07-05-01.png");

        let other = c
            .archive_name(ExtractKind::Snapshot, &rp("SNAP/panel.png"), None, modified())
            .unwrap();
        assert_eq!(other.as_str(), "snapshots/panel.png");
    }

    #[test]
    fn test_logbook_summary_and_name() {
        let csv = "Flight Date,From,To\n2024-01-03,KPAO,KSQL\n01/05/2024,KSQL,KPAO\n\n2024-01-04,KPAO,KHAF\n";
        let summary = logbook_summary(csv);
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.start, NaiveDate::from_ymd_opt(2024, 1, 3));
        assert_eq!(summary.end, NaiveDate::from_ymd_opt(2024, 1, 5));

        let name = catalogue()
            .archive_name(ExtractKind::Logbook, &rp("logbook.csv"), Some(csv), modified())
            .unwrap();
        assert_eq!(name.as_str(), "logbook/2024-01-03_to_2024-01-05_logbook_3entries.csv");
    }

    #[test]
    fn test_logbook_quoted_fields_keep_columns() {
        let csv = "Pilot,Flight Date,Hours\n\"Doe, Jane\",2024-01-03,1.2\n\"Roe, Rick\",\"2024-01-07\",0.8\n";
        let summary = logbook_summary(csv);
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.start, NaiveDate::from_ymd_opt(2024, 1, 3));
        assert_eq!(summary.end, NaiveDate::from_ymd_opt(2024, 1, 7));
    }

    #[test]
    fn test_logbook_empty_content() {
        let summary = logbook_summary("");
        assert_eq!(summary.rows, 0);
        assert!(summary.start.is_none());
    }

    #[test]
    fn test_logbook_without_dates_uses_modified() {
        let csv = "aircraft,hours\nN123,1.2\n";
        let name = catalogue()
            .archive_name(ExtractKind::Logbook, &rp("flight_log.csv"), Some(csv), modified())
            .unwrap();
        assert_eq!(name.as_str(), "logbook/2024-03-09_logbook_1entries.csv");
    }

    #[test]
    fn test_suffixed() {
        assert_eq!(suffixed(&rp("demo/a.LOG"), 1).unwrap().as_str(), "demo/a-1.LOG");
        assert_eq!(suffixed(&rp("demo/README"), 2).unwrap().as_str(), "demo/README-2");
        assert_eq!(suffixed(&rp("x.tar.gz"), 1).unwrap().as_str(), "x.tar-1.gz");
    }
}
