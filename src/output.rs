//! Output formatting and persistence for poll results.
//!
//! Supports pretty-printing, JSON serialization, and CSV append.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use serde::Serialize;
use tracing::{debug, info};

use crate::snapshot::BusSnapshot;
use crate::store::{BusId, LineId, RouteId, StopId};

/// Logs any value using Rust's debug pretty-print format.
pub fn print_pretty<T: std::fmt::Debug>(value: &T) {
    debug!("{:#?}", value);
}

/// Logs any value as pretty-printed JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// One bus from one poll cycle, flattened for CSV.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusRecord {
    pub timestamp: DateTime<Utc>,
    pub bus: BusId,
    pub line: Option<LineId>,
    pub route: Option<RouteId>,
    pub state: i64,
    pub last_stop: Option<StopId>,
    pub route_progress: Option<f64>,
    pub time: Option<String>,
    pub distance: Option<u32>,
}

impl BusRecord {
    pub fn new(timestamp: DateTime<Utc>, snapshot: &BusSnapshot) -> Self {
        Self {
            timestamp,
            bus: snapshot.id,
            line: snapshot.line,
            route: snapshot.route,
            state: snapshot.state.code(),
            last_stop: snapshot.last_stop,
            route_progress: snapshot.route_progress,
            time: snapshot.time.map(|t| t.to_string()),
            distance: snapshot.distance,
        }
    }
}

/// Appends every record as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_records<T: Serialize>(path: &str, records: &[T]) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, rows = records.len(), "Appending CSV records");

    if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;

    Ok(())
}

pub fn append_record<T: Serialize>(path: &str, record: &T) -> Result<()> {
    append_records(path, std::slice::from_ref(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{BusState, Eta};
    use crate::stats::PollStats;
    use crate::store::Bus;
    use std::env;
    use std::fs;

    fn temp_path(name: &str) -> String {
        format!("{}/{}", env::temp_dir().display(), name)
    }

    fn snapshot() -> BusSnapshot {
        let bus = Bus { id: 3425, line: Some(1800), route: Some(18000001) };
        let mut snapshot = BusSnapshot::of(&bus, BusState::Moving);
        snapshot.time = Some(Eta::LessThanOneMinute);
        snapshot
    }

    #[test]
    fn test_print_pretty_does_not_panic() {
        print_pretty(&PollStats::default());
    }

    #[test]
    fn test_print_json_does_not_panic() {
        print_json(&snapshot()).unwrap();
    }

    #[test]
    fn test_bus_record_fields() {
        let record = BusRecord::new(Utc::now(), &snapshot());
        assert_eq!(record.bus, 3425);
        assert_eq!(record.state, 1);
        assert_eq!(record.time.as_deref(), Some("<1"));
        assert_eq!(record.distance, None);
    }

    #[test]
    fn test_append_record_creates_file() {
        let path = temp_path("itranvias_poller_test_create.csv");
        let _ = fs::remove_file(&path); // clean up any prior run

        append_record(&path, &PollStats::default()).unwrap();

        assert!(Path::new(&path).exists());
        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.is_empty());

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_append_record_writes_header_once() {
        let path = temp_path("itranvias_poller_test_header.csv");
        let _ = fs::remove_file(&path);

        let stats = PollStats::default();
        append_record(&path, &stats).unwrap();
        append_record(&path, &stats).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let header_count = content.lines().filter(|l| l.contains("timestamp")).count();
        assert_eq!(header_count, 1);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_append_records_bus_rows() {
        let path = temp_path("itranvias_poller_test_buses.csv");
        let _ = fs::remove_file(&path);

        let now = Utc::now();
        let rows = vec![BusRecord::new(now, &snapshot()), BusRecord::new(now, &snapshot())];
        append_records(&path, &rows).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        // 1 header + 2 data rows
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,bus,line,route"));
        assert!(lines[1].contains("<1"));

        fs::remove_file(&path).unwrap();
    }
}
