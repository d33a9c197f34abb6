//! Records the most recent gcode line and a running count, optionally
//! capturing every line to CSV batches per print job.

use crate::config::GcodeTrackerConfig;
use async_trait::async_trait;
use ino_shared::StatusObject;
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const NO_PRINT_ID: &str = "NO_ID_KLIPPER";
const PRINT_START: &str = "SDCARD_PRINT_FILE";

#[derive(Debug)]
struct TrackerState {
    last_line: Option<String>,
    count: u64,
    print_id: String,
    batch: Vec<String>,
    batch_counter: u32,
}

#[derive(Debug)]
pub struct GcodeTracker {
    output_dir: Option<PathBuf>,
    batch_size: usize,
    state: Mutex<TrackerState>,
}

impl GcodeTracker {
    pub fn new(config: &GcodeTrackerConfig) -> Self {
        if let Some(dir) = &config.output_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                tracing::error!("gcode_tracker: cannot create {}: {}", dir.display(), e);
            }
        }
        Self {
            output_dir: config.output_dir.clone(),
            batch_size: config.batch_size.max(1),
            state: Mutex::new(TrackerState {
                last_line: None,
                count: 0,
                print_id: NO_PRINT_ID.to_string(),
                batch: Vec::new(),
                batch_counter: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Note one dispatched line.
    pub fn record(&self, line: &str, eventtime: f64) {
        let mut state = self.lock();
        if let Some(file) = print_file(line) {
            self.write_batch(&mut state);
            state.print_id = format!("{}_{}", file, uuid::Uuid::new_v4());
            state.batch_counter = 0;
            tracing::info!("gcode_tracker: new print job {}", state.print_id);
        }
        state.count += 1;
        state.last_line = Some(line.to_string());
        if self.output_dir.is_some() {
            let entry = format!("{},{},{}\n", state.count, eventtime, line);
            state.batch.push(entry);
            if state.batch.len() >= self.batch_size {
                self.write_batch(&mut state);
            }
        }
    }

    /// Write out whatever is buffered, e.g. on shutdown.
    pub fn flush(&self) {
        let mut state = self.lock();
        self.write_batch(&mut state);
    }

    fn write_batch(&self, state: &mut TrackerState) {
        let Some(dir) = &self.output_dir else {
            return;
        };
        if state.batch.is_empty() {
            return;
        }
        let path = dir.join(format!("{}_gcode_{}.csv", state.print_id, state.batch_counter));
        match append_lines(&path, &state.batch) {
            Ok(()) => tracing::debug!("gcode_tracker: wrote {} lines to {}", state.batch.len(), path.display()),
            Err(e) => tracing::error!("gcode_tracker: writing {} failed: {}", path.display(), e),
        }
        state.batch.clear();
        state.batch_counter += 1;
    }

    pub fn count(&self) -> u64 {
        self.lock().count
    }

    pub fn current_line(&self) -> Option<String> {
        self.lock().last_line.clone()
    }

    pub fn print_id(&self) -> String {
        self.lock().print_id.clone()
    }
}

fn append_lines(path: &Path, lines: &[String]) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for line in lines {
        file.write_all(line.as_bytes())?;
    }
    file.flush()
}

/// File name of a print start command, quotes removed.
fn print_file(line: &str) -> Option<String> {
    let line = line.trim();
    if !line.to_ascii_uppercase().starts_with(PRINT_START) {
        return None;
    }
    let (_, rest) = line.split_once("FILENAME=")?;
    let name = rest.trim().trim_matches('"');
    // Only the base name goes into capture file names.
    let name = name.rsplit('/').next().unwrap_or(name);
    (!name.is_empty()).then(|| name.to_string())
}

#[async_trait]
impl StatusObject for GcodeTracker {
    async fn get_status(&self, eventtime: f64) -> serde_json::Value {
        let state = self.lock();
        json!({
            "eventtime": eventtime,
            "current_gcode_line": state.last_line,
            "current_gcode_line_count": state.count,
            "current_print_id": state.print_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_file_parsing() {
        assert_eq!(print_file("SDCARD_PRINT_FILE FILENAME=\"benchy.gcode\""), Some("benchy.gcode".to_string()));
        assert_eq!(print_file("G1 X10"), None);
        assert_eq!(print_file("SDCARD_PRINT_FILE"), None);
        assert_eq!(print_file("SDCARD_PRINT_FILE FILENAME=jobs/cube.gcode"), Some("cube.gcode".to_string()));
    }

    #[test]
    fn test_count_survives_new_print() {
        let tracker = GcodeTracker::new(&GcodeTrackerConfig::default());
        tracker.record("G28", 1.0);
        tracker.record("SDCARD_PRINT_FILE FILENAME=part.gcode", 2.0);
        tracker.record("G1 X1", 3.0);
        assert_eq!(tracker.count(), 3);
        assert_eq!(tracker.current_line().as_deref(), Some("G1 X1"));
        assert!(tracker.print_id().starts_with("part.gcode_"));
    }

    #[test]
    fn test_batches_written_per_print() {
        let dir = tempfile::tempdir().unwrap();
        let config = GcodeTrackerConfig {
            output_dir: Some(dir.path().to_path_buf()),
            batch_size: 2,
        };
        let tracker = GcodeTracker::new(&config);
        tracker.record("G28", 1.0);
        tracker.record("G1 X1", 1.5);
        tracker.record("M104 S200", 2.0);
        tracker.flush();

        let first = std::fs::read_to_string(dir.path().join("NO_ID_KLIPPER_gcode_0.csv")).unwrap();
        assert_eq!(first, "1,1,G28\n2,1.5,G1 X1\n");
        let second = std::fs::read_to_string(dir.path().join("NO_ID_KLIPPER_gcode_1.csv")).unwrap();
        assert_eq!(second, "3,2,M104 S200\n");
    }
}
