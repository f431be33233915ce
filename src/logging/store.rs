use super::{LogFilter, LogLine};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lines kept in memory
const RING_CAPACITY: usize = 10_000;

/// Rotate `llmdock.log` to `llmdock.log.1` past this size
const ROTATE_BYTES: u64 = 5 * 1024 * 1024;

const LOG_FILE_NAME: &str = "llmdock.log";

/// JSONL sink with single-generation rotation
struct LogFile {
    path: PathBuf,
    file: Option<File>,
    written: u64,
}

impl LogFile {
    fn open(dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);
        let written = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            file: None,
            written,
        })
    }

    fn read_existing(&self) -> Vec<LogLine> {
        let Ok(file) = File::open(&self.path) else {
            return Vec::new();
        };
        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect()
    }

    fn append(&mut self, line: &LogLine) -> std::io::Result<()> {
        if self.written > ROTATE_BYTES {
            self.file = None;
            let rotated = self.path.with_extension("log.1");
            let _ = fs::remove_file(&rotated);
            fs::rename(&self.path, rotated)?;
            self.written = 0;
        }

        let file = match self.file.take() {
            Some(file) => file,
            None => OpenOptions::new().create(true).append(true).open(&self.path)?,
        };
        let file = self.file.insert(file);
        let mut json = serde_json::to_string(line)?;
        json.push('\n');
        file.write_all(json.as_bytes())?;
        self.written += json.len() as u64;
        Ok(())
    }
}

/// Operation log: bounded in-memory ring plus an optional JSONL file
pub struct LogManager {
    ring: RwLock<VecDeque<LogLine>>,
    file: Option<Mutex<LogFile>>,
    file_path: Option<PathBuf>,
}

impl LogManager {
    /// Persist under `logs_dir`, replaying whatever the file already holds.
    pub fn new(logs_dir: PathBuf) -> std::io::Result<Arc<Self>> {
        let file = LogFile::open(&logs_dir)?;
        let mut ring = VecDeque::with_capacity(1024);
        for line in file.read_existing() {
            push_bounded(&mut ring, line);
        }

        Ok(Arc::new(Self {
            ring: RwLock::new(ring),
            file_path: Some(file.path.clone()),
            file: Some(Mutex::new(file)),
        }))
    }

    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            ring: RwLock::new(VecDeque::with_capacity(1024)),
            file: None,
            file_path: None,
        })
    }

    pub fn log(&self, line: LogLine) {
        if let Some(file) = &self.file {
            if let Err(e) = file.lock().append(&line) {
                tracing::warn!("Failed to write log file: {}", e);
            }
        }
        push_bounded(&mut self.ring.write(), line);
    }

    /// Up to `max_lines` most recent matching lines, oldest first
    pub fn get_recent_logs(&self, max_lines: usize, filter: Option<&LogFilter>) -> Vec<LogLine> {
        let ring = self.ring.read();
        let mut lines: Vec<LogLine> = ring
            .iter()
            .rev()
            .filter(|line| filter.map_or(true, |f| f.matches(line)))
            .take(max_lines)
            .cloned()
            .collect();
        lines.reverse();
        lines
    }

    /// Empties the in-memory view only
    pub fn clear_view(&self) {
        self.ring.write().clear();
    }

    pub fn log_file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }
}

fn push_bounded(ring: &mut VecDeque<LogLine>, line: LogLine) {
    if ring.len() >= RING_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(line);
}
