//! Per-stage training log - append-only `train.log` in the stage directory

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const STAGE_LOG_FILE: &str = "train.log";

/// Timestamped line sink for one stage. Every line is flushed as written.
pub struct StageLog {
    file: File,
    path: PathBuf,
    lines: usize,
}

impl StageLog {
    /// Opens (or creates) `dir/train.log` for appending.
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(STAGE_LOG_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file,
            path,
            lines: 0,
        })
    }

    pub fn line(&mut self, text: impl AsRef<str>) -> io::Result<()> {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(self.file, "[{}] {}", stamp, text.as_ref().trim_end())?;
        self.file.flush()?;
        self.lines += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines written through this handle.
    pub fn lines_written(&self) -> usize {
        self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let stage_dir = dir.path().join("stage_01_6l");
        {
            let mut log = StageLog::open(&stage_dir).unwrap();
            log.line("first\n").unwrap();
            assert_eq!(log.lines_written(), 1);
        }
        let mut log = StageLog::open(&stage_dir).unwrap();
        log.line("second").unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] first"));
        assert!(lines[1].ends_with("] second"));
        assert!(lines[0].starts_with('['));
    }
}
