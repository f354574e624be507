use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::info;

// ---------------------------------------------------------------------------
// LogRotation
// ---------------------------------------------------------------------------

/// Rotation policy for the project's `logs/` directory.
///
/// Applied on startup and after heavy turns: at most `max_files` log files,
/// at most `max_total_bytes` across them, nothing older than `max_age`.
#[derive(Debug, Clone)]
pub struct LogRotation {
    pub dir: PathBuf,
    pub max_files: usize,
    pub max_total_bytes: u64,
    pub max_age: Duration,
}

impl LogRotation {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_files: 10,
            max_total_bytes: 50 * 1024 * 1024,
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }

    /// Apply the policy. Returns the number of files deleted. A missing
    /// directory is not an error.
    pub fn rotate(&self) -> std::io::Result<usize> {
        let mut files = match collect_logs(&self.dir) {
            Ok(files) => files,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        // Oldest first so pruning walks FIFO.
        files.sort_by_key(|f| f.modified);

        let now = SystemTime::now();
        let mut removed = 0usize;

        // Age pass.
        files.retain(|f| {
            let expired = now
                .duration_since(f.modified)
                .map(|age| age > self.max_age)
                .unwrap_or(false);
            if expired && std::fs::remove_file(&f.path).is_ok() {
                removed += 1;
                false
            } else {
                true
            }
        });

        // Count pass.
        while files.len() > self.max_files {
            let victim = files.remove(0);
            if std::fs::remove_file(&victim.path).is_ok() {
                removed += 1;
            }
        }

        // Size pass.
        let mut total: u64 = files.iter().map(|f| f.size).sum();
        while total > self.max_total_bytes && !files.is_empty() {
            let victim = files.remove(0);
            if std::fs::remove_file(&victim.path).is_ok() {
                total -= victim.size;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, dir = %self.dir.display(), "rotated log files");
        }
        Ok(removed)
    }
}

struct LogFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

fn collect_logs(dir: &Path) -> std::io::Result<Vec<LogFile>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let meta = entry.metadata()?;
        out.push(LogFile {
            path,
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
