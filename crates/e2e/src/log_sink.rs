//! Per-test append-only log file

use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Origin of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Test,
    Frontend,
    Backend,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Test => "TEST",
            LogSource::Frontend => "FRONTEND",
            LogSource::Backend => "BACKEND",
        }
    }
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to one test's log file.
///
/// Cloning is cheap and every clone appends to the same file. Writes never
/// fail the caller: I/O errors are dropped, and a sink whose file could not
/// be opened silently discards records.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl LogSink {
    /// Open (or create) `<log_dir>/<sanitized test name>.log`
    pub fn for_test(log_dir: &Path, test_name: &str) -> Self {
        let path = log_dir.join(format!("{}.log", sanitize_test_name(test_name)));
        let _ = std::fs::create_dir_all(log_dir);
        let file = OpenOptions::new().create(true).append(true).open(&path).ok();
        if file.is_none() {
            tracing::warn!(path = %path.display(), "Could not open test log file");
        }
        Self {
            inner: Arc::new(SinkInner {
                path: Some(path),
                file: Mutex::new(file),
            }),
        }
    }

    /// A sink that discards everything
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(SinkInner {
                path: None,
                file: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Append `[ISO8601] [SOURCE] message`
    pub fn log(&self, source: LogSource, message: impl AsRef<str>) {
        let mut guard = self.inner.file.lock();
        if let Some(file) = guard.as_mut() {
            let line = format_record(
                &chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                source,
                message.as_ref(),
            );
            let _ = file.write_all(line.as_bytes());
        }
    }

    pub fn test(&self, message: impl AsRef<str>) {
        self.log(LogSource::Test, message)
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink").field("path", &self.inner.path).finish()
    }
}

fn format_record(timestamp: &str, source: LogSource, message: &str) -> String {
    format!("[{}] [{}] {}\n", timestamp, source, message.trim_end())
}

/// Turn a test name into a safe file stem: `module::case name` -> `module-case_name`
pub fn sanitize_test_name(name: &str) -> String {
    let name = name.replace("::", "-");
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_matches('.').to_string();
    if sanitized.is_empty() {
        "unlabeled_test".to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("login::rejects bad password", "login-rejects_bad_password")]
    #[test_case("a/b\\c", "a_b_c")]
    #[test_case("..", "unlabeled_test")]
    #[test_case("", "unlabeled_test")]
    fn test_sanitize_test_name(input: &str, expected: &str) {
        assert_eq!(sanitize_test_name(input), expected);
    }

    #[test]
    fn test_record_format() {
        let line = format_record("2024-01-01T00:00:00.000Z", LogSource::Backend, "listening\n");
        assert_eq!(line, "[2024-01-01T00:00:00.000Z] [BACKEND] listening\n");
    }

    #[test]
    fn test_appends_lines_per_test() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::for_test(dir.path(), "suite::case one");
        sink.test("setup");
        sink.clone().log(LogSource::Frontend, "vite ready");

        let path = dir.path().join("suite-case_one.log");
        assert_eq!(sink.path(), Some(path.as_path()));
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[TEST] setup"));
        assert!(lines[1].ends_with("[FRONTEND] vite ready"));
    }

    #[test]
    fn test_unwritable_dir_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        // A regular file where the directory should be
        let sink = LogSink::for_test(&blocker, "case");
        sink.test("dropped");
        LogSink::disabled().test("dropped too");
    }
}
