//! Access log in Apache combined format
//!
//! Every line also goes to the `mediaplanet::access` tracing target, so a
//! subscriber can collect it without a log file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::http::Request;

/// One finished audience session
#[derive(Debug, Clone)]
pub struct AccessEntry<'a> {
    pub ip: String,
    pub time: DateTime<Utc>,
    pub request: &'a Request,
    pub status: u16,
    /// `None` when the client never reached the sink
    pub bytes_sent: Option<u64>,
    pub connected: Option<Duration>,
}

impl AccessEntry<'_> {
    /// `ip - - [date] "METHOD URI PROTO" status bytes "referer" "agent" seconds`
    pub fn format(&self) -> String {
        format!(
            "{} - - [{}] \"{} {} {}\" {} {} \"{}\" \"{}\" {}",
            self.ip,
            self.time.format("%d/%b/%Y:%H:%M:%S %z"),
            self.request.method,
            self.request.uri,
            self.request.version,
            self.status,
            self.bytes_sent.map_or(-1, |b| b as i64),
            self.request.header("referer").unwrap_or("-"),
            self.request.header("user-agent").unwrap_or("-"),
            self.connected.map_or(-1, |d| d.as_secs() as i64),
        )
    }
}

pub struct AccessLog {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl AccessLog {
    /// Log to tracing only
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
        }
    }

    /// Append to `path` as well as to tracing
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = append(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            file: Mutex::new(Some(file)),
        })
    }

    pub fn write(&self, entry: &AccessEntry<'_>) {
        let line = entry.format();
        tracing::info!(target: "mediaplanet::access", "{}", line);

        let Ok(mut file) = self.file.lock() else {
            return;
        };
        if let Some(file) = file.as_mut() {
            if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
                tracing::warn!(error = %e, "Failed to write access log");
            }
        }
    }

    /// Close and reopen the log file under the same name
    ///
    /// Called after an external tool moved the old file away.
    pub fn rotate(&self) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let reopened = append(path)?;
        if let Ok(mut file) = self.file.lock() {
            *file = Some(reopened);
        }
        tracing::debug!(path = %path.display(), "Access log rotated");
        Ok(())
    }
}

fn append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request() -> Request {
        Request::parse(
            b"GET /live.ogg?token=x HTTP/1.1\r\nReferer: http://example.com/\r\nUser-Agent: vlc/3.0\r\n",
        )
        .unwrap()
    }

    #[test]
    fn test_combined_format() {
        let request = request();
        let entry = AccessEntry {
            ip: "192.168.1.20".into(),
            time: Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap(),
            request: &request,
            status: 200,
            bytes_sent: Some(123_456),
            connected: Some(Duration::from_millis(42_700)),
        };
        assert_eq!(
            entry.format(),
            "192.168.1.20 - - [05/Mar/2024:07:08:09 +0000] \"GET /live.ogg?token=x HTTP/1.1\" 200 123456 \"http://example.com/\" \"vlc/3.0\" 42"
        );
    }

    #[test]
    fn test_missing_fields() {
        let request = Request::parse(b"HEAD / HTTP/1.0\r\n").unwrap();
        let entry = AccessEntry {
            ip: "10.0.0.1".into(),
            time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            request: &request,
            status: 200,
            bytes_sent: None,
            connected: None,
        };
        assert!(entry.format().ends_with("200 -1 \"-\" \"-\" -1"));
    }

    #[test]
    fn test_file_and_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let log = AccessLog::open(&path).unwrap();
        let request = request();
        let entry = AccessEntry {
            ip: "10.0.0.2".into(),
            time: Utc::now(),
            request: &request,
            status: 200,
            bytes_sent: Some(1),
            connected: Some(Duration::from_secs(1)),
        };

        log.write(&entry);
        std::fs::rename(&path, dir.path().join("access.log.1")).unwrap();
        log.rotate().unwrap();
        log.write(&entry);

        let old = std::fs::read_to_string(dir.path().join("access.log.1")).unwrap();
        let new = std::fs::read_to_string(&path).unwrap();
        assert_eq!(old.lines().count(), 1);
        assert_eq!(new.lines().count(), 1);
        assert!(new.starts_with("10.0.0.2 - - ["));
    }
}
