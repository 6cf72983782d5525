//! RawWriter half of C8: an append-only `raw.jsonl` transcript of the
//! literal provider traffic, one JSON object per line.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

use crate::error::Result;
use crate::fs_guard;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum RawEntry {
    Request { timestamp: f64, body: serde_json::Value },
    Response { timestamp: f64, body: serde_json::Value },
    StreamChunk { timestamp: f64, chunk: serde_json::Value },
    StreamComplete {
        timestamp: f64,
        event_count: u64,
        content_length: u64,
        tool_call_count: u64,
        received_done: bool,
        finish_reason: Option<String>,
        http_status: Option<u16>,
        duration_ms: u64,
    },
}

pub struct RawWriter {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl RawWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs_guard::open_append_no_symlink(&path)?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_entry(&self, entry: &RawEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        let mut file = self.file.lock().unwrap();
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RawWriter::open(dir.path().join("raw.jsonl")).unwrap();

        writer
            .write_entry(&RawEntry::Request { timestamp: 1.0, body: serde_json::json!({"model": "x"}) })
            .unwrap();
        writer
            .write_entry(&RawEntry::StreamComplete {
                timestamp: 2.0,
                event_count: 5,
                content_length: 42,
                tool_call_count: 1,
                received_done: true,
                finish_reason: Some("stop".into()),
                http_status: Some(200),
                duration_ms: 123,
            })
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("raw.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "request");

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["type"], "stream_complete");
        assert_eq!(second["received_done"], true);
    }

    #[test]
    fn refuses_to_follow_a_symlinked_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real.jsonl");
        std::fs::write(&target, b"").unwrap();
        let link = dir.path().join("raw.jsonl");
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&target, &link).unwrap();
            let err = RawWriter::open(&link).unwrap_err();
            assert!(matches!(err, crate::error::SessionError::Symlink(_)));
        }
    }
}
