use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Something the session did that is worth an audit line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityEvent {
    SessionStarted {
        threads: usize,
        images: usize,
        reset_keys: Vec<String>,
    },
    ThreadCreated {
        thread_id: String,
        character_id: i64,
    },
    ThreadRenamed {
        thread_id: String,
        name: String,
    },
    ThreadDeleted {
        thread_id: String,
    },
    MessageDispatched {
        thread_id: String,
        context_turns: usize,
        directive: Option<String>,
    },
    DispatchFailed {
        thread_id: String,
        error: String,
    },
    ImageGenerated {
        thread_id: Option<String>,
        prompt: String,
        url: String,
        created_at: i64,
    },
    ImageFailed {
        thread_id: Option<String>,
        prompt: String,
        error: String,
    },
    ImageDeleted {
        created_at: i64,
    },
    PortraitStored {
        character_id: i64,
        url: String,
    },
}

/// Append-only writer for `events.jsonl`.
///
/// Each line is one compact JSON object: the event fields plus
/// `session_id` and `ts`.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    inner: Arc<ActivityLogInner>,
}

#[derive(Debug)]
struct ActivityLogInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_session_id(path, Uuid::new_v4().to_string())
    }

    pub fn with_session_id(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ActivityLogInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn record(&self, event: &ActivityEvent) -> anyhow::Result<Value> {
        let mut row = match serde_json::to_value(event)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        row.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        row.insert("ts".to_string(), Value::String(now_utc_iso()));

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&row)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("activity log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(row))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::Value;

    use super::{ActivityEvent, ActivityLog};

    #[test]
    fn record_writes_tagged_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("events.jsonl");
        let log = ActivityLog::with_session_id(&path, "session-1");

        let written = log.record(&ActivityEvent::ThreadCreated {
            thread_id: "17".to_string(),
            character_id: 3,
        })?;

        let content = fs::read_to_string(&path)?;
        let parsed: Value = serde_json::from_str(content.lines().next().unwrap_or(""))?;
        assert_eq!(parsed, written);
        assert_eq!(parsed["type"], "thread_created");
        assert_eq!(parsed["thread_id"], "17");
        assert_eq!(parsed["character_id"], 3);
        assert_eq!(parsed["session_id"], "session-1");
        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn record_appends_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = ActivityLog::new(&path);

        log.record(&ActivityEvent::ImageDeleted { created_at: 1 })?;
        log.record(&ActivityEvent::ThreadDeleted {
            thread_id: "2".to_string(),
        })?;

        let content = fs::read_to_string(&path)?;
        let types: Vec<String> = content
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row["type"].as_str().map(str::to_string))
            .collect();
        assert_eq!(types, vec!["image_deleted", "thread_deleted"]);
        assert!(!log.session_id().is_empty());
        Ok(())
    }
}
