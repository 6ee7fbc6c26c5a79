use super::{Event, EventKind};
use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct Inner {
    path: PathBuf,
    last_seq: u64,
    listener: Option<mpsc::UnboundedSender<Event>>,
}

/// Append-only writer for a run's `events.jsonl`.
///
/// Cheap to clone; clones share the sequence counter, so concurrent parallel
/// tasks each get a unique, gap-free sequence number. Appends also take an
/// exclusive file lock so a second process cannot interleave a line.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Mutex<Inner>>,
}

impl EventLog {
    /// Open (or create) the log, continuing after the last recorded sequence number.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let last_seq = read_events(path)?.last().map(|e| e.seq).unwrap_or(0);
        truncate_torn_line(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                path: path.to_path_buf(),
                last_seq,
                listener: None,
            })),
        })
    }

    /// Forward every appended event to `tx` (used by the terminal UI).
    pub fn with_listener(self, tx: mpsc::UnboundedSender<Event>) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.listener = Some(tx);
        }
        self
    }

    /// Append an event and return it with its assigned sequence number.
    pub fn emit(&self, kind: EventKind, actor: &str, detail: Value) -> Result<Event> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("Event log lock poisoned"))?;

        let event = Event {
            seq: inner.last_seq + 1,
            timestamp: Utc::now(),
            kind,
            actor: actor.to_string(),
            detail,
        };
        let mut line = serde_json::to_string(&event).context("Failed to serialize event")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&inner.path)
            .with_context(|| format!("Failed to open event log {}", inner.path.display()))?;
        file.lock_exclusive().context("Failed to lock event log")?;
        let written = file.write_all(line.as_bytes()).and_then(|_| file.flush());
        let _ = FileExt::unlock(&file);
        written.context("Failed to append event")?;

        inner.last_seq = event.seq;
        tracing::debug!(seq = event.seq, kind = %event.kind, actor = %event.actor, "event");
        if let Some(ref tx) = inner.listener {
            let _ = tx.send(event.clone());
        }
        Ok(event)
    }

    /// Sequence number of the most recent event (0 when empty).
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().map(|i| i.last_seq).unwrap_or(0)
    }

    pub fn path(&self) -> PathBuf {
        self.inner
            .lock()
            .map(|i| i.path.clone())
            .unwrap_or_default()
    }
}

/// Drop a partial final line left by an interrupted append so the next
/// append starts on a fresh line.
fn truncate_torn_line(path: &Path) -> Result<()> {
    let Ok(bytes) = fs::read(path) else {
        return Ok(());
    };
    if bytes.is_empty() || bytes.ends_with(b"\n") {
        return Ok(());
    }
    let keep = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open event log {}", path.display()))?;
    file.set_len(keep as u64)
        .context("Failed to truncate torn event line")?;
    Ok(())
}

/// Read all events from a log file. A missing file is an empty log.
///
/// A torn final line (a crash mid-append) is ignored; corruption anywhere
/// else is an error.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    read_events_after(path, 0)
}

/// Read events with `seq > after`.
pub fn read_events_after(path: &Path, after: u64) -> Result<Vec<Event>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open event log {}", path.display()))?;
    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<_>>()
        .context("Failed to read event log")?;

    let mut events = Vec::new();
    let count = lines.len();
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(event) if event.seq > after => events.push(event),
            Ok(_) => {}
            Err(_) if i + 1 == count => {
                tracing::warn!(path = %path.display(), "ignoring torn final event line");
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Corrupt event at line {} of {}", i + 1, path.display())
                });
            }
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::is_gap_free;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup_log() -> (EventLog, TempDir) {
        let dir = TempDir::new().unwrap();
        let log = EventLog::open(&dir.path().join("run").join("events.jsonl")).unwrap();
        (log, dir)
    }

    #[test]
    fn test_emit_assigns_increasing_sequence() {
        let (log, _dir) = setup_log();
        let a = log.emit(EventKind::RunStarted, "engine", json!({})).unwrap();
        let b = log.emit(EventKind::PhaseStarted, "architect", json!({"phase": "architect"})).unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(log.last_seq(), 2);

        let events = read_events(&log.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].actor, "architect");
        assert!(is_gap_free(&events));
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let (log, _dir) = setup_log();
        log.emit(EventKind::RunStarted, "engine", json!({})).unwrap();
        log.emit(EventKind::RunPaused, "engine", json!({})).unwrap();

        let reopened = EventLog::open(&log.path()).unwrap();
        let e = reopened.emit(EventKind::RunResumed, "engine", json!({})).unwrap();
        assert_eq!(e.seq, 3);
        assert!(is_gap_free(&read_events(&log.path()).unwrap()));
    }

    #[test]
    fn test_clones_share_sequence_across_threads() {
        let (log, _dir) = setup_log();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        log.emit(EventKind::TaskCompleted, &format!("task-{}", i), json!({}))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let events = read_events(&log.path()).unwrap();
        assert_eq!(events.len(), 200);
        assert!(is_gap_free(&events));
    }

    #[test]
    fn test_read_after_offset() {
        let (log, _dir) = setup_log();
        for _ in 0..5 {
            log.emit(EventKind::DecisionRecorded, "engine", json!({})).unwrap();
        }
        let tail = read_events_after(&log.path(), 3).unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_events(&dir.path().join("none.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn test_torn_final_line_is_ignored() {
        let (log, _dir) = setup_log();
        log.emit(EventKind::RunStarted, "engine", json!({})).unwrap();
        let mut f = OpenOptions::new().append(true).open(log.path()).unwrap();
        f.write_all(b"{\"seq\": 2, \"timest").unwrap();

        let events = read_events(&log.path()).unwrap();
        assert_eq!(events.len(), 1);

        let reopened = EventLog::open(&log.path()).unwrap();
        let e = reopened.emit(EventKind::RunResumed, "engine", json!({})).unwrap();
        assert_eq!(e.seq, 2);
        assert!(is_gap_free(&read_events(&log.path()).unwrap()));
    }

    #[test]
    fn test_corrupt_middle_line_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        fs::write(&path, "garbage\n{}\n").unwrap();
        assert!(read_events(&path).is_err());
    }

    #[tokio::test]
    async fn test_listener_receives_events() {
        let (log, _dir) = setup_log();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let log = log.with_listener(tx);
        log.emit(EventKind::RunStarted, "engine", json!({"objective": "x"})).unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, EventKind::RunStarted);
        assert_eq!(received.seq, 1);
    }
}
