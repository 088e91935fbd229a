//! Append-only JSONL event sink.
//!
//! Every observable decision the node makes is written as one JSON object
//! per line to `node-<port>-<ts>-<nodeid>.jsonl`. Records always carry
//! `ts_ms`, `event`, and `node_id`; event-specific fields are merged in and
//! `null` values are dropped so absent data never appears as a key.
//!
//! The sink is shared (the peer table and the runtime both write through it)
//! and append-ordered: a single mutex serializes writes, each record is
//! flushed immediately so an external harness can tail the file live.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::clock;

pub struct EventLog {
    node_id: String,
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl EventLog {
    /// Create the log directory if needed and open a fresh event file.
    pub fn create(log_dir: &Path, port: u16, node_id: &str) -> std::io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let short_id = node_id.get(..8).unwrap_or(node_id);
        let filename = format!("node-{}-{}-{}.jsonl", port, clock::now_ms(), short_id);
        let path = log_dir.join(filename);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            node_id: node_id.to_string(),
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. `fields` must be a JSON object; entries whose
    /// value is `null` are skipped. Write failures are swallowed: the event
    /// sink must never take the runtime down.
    pub fn log(&self, event: &str, fields: Value) {
        let mut record = json!({
            "ts_ms": clock::now_ms(),
            "event": event,
            "node_id": self.node_id,
        });
        if let (Some(out), Value::Object(extra)) = (record.as_object_mut(), fields) {
            for (key, value) in extra {
                if !value.is_null() {
                    out.insert(key, value);
                }
            }
        }

        let Ok(mut guard) = self.file.lock() else {
            return;
        };
        if let Some(file) = guard.as_mut() {
            let mut line = record.to_string();
            line.push('\n');
            if file.write_all(line.as_bytes()).is_ok() {
                let _ = file.flush();
            }
        }
    }

    /// Flush and close the underlying file. Records logged afterwards are
    /// dropped. Idempotent.
    pub fn close(&self) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(mut file) = guard.take() {
                let _ = file.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn temp_log_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rumornet-events-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn read_lines(path: &Path) -> Vec<Value> {
        let mut text = String::new();
        File::open(path).unwrap().read_to_string(&mut text).unwrap();
        text.lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn records_carry_mandatory_keys() {
        let dir = temp_log_dir("mandatory");
        let log = EventLog::create(&dir, 5000, "aabbccdd-0000-0000-0000-000000000000").unwrap();
        log.log("node_listening", json!({ "peer": "127.0.0.1:5000" }));

        let records = read_lines(log.path());
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert!(rec["ts_ms"].is_i64());
        assert_eq!(rec["event"], "node_listening");
        assert_eq!(rec["node_id"], "aabbccdd-0000-0000-0000-000000000000");
        assert_eq!(rec["peer"], "127.0.0.1:5000");
    }

    #[test]
    fn null_fields_are_dropped() {
        let dir = temp_log_dir("nulls");
        let log = EventLog::create(&dir, 5001, "11223344-aaaa").unwrap();
        log.log(
            "peer_update",
            json!({ "peer": "127.0.0.1:6000", "peer_node_id": Value::Null }),
        );

        let records = read_lines(log.path());
        assert!(records[0].get("peer_node_id").is_none());
        assert_eq!(records[0]["peer"], "127.0.0.1:6000");
    }

    #[test]
    fn filename_embeds_port_and_short_node_id() {
        let dir = temp_log_dir("name");
        let log = EventLog::create(&dir, 7777, "deadbeef-1234-5678-9abc-def012345678").unwrap();
        let name = log.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("node-7777-"));
        assert!(name.ends_with("-deadbeef.jsonl"));
    }

    #[test]
    fn close_is_idempotent_and_silences_later_records() {
        let dir = temp_log_dir("close");
        let log = EventLog::create(&dir, 5002, "00000000-x").unwrap();
        log.log("node_listening", json!({}));
        log.close();
        log.close();
        log.log("node_shutdown", json!({}));
        assert_eq!(read_lines(log.path()).len(), 1);
    }
}
