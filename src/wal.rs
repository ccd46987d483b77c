// =============================================================================
// Write-Ahead Log — durability backstop for the order queue
// =============================================================================
//
// Append-only JSON-lines file: `ENQUEUE` records are fsync'd before the order
// becomes visible in memory; `COMPLETE` records are best-effort (a duplicate
// replay on crash recovery is harmless — `mark_complete` is idempotent from
// the recovery reader's point of view). Compaction rewrites only the
// still-pending `ENQUEUE` records to a `.tmp` file and renames it over the
// WAL atomically.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::order::Order;
use crate::error::EngineError;

/// Trigger compaction once completed-but-not-yet-compacted records exceed
/// this count.
pub const COMPACTION_THRESHOLD: usize = 10;

/// Bare order-id wrapper — `COMPLETE` records nest just the id under `order`
/// rather than the full order the `ENQUEUE` record carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderIdRef {
    id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
enum WalRecord {
    #[serde(rename = "ENQUEUE")]
    Enqueue { order: Order, timestamp: DateTime<Utc> },
    #[serde(rename = "COMPLETE")]
    Complete { order: OrderIdRef, timestamp: DateTime<Utc> },
}

pub struct RecoveryResult {
    pub pending: Vec<Order>,
    pub completed_count: usize,
}

/// The WAL file is owned by a single writer serialized behind this mutex;
/// readers only exist during `recover`, before concurrent writes begin.
pub struct Wal {
    path: PathBuf,
    file: Mutex<File>,
}

impl Wal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::WalWriteFailed {
                reason: format!("failed to open WAL file {}: {e}", path.display()),
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn append_enqueue(&self, order: &Order) -> Result<(), EngineError> {
        let record = WalRecord::Enqueue {
            order: order.clone(),
            timestamp: Utc::now(),
        };
        self.append_and_fsync(&record)
    }

    /// No fsync required — a duplicate `COMPLETE` replay on crash is
    /// acceptable; the recovery reader treats `completed` as a set.
    pub fn append_complete(&self, order_id: &str) -> Result<(), EngineError> {
        let record = WalRecord::Complete {
            order: OrderIdRef { id: order_id.to_string() },
            timestamp: Utc::now(),
        };
        let line = serde_json::to_string(&record).map_err(|e| EngineError::WalWriteFailed {
            reason: format!("serialize COMPLETE record failed: {e}"),
        })?;

        let mut file = self.file.lock().expect("WAL mutex poisoned");
        writeln!(file, "{line}").map_err(|e| EngineError::WalWriteFailed {
            reason: format!("append COMPLETE failed: {e}"),
        })?;
        Ok(())
    }

    fn append_and_fsync(&self, record: &WalRecord) -> Result<(), EngineError> {
        let line = serde_json::to_string(record).map_err(|e| EngineError::WalWriteFailed {
            reason: format!("serialize ENQUEUE record failed: {e}"),
        })?;

        let mut file = self.file.lock().expect("WAL mutex poisoned");
        writeln!(file, "{line}").map_err(|e| EngineError::WalWriteFailed {
            reason: format!("append ENQUEUE failed: {e}"),
        })?;
        file.sync_data().map_err(|e| EngineError::WalWriteFailed {
            reason: format!("fsync ENQUEUE failed: {e}"),
        })?;
        Ok(())
    }

    /// Stream the WAL line-by-line, building `enqueued \ completed`. Parse
    /// errors on individual lines are logged and skipped rather than
    /// aborting recovery. Triggers compaction if warranted.
    pub fn recover(&self) -> Result<RecoveryResult, EngineError> {
        let read_file = File::open(&self.path).map_err(|e| EngineError::WalWriteFailed {
            reason: format!("failed to open WAL for recovery: {e}"),
        })?;
        let reader = BufReader::new(read_file);

        let mut enqueued: HashMap<String, Order> = HashMap::new();
        let mut completed: HashSet<String> = HashSet::new();
        let mut any_record = false;

        for (lineno, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!(lineno, error = %e, "WAL recovery: failed to read line");
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WalRecord>(&line) {
                Ok(WalRecord::Enqueue { order, .. }) => {
                    enqueued.insert(order.order_id.clone(), order);
                    any_record = true;
                }
                Ok(WalRecord::Complete { order, .. }) => {
                    completed.insert(order.id);
                    any_record = true;
                }
                Err(e) => {
                    warn!(lineno, error = %e, "WAL recovery: skipping unparsable line");
                }
            }
        }

        let pending: Vec<Order> = enqueued
            .iter()
            .filter(|(id, _)| !completed.contains(*id))
            .map(|(_, order)| order.clone())
            .collect();

        if completed.len() > COMPACTION_THRESHOLD || any_record {
            self.compact(&enqueued, &completed)?;
        }

        Ok(RecoveryResult {
            pending,
            completed_count: completed.len(),
        })
    }

    fn compact(
        &self,
        enqueued: &HashMap<String, Order>,
        completed: &HashSet<String>,
    ) -> Result<(), EngineError> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp_file = File::create(&tmp_path).map_err(|e| EngineError::WalWriteFailed {
                reason: format!("failed to create WAL compaction tmp file: {e}"),
            })?;

            for (order_id, order) in enqueued.iter() {
                if completed.contains(order_id) {
                    continue;
                }
                let record = WalRecord::Enqueue {
                    order: order.clone(),
                    timestamp: Utc::now(),
                };
                let line = serde_json::to_string(&record).map_err(|e| EngineError::WalWriteFailed {
                    reason: format!("serialize during compaction failed: {e}"),
                })?;
                writeln!(tmp_file, "{line}").map_err(|e| EngineError::WalWriteFailed {
                    reason: format!("write during compaction failed: {e}"),
                })?;
            }
            tmp_file.sync_data().map_err(|e| EngineError::WalWriteFailed {
                reason: format!("fsync compaction tmp file failed: {e}"),
            })?;
        }

        std::fs::rename(&tmp_path, &self.path).map_err(|e| EngineError::WalWriteFailed {
            reason: format!("atomic rename over WAL failed: {e}"),
        })?;

        // Re-open the append handle: the old fd now points at the renamed-
        // away file.
        let new_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| EngineError::WalWriteFailed {
                reason: format!("failed to reopen WAL after compaction: {e}"),
            })?;
        *self.file.lock().expect("WAL mutex poisoned") = new_file;

        info!(pending = enqueued.len().saturating_sub(completed.len()), "WAL compacted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketType, OrderType, Side};
    use tempfile_like::TempWalFile;

    /// Minimal temp-file helper; avoids pulling in `tempfile` just for this
    /// module's tests.
    mod tempfile_like {
        use std::path::PathBuf;

        pub struct TempWalFile {
            pub path: PathBuf,
        }

        impl TempWalFile {
            pub fn new(tag: &str) -> Self {
                let path = std::env::temp_dir().join(format!(
                    "nexus-wal-test-{tag}-{}.jsonl",
                    std::process::id()
                ));
                let _ = std::fs::remove_file(&path);
                Self { path }
            }
        }

        impl Drop for TempWalFile {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
                let _ = std::fs::remove_file(self.path.with_extension("tmp"));
            }
        }
    }

    fn sample_order() -> Order {
        Order::new("u1", "BTCUSDT", Side::Buy, OrderType::Market, 1.0, 100.0, MarketType::Spot)
    }

    #[test]
    fn enqueue_then_recover_returns_pending_order() {
        let tmp = TempWalFile::new("enqueue-recover");
        let wal = Wal::open(&tmp.path).unwrap();
        let order = sample_order();
        wal.append_enqueue(&order).unwrap();

        let result = wal.recover().unwrap();
        assert_eq!(result.pending.len(), 1);
        assert_eq!(result.pending[0].order_id, order.order_id);
    }

    #[test]
    fn completed_order_is_excluded_from_recovery() {
        let tmp = TempWalFile::new("completed-excluded");
        let wal = Wal::open(&tmp.path).unwrap();
        let order = sample_order();
        wal.append_enqueue(&order).unwrap();
        wal.append_complete(&order.order_id).unwrap();

        let result = wal.recover().unwrap();
        assert!(result.pending.is_empty());
        assert_eq!(result.completed_count, 1);
    }

    #[test]
    fn corrupt_line_is_skipped_not_fatal() {
        let tmp = TempWalFile::new("corrupt-line");
        let wal = Wal::open(&tmp.path).unwrap();
        let order = sample_order();
        wal.append_enqueue(&order).unwrap();

        {
            let mut file = OpenOptions::new().append(true).open(&tmp.path).unwrap();
            writeln!(file, "{{not valid json").unwrap();
        }

        let result = wal.recover().unwrap();
        assert_eq!(result.pending.len(), 1);
    }

    #[test]
    fn on_disk_schema_uses_action_and_nested_order() {
        let tmp = TempWalFile::new("schema");
        let wal = Wal::open(&tmp.path).unwrap();
        let order = sample_order();
        let order_id = order.order_id.clone();
        wal.append_enqueue(&order).unwrap();
        wal.append_complete(&order_id).unwrap();

        let contents = std::fs::read_to_string(&tmp.path).unwrap();
        let mut lines = contents.lines();

        let enqueue: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(enqueue["action"], "ENQUEUE");
        assert_eq!(enqueue["order"]["order_id"], order_id);
        assert!(enqueue["timestamp"].is_string());

        let complete: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(complete["action"], "COMPLETE");
        assert_eq!(complete["order"]["id"], order_id);
        assert!(complete["timestamp"].is_string());
    }

    #[test]
    fn recovery_compacts_when_any_record_present() {
        let tmp = TempWalFile::new("compaction");
        let wal = Wal::open(&tmp.path).unwrap();
        let order = sample_order();
        wal.append_enqueue(&order).unwrap();
        wal.append_complete(&order.order_id).unwrap();

        wal.recover().unwrap();

        let contents = std::fs::read_to_string(&tmp.path).unwrap();
        assert!(contents.trim().is_empty(), "compaction should drop the completed order");
    }
}
