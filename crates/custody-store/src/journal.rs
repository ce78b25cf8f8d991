//! Append-only audit journal in JSON Lines format.
//!
//! One file per chain per day (`journal_{chain}_{date}.jsonl`), opened in
//! append mode. Each line is a complete JSON object, so an interrupted write
//! only damages the last line.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use custody_core::{BlockNumber, ManualIntervention, OrderId, OrderKind, OrderStatus};

use crate::error::StoreResult;

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEntry {
    Transition {
        at: DateTime<Utc>,
        order_id: OrderId,
        kind: OrderKind,
        from: Option<OrderStatus>,
        to: OrderStatus,
        bn: Option<BlockNumber>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        txid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    Intervention(ManualIntervention),
    Rollback {
        at: DateTime<Utc>,
        height: BlockNumber,
        orders: Vec<OrderId>,
    },
}

struct ActiveFile {
    writer: BufWriter<File>,
    date: String,
    records_written: usize,
}

/// Buffered JSON Lines writer for [`JournalEntry`] values.
pub struct JournalWriter {
    base_dir: PathBuf,
    chain: String,
    buffer: Vec<JournalEntry>,
    max_buffer_size: usize,
    active: Option<ActiveFile>,
}

impl JournalWriter {
    /// Create a writer; the directory is created on first use.
    pub fn new(base_dir: impl Into<PathBuf>, chain: impl Into<String>, max_buffer_size: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            chain: chain.into(),
            buffer: Vec::with_capacity(max_buffer_size),
            max_buffer_size: max_buffer_size.max(1),
            active: None,
        }
    }

    pub fn append(&mut self, entry: JournalEntry) -> StoreResult<()> {
        self.buffer.push(entry);
        if self.buffer.len() >= self.max_buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Path of the file for `date` (`YYYY-MM-DD`).
    pub fn path_for(&self, date: &str) -> PathBuf {
        self.base_dir
            .join(format!("journal_{}_{}.jsonl", self.chain, date))
    }

    fn open(&mut self, date: &str) -> StoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        let path = self.path_for(date);
        info!(path = %path.display(), "Opening journal (append mode)");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.active = Some(ActiveFile {
            writer: BufWriter::new(file),
            date: date.to_string(),
            records_written: 0,
        });
        Ok(())
    }

    fn close_active(&mut self) {
        if let Some(mut active) = self.active.take() {
            if let Err(e) = active.writer.flush() {
                warn!(?e, "Failed to flush journal on close");
            }
            info!(
                chain = %self.chain,
                date = %active.date,
                records = active.records_written,
                "Closed journal"
            );
        }
    }

    /// Write buffered entries, rotating at the date boundary.
    pub fn flush(&mut self) -> StoreResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if self.active.as_ref().is_some_and(|a| a.date != today) {
            self.close_active();
        }
        if self.active.is_none() {
            self.open(&today)?;
        }

        let count = self.buffer.len();
        if let Some(active) = self.active.as_mut() {
            for entry in &self.buffer {
                let line = serde_json::to_string(entry)?;
                writeln!(active.writer, "{line}")?;
            }
            active.writer.flush()?;
            active.records_written += count;
        }
        debug!(chain = %self.chain, records = count, "Flushed journal");
        self.buffer.clear();
        Ok(())
    }

    pub fn close(&mut self) -> StoreResult<()> {
        self.flush()?;
        self.close_active();
        Ok(())
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(?e, "Failed to flush journal on drop");
        }
        self.close_active();
    }
}

impl std::fmt::Debug for JournalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalWriter")
            .field("base_dir", &self.base_dir)
            .field("chain", &self.chain)
            .field("pending", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_core::InterventionReason;
    use std::io::{BufRead, BufReader};
    use tempfile::TempDir;

    fn transition(id: u64) -> JournalEntry {
        JournalEntry::Transition {
            at: Utc::now(),
            order_id: OrderId(id),
            kind: OrderKind::Withdraw,
            from: Some(OrderStatus::Pending),
            to: OrderStatus::Broadcasting,
            bn: Some(100),
            txid: None,
            note: None,
        }
    }

    fn read_lines(path: &std::path::Path) -> Vec<JournalEntry> {
        let file = File::open(path).unwrap();
        BufReader::new(file)
            .lines()
            .map(|l| serde_json::from_str(&l.unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn test_append_flush_read_back() {
        let dir = TempDir::new().unwrap();
        let mut journal = JournalWriter::new(dir.path(), "eth", 100);
        journal.append(transition(1)).unwrap();
        journal
            .append(JournalEntry::Intervention(ManualIntervention::new(
                OrderId(1),
                InterventionReason::FailedCritical,
                "stuck",
            )))
            .unwrap();
        assert_eq!(journal.pending(), 2);
        journal.close().unwrap();

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let entries = read_lines(&journal.path_for(&today));
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[1], JournalEntry::Intervention(_)));
    }

    #[test]
    fn test_auto_flush_at_buffer_limit() {
        let dir = TempDir::new().unwrap();
        let mut journal = JournalWriter::new(dir.path(), "btc", 2);
        journal.append(transition(1)).unwrap();
        assert_eq!(journal.pending(), 1);
        journal.append(transition(2)).unwrap();
        assert_eq!(journal.pending(), 0);
    }

    #[test]
    fn test_append_mode_keeps_existing_lines() {
        let dir = TempDir::new().unwrap();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let mut journal = JournalWriter::new(dir.path(), "eth", 10);
            journal.append(transition(1)).unwrap();
        }
        let mut journal = JournalWriter::new(dir.path(), "eth", 10);
        journal.append(transition(2)).unwrap();
        journal.close().unwrap();
        assert_eq!(read_lines(&journal.path_for(&today)).len(), 2);
    }
}
