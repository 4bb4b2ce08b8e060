//! WorkItem queue
//!
//! Orchestrators share one queue. `get_next` and `acknowledge` may be called
//! concurrently from every orchestrator thread.

use crate::io::determine_remaining_files_to_process;
use batchgen_common::{BatchGenError, Result};
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Handle to one input file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: String,
    pub ack_token: String,
    pub source: PathBuf,
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Source of work items
pub trait WorkQueue: Send + Sync {
    /// Next item, or `None` when there is no more work right now
    fn get_next(&self) -> Result<Option<WorkItem>>;

    /// Remove an item from future consideration once it is fully processed
    fn acknowledge(&self, item: &WorkItem) -> Result<()>;
}

/// Ack token of items served by [`InMemoryQueue`]
pub const IN_MEMORY_ACK_TOKEN: &str = "in-memory";

/// Snapshot of unprocessed files, taken once at construction
///
/// Items are removed from the supply when fetched. A failed item is not
/// requeued, so it is only retried when the whole run is restarted.
pub struct InMemoryQueue {
    supply: SegQueue<WorkItem>,
    acknowledged: Mutex<HashSet<String>>,
}

impl InMemoryQueue {
    /// Serve `files` in the given order
    pub fn new(files: Vec<PathBuf>) -> Self {
        let supply = SegQueue::new();
        for (position, file) in files.into_iter().enumerate() {
            supply.push(WorkItem {
                id: format!("item={};file={}", position, file.display()),
                ack_token: IN_MEMORY_ACK_TOKEN.to_string(),
                source: file,
            });
        }

        Self {
            supply,
            acknowledged: Mutex::new(HashSet::new()),
        }
    }

    /// Queue every input file that has no output file yet
    pub fn from_dirs(input_dir: &Path, output_dir: &Path) -> Result<Self> {
        let files = determine_remaining_files_to_process(input_dir, output_dir)?;
        info!(
            input_dir = %input_dir.display(),
            files = files.len(),
            "Queued unprocessed input files"
        );
        Ok(Self::new(files))
    }

    /// Items not fetched yet
    pub fn remaining(&self) -> usize {
        self.supply.len()
    }

    /// Items acknowledged so far
    pub fn acknowledged(&self) -> usize {
        self.acknowledged.lock().len()
    }
}

impl WorkQueue for InMemoryQueue {
    fn get_next(&self) -> Result<Option<WorkItem>> {
        Ok(self.supply.pop())
    }

    fn acknowledge(&self, item: &WorkItem) -> Result<()> {
        if item.ack_token != IN_MEMORY_ACK_TOKEN {
            return Err(BatchGenError::queue(format!(
                "{} was not issued by this queue",
                item.id
            )));
        }
        if !self.acknowledged.lock().insert(item.id.clone()) {
            debug!(item = %item, "Work item acknowledged twice");
        }
        Ok(())
    }
}
