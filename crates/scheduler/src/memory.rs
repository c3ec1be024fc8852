//! Deterministic in-memory scanner for benchmarks and tests.
//!
//! Generates rows `id = 0..total_rows` and fills whatever columns the target
//! block has: `Int64` gets the id, `Float64` gets `id / 2`, `Utf8` gets a
//! tag cycling through 16 values.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use scanflow_core::{
    Block, Column, DataType, Field, ScanError, ScanResult, Schema, SchemaRef, StorageType,
};

use crate::task::{RuntimeState, Scanner};

const TAG_CARDINALITY: i64 = 16;

/// Schema `MemoryScanner` is usually paired with: `id`, `value`, `tag`.
pub fn memory_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64),
        Field::new("value", DataType::Float64),
        Field::new("tag", DataType::Utf8),
    ]))
}

/// Builder for [`MemoryScanner`].
#[derive(Debug, Clone)]
pub struct MemoryScannerBuilder {
    name: String,
    storage: StorageType,
    total_rows: usize,
    rows_per_read: usize,
    limit: i64,
    latency: Option<Duration>,
}

impl MemoryScannerBuilder {
    /// Scanner name. Use [`FILE_SCANNER_NAME`](crate::task::FILE_SCANNER_NAME)
    /// to get file-scanner thread policy.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn storage(mut self, storage: StorageType) -> Self {
        self.storage = storage;
        self
    }

    pub fn rows_per_read(mut self, rows: usize) -> Self {
        self.rows_per_read = rows.max(1);
        self
    }

    /// Push a row limit into the scan. Non-positive means none.
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Sleep this long on every read, to mimic slow storage.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn build(self) -> MemoryScanner {
        let effective_rows = if self.limit > 0 {
            self.total_rows.min(self.limit as usize)
        } else {
            self.total_rows
        };
        MemoryScanner {
            name: self.name,
            storage: self.storage,
            rows_per_read: self.rows_per_read,
            limit: self.limit,
            latency: self.latency,
            effective_rows,
            emitted: 0,
            opened: false,
        }
    }
}

pub struct MemoryScanner {
    name: String,
    storage: StorageType,
    rows_per_read: usize,
    limit: i64,
    latency: Option<Duration>,
    effective_rows: usize,
    emitted: usize,
    opened: bool,
}

impl MemoryScanner {
    pub fn builder(total_rows: usize) -> MemoryScannerBuilder {
        MemoryScannerBuilder {
            name: "MemoryScanner".to_string(),
            storage: StorageType::Local,
            total_rows,
            rows_per_read: 1024,
            limit: -1,
            latency: None,
        }
    }

    pub fn rows_emitted(&self) -> usize {
        self.emitted
    }
}

impl Scanner for MemoryScanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn storage_type(&self) -> StorageType {
        self.storage
    }

    fn init(&mut self) -> ScanResult<()> {
        Ok(())
    }

    fn open(&mut self, state: &RuntimeState) -> ScanResult<()> {
        debug!(
            query_id = %state.query_id,
            scanner = %self.name,
            rows = self.effective_rows,
            "memory scanner opened"
        );
        self.opened = true;
        Ok(())
    }

    fn get_block_after_projects(
        &mut self,
        _state: &RuntimeState,
        block: &mut Block,
    ) -> ScanResult<bool> {
        if !self.opened {
            return Err(ScanError::Scanner(format!("{} read before open", self.name)));
        }
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }

        let n = self.rows_per_read.min(self.effective_rows - self.emitted);
        let start = self.emitted as i64;
        let ids = start..start + n as i64;
        for column in block.columns_mut() {
            match column {
                Column::Int64(v) => v.extend(ids.clone()),
                Column::Float64(v) => v.extend(ids.clone().map(|id| id as f64 / 2.0)),
                Column::Utf8(v) => {
                    v.extend(ids.clone().map(|id| format!("tag-{}", id % TAG_CARDINALITY)))
                }
            }
        }
        self.emitted += n;
        Ok(self.emitted >= self.effective_rows)
    }

    fn limit(&self) -> i64 {
        self.limit
    }
}
