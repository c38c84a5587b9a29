//! Storage collaborators for parsed output

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::error::CrawlError;
use super::rule::DataCell;

/// Persists parsed records
///
/// Errors are logged by the result sink and never fed back into the
/// request pipeline.
#[async_trait]
pub trait Storager: Send + Sync {
    async fn save(&self, cells: Vec<DataCell>) -> Result<(), CrawlError>;
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct MemoryStorage {
    cells: Mutex<Vec<DataCell>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of stored records
    pub async fn cells(&self) -> Vec<DataCell> {
        self.cells.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.cells.lock().await.len()
    }
}

#[async_trait]
impl Storager for MemoryStorage {
    async fn save(&self, cells: Vec<DataCell>) -> Result<(), CrawlError> {
        self.cells.lock().await.extend(cells);
        Ok(())
    }
}

/// Writes every record to the log as JSON
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStorage;

#[async_trait]
impl Storager for LogStorage {
    async fn save(&self, cells: Vec<DataCell>) -> Result<(), CrawlError> {
        for cell in cells {
            let json = serde_json::to_string(&cell.data)
                .map_err(|e| CrawlError::Storage(e.to_string()))?;
            tracing::info!(task = cell.task_name().unwrap_or_default(), data = %json, "Stored record");
        }
        Ok(())
    }
}
