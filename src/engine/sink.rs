//! Result sink
//!
//! Single consumer of parse output. Data records are routed to the storage
//! of the task named in the record; anything else is only logged.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::registry::TaskRegistry;
use super::worker::ParseOutput;
use crate::collect::{CrawlError, Item};

pub struct ResultSink {
    registry: Arc<TaskRegistry>,
    rx: mpsc::Receiver<ParseOutput>,
    idle: Duration,
}

impl ResultSink {
    pub fn new(
        registry: Arc<TaskRegistry>,
        rx: mpsc::Receiver<ParseOutput>,
        idle: Duration,
    ) -> Self {
        Self { registry, rx, idle }
    }

    /// Drain results until cancelled or every sender is gone
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = tokio::time::timeout(self.idle, self.rx.recv()) => received,
            };

            match received {
                Ok(Some(output)) => {
                    self.handle(output).await;
                }
                Ok(None) => break,
                Err(_) => tracing::info!("No data"),
            }
        }
        tracing::debug!("Result sink stopped");
    }

    /// Save every data record of one result; returns how many were saved
    pub async fn handle(&self, output: ParseOutput) -> usize {
        tracing::debug!(
            task = %output.task,
            url = %output.url,
            requests = output.requests,
            items = output.items.len(),
            "Received parse result"
        );

        let mut saved = 0;
        for item in output.items {
            let cell = match item {
                Item::Data(cell) => cell,
                Item::Value(value) => {
                    tracing::info!(task = %output.task, item = %value, "Item");
                    continue;
                }
            };

            let Some(name) = cell.task_name().map(str::to_string) else {
                tracing::warn!("Data cell without task name");
                continue;
            };
            let Some(task) = self.registry.get(&name) else {
                tracing::error!(error = %CrawlError::UnknownTask(name), "Cannot route data cell");
                continue;
            };

            match task.storage().save(vec![cell]).await {
                Ok(()) => {
                    saved += 1;
                    crate::metrics::record_stored(&name, 1);
                }
                Err(e) => tracing::error!(task = %name, error = %e, "Storage save failed"),
            }
        }
        saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::testing::{empty_tree, StaticFetcher};
    use crate::collect::{DataCell, MemoryStorage, Storager, Task, TaskOptions};
    use async_trait::async_trait;
    use serde_json::Value;

    struct FailingStorage;

    #[async_trait]
    impl Storager for FailingStorage {
        async fn save(&self, _cells: Vec<DataCell>) -> Result<(), CrawlError> {
            Err(CrawlError::Storage("disk full".into()))
        }
    }

    fn registry(books: Arc<MemoryStorage>) -> Arc<TaskRegistry> {
        let mut registry = TaskRegistry::new();
        registry.add(Task::new(
            TaskOptions::new("books"),
            empty_tree(),
            Arc::new(StaticFetcher::new()),
            books,
        ));
        registry.add(Task::new(
            TaskOptions::new("broken"),
            empty_tree(),
            Arc::new(StaticFetcher::new()),
            Arc::new(FailingStorage),
        ));
        Arc::new(registry)
    }

    fn output(items: Vec<Item>) -> ParseOutput {
        ParseOutput {
            task: "books".into(),
            url: "http://a".into(),
            requests: 0,
            items,
        }
    }

    #[tokio::test]
    async fn test_routes_cells_by_task_name() {
        let books = Arc::new(MemoryStorage::new());
        let (_tx, rx) = mpsc::channel(1);
        let sink = ResultSink::new(registry(books.clone()), rx, Duration::from_secs(10));

        let saved = sink
            .handle(output(vec![
                DataCell::new("books").with("title", Value::from("Dune")).into(),
                Item::Value(Value::from("not stored")),
                DataCell::new("unknown").into(),
                DataCell::new("broken").into(),
            ]))
            .await;

        assert_eq!(saved, 1);
        let cells = books.cells().await;
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].get("title"), Some(&Value::from("Dune")));
    }

    #[tokio::test]
    async fn test_run_drains_until_senders_drop() {
        let books = Arc::new(MemoryStorage::new());
        let (tx, rx) = mpsc::channel(4);
        let sink = ResultSink::new(registry(books.clone()), rx, Duration::from_millis(10));
        let handle = tokio::spawn(sink.run(CancellationToken::new()));

        tx.send(output(vec![DataCell::new("books").into()])).await.unwrap();
        // Let the idle branch fire at least once
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(output(vec![DataCell::new("books").into()])).await.unwrap();
        drop(tx);

        handle.await.unwrap();
        assert_eq!(books.len().await, 2);
    }
}
