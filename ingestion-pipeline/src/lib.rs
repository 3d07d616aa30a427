#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

//! Document ingestion: extraction, deterministic chunking, embedding and
//! the durable task queue feeding the per-tenant vector index.

pub mod chunker;
pub mod extract;
pub mod pipeline;

pub use pipeline::{IngestReceipt, IngestionPipeline};

use std::sync::Arc;

use tokio::time::{sleep, Duration};
use tracing::{error, info};
use uuid::Uuid;

/// Claims and processes ingestion tasks until the process shuts down.
/// Runs on a worker pool distinct from the request path so heavy documents
/// never block queries.
pub async fn run_worker_loop(pipeline: Arc<IngestionPipeline>) {
    let worker_id = format!("ingestion-worker-{}", Uuid::new_v4());
    let idle_backoff = Duration::from_millis(500);
    info!(%worker_id, "ingestion worker started");

    loop {
        match pipeline.process_next(&worker_id).await {
            Ok(true) => {}
            Ok(false) => {
                sleep(idle_backoff).await;
            }
            Err(err) => {
                // process_next already recorded the failure on the task and
                // document rows; the loop just keeps draining.
                error!(%worker_id, error = %err, "ingestion task failed");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
