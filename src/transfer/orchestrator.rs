use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use super::TransferEngine;
use super::error::{Result, TransferError};
use super::progress::{AggregateProgress, ProgressSink};
use super::request::TransferRequest;

/// Shared state of one `run_many` call
struct Batch {
    engine: TransferEngine,
    progress: Arc<AggregateProgress>,
    failed: AtomicBool,
    first_error: Mutex<Option<TransferError>>,
}

impl Batch {
    async fn fail(&self, request: &TransferRequest, error: TransferError) {
        self.failed.store(true, Ordering::SeqCst);
        let mut first = self.first_error.lock().await;
        if first.is_none() {
            *first = Some(TransferError::FileFailed {
                path: request.local_path.clone(),
                source: Box::new(error),
            });
        } else {
            warn!(
                "Additional failure for {}: {}",
                request.local_path.display(),
                error
            );
        }
    }
}

pub(crate) async fn run_many(
    engine: &TransferEngine,
    requests: Vec<TransferRequest>,
    concurrency: usize,
    sink: Arc<dyn ProgressSink>,
) -> Result<()> {
    if concurrency == 0 {
        return Err(TransferError::InvalidRequest(
            "concurrency must be at least 1".to_string(),
        ));
    }
    for request in &requests {
        request.validate()?;
    }
    if requests.is_empty() {
        return Ok(());
    }

    let count = requests.len();
    let workers = concurrency.min(count);
    info!("Transferring {} files with {} workers", count, workers);

    let batch = Arc::new(Batch {
        engine: engine.clone(),
        progress: AggregateProgress::new(count, sink),
        failed: AtomicBool::new(false),
        first_error: Mutex::new(None),
    });

    // Every request is queued up front, so the queue never blocks the producer
    let (work_tx, work_rx) = mpsc::channel::<(usize, TransferRequest)>(count);
    for item in requests.into_iter().enumerate() {
        if work_tx.send(item).await.is_err() {
            return Err(TransferError::Worker("work queue closed".to_string()));
        }
    }
    drop(work_tx);
    let work_rx = Arc::new(Mutex::new(work_rx));

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let work_rx = Arc::clone(&work_rx);
        let batch = Arc::clone(&batch);

        handles.push(tokio::spawn(async move {
            loop {
                let next = {
                    let mut rx_guard = work_rx.lock().await;
                    rx_guard.recv().await
                };
                let Some((index, request)) = next else {
                    break;
                };
                if batch.failed.load(Ordering::SeqCst) {
                    debug!(
                        "Worker {} skipping {} after an earlier failure",
                        worker,
                        request.local_path.display()
                    );
                    break;
                }

                let sink = batch.progress.sink_for(index);
                match batch.engine.transfer(&request, sink).await {
                    Ok(()) => info!(
                        "{} {} done ({})",
                        request.direction,
                        request.local_path.display(),
                        request.remote_uri()
                    ),
                    Err(e) => batch.fail(&request, e).await,
                }
            }
        }));
    }

    let mut panicked = None;
    for joined in join_all(handles).await {
        if let Err(e) = joined {
            warn!("Transfer worker failed: {}", e);
            panicked.get_or_insert_with(|| e.to_string());
        }
    }

    if let Some(error) = batch.first_error.lock().await.take() {
        return Err(error);
    }
    match panicked {
        Some(message) => Err(TransferError::Worker(message)),
        None => Ok(()),
    }
}
