use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::models::{ProductId, Reading, SeriesPoint};

use super::{LiveValueCache, SessionRegistry};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

enum PersistCommand {
    Append {
        product_id: ProductId,
        point: SeriesPoint,
    },
    Drain(oneshot::Sender<()>),
}

/// Consumer of decoded readings.
///
/// Runs on the device reader's task: the cache update and the throttle
/// decision are synchronous, the write is handed to the persistence worker
/// through a bounded queue so a slow store never stalls line decoding.
#[derive(Clone)]
pub struct IngestPipeline {
    registry: Arc<SessionRegistry>,
    cache: Arc<LiveValueCache>,
    queue: mpsc::Sender<PersistCommand>,
}

impl IngestPipeline {
    pub fn on_readings(&self, readings: &[Reading]) {
        for reading in readings {
            self.on_reading(reading);
        }
    }

    pub fn on_reading(&self, reading: &Reading) {
        self.cache.update(reading);

        let Some(product_id) = self
            .registry
            .admit(&reading.channel_id, reading.captured_at)
        else {
            return;
        };

        log_debug!(
            "queueing {} for series {} ({})",
            reading.value,
            product_id,
            reading.channel_id
        );
        let command = PersistCommand::Append {
            product_id,
            point: SeriesPoint::from(reading),
        };
        match self.queue.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log_warn!(
                    "persistence queue full; dropping sample from {}",
                    reading.channel_id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log_error!(
                    "persistence worker stopped; dropping sample from {}",
                    reading.channel_id
                );
            }
        }
    }

    /// Resolves once every sample queued before the call has been handled.
    pub async fn drain(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.queue
            .send(PersistCommand::Drain(done_tx))
            .await
            .map_err(|_| anyhow!("persistence worker is not running"))?;
        done_rx
            .await
            .context("persistence worker stopped before draining")
    }
}

/// Handle on the task writing queued samples to the series store.
pub struct PersistenceWorker {
    handle: Option<JoinHandle<()>>,
    cancel_token: CancellationToken,
}

impl PersistenceWorker {
    /// Spawns the worker and returns the pipeline feeding it.
    pub fn spawn(
        registry: Arc<SessionRegistry>,
        cache: Arc<LiveValueCache>,
        db: Database,
        capacity: usize,
    ) -> (IngestPipeline, Self) {
        let (queue, receiver) = mpsc::channel(capacity.max(1));
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(persistence_loop(db, receiver, cancel_token.clone()));

        let pipeline = IngestPipeline {
            registry,
            cache,
            queue,
        };
        let worker = Self {
            handle: Some(handle),
            cancel_token,
        };
        (pipeline, worker)
    }

    /// Writes what is already queued, then stops.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel_token.cancel();
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("persistence worker failed to join")
        } else {
            Ok(())
        }
    }
}

async fn persistence_loop(
    db: Database,
    mut receiver: mpsc::Receiver<PersistCommand>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            command = receiver.recv() => match command {
                Some(command) => handle_command(&db, command).await,
                None => break,
            },
            _ = cancel_token.cancelled() => {
                receiver.close();
                while let Some(command) = receiver.recv().await {
                    handle_command(&db, command).await;
                }
                break;
            }
        }
    }
    log_info!("persistence worker shutting down");
}

async fn handle_command(db: &Database, command: PersistCommand) {
    match command {
        PersistCommand::Append { product_id, point } => {
            if let Err(err) = db.append_point(&product_id, &point).await {
                log_error!("sample for series {product_id} lost: {err:#}");
            }
        }
        PersistCommand::Drain(done) => {
            let _ = done.send(());
        }
    }
}
