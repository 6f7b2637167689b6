use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Consumer, Flusher, Monitor, PipelineError, Producer};
use crate::config::Config;
use crate::db::Database;
use crate::rpc::{ChainClient, RpcError};
use crate::store::TaskStore;

const RESTART_DELAY: Duration = Duration::from_secs(2);
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Factory for chain clients. The coordinator calls it again whenever the
/// producer needs a fresh connection.
pub type ConnectFn<C> = Arc<dyn Fn() -> BoxFuture<'static, Result<C, RpcError>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Settings {
    pub consumer_pool_size: usize,
    pub monitor_interval: Duration,
    pub flusher_interval: Duration,
    pub tx_flush_batch_size: usize,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            consumer_pool_size: config.consumer_pool_size,
            monitor_interval: config.monitor_interval,
            flusher_interval: config.flusher_interval,
            tx_flush_batch_size: config.tx_flush_batch_size,
        }
    }
}

/// Wires the pipeline together and supervises it: reconcile first, then
/// monitor, consumers and finally the producer, which is restarted with a
/// fresh client whenever its stream dies or the monitor reports it lagging.
pub struct Coordinator<S, C, D> {
    store: Arc<S>,
    db: Arc<D>,
    connect: ConnectFn<C>,
    settings: Settings,
    cancel: CancellationToken,
    wakeup: Arc<Notify>,
}

impl<S: TaskStore, C: ChainClient, D: Database> Coordinator<S, C, D> {
    pub fn new(
        store: Arc<S>,
        db: Arc<D>,
        connect: ConnectFn<C>,
        settings: Settings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            db,
            connect,
            settings,
            cancel,
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub async fn run(&self) -> Result<(), PipelineError> {
        let flusher = Arc::new(Flusher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.db),
            self.settings.flusher_interval,
            self.settings.tx_flush_batch_size,
            self.cancel.clone(),
        ));

        // Nothing may consume until the store and the database agree.
        flusher.reconcile().await?;

        let shared_chain = Arc::new((self.connect)().await?);

        let (health_tx, health_rx) = watch::channel(true);
        let monitor = Arc::new(Monitor::new(
            Arc::clone(&self.store),
            Arc::clone(&shared_chain),
            health_tx,
            self.settings.monitor_interval,
            self.cancel.clone(),
        ));

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        {
            let monitor = Arc::clone(&monitor);
            tasks.push(tokio::spawn(async move { monitor.run().await }));
        }
        {
            let flusher = Arc::clone(&flusher);
            tasks.push(tokio::spawn(async move { flusher.run().await }));
        }
        for worker_id in 0..self.settings.consumer_pool_size {
            tasks.push(self.spawn_consumer(worker_id, Arc::clone(&shared_chain)));
        }

        self.supervise_producer(health_rx).await;

        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("indexer stopped");
        Ok(())
    }

    /// Each worker is kept alive for the lifetime of the process; failures
    /// and panics respawn it after a short delay.
    fn spawn_consumer(&self, worker_id: usize, chain: Arc<C>) -> JoinHandle<()> {
        let consumer = Arc::new(Consumer::new(
            Arc::clone(&self.store),
            chain,
            Arc::clone(&self.wakeup),
            self.cancel.clone(),
            worker_id,
        ));
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let worker = Arc::clone(&consumer);
                let outcome = tokio::spawn(async move { worker.run().await }).await;
                match outcome {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) => {
                        tracing::error!("consumer worker {} failed: {}", worker_id, e)
                    }
                    Err(e) => tracing::error!("consumer worker {} panicked: {}", worker_id, e),
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RESTART_DELAY) => {}
                }
            }
        })
    }

    /// Run the producer until cancellation, reconnecting whenever its
    /// stream dies or the monitor flags it as lagging behind the tip.
    async fn supervise_producer(&self, mut health_rx: watch::Receiver<bool>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let chain = match (self.connect)().await {
                Ok(chain) => Arc::new(chain),
                Err(e) => {
                    tracing::error!("chain connect failed: {}", e);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(CONNECT_RETRY_DELAY) => continue,
                    }
                }
            };

            let producer = Arc::new(Producer::new(
                Arc::clone(&self.store),
                chain,
                Arc::clone(&self.wakeup),
                self.cancel.clone(),
            ));
            let instance = Arc::clone(&producer);
            let mut handle = tokio::spawn(async move { instance.run().await });

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = (&mut handle).await;
                    return;
                }
                outcome = &mut handle => match outcome {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) => tracing::warn!("producer failed: {}, restarting", e),
                    Err(e) => tracing::error!("producer panicked: {}, restarting", e),
                },
                _ = wait_unhealthy(&mut health_rx) => {
                    tracing::warn!("producer lagging behind chain tip, restarting with a fresh client");
                    handle.abort();
                    let _ = (&mut handle).await;
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(RESTART_DELAY) => {}
            }
        }
    }
}

/// Resolves when the monitor reports a healthy→unhealthy transition.
/// Pends forever once the monitor is gone.
async fn wait_unhealthy(health_rx: &mut watch::Receiver<bool>) {
    loop {
        if health_rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
        if !*health_rx.borrow() {
            return;
        }
    }
}
