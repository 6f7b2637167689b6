mod config;
mod db;
mod pipeline;
mod rpc;
mod store;
mod types;

use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

use config::Config;
use db::{DbPool, PgDatabase};
use pipeline::coordinator::ConnectFn;
use pipeline::{Coordinator, Settings};
use rpc::{RpcChainClient, RpcClientConfig};
use store::RedisTaskStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let store = Arc::new(RedisTaskStore::connect(&config.redis_url).await?);

    let pool = DbPool::new(&config.database_url).await?;
    pool.run_migrations().await?;
    let db = Arc::new(PgDatabase::new(pool));

    let rpc_config = RpcClientConfig::new(Url::parse(&config.chain_ws_url)?)
        .with_request_timeout(config.rpc_timeout);
    let connect: ConnectFn<RpcChainClient> = Arc::new(move || {
        let rpc_config = rpc_config.clone();
        async move { RpcChainClient::connect(rpc_config).await }.boxed()
    });

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    let coordinator = Coordinator::new(store, db, connect, Settings::from(&config), cancel);
    coordinator.run().await?;

    Ok(())
}
