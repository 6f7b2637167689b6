pub mod consumer;
pub mod coordinator;
pub mod flusher;
pub mod monitor;
pub mod producer;

#[cfg(test)]
mod testkit;

pub use consumer::Consumer;
pub use coordinator::{Coordinator, Settings};
pub use flusher::Flusher;
pub use monitor::Monitor;
pub use producer::Producer;

use thiserror::Error;

use crate::db::DbError;
use crate::rpc::RpcError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("chain error: {0}")]
    Rpc(#[from] RpcError),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("task failure: {0}")]
    Task(String),
}

impl PipelineError {
    /// Errors worth a local retry before giving the claim back.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Store(e) => e.is_transient(),
            PipelineError::Rpc(e) => e.is_retryable(),
            PipelineError::Db(_) => false,
            PipelineError::Task(_) => false,
        }
    }
}
