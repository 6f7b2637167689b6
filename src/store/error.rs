use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("malformed block number in store: {0:?}")]
    MalformedNumber(String),

    #[error("malformed transaction record: {0}")]
    MalformedRecord(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the caller should retry with backoff instead of failing the
    /// component. Malformed persisted data is never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Redis(e) => {
                e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
            }
            StoreError::MalformedNumber(_) => false,
            StoreError::MalformedRecord(_) => false,
        }
    }
}
