use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("connection pool: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("pool build: {0}")]
    Build(#[from] deadpool_postgres::BuildError),

    #[error("postgres: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("schema migration {name} failed: {source}")]
    Migration {
        name: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("invalid database url: {0}")]
    InvalidUrl(String),
}
