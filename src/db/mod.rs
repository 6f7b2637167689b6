pub mod database;
pub mod error;
pub mod migrations;
pub mod pool;

pub use database::{BlockNumberRow, Database, PgDatabase};
pub use error::DbError;
pub use pool::DbPool;
