pub mod error;
pub mod task_store;

pub use error::StoreError;
pub use task_store::{BlockSet, RedisTaskStore, TaskStore};
