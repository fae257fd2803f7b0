pub mod database;
pub mod debounce;
pub mod error;
pub mod kv;
pub mod progress;
pub mod schema;

pub use database::SqliteStore;
pub use debounce::{SaveDebouncer, SaveDecision};
pub use error::StoreError;
pub use kv::{KeyValueStore, MemoryStore};
pub use progress::{ProgressStore, ProgressWriter};
