pub mod memory;
pub mod models;
pub mod store;
pub mod writer;

pub use memory::MemoryStore;
pub use store::{DocumentStore, SqliteStore, StoreQuery};
pub use writer::{BatchFailure, BulkSyncWriter, WriteReport};
