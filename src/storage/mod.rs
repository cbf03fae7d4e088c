pub mod buffer_store;
pub mod config_store;
pub mod migrations;
pub mod models;
pub mod sqlite_manager;

pub use buffer_store::BufferStore;
pub use config_store::{ConfigStore, SqliteConfigStore};
pub use models::{BufferCounts, BufferedRecord};
pub use sqlite_manager::SqliteManager;
