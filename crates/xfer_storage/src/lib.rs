pub mod catalog;
pub mod repository;

pub use catalog::SqliteResourceCatalog;
pub use repository::{StorageConfig, TransferStore};
