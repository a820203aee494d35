pub mod sqlite;

pub use sqlite::{SqliteDatabaseManager, SqliteTaskStore};
