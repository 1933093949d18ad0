pub mod appwrite;
pub mod db;
pub mod disabled;
pub mod memory;
pub mod mirror;

pub use appwrite::AppwriteAdapter;
pub use db::PgStore;
pub use disabled::DisabledPersistence;
pub use memory::{InMemoryPersistence, InMemorySessionStore};
pub use mirror::MirroredSessionStore;
