//! Persistence layer modules.

pub mod db;
pub mod schema;
pub mod workspace_repo;

pub use workspace_repo::WorkspaceRepo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
