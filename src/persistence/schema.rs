//! `SQLite` schema bootstrap logic.
//!
//! Table definitions use `CREATE TABLE IF NOT EXISTS` and are re-applied on
//! every connect.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS workspace (
    id              TEXT PRIMARY KEY NOT NULL,
    local_path      TEXT NOT NULL,
    remote_path     TEXT,
    init_cmd        TEXT NOT NULL DEFAULT '',
    build_cmd       TEXT NOT NULL DEFAULT '',
    test_cmd        TEXT NOT NULL DEFAULT '',
    start_cmd       TEXT NOT NULL DEFAULT '',
    env             TEXT NOT NULL DEFAULT '{}',
    address         TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workspace_local_path ON workspace(local_path);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
