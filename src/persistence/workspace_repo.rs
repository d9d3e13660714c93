//! Workspace repository for `SQLite` persistence.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::models::{CommandSet, Workspace};
use crate::{AppError, Result};

use super::db::Database;

/// Internal row struct for `SQLite` workspace queries.
#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    local_path: String,
    remote_path: Option<String>,
    init_cmd: String,
    build_cmd: String,
    test_cmd: String,
    start_cmd: String,
    env: String,
    address: String,
    created_at: String,
}

impl WorkspaceRow {
    fn into_workspace(self) -> Result<Workspace> {
        let env: BTreeMap<String, String> = serde_json::from_str(&self.env)
            .map_err(|err| AppError::Db(format!("invalid env for {}: {err}", self.id)))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|err| AppError::Db(format!("invalid created_at for {}: {err}", self.id)))?
            .with_timezone(&Utc);
        Ok(Workspace {
            id: self.id,
            local_path: PathBuf::from(self.local_path),
            remote_path: self.remote_path,
            commands: CommandSet::new(self.init_cmd, self.build_cmd, self.test_cmd, self.start_cmd),
            env,
            address: self.address,
            created_at,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, local_path, remote_path, init_cmd, build_cmd, \
     test_cmd, start_cmd, env, address, created_at FROM workspace";

/// Repository wrapper around `SQLite` for workspace records.
#[derive(Clone)]
pub struct WorkspaceRepo {
    db: Arc<Database>,
}

impl WorkspaceRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new workspace record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails (including a duplicate id).
    pub async fn create(&self, workspace: &Workspace) -> Result<Workspace> {
        let env = serde_json::to_string(&workspace.env)
            .map_err(|err| AppError::Db(format!("failed to encode env: {err}")))?;
        sqlx::query(
            "INSERT INTO workspace (id, local_path, remote_path, init_cmd, build_cmd, \
             test_cmd, start_cmd, env, address, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&workspace.id)
        .bind(workspace.local_path.to_string_lossy().into_owned())
        .bind(&workspace.remote_path)
        .bind(&workspace.commands.init)
        .bind(&workspace.commands.build)
        .bind(&workspace.commands.test)
        .bind(&workspace.commands.start)
        .bind(env)
        .bind(&workspace.address)
        .bind(workspace.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true))
        .execute(self.db.as_ref())
        .await?;
        Ok(workspace.clone())
    }

    /// Retrieve a workspace by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no workspace has this id.
    pub async fn get_by_id(&self, id: &str) -> Result<Workspace> {
        let row: Option<WorkspaceRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.ok_or_else(|| AppError::NotFound(format!("workspace {id} not found")))?
            .into_workspace()
    }

    /// List every workspace, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or a row is corrupt.
    pub async fn list(&self) -> Result<Vec<Workspace>> {
        let rows: Vec<WorkspaceRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY created_at, id"))
                .fetch_all(self.db.as_ref())
                .await?;
        rows.into_iter().map(WorkspaceRow::into_workspace).collect()
    }

    /// Overwrite every mutable field of an existing workspace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the workspace does not exist, or
    /// `AppError::Db` if the update fails.
    pub async fn update(&self, workspace: &Workspace) -> Result<Workspace> {
        let env = serde_json::to_string(&workspace.env)
            .map_err(|err| AppError::Db(format!("failed to encode env: {err}")))?;
        let result = sqlx::query(
            "UPDATE workspace SET local_path = ?1, remote_path = ?2, init_cmd = ?3, \
             build_cmd = ?4, test_cmd = ?5, start_cmd = ?6, env = ?7, address = ?8 \
             WHERE id = ?9",
        )
        .bind(workspace.local_path.to_string_lossy().into_owned())
        .bind(&workspace.remote_path)
        .bind(&workspace.commands.init)
        .bind(&workspace.commands.build)
        .bind(&workspace.commands.test)
        .bind(&workspace.commands.start)
        .bind(env)
        .bind(&workspace.address)
        .bind(&workspace.id)
        .execute(self.db.as_ref())
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "workspace {} not found",
                workspace.id
            )));
        }
        Ok(workspace.clone())
    }

    /// Delete a workspace by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no workspace has this id.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM workspace WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("workspace {id} not found")));
        }
        Ok(())
    }
}
