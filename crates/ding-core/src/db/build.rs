//! Build database operations.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::DbPool;
use crate::error::{DingError, Result};
use crate::models::{Build, BuildId, BuildStatus, RepoId};

pub struct BuildRepo;

impl BuildRepo {
    pub async fn create(pool: &DbPool, build: &Build) -> Result<BuildId> {
        let id = sqlx::query(
            r#"
            INSERT INTO build (repo_id, branch, commit_hash, status, start)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(build.repo_id.0)
        .bind(&build.branch)
        .bind(&build.commit_hash)
        .bind(build.status.as_str())
        .bind(build.start.to_rfc3339())
        .execute(pool)
        .await?
        .last_insert_rowid();

        Ok(BuildId(id))
    }

    pub async fn get_by_id(pool: &DbPool, id: BuildId) -> Result<Option<Build>> {
        let row = sqlx::query(Self::SELECT_COLUMNS_WHERE_ID)
            .bind(id.0)
            .fetch_optional(pool)
            .await?;
        row.as_ref().map(Self::row_to_build).transpose()
    }

    pub async fn list_for_repo(pool: &DbPool, repo_id: RepoId, limit: i64) -> Result<Vec<Build>> {
        let rows = sqlx::query(
            r#"
            SELECT id, repo_id, branch, commit_hash, status, start, finish, error_message,
                   last_line, released, builddir_removed, disk_usage
            FROM build WHERE repo_id = ? ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(repo_id.0)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        rows.iter().map(Self::row_to_build).collect()
    }

    /// All builds for a (repo, branch), most recent first — the ordering
    /// build retention and the notification policy
    /// both rely on.
    pub async fn list_for_branch(
        pool: &DbPool,
        repo_id: RepoId,
        branch: &str,
    ) -> Result<Vec<Build>> {
        let rows = sqlx::query(
            r#"
            SELECT id, repo_id, branch, commit_hash, status, start, finish, error_message,
                   last_line, released, builddir_removed, disk_usage
            FROM build WHERE repo_id = ? AND branch = ? ORDER BY id DESC
            "#,
        )
        .bind(repo_id.0)
        .bind(branch)
        .fetch_all(pool)
        .await?;
        rows.iter().map(Self::row_to_build).collect()
    }

    /// Builds with `status = 'new'`, oldest first — re-submitted through
    /// the serializer on startup.
    pub async fn get_queued(pool: &DbPool) -> Result<Vec<Build>> {
        let rows = sqlx::query(
            r#"
            SELECT id, repo_id, branch, commit_hash, status, start, finish, error_message,
                   last_line, released, builddir_removed, disk_usage
            FROM build WHERE status = 'new' ORDER BY id ASC
            "#,
        )
        .fetch_all(pool)
        .await?;
        rows.iter().map(Self::row_to_build).collect()
    }

    /// Builds with `finish IS NULL AND status != 'new'` — the stale set
    /// startup recovery closes.
    pub async fn get_stale_active(pool: &DbPool) -> Result<Vec<Build>> {
        let rows = sqlx::query(
            r#"
            SELECT id, repo_id, branch, commit_hash, status, start, finish, error_message,
                   last_line, released, builddir_removed, disk_usage
            FROM build WHERE finish IS NULL AND status != 'new'
            "#,
        )
        .fetch_all(pool)
        .await?;
        rows.iter().map(Self::row_to_build).collect()
    }

    pub async fn update_status(pool: &DbPool, id: BuildId, status: BuildStatus) -> Result<()> {
        sqlx::query("UPDATE build SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.0)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_commit_hash(pool: &DbPool, id: BuildId, commit_hash: &str) -> Result<()> {
        sqlx::query("UPDATE build SET commit_hash = ? WHERE id = ?")
            .bind(commit_hash)
            .bind(id.0)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Finalizes a build: sets `finish` (if not already set), the error
    /// message, and the last captured output line.
    pub async fn finish(
        pool: &DbPool,
        id: BuildId,
        finish: DateTime<Utc>,
        error_message: Option<&str>,
        last_line: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE build SET finish = COALESCE(finish, ?), error_message = ?, last_line = ?
            WHERE id = ?
            "#,
        )
        .bind(finish.to_rfc3339())
        .bind(error_message)
        .bind(last_line)
        .bind(id.0)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_disk_usage(pool: &DbPool, id: BuildId, disk_usage: i64) -> Result<()> {
        sqlx::query("UPDATE build SET disk_usage = ? WHERE id = ?")
            .bind(disk_usage)
            .bind(id.0)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn mark_released(pool: &DbPool, id: BuildId, time: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE build SET released = ? WHERE id = ?")
            .bind(time.to_rfc3339())
            .bind(id.0)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn mark_builddir_removed(pool: &DbPool, id: BuildId) -> Result<()> {
        sqlx::query("UPDATE build SET builddir_removed = 1 WHERE id = ?")
            .bind(id.0)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn delete(pool: &DbPool, id: BuildId) -> Result<()> {
        sqlx::query("DELETE FROM result WHERE build_id = ?")
            .bind(id.0)
            .execute(pool)
            .await?;
        sqlx::query("DELETE FROM build WHERE id = ?")
            .bind(id.0)
            .execute(pool)
            .await?;
        Ok(())
    }

    const SELECT_COLUMNS_WHERE_ID: &'static str = r#"
        SELECT id, repo_id, branch, commit_hash, status, start, finish, error_message,
               last_line, released, builddir_removed, disk_usage
        FROM build WHERE id = ?
    "#;

    fn row_to_build(row: &sqlx::sqlite::SqliteRow) -> Result<Build> {
        let status_str: String = row.get("status");
        let start_str: String = row.get("start");
        let finish_str: Option<String> = row.get("finish");
        let released_str: Option<String> = row.get("released");

        Ok(Build {
            id: BuildId(row.get("id")),
            repo_id: RepoId(row.get("repo_id")),
            branch: row.get("branch"),
            commit_hash: row.get("commit_hash"),
            status: status_str
                .parse()
                .map_err(DingError::Configuration)?,
            start: parse_rfc3339(&start_str, "build.start")?,
            finish: finish_str
                .map(|s| parse_rfc3339(&s, "build.finish"))
                .transpose()?,
            error_message: row.get("error_message"),
            last_line: row.get("last_line"),
            released: released_str
                .map(|s| parse_rfc3339(&s, "build.released"))
                .transpose()?,
            builddir_removed: row.get("builddir_removed"),
            disk_usage: row.get("disk_usage"),
        })
    }
}

fn parse_rfc3339(s: &str, field: &'static str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DingError::Configuration(format!("{field}: {e}")))
}
