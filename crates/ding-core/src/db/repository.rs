//! Repository database operations.

use sqlx::Row;

use super::DbPool;
use crate::error::{DingError, Result};
use crate::models::{Repo, RepoId};

pub struct RepoRepo;

impl RepoRepo {
    pub async fn create(pool: &DbPool, repo: &Repo) -> Result<RepoId> {
        let id = sqlx::query(
            r#"
            INSERT INTO repo (name, vcs, origin, checkout_path, build_script)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&repo.name)
        .bind(repo.vcs.as_str())
        .bind(&repo.origin)
        .bind(&repo.checkout_path)
        .bind(&repo.build_script)
        .execute(pool)
        .await?
        .last_insert_rowid();

        Ok(RepoId(id))
    }

    pub async fn get_by_id(pool: &DbPool, id: RepoId) -> Result<Option<Repo>> {
        let row = sqlx::query(
            "SELECT id, name, vcs, origin, checkout_path, build_script FROM repo WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(pool)
        .await?;

        row.as_ref().map(Self::row_to_repo).transpose()
    }

    pub async fn get_by_name(pool: &DbPool, name: &str) -> Result<Option<Repo>> {
        let row = sqlx::query(
            "SELECT id, name, vcs, origin, checkout_path, build_script FROM repo WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(pool)
        .await?;

        row.as_ref().map(Self::row_to_repo).transpose()
    }

    pub async fn list(pool: &DbPool) -> Result<Vec<Repo>> {
        let rows = sqlx::query(
            "SELECT id, name, vcs, origin, checkout_path, build_script FROM repo ORDER BY name",
        )
        .fetch_all(pool)
        .await?;

        rows.iter().map(Self::row_to_repo).collect()
    }

    /// `saveRepo`: updates an existing repository's mutable fields.
    pub async fn update(pool: &DbPool, repo: &Repo) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE repo SET name = ?, vcs = ?, origin = ?, checkout_path = ?, build_script = ?
            WHERE id = ?
            "#,
        )
        .bind(&repo.name)
        .bind(repo.vcs.as_str())
        .bind(&repo.origin)
        .bind(&repo.checkout_path)
        .bind(&repo.build_script)
        .bind(repo.id.0)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn delete(pool: &DbPool, id: RepoId) -> Result<()> {
        sqlx::query("DELETE FROM repo WHERE id = ?")
            .bind(id.0)
            .execute(pool)
            .await?;
        Ok(())
    }

    fn row_to_repo(row: &sqlx::sqlite::SqliteRow) -> Result<Repo> {
        let vcs_str: String = row.get("vcs");
        Ok(Repo {
            id: RepoId(row.get("id")),
            name: row.get("name"),
            vcs: vcs_str
                .parse()
                .map_err(|e: String| DingError::Configuration(e))?,
            origin: row.get("origin"),
            checkout_path: row.get("checkout_path"),
            build_script: row.get("build_script"),
        })
    }
}
