//! Result and release database operations.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::DbPool;
use crate::error::Result;
use crate::models::{BuildId, BuildResult, Release, ResultId, StepRecord};

pub struct ResultRepo;

impl ResultRepo {
    pub async fn create(pool: &DbPool, result: &BuildResult) -> Result<ResultId> {
        let id = sqlx::query(
            r#"
            INSERT INTO result (build_id, command, version, os, arch, toolchain, filename, filesize)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(result.build_id.0)
        .bind(&result.command)
        .bind(&result.version)
        .bind(&result.os)
        .bind(&result.arch)
        .bind(&result.toolchain)
        .bind(&result.filename)
        .bind(result.filesize)
        .execute(pool)
        .await?
        .last_insert_rowid();

        Ok(ResultId(id))
    }

    pub async fn list_for_build(pool: &DbPool, build_id: BuildId) -> Result<Vec<BuildResult>> {
        let rows = sqlx::query(
            r#"
            SELECT id, build_id, command, version, os, arch, toolchain, filename, filesize
            FROM result WHERE build_id = ? ORDER BY id
            "#,
        )
        .bind(build_id.0)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| BuildResult {
                id: ResultId(row.get("id")),
                build_id: BuildId(row.get("build_id")),
                command: row.get("command"),
                version: row.get("version"),
                os: row.get("os"),
                arch: row.get("arch"),
                toolchain: row.get("toolchain"),
                filename: row.get("filename"),
                filesize: row.get("filesize"),
            })
            .collect())
    }
}

pub struct ReleaseRepo;

impl ReleaseRepo {
    pub async fn create(pool: &DbPool, release: &Release) -> Result<()> {
        sqlx::query(
            "INSERT INTO release (build_id, time, build_script, steps) VALUES (?, ?, ?, ?)",
        )
        .bind(release.build_id.0)
        .bind(release.time.to_rfc3339())
        .bind(&release.build_script)
        .bind(serde_json::to_string(&release.steps)?)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn get_by_build(pool: &DbPool, build_id: BuildId) -> Result<Option<Release>> {
        let row = sqlx::query("SELECT build_id, time, build_script, steps FROM release WHERE build_id = ?")
            .bind(build_id.0)
            .fetch_optional(pool)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let time_str: String = row.get("time");
        let steps_str: String = row.get("steps");
        Ok(Some(Release {
            build_id: BuildId(row.get("build_id")),
            time: DateTime::parse_from_rfc3339(&time_str)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| crate::error::DingError::Configuration(e.to_string()))?,
            build_script: row.get("build_script"),
            steps: serde_json::from_str::<Vec<StepRecord>>(&steps_str)?,
        }))
    }

    pub async fn is_released(pool: &DbPool, build_id: BuildId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM release WHERE build_id = ?")
            .bind(build_id.0)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }
}
