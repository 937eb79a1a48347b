//! Build retention: after every finalization, trims old builds for the
//! same (repo, branch), keeping the most recent and anything released.

use chrono::{Duration, Utc};

use crate::db::build::BuildRepo;
use crate::db::DbPool;
use crate::error::Result;
use crate::ipc::IpcTransport;
use crate::models::{Build, RepoId};

const MAX_RETAINED_INDEX: usize = 10;
const MAX_AGE_DAYS: i64 = 14;

/// For the builds of `(repo_id, branch)` ordered by id descending,
/// preserves index 0 and any released build; removes the rest whose
/// index is ≥ [`MAX_RETAINED_INDEX`] or whose `finish` is older than
/// [`MAX_AGE_DAYS`] days. Each removal runs in its own transaction-sized
/// step (one DB delete, then one on-disk removal) to avoid a
/// long-running lock across the whole sweep.
pub async fn cleanup_builds(
    pool: &DbPool,
    transport: &dyn IpcTransport,
    repo_name: &str,
    repo_id: RepoId,
    branch: &str,
) -> Result<usize> {
    let builds = BuildRepo::list_for_branch(pool, repo_id, branch).await?;
    let cutoff = Utc::now() - Duration::days(MAX_AGE_DAYS);

    let mut removed = 0usize;
    for (index, build) in builds.iter().enumerate() {
        if index == 0 || build.released.is_some() {
            continue;
        }
        if !should_remove(index, build, cutoff) {
            continue;
        }

        BuildRepo::delete(pool, build.id).await?;
        if let Err(e) = transport.remove_dir(repo_name, Some(build.id.0)).await {
            tracing::warn!(build_id = build.id.0, error = %e, "failed to remove build directory during cleanup");
        }
        removed += 1;
    }
    Ok(removed)
}

fn should_remove(index: usize, build: &Build, cutoff: chrono::DateTime<Utc>) -> bool {
    if index >= MAX_RETAINED_INDEX {
        return true;
    }
    matches!(build.finish, Some(finish) if finish < cutoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BuildId, BuildStatus};

    fn build(id: i64, finish: Option<chrono::DateTime<Utc>>, released: bool) -> Build {
        Build {
            id: BuildId(id),
            repo_id: RepoId(1),
            branch: "main".to_string(),
            commit_hash: "abc".to_string(),
            status: BuildStatus::Success,
            start: Utc::now(),
            finish,
            error_message: None,
            last_line: None,
            released: released.then(Utc::now),
            builddir_removed: false,
            disk_usage: None,
        }
    }

    #[test]
    fn most_recent_index_is_never_removed() {
        let b = build(1, Some(Utc::now() - Duration::days(30)), false);
        assert!(!should_remove(0, &b, Utc::now() - Duration::days(14)));
    }

    #[test]
    fn old_finish_beyond_index_zero_is_removed() {
        let b = build(1, Some(Utc::now() - Duration::days(30)), false);
        assert!(should_remove(1, &b, Utc::now() - Duration::days(14)));
    }

    #[test]
    fn recent_finish_within_limit_is_kept() {
        let b = build(1, Some(Utc::now()), false);
        assert!(!should_remove(1, &b, Utc::now() - Duration::days(14)));
    }

    #[test]
    fn index_at_or_beyond_ten_is_removed_regardless_of_age() {
        let b = build(1, Some(Utc::now()), false);
        assert!(should_remove(10, &b, Utc::now() - Duration::days(14)));
    }
}
