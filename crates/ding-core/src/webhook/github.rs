//! GitHub push webhook parsing.

use serde::Deserialize;

use crate::error::{DingError, Result};

use super::PushEvent;

#[derive(Deserialize)]
struct GitHubPushPayload {
    #[serde(rename = "ref")]
    ref_name: String,
    after: String,
}

/// Parses a GitHub `push` event body into a [`PushEvent`].
///
/// Branch is derived from `refs/heads/<branch>`; non-branch refs (tags,
/// pull request refs) are rejected as a user error, matching the original's
/// narrow push-only handling.
pub fn parse_github_push(body: &[u8]) -> Result<PushEvent> {
    let payload: GitHubPushPayload = serde_json::from_slice(body)
        .map_err(|e| DingError::InvalidWebhookPayload(format!("github push: {e}")))?;

    let branch = payload
        .ref_name
        .strip_prefix("refs/heads/")
        .ok_or_else(|| {
            DingError::InvalidWebhookPayload(format!(
                "unsupported ref for push event: {}",
                payload.ref_name
            ))
        })?
        .to_string();

    if payload.after.is_empty() {
        return Err(DingError::InvalidWebhookPayload(
            "push event missing commit sha".to_string(),
        ));
    }

    Ok(PushEvent {
        branch,
        commit: payload.after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_branch_push() {
        let body = br#"{"ref":"refs/heads/main","after":"abc123"}"#;
        let event = parse_github_push(body).unwrap();
        assert_eq!(event.branch, "main");
        assert_eq!(event.commit, "abc123");
    }

    #[test]
    fn rejects_tag_ref() {
        let body = br#"{"ref":"refs/tags/v1.0","after":"abc123"}"#;
        assert!(parse_github_push(body).is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse_github_push(b"not json").is_err());
    }
}
