//! Bitbucket push webhook parsing.

use serde::Deserialize;

use crate::error::{DingError, Result};
use crate::models::Vcs;

use super::PushEvent;

#[derive(Deserialize)]
struct BitbucketPayload {
    push: BitbucketPush,
    repository: BitbucketRepository,
}

#[derive(Deserialize)]
struct BitbucketPush {
    changes: Vec<BitbucketChange>,
}

#[derive(Deserialize)]
struct BitbucketChange {
    new: Option<BitbucketRef>,
}

#[derive(Deserialize)]
struct BitbucketRef {
    name: String,
    #[serde(rename = "type")]
    ref_type: String,
    #[serde(default)]
    heads: Vec<BitbucketHead>,
}

#[derive(Deserialize)]
struct BitbucketHead {
    hash: String,
    #[serde(rename = "type")]
    head_type: String,
}

#[derive(Deserialize)]
struct BitbucketRepository {
    scm: String,
}

/// Checks that the payload's declared `scm` is consistent with the
/// repository's configured [`Vcs`]
/// (`hg↔mercurial|command`, `git↔git|command`).
fn scm_matches(scm: &str, vcs: Vcs) -> bool {
    match scm {
        "hg" => matches!(vcs, Vcs::Mercurial | Vcs::Command),
        "git" => matches!(vcs, Vcs::Git | Vcs::Command),
        _ => false,
    }
}

/// Parses a Bitbucket push payload into zero or more [`PushEvent`]s, one
/// per branch/named_branch change. Tag changes are dispatched against
/// `fallback_branch` (the repository's default branch); bookmark changes
/// (Mercurial) are ignored, matching the original.
pub fn parse_bitbucket_push(
    body: &[u8],
    vcs: Vcs,
    fallback_branch: &str,
) -> Result<Vec<PushEvent>> {
    let payload: BitbucketPayload = serde_json::from_slice(body)
        .map_err(|e| DingError::InvalidWebhookPayload(format!("bitbucket push: {e}")))?;

    if !scm_matches(&payload.repository.scm, vcs) {
        return Err(DingError::InvalidWebhookPayload(format!(
            "bitbucket scm '{}' does not match configured vcs '{}'",
            payload.repository.scm, vcs
        )));
    }

    let mut events = Vec::new();
    for change in payload.push.changes {
        let Some(new_ref) = change.new else {
            // A change with no `new` side is a branch deletion; nothing to build.
            continue;
        };
        let branch = match new_ref.ref_type.as_str() {
            "branch" | "named_branch" => new_ref.name.clone(),
            "tag" => fallback_branch.to_string(),
            // Bookmarks (Mercurial) carry no commit to build from here.
            _ => continue,
        };
        for head in &new_ref.heads {
            if head.head_type == "commit" {
                events.push(PushEvent {
                    branch: branch.clone(),
                    commit: head.hash.clone(),
                });
            }
        }
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(scm: &str, ref_type: &str, name: &str) -> Vec<u8> {
        payload_with_hash(scm, ref_type, name, "deadbeef00000000000000000000000000000000")
    }

    fn payload_with_hash(scm: &str, ref_type: &str, name: &str, hash: &str) -> Vec<u8> {
        format!(
            r#"{{"push":{{"changes":[{{"new":{{"name":"{name}","type":"{ref_type}","heads":[{{"hash":"{hash}","type":"commit"}}]}}}}]}},"repository":{{"scm":"{scm}"}}}}"#
        )
        .into_bytes()
    }

    #[test]
    fn parses_branch_push() {
        let events = parse_bitbucket_push(&payload("git", "branch", "main"), Vcs::Git, "master")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].branch, "main");
    }

    #[test]
    fn commit_is_taken_from_heads_not_branch_name() {
        let events = parse_bitbucket_push(
            &payload_with_hash("git", "branch", "main", "2951856392c4ba466082948455bac7303404675f"),
            Vcs::Git,
            "master",
        )
        .unwrap();
        assert_eq!(events[0].commit, "2951856392c4ba466082948455bac7303404675f");
    }

    #[test]
    fn change_with_no_commit_head_yields_no_event() {
        let body = br#"{"push":{"changes":[{"new":{"name":"main","type":"branch","heads":[]}}]},"repository":{"scm":"git"}}"#;
        let events = parse_bitbucket_push(body, Vcs::Git, "master").unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn tag_falls_back_to_default_branch() {
        let events =
            parse_bitbucket_push(&payload("git", "tag", "v1.0"), Vcs::Git, "master").unwrap();
        assert_eq!(events[0].branch, "master");
    }

    #[test]
    fn rejects_scm_mismatch() {
        assert!(parse_bitbucket_push(&payload("hg", "branch", "default"), Vcs::Git, "master").is_err());
    }

    #[test]
    fn command_vcs_accepts_either_scm() {
        assert!(parse_bitbucket_push(&payload("git", "branch", "main"), Vcs::Command, "master").is_ok());
        assert!(parse_bitbucket_push(&payload("hg", "branch", "default"), Vcs::Command, "master").is_ok());
    }
}
