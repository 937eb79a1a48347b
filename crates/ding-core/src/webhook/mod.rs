//! Webhook payload parsing for the GitHub and Bitbucket push receivers.

pub mod bitbucket;
pub mod github;

pub use bitbucket::parse_bitbucket_push;
pub use github::parse_github_push;

/// Outcome of parsing a push-shaped webhook payload: enough to call
/// `createBuild(repo, branch, commit)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub branch: String,
    pub commit: String,
}
