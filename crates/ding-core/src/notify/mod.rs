//! Notification policy: decides whether a finalized build should send a
//! "failing" or "resolved" mail, based only on the previous build's
//! status on the same (repo, branch).

use crate::models::BuildStatus;

/// The decision the policy reaches for one finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailDecision {
    None,
    Failing,
    Resolved,
}

/// `previous` is the status of the most recent prior build on the same
/// (repo, branch), or `None` if this is the first build. `current_failed`
/// is whether the build just finalized failed (any non-success status is
/// a failure; `success` is the only passing outcome).
pub fn decide(previous: Option<BuildStatus>, current_failed: bool) -> MailDecision {
    let previous_failed = previous.map(|status| !status.is_success());
    match (previous_failed, current_failed) {
        (None, true) => MailDecision::Failing,
        (Some(false), true) => MailDecision::Failing,
        (Some(true), true) => MailDecision::None,
        (Some(true), false) => MailDecision::Resolved,
        (Some(false), false) | (None, false) => MailDecision::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_then_failure_sends_failing() {
        assert_eq!(decide(None, true), MailDecision::Failing);
    }

    #[test]
    fn success_then_failure_sends_failing() {
        assert_eq!(decide(Some(BuildStatus::Success), true), MailDecision::Failing);
    }

    #[test]
    fn failure_then_failure_sends_nothing() {
        assert_eq!(decide(Some(BuildStatus::Build), true), MailDecision::None);
    }

    #[test]
    fn failure_then_success_sends_resolved() {
        assert_eq!(decide(Some(BuildStatus::Build), false), MailDecision::Resolved);
    }

    #[test]
    fn success_then_success_sends_nothing() {
        assert_eq!(decide(Some(BuildStatus::Success), false), MailDecision::None);
    }

    #[test]
    fn absent_then_success_sends_nothing() {
        assert_eq!(decide(None, false), MailDecision::None);
    }

    #[test]
    fn decision_is_a_pure_function_of_the_pair() {
        for previous in [None, Some(BuildStatus::Build), Some(BuildStatus::Success)] {
            for current_failed in [true, false] {
                assert_eq!(
                    decide(previous, current_failed),
                    decide(previous, current_failed)
                );
            }
        }
    }
}
