//! SMTP submission for failure/recovery notifications. When mail is
//! disabled in configuration, a fake client logs the message instead of
//! submitting it — notification-policy decisions and build status are
//! unaffected either way.

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use crate::config::MailConfig;
use crate::notify::MailDecision;

/// A single notification mail, fully rendered and ready to send.
pub struct Notification {
    pub to_name: String,
    pub to_email: String,
    pub subject: String,
    pub body: String,
}

/// Builds the notification body: the UI link, branch, last captured
/// output line, and error summary.
pub fn render(
    decision: MailDecision,
    base_url: &str,
    repo: &str,
    build_id: i64,
    branch: &str,
    last_line: Option<&str>,
    error_message: Option<&str>,
    to_name: &str,
    to_email: &str,
) -> Option<Notification> {
    let verb = match decision {
        MailDecision::None => return None,
        MailDecision::Failing => "failing",
        MailDecision::Resolved => "resolved",
    };

    let link = format!("{base_url}/#/repo/{repo}/build/{build_id}/");
    let mut body = format!("{repo} ({branch}) build {build_id} is {verb}.\n\n{link}\n");
    if let Some(line) = last_line {
        body.push_str(&format!("\nLast output line:\n{line}\n"));
    }
    if let Some(err) = error_message {
        body.push_str(&format!("\nError:\n{err}\n"));
    }

    Some(Notification {
        to_name: to_name.to_string(),
        to_email: to_email.to_string(),
        subject: format!("ding: {repo} ({branch}) {verb}"),
        body,
    })
}

/// Submits a notification mail. Submission is synchronous, but failures
/// never propagate into build status — they are only logged.
pub async fn send(config: &MailConfig, notification: Notification) {
    if !config.enabled {
        tracing::info!(
            to = %notification.to_email,
            subject = %notification.subject,
            "mail disabled; logging notification instead of sending"
        );
        return;
    }

    let result = send_via_smtp(config, &notification);
    if let Err(e) = result {
        tracing::warn!(error = %e, to = %notification.to_email, "failed to submit notification mail");
    }
}

fn send_via_smtp(config: &MailConfig, notification: &Notification) -> Result<(), String> {
    let from = if config.from_name.is_empty() {
        config.from.clone()
    } else {
        format!("{} <{}>", config.from_name, config.from)
    };

    let mut builder = Message::builder()
        .from(from.parse().map_err(|e| format!("invalid from address: {e}"))?)
        .to(format!("{} <{}>", notification.to_name, notification.to_email)
            .parse()
            .map_err(|e| format!("invalid to address: {e}"))?)
        .subject(&notification.subject)
        .header(ContentType::TEXT_PLAIN);

    if let Some(reply_to) = &config.reply_to {
        builder = builder
            .reply_to(reply_to.parse().map_err(|e| format!("invalid reply-to: {e}"))?);
    }

    let email = builder
        .body(notification.body.clone())
        .map_err(|e| e.to_string())?;

    let mut transport_builder = if config.smtp_tls {
        SmtpTransport::relay(&config.smtp_host).map_err(|e| e.to_string())?
    } else {
        SmtpTransport::builder_dangerous(&config.smtp_host)
    }
    .port(config.smtp_port);

    if !config.smtp_username.is_empty() {
        transport_builder = transport_builder.credentials(Credentials::new(
            config.smtp_username.clone(),
            config.smtp_password.clone(),
        ));
    }

    let transport = transport_builder.build();
    transport.send(&email).map_err(|e| e.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_decision_renders_nothing() {
        assert!(render(
            MailDecision::None,
            "http://localhost",
            "demo",
            1,
            "main",
            None,
            None,
            "ops",
            "ops@example.com"
        )
        .is_none());
    }

    #[test]
    fn failing_decision_includes_last_line_and_error() {
        let notification = render(
            MailDecision::Failing,
            "http://localhost",
            "demo",
            7,
            "main",
            Some("exit status 1"),
            Some("build step failed"),
            "ops",
            "ops@example.com",
        )
        .unwrap();
        assert!(notification.subject.contains("failing"));
        assert!(notification.body.contains("exit status 1"));
        assert!(notification.body.contains("build step failed"));
        assert!(notification.body.contains("/#/repo/demo/build/7/"));
    }

    #[tokio::test]
    async fn disabled_config_never_attempts_smtp() {
        let config = MailConfig {
            enabled: false,
            ..Default::default()
        };
        let notification = Notification {
            to_name: "ops".to_string(),
            to_email: "ops@example.com".to_string(),
            subject: "test".to_string(),
            body: "test".to_string(),
        };
        send(&config, notification).await;
    }
}
