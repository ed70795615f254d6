//! SMTP mail transport using Lettre.

use keel_core::config::Configuration;
use keel_core::error::ConfigError;
use keel_core::mail::{MailError, MailMessage, MailTransport};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::future::Future;
use std::pin::Pin;

/// Submission port used when `MAIL_PORT` is unset.
pub const DEFAULT_MAIL_PORT: u16 = 587;

/// Sends mail through an SMTP relay using STARTTLS.
#[derive(Clone)]
pub struct SmtpMailTransport {
    server: String,
    port: u16,
    credentials: Option<Credentials>,
}

impl std::fmt::Debug for SmtpMailTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailTransport")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("authenticated", &self.credentials.is_some())
            .finish()
    }
}

impl SmtpMailTransport {
    /// Transport for `server:port`, optionally authenticating.
    #[must_use]
    pub fn new(server: impl Into<String>, port: u16, credentials: Option<(String, String)>) -> Self {
        Self {
            server: server.into(),
            port,
            credentials: credentials.map(|(user, password)| Credentials::new(user, password)),
        }
    }

    /// Transport from `MAIL_SERVER`, `MAIL_PORT`, `MAIL_USERNAME` and
    /// `MAIL_PASSWORD`; `None` when no server is configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a port outside `u16`.
    pub fn from_config(config: &Configuration) -> Result<Option<Self>, ConfigError> {
        let Some(server) = config.get_string("MAIL_SERVER").filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let port = match config.get_u64("MAIL_PORT")? {
            None => DEFAULT_MAIL_PORT,
            Some(port) => u16::try_from(port).map_err(|_| ConfigError::Invalid {
                key: "MAIL_PORT".to_string(),
                reason: format!("{port} is not a valid port"),
            })?,
        };
        let credentials = config
            .get_string("MAIL_USERNAME")
            .zip(config.get_string("MAIL_PASSWORD"));

        Ok(Some(Self::new(server, port, credentials)))
    }

    fn build_transport(&self) -> Result<SmtpTransport, MailError> {
        let builder = SmtpTransport::starttls_relay(&self.server)
            .map_err(|e| MailError::Transport(format!("SMTP relay error: {e}")))?
            .port(self.port);

        Ok(match &self.credentials {
            Some(credentials) => builder.credentials(credentials.clone()).build(),
            None => builder.build(),
        })
    }
}

fn build_message(message: &MailMessage) -> Result<Message, MailError> {
    let from: Mailbox = message
        .from
        .parse()
        .map_err(|e| MailError::Address(format!("{}: {e}", message.from)))?;

    let mut builder = Message::builder()
        .from(from)
        .subject(message.subject.as_str())
        .header(ContentType::TEXT_PLAIN);
    for to in &message.to {
        builder = builder.to(to
            .parse()
            .map_err(|e| MailError::Address(format!("{to}: {e}")))?);
    }

    builder
        .body(message.body.clone())
        .map_err(|e| MailError::Build(e.to_string()))
}

impl MailTransport for SmtpMailTransport {
    fn send(
        &self,
        message: MailMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), MailError>> + Send + '_>> {
        Box::pin(async move {
            let email = build_message(&message)?;
            let mailer = self.build_transport()?;

            tokio::task::spawn_blocking(move || {
                mailer
                    .send(&email)
                    .map_err(|e| MailError::Transport(format!("Failed to send email: {e}")))
            })
            .await
            .map_err(|e| MailError::Transport(format!("Email task failed: {e}")))?
            .map(|_| ())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use keel_core::config::SettingValue;
    use std::collections::BTreeMap;

    #[test]
    fn test_from_config() {
        assert!(
            SmtpMailTransport::from_config(&Configuration::from_map(BTreeMap::new()))
                .unwrap()
                .is_none()
        );

        let transport = SmtpMailTransport::from_config(&keel_testing::test_config())
            .unwrap()
            .unwrap();
        assert_eq!(transport.port, DEFAULT_MAIL_PORT);
        assert!(transport.credentials.is_none());

        let mut values = BTreeMap::new();
        values.insert("MAIL_SERVER".to_string(), SettingValue::from("smtp.example.com"));
        values.insert("MAIL_PORT".to_string(), SettingValue::Integer(70_000));
        assert!(matches!(
            SmtpMailTransport::from_config(&Configuration::from_map(values)),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_build_message_rejects_bad_addresses() {
        let message = MailMessage {
            from: "ops@example.com".into(),
            to: vec!["not an address".into()],
            subject: "s".into(),
            body: "b".into(),
        };
        assert!(matches!(build_message(&message), Err(MailError::Address(_))));

        let message = MailMessage {
            to: vec!["ops@example.com".into()],
            ..message
        };
        assert!(build_message(&message).is_ok());
    }
}
