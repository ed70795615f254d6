//! Outbound mail transport abstraction.
//!
//! The exception notifier only needs "send this message"; concrete
//! transports (SMTP in production, recording fakes in tests) live elsewhere.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// A plain-text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    /// Sender address.
    pub from: String,
    /// Recipient addresses.
    pub to: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

/// Mail delivery failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MailError {
    /// An address could not be parsed.
    #[error("invalid mail address: {0}")]
    Address(String),

    /// The message could not be assembled.
    #[error("failed to build mail message: {0}")]
    Build(String),

    /// The transport could not deliver the message.
    #[error("mail transport failed: {0}")]
    Transport(String),
}

/// Delivers mail messages.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the trait stays
/// dyn-compatible (`Arc<dyn MailTransport>`).
pub trait MailTransport: Send + Sync + 'static {
    /// Send one message. Implementations do not retry.
    ///
    /// # Errors
    ///
    /// Returns [`MailError`] when the message cannot be built or delivered.
    fn send(
        &self,
        message: MailMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), MailError>> + Send + '_>>;
}
