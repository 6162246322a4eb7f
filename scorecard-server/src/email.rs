//! Outbound email seam.
//!
//! Rendering and delivery live outside this service; the pipeline only
//! needs "send this notification as an email, tell me if it worked". The
//! default implementation logs instead of sending, which is also what
//! tests use.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub user_id: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Logs the email instead of sending it.
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            user_id = %message.user_id,
            subject = %message.subject,
            "email delivery delegated to the mail service"
        );
        Ok(())
    }
}
