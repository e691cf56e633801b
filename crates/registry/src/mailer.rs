//! Token delivery by mail
//!
//! Tokens reach the requester out-of-band. With a configured mailhost
//! they go out over SMTP; without one they are only logged, which is
//! what small private deployments run with.

use lettre::message::header::ContentType;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;
use weftnet_common::{Error, Result};

pub struct Mailer {
    mailhost: Option<String>,
    from: String,
}

impl Mailer {
    pub fn new(mailhost: Option<String>, from: String) -> Self {
        Self { mailhost, from }
    }

    pub async fn send_token(&self, email: &str, token: &str) -> Result<()> {
        let Some(mailhost) = &self.mailhost else {
            info!("No mailhost configured, token for {}: {}", email, token);
            return Ok(());
        };
        let message = Message::builder()
            .from(self
                .from
                .parse()
                .map_err(|e| Error::InvalidConfig(format!("mail_from: {}", e)))?)
            .to(email
                .parse()
                .map_err(|e| Error::InvalidConfig(format!("recipient: {}", e)))?)
            .subject("[weftnet] Token Request")
            .header(ContentType::TEXT_PLAIN)
            .body(format!("Your token: {}\n", token))
            .map_err(|e| Error::Internal(format!("mail build: {}", e)))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(mailhost).build();
        transport
            .send(message)
            .await
            .map_err(|e| Error::Internal(format!("mail send: {}", e)))?;
        info!("Sent token to {}", email);
        Ok(())
    }
}
