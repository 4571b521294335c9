use async_trait::async_trait;
use tracing::info;

/// Out-of-band channel for a freshly issued passcode.
#[async_trait]
pub trait OtpSender: Send + Sync {
    async fn send(&self, email: &str, code: &str) -> anyhow::Result<()>;
}

/// Stand-in for a mail transport: writes the code to the server log.
#[derive(Clone, Default)]
pub struct LogOtpSender;

#[async_trait]
impl OtpSender for LogOtpSender {
    async fn send(&self, email: &str, code: &str) -> anyhow::Result<()> {
        info!(%email, %code, "password reset code issued");
        Ok(())
    }
}
