use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::auth::repo_types::OtpRecord;
use crate::config::OtpConfig;

/// Lowercase hex SHA-256 of a passcode's decimal string.
pub fn digest(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Random 6-digit numeric code, zero padded.
pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    format!("{:06}", rng.gen_range(0..1_000_000))
}

#[derive(Debug, Clone, Copy)]
pub struct OtpPolicy {
    pub ttl: Duration,
    pub max_attempts: i32,
    pub invalidate_previous: bool,
}

impl From<&OtpConfig> for OtpPolicy {
    fn from(cfg: &OtpConfig) -> Self {
        Self {
            ttl: Duration::minutes(cfg.ttl_minutes),
            max_attempts: cfg.max_attempts,
            invalidate_previous: cfg.invalidate_previous,
        }
    }
}

impl Default for OtpPolicy {
    fn default() -> Self {
        Self::from(&OtpConfig::default())
    }
}

#[derive(Debug, Error)]
pub enum OtpError {
    #[error("no pending code")]
    NotFound,
    #[error("code expired")]
    Expired,
    #[error("code does not match")]
    Mismatch,
    #[error("code already used")]
    AlreadyUsed,
    #[error("too many attempts")]
    TooManyAttempts,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OtpRecord {
    pub fn expires_at(&self, ttl: Duration) -> OffsetDateTime {
        self.created_at + ttl
    }

    pub fn is_expired(&self, now: OffsetDateTime, ttl: Duration) -> bool {
        now > self.expires_at(ttl)
    }

    /// Validity check for a candidate digest. Does not mutate; the store
    /// applies the outcome (mark used, or count the failed attempt).
    pub fn check(
        &self,
        candidate_digest: &str,
        now: OffsetDateTime,
        policy: &OtpPolicy,
    ) -> Result<(), OtpError> {
        if self.is_used {
            return Err(OtpError::AlreadyUsed);
        }
        if self.is_expired(now, policy.ttl) {
            return Err(OtpError::Expired);
        }
        if policy.max_attempts > 0 && self.attempts >= policy.max_attempts {
            return Err(OtpError::TooManyAttempts);
        }
        if !bool::from(self.otp_hash.as_bytes().ct_eq(candidate_digest.as_bytes())) {
            return Err(OtpError::Mismatch);
        }
        Ok(())
    }
}
