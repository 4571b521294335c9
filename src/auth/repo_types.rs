use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// User record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // Argon2 hash, not exposed in JSON
    pub is_staff: bool,
    pub created_at: OffsetDateTime,
}

/// One issued password-reset passcode. Only the SHA-256 digest is kept.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OtpRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip_serializing)]
    pub otp_hash: String,
    pub created_at: OffsetDateTime,
    pub is_used: bool,
    pub attempts: i32,
}

/// OTP row joined with its owner, as listed for staff.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct OtpAuditRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub email: String,
    pub created_at: OffsetDateTime,
    pub is_used: bool,
    pub attempts: i32,
}
