use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::otp::{OtpError, OtpPolicy};
use crate::auth::repo_types::{OtpAuditRow, OtpRecord, User};

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;
    async fn create(&self, email: &str, password_hash: &str) -> anyhow::Result<User>;
    async fn set_password(&self, id: Uuid, password_hash: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait OtpStore: Send + Sync {
    /// Persist a new record for `user_id`, optionally retiring its unused predecessors.
    async fn issue(
        &self,
        user_id: Uuid,
        otp_hash: &str,
        now: OffsetDateTime,
        invalidate_previous: bool,
    ) -> anyhow::Result<OtpRecord>;

    /// Check the newest unused record against `candidate_digest` and mark it
    /// used on success. Read, check and write happen atomically.
    async fn consume(
        &self,
        user_id: Uuid,
        candidate_digest: &str,
        now: OffsetDateTime,
        policy: &OtpPolicy,
    ) -> Result<OtpRecord, OtpError>;

    async fn list_recent(&self, limit: i64) -> anyhow::Result<Vec<OtpAuditRow>>;
}

/// Postgres-backed implementation of both stores.
#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_hash, is_staff, created_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .context("find user by email")?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"SELECT id, email, password_hash, is_staff, created_at FROM users WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("find user by id")?;
        Ok(user)
    }

    async fn create(&self, email: &str, password_hash: &str) -> anyhow::Result<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (email, password_hash)
            VALUES ($1, $2)
            RETURNING id, email, password_hash, is_staff, created_at
            "#,
        )
        .bind(email)
        .bind(password_hash)
        .fetch_one(&self.db)
        .await
        .context("insert user")?;
        Ok(user)
    }

    async fn set_password(&self, id: Uuid, password_hash: &str) -> anyhow::Result<()> {
        let res = sqlx::query(r#"UPDATE users SET password_hash = $2 WHERE id = $1"#)
            .bind(id)
            .bind(password_hash)
            .execute(&self.db)
            .await
            .context("update password")?;
        anyhow::ensure!(res.rows_affected() == 1, "user {} not found", id);
        Ok(())
    }
}

#[async_trait]
impl OtpStore for PgStore {
    async fn issue(
        &self,
        user_id: Uuid,
        otp_hash: &str,
        now: OffsetDateTime,
        invalidate_previous: bool,
    ) -> anyhow::Result<OtpRecord> {
        let mut tx = self.db.begin().await.context("begin tx")?;
        if invalidate_previous {
            sqlx::query(
                r#"UPDATE otp_verifications SET is_used = true WHERE user_id = $1 AND is_used = false"#,
            )
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("retire previous otps")?;
        }
        let record = sqlx::query_as::<_, OtpRecord>(
            r#"
            INSERT INTO otp_verifications (id, user_id, otp_hash, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, user_id, otp_hash, created_at, is_used, attempts
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(otp_hash)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .context("insert otp")?;
        tx.commit().await.context("commit tx")?;
        Ok(record)
    }

    async fn consume(
        &self,
        user_id: Uuid,
        candidate_digest: &str,
        now: OffsetDateTime,
        policy: &OtpPolicy,
    ) -> Result<OtpRecord, OtpError> {
        let mut tx = self.db.begin().await.context("begin tx")?;
        let record = sqlx::query_as::<_, OtpRecord>(
            r#"
            SELECT id, user_id, otp_hash, created_at, is_used, attempts
            FROM otp_verifications
            WHERE user_id = $1 AND is_used = false
            ORDER BY created_at DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .context("select pending otp")?;

        // Dropping `tx` on an early return rolls back and releases the lock.
        let Some(mut record) = record else {
            return Err(OtpError::NotFound);
        };

        match record.check(candidate_digest, now, policy) {
            Ok(()) => {
                sqlx::query(r#"UPDATE otp_verifications SET is_used = true WHERE id = $1"#)
                    .bind(record.id)
                    .execute(&mut *tx)
                    .await
                    .context("mark otp used")?;
                tx.commit().await.context("commit tx")?;
                record.is_used = true;
                Ok(record)
            }
            Err(OtpError::Mismatch) => {
                sqlx::query(
                    r#"UPDATE otp_verifications SET attempts = attempts + 1 WHERE id = $1"#,
                )
                .bind(record.id)
                .execute(&mut *tx)
                .await
                .context("count otp attempt")?;
                tx.commit().await.context("commit tx")?;
                Err(OtpError::Mismatch)
            }
            Err(e) => Err(e),
        }
    }

    async fn list_recent(&self, limit: i64) -> anyhow::Result<Vec<OtpAuditRow>> {
        let rows = sqlx::query_as::<_, OtpAuditRow>(
            r#"
            SELECT o.id, o.user_id, u.email, o.created_at, o.is_used, o.attempts
              FROM otp_verifications o
              JOIN users u ON u.id = o.user_id
             ORDER BY o.created_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await
        .context("list otps")?;
        Ok(rows)
    }
}
