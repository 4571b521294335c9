//! In-process stores backing `AppState::fake()` in tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::otp::{OtpError, OtpPolicy};
use crate::auth::repo::{OtpStore, UserStore};
use crate::auth::repo_types::{OtpAuditRow, OtpRecord, User};

#[derive(Clone, Default)]
pub struct MemoryStore {
    users: Arc<Mutex<Vec<User>>>,
    otps: Arc<Mutex<Vec<OtpRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, email: &str, password_hash: &str, is_staff: bool) -> User {
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            is_staff,
            created_at: OffsetDateTime::now_utc(),
        };
        self.users.lock().unwrap().push(user.clone());
        user
    }

    pub fn otps_for(&self, user_id: Uuid) -> Vec<OtpRecord> {
        self.otps
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        Ok(self.users.lock().unwrap().iter().find(|u| u.id == id).cloned())
    }

    async fn create(&self, email: &str, password_hash: &str) -> anyhow::Result<User> {
        anyhow::ensure!(
            self.find_by_email(email).await?.is_none(),
            "duplicate email {}",
            email
        );
        Ok(self.insert_user(email, password_hash, false))
    }

    async fn set_password(&self, id: Uuid, password_hash: &str) -> anyhow::Result<()> {
        let mut users = self.users.lock().unwrap();
        let user = users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| anyhow::anyhow!("user {} not found", id))?;
        user.password_hash = password_hash.to_string();
        Ok(())
    }
}

#[async_trait]
impl OtpStore for MemoryStore {
    async fn issue(
        &self,
        user_id: Uuid,
        otp_hash: &str,
        now: OffsetDateTime,
        invalidate_previous: bool,
    ) -> anyhow::Result<OtpRecord> {
        let mut otps = self.otps.lock().unwrap();
        if invalidate_previous {
            otps.iter_mut()
                .filter(|r| r.user_id == user_id)
                .for_each(|r| r.is_used = true);
        }
        let record = OtpRecord {
            id: Uuid::new_v4(),
            user_id,
            otp_hash: otp_hash.to_string(),
            created_at: now,
            is_used: false,
            attempts: 0,
        };
        otps.push(record.clone());
        Ok(record)
    }

    async fn consume(
        &self,
        user_id: Uuid,
        candidate_digest: &str,
        now: OffsetDateTime,
        policy: &OtpPolicy,
    ) -> Result<OtpRecord, OtpError> {
        let mut otps = self.otps.lock().unwrap();
        let record = otps
            .iter_mut()
            .filter(|r| r.user_id == user_id && !r.is_used)
            .max_by_key(|r| r.created_at)
            .ok_or(OtpError::NotFound)?;

        match record.check(candidate_digest, now, policy) {
            Ok(()) => {
                record.is_used = true;
                Ok(record.clone())
            }
            Err(OtpError::Mismatch) => {
                record.attempts += 1;
                Err(OtpError::Mismatch)
            }
            Err(e) => Err(e),
        }
    }

    async fn list_recent(&self, limit: i64) -> anyhow::Result<Vec<OtpAuditRow>> {
        let users = self.users.lock().unwrap();
        let mut rows: Vec<OtpAuditRow> = self
            .otps
            .lock()
            .unwrap()
            .iter()
            .map(|r| OtpAuditRow {
                id: r.id,
                user_id: r.user_id,
                email: users
                    .iter()
                    .find(|u| u.id == r.user_id)
                    .map(|u| u.email.clone())
                    .unwrap_or_default(),
                created_at: r.created_at,
                is_used: r.is_used,
                attempts: r.attempts,
            })
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::otp::digest;
    use time::Duration;

    fn store_with_user() -> (MemoryStore, Uuid) {
        let store = MemoryStore::new();
        let user = store.insert_user("user@example.com", "x", false);
        (store, user.id)
    }

    #[tokio::test]
    async fn consumed_record_cannot_be_consumed_again() {
        let (store, uid) = store_with_user();
        let t0 = OffsetDateTime::now_utc();
        let policy = OtpPolicy::default();
        store.issue(uid, &digest("123456"), t0, true).await.unwrap();

        let rec = store
            .consume(uid, &digest("123456"), t0 + Duration::minutes(1), &policy)
            .await
            .expect("first consume succeeds");
        assert!(rec.is_used);

        let again = store
            .consume(uid, &digest("123456"), t0 + Duration::minutes(1), &policy)
            .await;
        assert!(matches!(again, Err(OtpError::NotFound)));
    }

    #[tokio::test]
    async fn expired_record_fails() {
        let (store, uid) = store_with_user();
        let t0 = OffsetDateTime::now_utc();
        store.issue(uid, &digest("123456"), t0, true).await.unwrap();
        let res = store
            .consume(
                uid,
                &digest("123456"),
                t0 + Duration::minutes(6),
                &OtpPolicy::default(),
            )
            .await;
        assert!(matches!(res, Err(OtpError::Expired)));
        assert!(!store.otps_for(uid)[0].is_used);
    }

    #[tokio::test]
    async fn wrong_code_never_marks_used() {
        let (store, uid) = store_with_user();
        let t0 = OffsetDateTime::now_utc();
        store.issue(uid, &digest("123456"), t0, true).await.unwrap();
        for _ in 0..3 {
            let res = store
                .consume(uid, &digest("000000"), t0, &OtpPolicy::default())
                .await;
            assert!(matches!(res, Err(OtpError::Mismatch)));
        }
        let rec = &store.otps_for(uid)[0];
        assert!(!rec.is_used);
        assert_eq!(rec.attempts, 3);

        // Three misses stay under the default limit.
        store
            .consume(uid, &digest("123456"), t0, &OtpPolicy::default())
            .await
            .expect("correct code after misses");
    }

    #[tokio::test]
    async fn unlimited_attempts_when_limit_disabled() {
        let (store, uid) = store_with_user();
        let t0 = OffsetDateTime::now_utc();
        let policy = OtpPolicy {
            max_attempts: 0,
            ..OtpPolicy::default()
        };
        store.issue(uid, &digest("123456"), t0, true).await.unwrap();
        for _ in 0..50 {
            let _ = store.consume(uid, &digest("999999"), t0, &policy).await;
        }
        assert!(store
            .consume(uid, &digest("123456"), t0, &policy)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn lockout_after_max_attempts() {
        let (store, uid) = store_with_user();
        let t0 = OffsetDateTime::now_utc();
        let policy = OtpPolicy {
            max_attempts: 2,
            ..OtpPolicy::default()
        };
        store.issue(uid, &digest("123456"), t0, true).await.unwrap();
        for _ in 0..2 {
            let _ = store.consume(uid, &digest("999999"), t0, &policy).await;
        }
        let res = store.consume(uid, &digest("123456"), t0, &policy).await;
        assert!(matches!(res, Err(OtpError::TooManyAttempts)));
    }

    #[tokio::test]
    async fn newest_unused_record_is_selected() {
        let (store, uid) = store_with_user();
        let t0 = OffsetDateTime::now_utc();
        let policy = OtpPolicy::default();
        store.issue(uid, &digest("111111"), t0, false).await.unwrap();
        store
            .issue(uid, &digest("222222"), t0 + Duration::seconds(30), false)
            .await
            .unwrap();

        // Without invalidation both remain unused, but only the newest is checked.
        let old = store
            .consume(uid, &digest("111111"), t0 + Duration::minutes(1), &policy)
            .await;
        assert!(matches!(old, Err(OtpError::Mismatch)));
        store
            .consume(uid, &digest("222222"), t0 + Duration::minutes(1), &policy)
            .await
            .expect("newest code verifies");
    }

    #[tokio::test]
    async fn reissue_retires_previous_codes() {
        let (store, uid) = store_with_user();
        let t0 = OffsetDateTime::now_utc();
        store.issue(uid, &digest("111111"), t0, true).await.unwrap();
        store
            .issue(uid, &digest("222222"), t0 + Duration::seconds(1), true)
            .await
            .unwrap();
        let unused: Vec<_> = store
            .otps_for(uid)
            .into_iter()
            .filter(|r| !r.is_used)
            .collect();
        assert_eq!(unused.len(), 1);
        assert_eq!(unused[0].otp_hash, digest("222222"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_correct_submissions_consume_once() {
        let (store, uid) = store_with_user();
        let t0 = OffsetDateTime::now_utc();
        store.issue(uid, &digest("123456"), t0, true).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .consume(uid, &digest("123456"), t0, &OtpPolicy::default())
                        .await
                })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(e) => assert!(matches!(e, OtpError::NotFound)),
            }
        }
        assert_eq!(successes, 1);
        assert!(store.otps_for(uid)[0].is_used);
    }
}
