//! Password reset: request a code, verify it, then set a new password.
//!
//! Each reset runs inside a [`ResetFlow`] context identified by a random id
//! that the client echoes back on every step. A step that cannot find the
//! context it expects sends the client back to the start of the flow.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::delivery::OtpSender;
use crate::auth::otp::{digest, generate_code, OtpError, OtpPolicy};
use crate::auth::password::hash_password;
use crate::auth::repo::{OtpStore, UserStore};
use crate::state::AppState;
use crate::validation::{normalize_email, validate_new_password, validate_otp_code, ValidationError};

pub const FORGOT_PATH: &str = "/api/v1/auth/password/forgot";

/// Generic text for every code failure; the reason is only logged.
pub const INVALID_CODE_MESSAGE: &str = "Invalid or expired code";

#[derive(Debug, Error)]
pub enum ResetError {
    #[error("no account for this email")]
    UserNotFound,
    #[error("reset flow missing or expired")]
    SessionStateMissing,
    #[error(transparent)]
    Otp(OtpError),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<OtpError> for ResetError {
    fn from(e: OtpError) -> Self {
        match e {
            OtpError::Internal(inner) => ResetError::Internal(inner),
            other => ResetError::Otp(other),
        }
    }
}

impl IntoResponse for ResetError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self {
            ResetError::UserNotFound | ResetError::SessionStateMissing => {
                return Redirect::to(FORGOT_PATH).into_response();
            }
            ResetError::Otp(reason) => {
                warn!(%reason, "otp verification failed");
                (
                    StatusCode::BAD_REQUEST,
                    "invalid_code",
                    INVALID_CODE_MESSAGE.to_string(),
                )
            }
            ResetError::Invalid(e) => (StatusCode::BAD_REQUEST, "invalid_input", e.to_string()),
            ResetError::Internal(e) => {
                error!(error = %e, "password reset failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "Internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}

#[derive(Debug, Clone)]
pub struct ResetFlow {
    pub user_id: Uuid,
    pub email: String,
    pub verified: bool,
    pub created_at: OffsetDateTime,
}

/// In-memory reset contexts; entries older than `ttl` are treated as absent.
#[derive(Clone)]
pub struct ResetFlows {
    flows: Arc<RwLock<HashMap<Uuid, ResetFlow>>>,
    ttl: Duration,
}

impl ResetFlows {
    pub fn new(ttl: Duration) -> Self {
        Self {
            flows: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    fn is_live(&self, flow: &ResetFlow, now: OffsetDateTime) -> bool {
        now <= flow.created_at + self.ttl
    }

    pub async fn start(&self, user_id: Uuid, email: String, now: OffsetDateTime) -> Uuid {
        let id = Uuid::new_v4();
        let mut flows = self.flows.write().await;
        flows.retain(|_, f| now <= f.created_at + self.ttl);
        flows.insert(
            id,
            ResetFlow {
                user_id,
                email,
                verified: false,
                created_at: now,
            },
        );
        id
    }

    pub async fn get(&self, id: Uuid, now: OffsetDateTime) -> Option<ResetFlow> {
        let flows = self.flows.read().await;
        flows.get(&id).filter(|f| self.is_live(f, now)).cloned()
    }

    pub async fn mark_verified(&self, id: Uuid, now: OffsetDateTime) -> bool {
        let mut flows = self.flows.write().await;
        match flows.get_mut(&id) {
            Some(flow) if now <= flow.created_at + self.ttl => {
                flow.verified = true;
                true
            }
            _ => false,
        }
    }

    /// Removes and returns the flow only if it is live and verified, so a
    /// verified flow authorises exactly one password change.
    pub async fn take_verified(&self, id: Uuid, now: OffsetDateTime) -> Option<ResetFlow> {
        let mut flows = self.flows.write().await;
        let ready = flows
            .get(&id)
            .is_some_and(|f| f.verified && now <= f.created_at + self.ttl);
        if ready {
            flows.remove(&id)
        } else {
            None
        }
    }

    pub async fn restore(&self, id: Uuid, flow: ResetFlow) {
        self.flows.write().await.insert(id, flow);
    }

    pub async fn remove(&self, id: Uuid) -> bool {
        self.flows.write().await.remove(&id).is_some()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.flows.read().await.len()
    }
}

/// Result of a successful reset request.
#[derive(Debug)]
pub struct IssuedReset {
    pub flow_id: Uuid,
    pub code: String,
}

pub struct PasswordReset<'a> {
    users: &'a dyn UserStore,
    otps: &'a dyn OtpStore,
    sender: &'a dyn OtpSender,
    flows: &'a ResetFlows,
    policy: OtpPolicy,
}

impl<'a> PasswordReset<'a> {
    pub fn new(
        users: &'a dyn UserStore,
        otps: &'a dyn OtpStore,
        sender: &'a dyn OtpSender,
        flows: &'a ResetFlows,
        policy: OtpPolicy,
    ) -> Self {
        Self {
            users,
            otps,
            sender,
            flows,
            policy,
        }
    }

    pub fn from_state(state: &'a AppState) -> Self {
        Self::new(
            state.users.as_ref(),
            state.otps.as_ref(),
            state.otp_sender.as_ref(),
            &state.reset_flows,
            OtpPolicy::from(&state.config.otp),
        )
    }

    /// Idle -> OTPRequested.
    pub async fn request(
        &self,
        raw_email: &str,
        now: OffsetDateTime,
    ) -> Result<IssuedReset, ResetError> {
        let email = normalize_email(raw_email)?;
        let user = self
            .users
            .find_by_email(&email)
            .await?
            .ok_or(ResetError::UserNotFound)?;

        let code = generate_code();
        self.otps
            .issue(user.id, &digest(&code), now, self.policy.invalidate_previous)
            .await?;
        self.sender.send(&user.email, &code).await?;

        let flow_id = self.flows.start(user.id, user.email, now).await;
        info!(user_id = %user.id, %flow_id, "password reset requested");
        Ok(IssuedReset { flow_id, code })
    }

    /// OTPRequested -> OTPVerified.
    pub async fn verify(
        &self,
        flow_id: Option<Uuid>,
        raw_code: &str,
        now: OffsetDateTime,
    ) -> Result<(), ResetError> {
        let flow_id = flow_id.ok_or(ResetError::SessionStateMissing)?;
        let flow = self
            .flows
            .get(flow_id, now)
            .await
            .ok_or(ResetError::SessionStateMissing)?;
        let code = validate_otp_code(raw_code)?;

        self.otps
            .consume(flow.user_id, &digest(&code), now, &self.policy)
            .await?;

        if !self.flows.mark_verified(flow_id, now).await {
            return Err(ResetError::SessionStateMissing);
        }
        info!(user_id = %flow.user_id, %flow_id, "reset code verified");
        Ok(())
    }

    /// OTPVerified -> Completed (and back to Idle).
    pub async fn complete(
        &self,
        flow_id: Option<Uuid>,
        password: &str,
        confirm: &str,
        now: OffsetDateTime,
    ) -> Result<Uuid, ResetError> {
        let flow_id = flow_id.ok_or(ResetError::SessionStateMissing)?;
        match self.flows.get(flow_id, now).await {
            Some(flow) if flow.verified => {}
            _ => return Err(ResetError::SessionStateMissing),
        }
        validate_new_password(password, confirm)?;
        let hash = hash_password(password)?;

        let flow = self
            .flows
            .take_verified(flow_id, now)
            .await
            .ok_or(ResetError::SessionStateMissing)?;
        if let Err(e) = self.users.set_password(flow.user_id, &hash).await {
            self.flows.restore(flow_id, flow).await;
            return Err(e.into());
        }
        info!(user_id = %flow.user_id, email = %flow.email, %flow_id, "password reset completed");
        Ok(flow.user_id)
    }

    /// Abandons a flow; unknown ids are ignored.
    pub async fn cancel(&self, flow_id: Option<Uuid>) {
        if let Some(id) = flow_id {
            if self.flows.remove(id).await {
                info!(flow_id = %id, "password reset cancelled");
            }
        }
    }
}
