use axum::{
    extract::{FromRef, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use time::{Duration, OffsetDateTime};
use tracing::{error, info, instrument, warn};

use crate::{
    auth::{
        dto::{
            AuthResponse, CancelResetRequest, ForgotPasswordRequest, ForgotPasswordResponse,
            LoginRequest, MeResponse, MessageResponse, OtpAuditItem, OtpAuditQuery, PublicUser,
            RefreshRequest, RegisterRequest, ResetPasswordRequest, VerifyOtpRequest,
        },
        extractors::{AuthUser, StaffUser},
        jwt::JwtKeys,
        password::{hash_password, verify_password},
        repo_types::User,
        reset::{PasswordReset, ResetError},
    },
    state::AppState,
    validation::{normalize_email, validate_new_password},
};

type ApiError = (StatusCode, String);

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

pub fn reset_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/password/forgot", get(forgot_password_prompt).post(forgot_password))
        .route("/auth/password/verify", post(verify_otp))
        .route("/auth/password/reset", post(reset_password))
        .route("/auth/password/cancel", post(cancel_reset))
}

pub fn admin_routes() -> Router<AppState> {
    Router::new().route("/admin/otps", get(list_otps))
}

fn internal(e: anyhow::Error) -> ApiError {
    error!(error = %e, "internal error");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".into())
}

fn public_user(user: &User) -> PublicUser {
    PublicUser {
        id: user.id,
        email: user.email.clone(),
        is_staff: user.is_staff,
    }
}

fn issue_tokens(state: &AppState, user: &User) -> Result<AuthResponse, ApiError> {
    let keys = JwtKeys::from_ref(state);
    let access_token = keys.sign_access(user.id, user.is_staff).map_err(internal)?;
    let refresh_token = keys.sign_refresh(user.id, user.is_staff).map_err(internal)?;
    Ok(AuthResponse {
        access_token,
        refresh_token,
        user: public_user(user),
    })
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let email = normalize_email(&payload.email).map_err(|e| {
        warn!(email = %payload.email, "invalid email");
        (StatusCode::BAD_REQUEST, e.to_string())
    })?;
    validate_new_password(&payload.password, &payload.password_confirm)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    // Ensure email is not taken
    if state.users.find_by_email(&email).await.map_err(internal)?.is_some() {
        warn!(%email, "email already registered");
        return Err((StatusCode::CONFLICT, "Email already registered".into()));
    }

    let hash = hash_password(&payload.password).map_err(internal)?;
    let user = state.users.create(&email, &hash).await.map_err(internal)?;

    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok(Json(issue_tokens(&state, &user)?))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let email = normalize_email(&payload.email)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let user = match state.users.find_by_email(&email).await.map_err(internal)? {
        Some(u) => u,
        None => {
            warn!(%email, "login unknown email");
            return Err((StatusCode::UNAUTHORIZED, "Invalid email or password".into()));
        }
    };

    if !verify_password(&payload.password, &user.password_hash).map_err(internal)? {
        warn!(%email, user_id = %user.id, "login invalid password");
        return Err((StatusCode::UNAUTHORIZED, "Invalid email or password".into()));
    }

    info!(user_id = %user.id, email = %user.email, "user logged in");
    Ok(Json(issue_tokens(&state, &user)?))
}

#[instrument(skip(state, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let keys = JwtKeys::from_ref(&state);
    let claims = keys
        .verify_refresh(&payload.refresh_token)
        .map_err(|e| (StatusCode::UNAUTHORIZED, e.to_string()))?;

    // Re-read the user so role changes apply to the new pair.
    let user = state
        .users
        .find_by_id(claims.sub)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::UNAUTHORIZED, "User not found".to_string()))?;
    Ok(Json(issue_tokens(&state, &user)?))
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<MeResponse>, ApiError> {
    let user = state
        .users
        .find_by_id(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            error!(user_id = %user_id, "user not found");
            (StatusCode::UNAUTHORIZED, "User not found".to_string())
        })?;

    let home = if user.is_staff {
        "admin-dashboard"
    } else {
        "user-dashboard"
    };
    Ok(Json(MeResponse {
        user: public_user(&user),
        home,
    }))
}

/// Landing point for redirects out of the reset flow.
pub async fn forgot_password_prompt() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "Submit your account email to receive a reset code.".into(),
    })
}

#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> Result<(StatusCode, Json<ForgotPasswordResponse>), ResetError> {
    let issued = PasswordReset::from_state(&state)
        .request(&payload.email, OffsetDateTime::now_utc())
        .await?;
    let demo_otp = state.config.otp.expose_demo.then_some(issued.code);
    Ok((
        StatusCode::ACCEPTED,
        Json(ForgotPasswordResponse {
            flow_id: issued.flow_id,
            message: "A reset code has been sent to your email address.".into(),
            demo_otp,
        }),
    ))
}

#[instrument(skip(state, payload))]
pub async fn verify_otp(
    State(state): State<AppState>,
    Json(payload): Json<VerifyOtpRequest>,
) -> Result<Json<MessageResponse>, ResetError> {
    PasswordReset::from_state(&state)
        .verify(payload.flow_id, &payload.otp, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(MessageResponse {
        message: "Code verified.".into(),
    }))
}

#[instrument(skip(state, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<MessageResponse>, ResetError> {
    PasswordReset::from_state(&state)
        .complete(
            payload.flow_id,
            &payload.password1,
            &payload.password2,
            OffsetDateTime::now_utc(),
        )
        .await?;
    Ok(Json(MessageResponse {
        message: "Password reset successfully. Please log in.".into(),
    }))
}

#[instrument(skip(state, payload))]
pub async fn cancel_reset(
    State(state): State<AppState>,
    Json(payload): Json<CancelResetRequest>,
) -> StatusCode {
    PasswordReset::from_state(&state).cancel(payload.flow_id).await;
    StatusCode::NO_CONTENT
}

#[instrument(skip(state))]
pub async fn list_otps(
    State(state): State<AppState>,
    StaffUser(_staff_id): StaffUser,
    Query(q): Query<OtpAuditQuery>,
) -> Result<Json<Vec<OtpAuditItem>>, ApiError> {
    let ttl = Duration::minutes(state.config.otp.ttl_minutes);
    let now = OffsetDateTime::now_utc();
    let rows = state
        .otps
        .list_recent(q.limit.clamp(1, 500))
        .await
        .map_err(internal)?;
    let items = rows
        .into_iter()
        .map(|r| OtpAuditItem {
            id: r.id,
            user_id: r.user_id,
            email: r.email,
            is_expired: now > r.created_at + ttl,
            created_at: r.created_at,
            is_used: r.is_used,
            attempts: r.attempts,
        })
        .collect();
    Ok(Json(items))
}
