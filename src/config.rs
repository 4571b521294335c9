use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
}

/// Knobs for one-time passcodes issued during password reset.
#[derive(Debug, Clone, Deserialize)]
pub struct OtpConfig {
    pub ttl_minutes: i64,
    /// Failed guesses allowed per record; 0 disables the limit.
    pub max_attempts: i32,
    /// Mark older unused codes as used when a new one is issued.
    pub invalidate_previous: bool,
    /// Echo the plaintext code in the forgot-password response (dev only).
    pub expose_demo: bool,
    pub flow_ttl_minutes: i64,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: 5,
            max_attempts: 5,
            invalidate_previous: true,
            expose_demo: false,
            flow_ttl_minutes: 15,
        }
    }
}

/// Upper bound for any configured lifetime, in minutes (one year).
pub const MAX_TTL_MINUTES: i64 = 60 * 24 * 365;

fn check_ttl(key: &str, minutes: i64) -> anyhow::Result<()> {
    anyhow::ensure!(
        (1..=MAX_TTL_MINUTES).contains(&minutes),
        "{key} must be between 1 and {MAX_TTL_MINUTES} minutes, got {minutes}"
    );
    Ok(())
}

impl OtpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        check_ttl("OTP_TTL_MINUTES", self.ttl_minutes)?;
        check_ttl("RESET_FLOW_TTL_MINUTES", self.flow_ttl_minutes)?;
        anyhow::ensure!(
            self.max_attempts >= 0,
            "OTP_MAX_ATTEMPTS must not be negative, got {}",
            self.max_attempts
        );
        Ok(())
    }
}

impl JwtConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        check_ttl("JWT_TTL_MINUTES", self.ttl_minutes)?;
        check_ttl("JWT_REFRESH_TTL_MINUTES", self.refresh_ttl_minutes)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt: JwtConfig,
    pub otp: OtpConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "docboard".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "docboard-users".into()),
            ttl_minutes: env_parse("JWT_TTL_MINUTES").unwrap_or(60),
            refresh_ttl_minutes: env_parse("JWT_REFRESH_TTL_MINUTES").unwrap_or(60 * 24 * 14),
        };
        let defaults = OtpConfig::default();
        let otp = OtpConfig {
            ttl_minutes: env_parse("OTP_TTL_MINUTES").unwrap_or(defaults.ttl_minutes),
            max_attempts: env_parse("OTP_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            invalidate_previous: env_parse("OTP_INVALIDATE_PREVIOUS")
                .unwrap_or(defaults.invalidate_previous),
            expose_demo: env_parse("OTP_EXPOSE_DEMO").unwrap_or(defaults.expose_demo),
            flow_ttl_minutes: env_parse("RESET_FLOW_TTL_MINUTES")
                .unwrap_or(defaults.flow_ttl_minutes),
        };
        jwt.validate()?;
        otp.validate()?;
        Ok(Self {
            database_url,
            jwt,
            otp,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}
