//! Registration, login and profile management.

use std::sync::Arc;

use serde::Serialize;

use crate::auth::{AuthUser, PasswordHasher, TokenSigner};
use crate::db::{CreateUserParams, Database, UpdateUserParams, UserRecord, UserStore};
use crate::error::{DatabaseError, ServiceError, ValidationError};

const MIN_PASSWORD_BYTES: usize = 8;
/// Longer passwords are rejected rather than silently truncated.
const MAX_PASSWORD_BYTES: usize = 72;
const MAX_EMAIL_CHARS: usize = 254;
const MAX_NAME_CHARS: usize = 100;
const BAD_CREDENTIALS: &str = "Incorrect email or password";

#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub token_type: &'static str,
    /// Seconds until the token expires.
    pub expires_in: i64,
    pub user: UserRecord,
}

pub struct AccountService {
    db: Arc<dyn Database>,
    hasher: PasswordHasher,
    signer: Arc<TokenSigner>,
}

impl AccountService {
    pub fn new(db: Arc<dyn Database>, hasher: PasswordHasher, signer: Arc<TokenSigner>) -> Self {
        Self { db, hasher, signer }
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: &str,
    ) -> Result<AuthResponse, ServiceError> {
        let email = normalize_email(email)?;
        validate_password(password)?;
        let name = validate_name(name)?;

        if self.db.get_user_by_email(&email).await?.is_some() {
            return Err(ServiceError::Conflict("Email already registered".to_string()));
        }

        let password_hash = self.hash_password(password.to_string()).await?;
        let user = self
            .db
            .create_user(&CreateUserParams {
                email,
                password_hash,
                name,
            })
            .await
            .map_err(|e| match e {
                // Lost a race with a concurrent registration.
                DatabaseError::Constraint(_) => {
                    ServiceError::Conflict("Email already registered".to_string())
                }
                other => other.into(),
            })?;
        tracing::info!(user_id = %user.id, "User registered");
        self.issue(user)
    }

    /// Unknown e-mail and wrong password fail identically.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, ServiceError> {
        let email = email.trim().to_lowercase();
        let Some(user) = self.db.get_user_by_email(&email).await? else {
            tracing::info!("Login failed: unknown email");
            return Err(ServiceError::Unauthorized(BAD_CREDENTIALS.to_string()));
        };

        let hasher = self.hasher;
        let candidate = password.to_string();
        let stored = user.password_hash.clone();
        let matches = tokio::task::spawn_blocking(move || hasher.verify(&candidate, &stored))
            .await
            .map_err(|e| ServiceError::Internal(format!("password check panicked: {e}")))?;
        match matches {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(user_id = %user.id, "Login failed: wrong password");
                return Err(ServiceError::Unauthorized(BAD_CREDENTIALS.to_string()));
            }
            Err(e) => {
                tracing::error!(user_id = %user.id, error = %e, "Stored password hash is unreadable");
                return Err(ServiceError::Internal(e.to_string()));
            }
        }

        self.db.record_login(user.id).await?;
        let user = self
            .db
            .get_user(user.id)
            .await?
            .ok_or_else(|| ServiceError::not_found("user"))?;
        tracing::info!(user_id = %user.id, "User logged in");
        self.issue(user)
    }

    /// Verify a bearer token and confirm its user still exists.
    pub async fn authenticate(&self, token: &str) -> Result<AuthUser, ServiceError> {
        let user = self.signer.verify(token)?;
        if self.db.get_user(user.user_id()).await?.is_none() {
            return Err(ServiceError::Unauthorized("User no longer exists".to_string()));
        }
        Ok(user)
    }

    pub async fn me(&self, user: &AuthUser) -> Result<UserRecord, ServiceError> {
        self.db
            .get_user(user.user_id())
            .await?
            .ok_or_else(|| ServiceError::not_found("user"))
    }

    pub async fn update_profile(
        &self,
        user: &AuthUser,
        name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<UserRecord, ServiceError> {
        let params = UpdateUserParams {
            name: name.map(validate_name).transpose()?,
            avatar_url: avatar_url.map(validate_avatar_url).transpose()?,
        };
        self.db
            .update_user(user.user_id(), &params)
            .await?
            .ok_or_else(|| ServiceError::not_found("user"))
    }

    /// Tokens are stateless; the client discards its copy.
    pub fn logout(&self, user: &AuthUser) {
        tracing::info!(user_id = %user.user_id(), "User logged out");
    }

    async fn hash_password(&self, password: String) -> Result<String, ServiceError> {
        let hasher = self.hasher;
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| ServiceError::Internal(format!("password hashing panicked: {e}")))?
            .map_err(|e| ServiceError::Internal(e.to_string()))
    }

    fn issue(&self, user: UserRecord) -> Result<AuthResponse, ServiceError> {
        let access_token = self
            .signer
            .issue(user.id, &user.email)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        Ok(AuthResponse {
            access_token,
            token_type: "bearer",
            expires_in: self.signer.ttl_seconds(),
            user,
        })
    }
}

fn normalize_email(raw: &str) -> Result<String, ValidationError> {
    let email = raw.trim().to_lowercase();
    let invalid = || ValidationError::new("email", "must be a valid email address");
    if email.is_empty() || email.chars().count() > MAX_EMAIL_CHARS {
        return Err(invalid());
    }
    if email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return Err(invalid());
    }
    Ok(email)
}

fn validate_password(password: &str) -> Result<(), ValidationError> {
    if password.len() < MIN_PASSWORD_BYTES {
        return Err(ValidationError::new(
            "password",
            format!("must be at least {MIN_PASSWORD_BYTES} characters"),
        ));
    }
    if password.len() > MAX_PASSWORD_BYTES {
        return Err(ValidationError::new(
            "password",
            format!("must be at most {MAX_PASSWORD_BYTES} bytes"),
        ));
    }
    Ok(())
}

fn validate_name(raw: &str) -> Result<String, ValidationError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ValidationError::new("name", "must not be empty"));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(ValidationError::new(
            "name",
            format!("must be at most {MAX_NAME_CHARS} characters"),
        ));
    }
    Ok(name.to_string())
}

fn validate_avatar_url(raw: &str) -> Result<String, ValidationError> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| ValidationError::new("avatar_url", e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::new("avatar_url", "must be an http(s) URL"));
    }
    Ok(parsed.to_string())
}
