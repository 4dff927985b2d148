//! Password hashing and bearer tokens.
//!
//! Passwords are stored as PBKDF2-HMAC-SHA256 strings of the form
//! `pbkdf2-sha256$<iterations>$<salt>$<hash>`. Bearer tokens are
//! `base64url(claims).base64url(hmac)` signed with the configured secret.
//! A verified token yields an [`AuthUser`], which is the only way service
//! operations learn who is calling.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

const HASH_SCHEME: &str = "pbkdf2-sha256";
const SALT_LEN: usize = 16;

/// Proof that the caller presented a valid bearer token.
///
/// Only token verification can construct one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    user_id: Uuid,
    email: String,
}

impl AuthUser {
    pub(crate) fn new(user_id: Uuid, email: impl Into<String>) -> Self {
        Self {
            user_id,
            email: email.into(),
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn email(&self) -> &str {
        &self.email
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PasswordHasher {
    iterations: u32,
}

impl PasswordHasher {
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
        }
    }

    pub fn hash(&self, password: &str) -> Result<String, AuthError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let derived = pbkdf2_sha256(password.as_bytes(), &salt, self.iterations)?;
        Ok(format!(
            "{HASH_SCHEME}${}${}${}",
            self.iterations,
            STANDARD_NO_PAD.encode(salt),
            STANDARD_NO_PAD.encode(derived)
        ))
    }

    /// Checks `password` against a stored hash, whatever its iteration count.
    pub fn verify(&self, password: &str, encoded: &str) -> Result<bool, AuthError> {
        let mut parts = encoded.split('$');
        let (Some(scheme), Some(iterations), Some(salt), Some(expected), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(AuthError::BadHash("expected four '$'-separated fields".to_string()));
        };
        if scheme != HASH_SCHEME {
            return Err(AuthError::BadHash(format!("unsupported scheme '{scheme}'")));
        }
        let iterations: u32 = iterations
            .parse()
            .map_err(|_| AuthError::BadHash("invalid iteration count".to_string()))?;
        let salt = STANDARD_NO_PAD
            .decode(salt)
            .map_err(|e| AuthError::BadHash(format!("salt: {e}")))?;
        let expected = STANDARD_NO_PAD
            .decode(expected)
            .map_err(|e| AuthError::BadHash(format!("hash: {e}")))?;

        let derived = pbkdf2_sha256(password.as_bytes(), &salt, iterations)?;
        Ok(bool::from(derived.as_slice().ct_eq(expected.as_slice())))
    }
}

/// Single-block PBKDF2 (32-byte output).
fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> Result<[u8; 32], AuthError> {
    let prf = HmacSha256::new_from_slice(password).map_err(|e| AuthError::BadHash(e.to_string()))?;

    let mut mac = prf.clone();
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u = [0u8; 32];
    u.copy_from_slice(&mac.finalize().into_bytes());
    let mut out = u;

    for _ in 1..iterations {
        let mut mac = prf.clone();
        mac.update(&u);
        u.copy_from_slice(&mac.finalize().into_bytes());
        for (o, b) in out.iter_mut().zip(u.iter()) {
            *o ^= b;
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Claims {
    sub: Uuid,
    email: String,
    iat: i64,
    exp: i64,
}

pub struct TokenSigner {
    secret: SecretString,
    ttl: Duration,
}

/// Longest accepted token lifetime, 366 days.
pub const MAX_TOKEN_TTL_HOURS: i64 = 24 * 366;

impl TokenSigner {
    /// `ttl_hours` is clamped into `1..=MAX_TOKEN_TTL_HOURS`.
    pub fn new(secret: SecretString, ttl_hours: i64) -> Self {
        Self {
            secret,
            ttl: Duration::hours(ttl_hours.clamp(1, MAX_TOKEN_TTL_HOURS)),
        }
    }

    pub fn ttl_seconds(&self) -> i64 {
        self.ttl.num_seconds()
    }

    pub fn issue(&self, user_id: Uuid, email: &str) -> Result<String, AuthError> {
        self.issue_at(user_id, email, Utc::now())
    }

    pub fn issue_at(&self, user_id: Uuid, email: &str, now: DateTime<Utc>) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        let body = serde_json::to_vec(&claims).map_err(|_| AuthError::Malformed)?;
        let body = URL_SAFE_NO_PAD.encode(body);
        let signature = URL_SAFE_NO_PAD.encode(self.sign(body.as_bytes())?);
        Ok(format!("{body}.{signature}"))
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, AuthError> {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<AuthUser, AuthError> {
        let (body, signature) = token.trim().split_once('.').ok_or(AuthError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::Malformed)?;

        let mut mac = self.mac()?;
        mac.update(body.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let raw = URL_SAFE_NO_PAD.decode(body).map_err(|_| AuthError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&raw).map_err(|_| AuthError::Malformed)?;
        if claims.exp <= now.timestamp() {
            return Err(AuthError::Expired);
        }
        Ok(AuthUser::new(claims.sub, claims.email))
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| AuthError::BadSignature)
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new(
            SecretString::from("0123456789abcdef0123456789abcdef".to_string()),
            24,
        )
    }

    #[test]
    fn pbkdf2_matches_rfc_7914_vector() {
        // RFC 7914 section 11, PBKDF2-HMAC-SHA256("passwd", "salt", 1).
        let derived = pbkdf2_sha256(b"passwd", b"salt", 1).unwrap();
        assert_eq!(
            derived[..8],
            [0x55, 0xac, 0x04, 0x6e, 0x56, 0xe3, 0x08, 0x9f]
        );
    }

    #[test]
    fn password_round_trip() {
        let hasher = PasswordHasher::new(1_000);
        let encoded = hasher.hash("correct horse").unwrap();
        assert!(encoded.starts_with("pbkdf2-sha256$1000$"));
        assert!(hasher.verify("correct horse", &encoded).unwrap());
        assert!(!hasher.verify("wrong horse", &encoded).unwrap());
        assert_ne!(encoded, hasher.hash("correct horse").unwrap(), "salt must vary");
    }

    #[test]
    fn verify_honours_stored_iteration_count() {
        let encoded = PasswordHasher::new(10).hash("pw123456").unwrap();
        assert!(PasswordHasher::new(5_000).verify("pw123456", &encoded).unwrap());
    }

    #[test]
    fn malformed_hashes_are_errors() {
        let hasher = PasswordHasher::new(10);
        for bad in ["", "plain", "bcrypt$10$abc$def", "pbkdf2-sha256$x$abc$def", "a$b$c$d$e"] {
            assert!(hasher.verify("pw", bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn token_round_trip() {
        let signer = signer();
        let id = Uuid::new_v4();
        let token = signer.issue(id, "a@example.com").unwrap();
        let user = signer.verify(&token).unwrap();
        assert_eq!(user.user_id(), id);
        assert_eq!(user.email(), "a@example.com");
    }

    #[test]
    fn tampered_and_foreign_tokens_are_rejected() {
        let signer = signer();
        let token = signer.issue(Uuid::new_v4(), "a@example.com").unwrap();

        let (body, sig) = token.split_once('.').unwrap();
        let forged_body = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&Claims {
                sub: Uuid::new_v4(),
                email: "evil@example.com".into(),
                iat: 0,
                exp: i64::MAX,
            })
            .unwrap(),
        );
        assert_eq!(signer.verify(&format!("{forged_body}.{sig}")), Err(AuthError::BadSignature));
        assert_eq!(signer.verify(body), Err(AuthError::Malformed));
        assert_eq!(signer.verify("a.b.c"), Err(AuthError::Malformed));

        let other = TokenSigner::new(SecretString::from("another-secret-another-secret-xx".to_string()), 24);
        assert_eq!(other.verify(&token), Err(AuthError::BadSignature));
    }

    #[test]
    fn oversized_ttl_is_clamped() {
        let signer = TokenSigner::new(
            SecretString::from("0123456789abcdef0123456789abcdef".to_string()),
            i64::MAX,
        );
        assert_eq!(signer.ttl_seconds(), MAX_TOKEN_TTL_HOURS * 3600);
        let token = signer.issue(Uuid::new_v4(), "a@example.com").unwrap();
        assert!(signer.verify(&token).is_ok());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let signer = signer();
        let issued = Utc::now() - Duration::hours(25);
        let token = signer.issue_at(Uuid::new_v4(), "a@example.com", issued).unwrap();
        assert_eq!(signer.verify(&token), Err(AuthError::Expired));
    }
}
