//! Bearer credentials and caller identity
//!
//! A connection authenticates once, at handshake time, with an HS256 JWT.
//! The verified claims are then trusted for the lifetime of the connection;
//! every hub operation turns them into a `UserId` with
//! [`user_id_from_claims`].
//!
//! Credentials come from the admin CLI or from logging in with a password
//! (see [`password`]).

pub mod password;

pub use password::{hash_password, verify_password, PasswordError};

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{User, UserId};

/// Claims carried by a bearer credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (username)
    pub sub: String,
    /// Numeric user id, as a string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    pub iss: String,
    pub aud: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

/// The caller's claims do not identify a user
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Missing user id claim")]
    MissingUserId,

    #[error("Unparseable user id claim: {0:?}")]
    InvalidUserId(String),
}

/// Resolve the numeric user id from verified claims
pub fn user_id_from_claims(claims: &Claims) -> Result<UserId, IdentityError> {
    let raw = claims
        .uid
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or(IdentityError::MissingUserId)?;

    raw.trim()
        .parse::<UserId>()
        .map_err(|_| IdentityError::InvalidUserId(raw.to_string()))
}

/// Token errors
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Missing bearer credential")]
    Missing,

    #[error("Invalid bearer credential: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),

    #[error("Signing secret must not be empty")]
    EmptySecret,
}

/// Settings for issuing and verifying tokens
#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl: Duration,
}

/// Issues and verifies bearer credentials
#[derive(Clone)]
pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    audience: String,
    ttl: Duration,
}

impl TokenAuthority {
    pub fn new(settings: TokenSettings) -> Result<Self, TokenError> {
        if settings.secret.is_empty() {
            return Err(TokenError::EmptySecret);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[settings.issuer.as_str()]);
        validation.set_audience(&[settings.audience.as_str()]);
        validation.leeway = 30;

        Ok(Self {
            encoding: EncodingKey::from_secret(settings.secret.as_bytes()),
            decoding: DecodingKey::from_secret(settings.secret.as_bytes()),
            validation,
            issuer: settings.issuer,
            audience: settings.audience,
            ttl: settings.ttl,
        })
    }

    /// Claims for `user`, valid from now for the configured lifetime
    pub fn claims_for(&self, user: &User) -> Claims {
        let now = Utc::now();
        Claims {
            sub: user.username.clone(),
            uid: Some(user.id.to_string()),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        }
    }

    /// Issue a credential for `user`
    pub fn issue(&self, user: &User) -> Result<String, TokenError> {
        self.sign(&self.claims_for(user))
    }

    /// Sign arbitrary claims
    pub fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        Ok(encode(&Header::new(Algorithm::HS256), claims, &self.encoding)?)
    }

    /// Verify signature, issuer, audience and expiry
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(TokenError::Missing);
        }
        Ok(decode::<Claims>(token, &self.decoding, &self.validation)?.claims)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority(secret: &str) -> TokenAuthority {
        TokenAuthority::new(TokenSettings {
            secret: secret.to_string(),
            issuer: "roomchat".to_string(),
            audience: "roomchat-clients".to_string(),
            ttl: Duration::minutes(60),
        })
        .unwrap()
    }

    fn alice() -> User {
        User {
            id: 7,
            username: "alice".to_string(),
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let tokens = authority("s3cret");
        let token = tokens.issue(&alice()).unwrap();

        let claims = tokens.verify(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(user_id_from_claims(&claims), Ok(7));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = authority("one").issue(&alice()).unwrap();
        assert!(matches!(
            authority("two").verify(&token),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let tokens = authority("s3cret");
        let mut claims = tokens.claims_for(&alice());
        claims.exp = Utc::now().timestamp() - 3600;
        let token = tokens.sign(&claims).unwrap();
        assert!(tokens.verify(&token).is_err());
    }

    #[test]
    fn test_empty_token_is_missing() {
        assert!(matches!(authority("s").verify("  "), Err(TokenError::Missing)));
    }

    #[test]
    fn test_token_without_uid_still_verifies() {
        let tokens = authority("s3cret");
        let mut claims = tokens.claims_for(&alice());
        claims.uid = None;
        let token = tokens.sign(&claims).unwrap();

        let verified = tokens.verify(&token).unwrap();
        assert_eq!(
            user_id_from_claims(&verified),
            Err(IdentityError::MissingUserId)
        );
    }

    #[test]
    fn test_user_id_parsing() {
        let mut claims = authority("s").claims_for(&alice());

        claims.uid = Some("42".to_string());
        assert_eq!(user_id_from_claims(&claims), Ok(42));

        claims.uid = Some("".to_string());
        assert_eq!(
            user_id_from_claims(&claims),
            Err(IdentityError::MissingUserId)
        );

        claims.uid = Some("abc".to_string());
        assert_eq!(
            user_id_from_claims(&claims),
            Err(IdentityError::InvalidUserId("abc".to_string()))
        );
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc.def"), Some("abc.def"));
        assert_eq!(bearer_token("bearer  abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }

    #[test]
    fn test_empty_secret_rejected() {
        let result = TokenAuthority::new(TokenSettings {
            secret: String::new(),
            issuer: "i".to_string(),
            audience: "a".to_string(),
            ttl: Duration::minutes(1),
        });
        assert!(matches!(result, Err(TokenError::EmptySecret)));
    }
}
