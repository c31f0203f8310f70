use crate::api::RowId;
use crate::error::{Result, SibylError};
use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::{header, request::Parts};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;

const HASH_SCHEME: &str = "pbkdf2-sha256";
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Account a request acts on behalf of, taken from its bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub id: RowId,
}

/// `sub` holds the account id as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}
impl Claims {
    pub fn account(&self) -> Option<RowId> {
        self.sub.parse().ok()
    }
}

pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}
impl TokenKeys {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl,
        }
    }
    pub fn issue(&self, account: RowId) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: account.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| SibylError::Internal(e.into()))
    }
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            let message = match e.kind() {
                ErrorKind::ExpiredSignature => "token expired",
                _ => "invalid token",
            };
            SibylError::Unauthorized(message.to_string())
        })?;
        Ok(data.claims)
    }
}

/// Stores as `$pbkdf2-sha256$<rounds>$<salt>$<hash>`.
pub fn hash_password(password: &str, rounds: u32) -> String {
    let salt: [u8; SALT_LEN] = rand::random();
    let mut hash = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, rounds, &mut hash);
    format!(
        "${}${}${}${}",
        HASH_SCHEME,
        rounds,
        STANDARD.encode(salt),
        STANDARD.encode(hash)
    )
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let parts: Vec<&str> = stored.split('$').collect();
    let (rounds, salt, expected) = match parts.as_slice() {
        ["", scheme, rounds, salt, hash] if *scheme == HASH_SCHEME => {
            match (rounds.parse::<u32>(), STANDARD.decode(salt), STANDARD.decode(hash)) {
                (Ok(rounds), Ok(salt), Ok(hash)) if rounds > 0 => (rounds, salt, hash),
                _ => return false,
            }
        }
        _ => return false,
    };
    let mut hash = vec![0u8; expected.len()];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, rounds, &mut hash);
    hash.ct_eq(&expected).into()
}

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    Arc<TokenKeys>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = SibylError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let value = parts
            .headers
            .get(header::AUTHORIZATION)
            .ok_or_else(|| SibylError::Unauthorized("missing authorization header".to_string()))?;
        let token = value
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| {
                SibylError::Unauthorized("authorization header must be a bearer token".to_string())
            })?;
        let keys = Arc::<TokenKeys>::from_ref(state);
        let claims = keys.verify(token.trim())?;
        let id = claims
            .account()
            .ok_or_else(|| SibylError::Unauthorized("invalid token".to_string()))?;
        Ok(Principal { id })
    }
}
