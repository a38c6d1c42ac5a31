use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::Role;

/// Session token lifetime in hours
pub const ACCESS_TOKEN_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // Username
    pub role: Role,  // Role at login; requests re-read the registry
    pub exp: i64,
    pub iat: i64,
}

/// Create a session JWT for a user
pub fn create_token(secret: &str, username: &str, role: Role) -> anyhow::Result<String> {
    let now = Utc::now();
    let exp = now + Duration::hours(ACCESS_TOKEN_HOURS);

    let claims = Claims {
        sub: username.to_string(),
        role,
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

/// Verify a session JWT and return its claims
pub fn verify_token(secret: &str, token: &str) -> anyhow::Result<Claims> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;

    Ok(token_data.claims)
}
