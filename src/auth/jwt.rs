//! JWT session tokens (HS256) carrying the wallet address and role.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Lowercased wallet address.
    pub sub: String,
    pub role: String,
    pub iat: usize,
    pub exp: usize,
}

impl Claims {
    pub fn is_owner(&self) -> bool {
        self.role == "owner"
    }
}

pub struct JwtHandler {
    secret: String,
    expiry_hours: i64,
}

impl JwtHandler {
    pub fn new(secret: String, expiry_hours: i64) -> Self {
        Self {
            secret,
            expiry_hours,
        }
    }

    /// Issue a token for an authenticated wallet. Returns the token and its
    /// expiry instant.
    pub fn generate_token(&self, address: &str, role: &str) -> Result<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(Duration::hours(self.expiry_hours))
            .context("invalid expiry")?;

        let claims = Claims {
            sub: address.to_lowercase(),
            role: role.to_string(),
            iat: now.timestamp() as usize,
            exp: expires_at.timestamp() as usize,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("failed to encode JWT")?;

        Ok((token, expires_at))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .context("invalid or expired token")?;
        Ok(decoded.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_validate_roundtrip() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string(), 72);

        let (token, expires_at) = handler.generate_token("0xABCD", "user").unwrap();
        assert!(!token.is_empty());
        assert!(expires_at > Utc::now());

        let claims = handler.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "0xabcd");
        assert_eq!(claims.role, "user");
        assert!(!claims.is_owner());
    }

    #[test]
    fn test_owner_role_claim() {
        let handler = JwtHandler::new("s".repeat(32), 1);
        let (token, _) = handler.generate_token("0xowner", "owner").unwrap();
        assert!(handler.validate_token(&token).unwrap().is_owner());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let a = JwtHandler::new("secret-a".to_string(), 72);
        let b = JwtHandler::new("secret-b".to_string(), 72);

        let (token, _) = a.generate_token("0xabcd", "user").unwrap();
        assert!(b.validate_token(&token).is_err());
        assert!(a.validate_token("garbage.token.here").is_err());
    }
}
