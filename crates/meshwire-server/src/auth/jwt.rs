//! JWT session token issuance and validation.

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use meshwire_core::db::unix_timestamp;

use super::claims::Claims;

/// Default session token lifetime: 24 hours.
pub const DEFAULT_TTL_SECS: i64 = 24 * 60 * 60;

/// Manages dashboard session token creation and validation.
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_secs: i64,
}

impl JwtManager {
    /// Create a new `JwtManager` with the given secret.
    pub fn new(secret: &[u8], ttl_secs: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl_secs,
        }
    }

    /// Issue a session token for the given user.
    pub fn issue(
        &self,
        user_id: i64,
        username: &str,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = unix_timestamp();

        let claims = Claims {
            jti: uuid::Uuid::new_v4().to_string(),
            sub: user_id,
            username: username.to_string(),
            iat: now,
            exp: now + self.ttl_secs,
        };

        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
    }

    /// Validate a token and return its claims.
    pub fn validate(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let data =
            jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &Validation::default())?;
        Ok(data.claims)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_jwt() -> JwtManager {
        JwtManager::new(b"test-secret-key-for-testing", 3600)
    }

    #[test]
    fn issue_and_validate() {
        let jwt = test_jwt();
        let token = jwt.issue(1, "alice").unwrap();

        let claims = jwt.validate(&token).unwrap();
        assert_eq!(claims.sub, 1);
        assert_eq!(claims.username, "alice");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn invalid_token_fails_validation() {
        let jwt = test_jwt();
        assert!(jwt.validate("not-a-valid-token").is_err());
    }

    #[test]
    fn wrong_secret_fails_validation() {
        let jwt1 = test_jwt();
        let jwt2 = JwtManager::new(b"different-secret", 3600);

        let token = jwt1.issue(1, "alice").unwrap();
        assert!(jwt2.validate(&token).is_err());
    }

    #[test]
    fn tokens_carry_unique_ids() {
        let jwt = test_jwt();
        let a = jwt.validate(&jwt.issue(1, "alice").unwrap()).unwrap();
        let b = jwt.validate(&jwt.issue(1, "alice").unwrap()).unwrap();
        assert_ne!(a.jti, b.jti);
    }
}
