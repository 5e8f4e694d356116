//! JWT access tokens
//!
//! HS256 only — the decoding path pins the algorithm so a token cannot talk
//! us into `none` or an asymmetric scheme. Claims carry the subject, role,
//! and an audience discriminator separating interactive users from panels.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::auth::roles::Role;
use crate::error::{Error, Result};

/// Audience discriminator
pub const AUD_USER: &str = "user";
pub const AUD_PANEL: &str = "panel";

/// Access token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: user or panel id
    pub sub: String,
    /// Role name
    pub role: String,
    /// `user` or `panel`
    pub aud: String,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Expiry (unix seconds)
    pub exp: i64,
}

impl Claims {
    /// Parse the role claim
    pub fn role(&self) -> Result<Role> {
        self.role.parse()
    }

    #[must_use]
    pub fn is_panel(&self) -> bool {
        self.aud == AUD_PANEL
    }
}

/// Issues and verifies access tokens
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
}

impl TokenService {
    /// Build from the configured secret; rejects secrets under 32 bytes
    pub fn new(secret: &str, access_ttl_minutes: i64) -> Result<Self> {
        if secret.len() < 32 {
            return Err(Error::ConfigInvalid(
                "jwt secret must be at least 32 bytes".to_string(),
            ));
        }
        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl: Duration::minutes(access_ttl_minutes),
        })
    }

    /// Issue an access token for a subject
    pub fn issue(&self, subject: &str, role: Role, audience: &str) -> Result<String> {
        if audience != AUD_USER && audience != AUD_PANEL {
            return Err(Error::Internal(format!("unknown audience '{audience}'")));
        }
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            role: role.as_str().to_string(),
            aud: audience.to_string(),
            iat: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("token encode: {e}")))
    }

    /// Verify a token and return its claims.
    ///
    /// The signing algorithm is pinned, the audience must be known, and the
    /// subject and role must be non-empty.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[AUD_USER, AUD_PANEL]);
        validation.set_required_spec_claims(&["exp", "sub", "aud"]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    Error::Unauthenticated("access token expired".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                    Error::Unauthenticated("unknown token audience".to_string())
                }
                _ => Error::Unauthenticated("invalid access token".to_string()),
            }
        })?;

        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(Error::Unauthenticated("token missing subject".to_string()));
        }
        if claims.role.is_empty() {
            return Err(Error::Unauthenticated("token missing role".to_string()));
        }
        claims.role()?;
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn service() -> TokenService {
        TokenService::new(SECRET, 15).unwrap()
    }

    #[test]
    fn short_secret_is_rejected() {
        assert!(TokenService::new("short", 15).is_err());
    }

    #[test]
    fn issue_and_verify_round_trip() {
        let service = service();
        let token = service.issue("user-1", Role::Admin, AUD_USER).unwrap();
        let claims = service.verify(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.role().unwrap(), Role::Admin);
        assert!(!claims.is_panel());
    }

    #[test]
    fn panel_audience_round_trip() {
        let service = service();
        let token = service.issue("panel-1", Role::Panel, AUD_PANEL).unwrap();
        let claims = service.verify(&token).unwrap();
        assert!(claims.is_panel());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let service = service();
        let token = service.issue("user-1", Role::User, AUD_USER).unwrap();
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push(if token.ends_with('A') { 'B' } else { 'A' });
        assert!(service.verify(&tampered).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = service().issue("user-1", Role::User, AUD_USER).unwrap();
        let other = TokenService::new("ffffffffffffffffffffffffffffffff", 15).unwrap();
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn algorithm_confusion_is_rejected() {
        // A token signed with a different algorithm must not validate, even
        // with the right secret bytes.
        let claims = Claims {
            sub: "user-1".into(),
            role: "user".into(),
            aud: AUD_USER.into(),
            iat: Utc::now().timestamp(),
            exp: (Utc::now() + Duration::minutes(5)).timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS384),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(service().verify(&token).is_err());
    }

    #[test]
    fn expired_token_maps_to_unauthenticated() {
        let service = TokenService::new(SECRET, -1).unwrap();
        let token = service.issue("user-1", Role::User, AUD_USER).unwrap();
        let err = service.verify(&token).unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }

    #[test]
    fn unknown_audience_is_rejected() {
        let claims = Claims {
            sub: "user-1".into(),
            role: "user".into(),
            aud: "mobile".into(),
            iat: Utc::now().timestamp(),
            exp: (Utc::now() + Duration::minutes(5)).timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(service().verify(&token).is_err());
    }
}
