//! Authorization core: users, roles, passwords, tokens, panels, scoping
//!
//! `AuthService` is the facade the API layer talks to. Argon2 work runs on
//! the blocking pool; the request path never stalls the runtime on a hash.

pub mod panels;
pub mod password;
pub mod rate_limit;
pub mod refresh;
pub mod roles;
pub mod scope;
pub mod tickets;
pub mod tokens;
pub mod users;

use sqlx::SqlitePool;
use std::sync::Arc;

use crate::audit::{AuditLogger, AuditRecord};
use crate::config::AuthConfig;
use crate::error::{Error, Result};

pub use panels::{Panel, PanelContext, PanelStore};
pub use password::PasswordHasher;
pub use rate_limit::{client_ip, RateLimiter, LOGIN_LIMIT, REFRESH_LIMIT};
pub use refresh::{RefreshStore, Rotation, RotationOutcome};
pub use roles::{permissions_for, role_has, Permission, Role};
pub use scope::RoomScope;
pub use tickets::TicketStore;
pub use tokens::{Claims, TokenService, AUD_PANEL, AUD_USER};
pub use users::{RoomGrant, User, UserStore};

/// Result of a successful login or refresh
#[derive(Debug, serde::Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Facade over the authorization stores
#[derive(Clone)]
pub struct AuthService {
    pub users: UserStore,
    pub refresh: RefreshStore,
    pub tickets: TicketStore,
    pub panels: PanelStore,
    pub tokens: TokenService,
    hasher: PasswordHasher,
    audit: AuditLogger,
}

impl AuthService {
    pub fn new(pool: SqlitePool, config: &AuthConfig, audit: AuditLogger) -> Result<Self> {
        Ok(Self {
            users: UserStore::new(pool.clone()),
            refresh: RefreshStore::new(pool.clone(), config.refresh_ttl_days),
            tickets: TicketStore::new(pool.clone()),
            panels: PanelStore::new(pool),
            tokens: TokenService::new(&config.jwt_secret, config.access_ttl_minutes)?,
            hasher: PasswordHasher::new(),
            audit,
        })
    }

    /// Hash a password on the blocking pool
    pub async fn hash_password(&self, password: &str) -> Result<String> {
        PasswordHasher::check_length(password)?;
        let hasher = self.hasher.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| Error::Internal(format!("hash task: {e}")))?
    }

    async fn verify_password(&self, password: &str, hash: &str) -> Result<bool> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| Error::Internal(format!("verify task: {e}")))?
    }

    /// Username/password login; issues an access token and a new refresh
    /// family.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        device_info: Option<&str>,
    ) -> Result<(TokenPair, User)> {
        if password.len() > 128 {
            return Err(Error::Unauthenticated("invalid credentials".to_string()));
        }
        let Some(user) = self.users.get_by_username(username).await? else {
            // Burn comparable time so unknown usernames are not observable
            let _ = self
                .verify_password(password, DUMMY_HASH)
                .await;
            return Err(Error::Unauthenticated("invalid credentials".to_string()));
        };
        if !user.is_active {
            return Err(Error::Unauthenticated("account disabled".to_string()));
        }
        if !self.verify_password(password, &user.password_hash).await? {
            self.audit
                .log(AuditRecord::auth("login_failed", &user.id))
                .await;
            return Err(Error::Unauthenticated("invalid credentials".to_string()));
        }

        let audience = if user.role == Role::Panel { AUD_PANEL } else { AUD_USER };
        let access_token = self.tokens.issue(&user.id, user.role, audience)?;
        let (refresh_token, _family) = self.refresh.issue_family(&user.id, device_info).await?;

        self.audit.log(AuditRecord::auth("login", &user.id)).await;
        Ok((
            TokenPair {
                access_token,
                refresh_token,
            },
            user,
        ))
    }

    /// Rotate a refresh token into a new token pair
    pub async fn refresh(&self, presented: &str) -> Result<TokenPair> {
        match self.refresh.rotate(presented).await? {
            RotationOutcome::Rotated(rotation) => {
                let user = self.users.get(&rotation.user_id).await?;
                if !user.is_active {
                    return Err(Error::Unauthenticated("account disabled".to_string()));
                }
                let audience = if user.role == Role::Panel { AUD_PANEL } else { AUD_USER };
                let access_token = self.tokens.issue(&user.id, user.role, audience)?;
                Ok(TokenPair {
                    access_token,
                    refresh_token: rotation.new_secret,
                })
            }
            RotationOutcome::TheftDetected { user_id, family_id } => {
                self.audit
                    .log(
                        AuditRecord::auth("refresh_reuse_detected", &user_id)
                            .with_details(serde_json::json!({ "family_id": family_id })),
                    )
                    .await;
                Err(Error::Unauthenticated(
                    "refresh token reuse detected".to_string(),
                ))
            }
        }
    }

    /// Revoke the presented token's family
    pub async fn logout(&self, refresh_token: &str, user_id: &str) -> Result<()> {
        self.refresh.revoke_by_secret(refresh_token).await?;
        self.audit.log(AuditRecord::auth("logout", user_id)).await;
        Ok(())
    }

    /// Verify the old password, set the new one, and revoke every session
    pub async fn change_password(
        &self,
        user_id: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        let user = self.users.get(user_id).await?;
        if !self.verify_password(old_password, &user.password_hash).await? {
            return Err(Error::Unauthenticated("invalid credentials".to_string()));
        }
        let new_hash = self.hash_password(new_password).await?;
        self.users.set_password_hash(user_id, &new_hash).await?;
        self.refresh.revoke_all_for_user(user_id).await?;
        self.audit
            .log(AuditRecord::auth("password_changed", user_id))
            .await;
        Ok(())
    }

    /// First-boot bootstrap: create the owner account with a random password.
    ///
    /// The generated password goes to stdout only — never to the structured
    /// logger — and only when the users table is empty.
    pub async fn seed_owner_if_empty(&self) -> Result<()> {
        if self.users.count().await? > 0 {
            return Ok(());
        }
        let password = refresh::generate_secret();
        let hash = self.hash_password(&password).await?;
        let user = self
            .users
            .create("owner", "Owner", None, &hash, Role::Owner, None)
            .await?;

        println!("==============================================");
        println!(" First boot: created owner account");
        println!("   username: owner");
        println!("   password: {password}");
        println!(" Change this password immediately after login.");
        println!("==============================================");

        self.audit.log(AuditRecord::auth("owner_seeded", &user.id)).await;
        Ok(())
    }

    /// Materialize the room scope for an authenticated caller
    pub async fn scope_for_user(&self, user: &User) -> Result<RoomScope> {
        match user.role {
            Role::Admin | Role::Owner => Ok(RoomScope::Unrestricted),
            Role::User | Role::Panel => {
                let grants = self.users.room_grants(&user.id).await?;
                Ok(RoomScope::from_grants(&grants))
            }
        }
    }
}

/// A valid Argon2id hash of an unknowable password, for timing-balanced
/// rejection of unknown usernames.
const DUMMY_HASH: &str = "$argon2id$v=19$m=65536,t=3,p=1$\
c29tZXNhbHRzb21lc2FsdA$G1/rGlpvKkTYNzhpZLcUMLRas4cRz1MJvR2X2TnDm0M";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;
    use crate::registry::db::connect_memory;

    async fn service() -> AuthService {
        let pool = connect_memory().await;
        let audit = AuditLogger::disabled();
        let config = AuthConfig {
            jwt_secret: "0123456789abcdef0123456789abcdef".to_string(),
            access_ttl_minutes: 15,
            refresh_ttl_days: 30,
        };
        AuthService::new(pool, &config, audit).unwrap()
    }

    #[tokio::test]
    async fn seed_owner_only_once() {
        let service = service().await;
        service.seed_owner_if_empty().await.unwrap();
        assert_eq!(service.users.count().await.unwrap(), 1);
        service.seed_owner_if_empty().await.unwrap();
        assert_eq!(service.users.count().await.unwrap(), 1);

        let owner = service.users.get_by_username("owner").await.unwrap().unwrap();
        assert_eq!(owner.role, Role::Owner);
    }

    #[tokio::test]
    async fn login_and_refresh_flow() {
        let service = service().await;
        let hash = service.hash_password("a good password").await.unwrap();
        service
            .users
            .create("alice", "Alice", None, &hash, Role::User, None)
            .await
            .unwrap();

        let (pair, user) = service
            .login("Alice", "a good password", Some("test"))
            .await
            .unwrap();
        assert_eq!(user.username, "alice");
        let claims = service.tokens.verify(&pair.access_token).unwrap();
        assert_eq!(claims.role().unwrap(), Role::User);

        let next = service.refresh(&pair.refresh_token).await.unwrap();
        assert!(service.tokens.verify(&next.access_token).is_ok());

        // E3: replaying the consumed token kills the family
        let err = service.refresh(&pair.refresh_token).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
        let err = service.refresh(&next.refresh_token).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let service = service().await;
        let hash = service.hash_password("a good password").await.unwrap();
        service
            .users
            .create("bob", "Bob", None, &hash, Role::User, None)
            .await
            .unwrap();
        assert!(service.login("bob", "wrong password", None).await.is_err());
        assert!(service.login("nobody", "whatever pass", None).await.is_err());
    }

    #[tokio::test]
    async fn password_change_revokes_sessions() {
        let service = service().await;
        let hash = service.hash_password("original pass").await.unwrap();
        let user = service
            .users
            .create("carol", "Carol", None, &hash, Role::User, None)
            .await
            .unwrap();

        let (pair, _) = service.login("carol", "original pass", None).await.unwrap();
        service
            .change_password(&user.id, "original pass", "a new password")
            .await
            .unwrap();

        // Old refresh token is dead; new password logs in
        assert!(service.refresh(&pair.refresh_token).await.is_err());
        assert!(service.login("carol", "a new password", None).await.is_ok());
        assert!(service.login("carol", "original pass", None).await.is_err());
    }

    #[tokio::test]
    async fn overlong_login_password_is_rejected_early() {
        let service = service().await;
        let long = "x".repeat(200);
        assert!(service.login("anyone", &long, None).await.is_err());
    }
}
