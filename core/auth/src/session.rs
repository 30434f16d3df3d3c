//! Authenticated session access.

use async_trait::async_trait;
use tokio::sync::RwLock;

use fiscalgate_common::Role;

/// Source of the bearer token and principal role.
///
/// Login and token refresh happen outside the request engine; it only reads
/// the current values.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Current access token, if logged in.
    async fn access_token(&self) -> Option<String>;

    /// Role of the authenticated principal.
    async fn role(&self) -> Option<Role>;
}

/// Session whose values are set explicitly.
#[derive(Debug, Default)]
pub struct StaticSession {
    token: RwLock<Option<String>>,
    role: RwLock<Option<Role>>,
}

impl StaticSession {
    /// Create an anonymous session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a logged-in session.
    pub fn with_credentials(token: impl Into<String>, role: Role) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
            role: RwLock::new(Some(role)),
        }
    }

    pub async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    pub async fn set_role(&self, role: Option<Role>) {
        *self.role.write().await = role;
    }

    /// Forget token and role.
    pub async fn clear(&self) {
        self.set_token(None).await;
        self.set_role(None).await;
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn access_token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    async fn role(&self) -> Option<Role> {
        *self.role.read().await
    }
}
