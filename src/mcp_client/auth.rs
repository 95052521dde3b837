//! Credential lookup for transports that need bearer tokens.
//!
//! The gateway never stores credentials on disk. Whoever owns the token
//! store implements [`CredentialProvider`]; after a fresh authorization it
//! calls `Gateway::on_authorization_granted` so the server reconnects.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

/// Source of bearer credentials, keyed by server name.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// The current credential for `server`, if one is available.
    async fn get_credential(&self, server: &str) -> Option<String>;
}

/// Provider that never has credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn get_credential(&self, _server: &str) -> Option<String> {
        None
    }
}

/// In-memory token map.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    tokens: RwLock<HashMap<String, String>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(self, server: &str, token: &str) -> Self {
        self.set(server, token);
        self
    }

    pub fn set(&self, server: &str, token: &str) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.insert(server.to_string(), token.to_string());
        }
    }

    pub fn revoke(&self, server: &str) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.remove(server);
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_credential(&self, server: &str) -> Option<String> {
        self.tokens.read().ok()?.get(server).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_credentials() {
        let creds = StaticCredentials::new().with_token("search", "t1");
        assert_eq!(creds.get_credential("search").await.as_deref(), Some("t1"));
        assert!(creds.get_credential("other").await.is_none());

        creds.revoke("search");
        assert!(creds.get_credential("search").await.is_none());
        assert!(NoCredentials.get_credential("search").await.is_none());
    }
}
