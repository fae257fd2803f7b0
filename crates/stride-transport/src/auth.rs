use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use secrecy::SecretString;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no credentials available")]
    Missing,
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

/// Supplies the bearer credential for stream requests.
#[async_trait]
pub trait TokenSupplier: Send + Sync {
    async fn current_token(&self) -> Result<SecretString, AuthError>;

    /// Obtain a new credential after the server reported it expired.
    async fn refresh(&self) -> Result<SecretString, AuthError>;
}

/// Fixed credential with an optional one-shot replacement for `refresh`.
pub struct StaticTokenSupplier {
    token: RwLock<SecretString>,
    replacement: Mutex<Option<SecretString>>,
    refreshes: AtomicUsize,
}

impl StaticTokenSupplier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(SecretString::from(token.into())),
            replacement: Mutex::new(None),
            refreshes: AtomicUsize::new(0),
        }
    }

    /// The first `refresh` swaps in this token; later refreshes fail.
    pub fn with_refreshed(self, token: impl Into<String>) -> Self {
        *self.replacement.lock() = Some(SecretString::from(token.into()));
        self
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TokenSupplier for StaticTokenSupplier {
    async fn current_token(&self) -> Result<SecretString, AuthError> {
        Ok(self.token.read().clone())
    }

    async fn refresh(&self) -> Result<SecretString, AuthError> {
        let _ = self.refreshes.fetch_add(1, Ordering::Relaxed);
        let next = self
            .replacement
            .lock()
            .take()
            .ok_or_else(|| AuthError::RefreshFailed("static credential cannot be refreshed".into()))?;
        *self.token.write() = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[tokio::test]
    async fn static_token_without_refresh() {
        let supplier = StaticTokenSupplier::new("abc");
        assert_eq!(supplier.current_token().await.unwrap().expose_secret(), "abc");
        assert!(matches!(supplier.refresh().await, Err(AuthError::RefreshFailed(_))));
        assert_eq!(supplier.refresh_count(), 1);
    }

    #[tokio::test]
    async fn refresh_swaps_once() {
        let supplier = StaticTokenSupplier::new("old").with_refreshed("new");
        assert_eq!(supplier.refresh().await.unwrap().expose_secret(), "new");
        assert_eq!(supplier.current_token().await.unwrap().expose_secret(), "new");
        assert!(supplier.refresh().await.is_err());
        assert_eq!(supplier.refresh_count(), 2);
    }
}
