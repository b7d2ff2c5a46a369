//! Credential store for the owner's GitHub token

use anyhow::{anyhow, Context, Result};
use std::env;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::state::StateDb;

const GITHUB_TOKEN_KEY: &str = "github_token";

/// Persists and retrieves the GitHub token
#[cfg_attr(test, mockall::automock)]
pub trait CredentialStore: Send + Sync {
    fn get_token(&self) -> Result<Option<String>>;
    fn set_token(&self, token: &str) -> Result<()>;
    /// Returns whether a stored token was removed
    fn remove_token(&self) -> Result<bool>;
}

/// Token stored in the state database, optionally falling back to `GITHUB_TOKEN`
pub struct StoredCredentials {
    db: Arc<StateDb>,
    environment_fallback: bool,
}

impl StoredCredentials {
    pub fn new(db: Arc<StateDb>) -> Self {
        Self {
            db,
            environment_fallback: false,
        }
    }

    pub fn with_environment_fallback(mut self) -> Self {
        self.environment_fallback = true;
        self
    }
}

impl CredentialStore for StoredCredentials {
    fn get_token(&self) -> Result<Option<String>> {
        if let Some(token) = self.db.get_credential(GITHUB_TOKEN_KEY)? {
            return Ok(Some(token));
        }

        if self.environment_fallback {
            return Ok(token_from_environment().ok());
        }

        Ok(None)
    }

    fn set_token(&self, token: &str) -> Result<()> {
        let token = validate_token_format(token)?;
        self.db
            .set_credential(GITHUB_TOKEN_KEY, &token)
            .context("Failed to store GitHub token")
    }

    fn remove_token(&self) -> Result<bool> {
        self.db.remove_credential(GITHUB_TOKEN_KEY)
    }
}

/// Try to get token from environment variable
pub fn token_from_environment() -> Result<String> {
    debug!("Attempting environment variable authentication");

    let token = env::var("GITHUB_TOKEN").context("GITHUB_TOKEN environment variable not set")?;
    let token = validate_token_format(&token)?;

    debug!("Successfully found GITHUB_TOKEN environment variable");
    Ok(token)
}

fn validate_token_format(token: &str) -> Result<String> {
    let token = token.trim();

    if token.is_empty() {
        return Err(anyhow!("GitHub token is empty"));
    }

    if !["ghp_", "gho_", "ghs_", "github_pat_"]
        .iter()
        .any(|prefix| token.starts_with(prefix))
    {
        warn!("GitHub token doesn't look like a valid token (should start with ghp_, gho_, ghs_ or github_pat_)");
    }

    Ok(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_stored_token_roundtrip() {
        env::remove_var("GITHUB_TOKEN");
        let db = Arc::new(StateDb::open_in_memory().unwrap());
        let store = StoredCredentials::new(db).with_environment_fallback();

        assert_eq!(store.get_token().unwrap(), None);

        store.set_token("  ghp_secret  ").unwrap();
        assert_eq!(store.get_token().unwrap().as_deref(), Some("ghp_secret"));

        assert!(store.remove_token().unwrap());
        assert_eq!(store.get_token().unwrap(), None);
    }

    #[test]
    fn test_empty_token_rejected() {
        let db = Arc::new(StateDb::open_in_memory().unwrap());
        let store = StoredCredentials::new(db);
        assert!(store.set_token("   ").is_err());
    }

    #[test]
    #[serial]
    fn test_environment_fallback() {
        env::set_var("GITHUB_TOKEN", "ghp_from_env");
        let db = Arc::new(StateDb::open_in_memory().unwrap());

        let strict = StoredCredentials::new(db.clone());
        assert_eq!(strict.get_token().unwrap(), None);

        let fallback = StoredCredentials::new(db.clone()).with_environment_fallback();
        assert_eq!(fallback.get_token().unwrap().as_deref(), Some("ghp_from_env"));

        // A stored token wins over the environment
        fallback.set_token("ghp_stored").unwrap();
        assert_eq!(fallback.get_token().unwrap().as_deref(), Some("ghp_stored"));

        env::remove_var("GITHUB_TOKEN");
    }
}
