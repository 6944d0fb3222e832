//! Access-token resolution.
//!
//! Credential acquisition and storage are someone else's problem: the core
//! only ever consumes an opaque bearer token. `TokenProvider` is the seam a
//! caller plugs a real credential source into; the only implementation
//! shipped here is an environment-variable lookup, concrete enough to run
//! the daemon end-to-end.

use async_trait::async_trait;

/// Supplies the bearer token the forge API client authenticates with.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Option<String>;
}

/// Reads the token from a fixed environment variable on every call, so a
/// rotated token is picked up on the next poll without a daemon restart.
pub struct EnvTokenProvider {
    var_name: String,
}

impl EnvTokenProvider {
    pub fn new(var_name: impl Into<String>) -> Self {
        Self {
            var_name: var_name.into(),
        }
    }
}

impl Default for EnvTokenProvider {
    fn default() -> Self {
        Self::new("PKS_RUNNER_TOKEN")
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn token(&self) -> Option<String> {
        std::env::var(&self.var_name).ok().filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[tokio::test]
    #[serial]
    async fn reads_configured_variable() {
        std::env::set_var("PKS_TEST_TOKEN_A", "secret");
        let provider = EnvTokenProvider::new("PKS_TEST_TOKEN_A");
        assert_eq!(provider.token().await, Some("secret".to_string()));
        std::env::remove_var("PKS_TEST_TOKEN_A");
    }

    #[tokio::test]
    #[serial]
    async fn missing_variable_yields_none() {
        std::env::remove_var("PKS_TEST_TOKEN_B");
        let provider = EnvTokenProvider::new("PKS_TEST_TOKEN_B");
        assert_eq!(provider.token().await, None);
    }

    #[tokio::test]
    #[serial]
    async fn empty_variable_yields_none() {
        std::env::set_var("PKS_TEST_TOKEN_C", "");
        let provider = EnvTokenProvider::new("PKS_TEST_TOKEN_C");
        assert_eq!(provider.token().await, None);
        std::env::remove_var("PKS_TEST_TOKEN_C");
    }
}
