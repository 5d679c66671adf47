//! Integration test entry point
//!
//! These tests need a running Hermes proxy in front of a replicated
//! MySQL/MariaDB cluster. Run with:
//! HERMES_RUN_INTEGRATION_TESTS=1 cargo test --test integration

mod rw_split;

use std::env;

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("HERMES_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Proxy endpoint configuration from environment
pub fn get_proxy_config() -> ProxyTestConfig {
    ProxyTestConfig {
        host: env::var("HERMES_TEST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("HERMES_TEST_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(4006),
        user: env::var("HERMES_TEST_USER").unwrap_or_else(|_| "root".to_string()),
        password: env::var("HERMES_TEST_PASS").unwrap_or_default(),
        database: env::var("HERMES_TEST_DB").unwrap_or_else(|_| "test".to_string()),
    }
}

/// Connection details for the proxy under test
#[derive(Debug, Clone)]
pub struct ProxyTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ProxyTestConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}
