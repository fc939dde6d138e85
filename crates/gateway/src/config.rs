//! Gateway configuration from environment variables.
//!
//! Every key has a usable default so a bare `cargo run` comes up against
//! local Consul and NATS. `dotenvy` in `main` lets a `.env` file supply the
//! same keys.

use std::env;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server listens on.
    pub port: u16,
    /// Log level: debug, info, warn, or error.
    pub log_level: String,
    /// Consul address for service discovery (`host:port`).
    pub consul_address: String,
    /// NATS address for async messaging.
    pub nats_address: String,
    /// Secret for JWT signing. Change in production.
    pub jwt_secret: String,
    /// JWT token expiration in minutes.
    pub jwt_expiration_minutes: i64,
    /// CORS allow-lists.
    pub cors_allowed_origins: Vec<String>,
    pub cors_allowed_methods: Vec<String>,
    pub cors_allowed_headers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            log_level: "info".to_string(),
            consul_address: "localhost:8500".to_string(),
            nats_address: "nats://localhost:4222".to_string(),
            jwt_secret: "default-jwt-secret-change-me-in-production".to_string(),
            jwt_expiration_minutes: 60,
            cors_allowed_origins: str_list(&["http://localhost:3000", "http://localhost:8080"]),
            cors_allowed_methods: str_list(&["GET", "POST", "PUT", "DELETE", "OPTIONS", "PATCH"]),
            cors_allowed_headers: str_list(&[
                "Accept",
                "Authorization",
                "Content-Type",
                "X-CSRF-Token",
                "X-Request-ID",
                "X-Requested-With",
            ]),
        }
    }
}

impl Config {
    /// Read configuration from the environment, falling back to defaults
    /// for missing or invalid values.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Self {
            port: env::var("PORT")
                .ok()
                // Tolerate the ":8080" form some deployments use.
                .and_then(|v| v.trim_start_matches(':').parse().ok())
                .unwrap_or(defaults.port),
            log_level: env::var("LOG_LEVEL")
                .map(|v| normalize_log_level(&v))
                .unwrap_or(defaults.log_level),
            consul_address: env::var("CONSUL_ADDRESS").unwrap_or(defaults.consul_address),
            nats_address: env::var("NATS_ADDRESS").unwrap_or(defaults.nats_address),
            jwt_secret: env::var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            jwt_expiration_minutes: env::var("JWT_EXPIRATION_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&v| v > 0)
                .unwrap_or(defaults.jwt_expiration_minutes),
            cors_allowed_origins: env_list("CORS_ALLOWED_ORIGINS", defaults.cors_allowed_origins),
            cors_allowed_methods: env_list("CORS_ALLOWED_METHODS", defaults.cors_allowed_methods),
            cors_allowed_headers: env_list("CORS_ALLOWED_HEADERS", defaults.cors_allowed_headers),
        }
    }
}

fn normalize_log_level(level: &str) -> String {
    match level.to_lowercase().as_str() {
        lvl @ ("trace" | "debug" | "info" | "warn" | "error") => lvl.to_string(),
        _ => "info".to_string(),
    }
}

fn env_list(name: &str, default: Vec<String>) -> Vec<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .split(',')
            .map(|item| item.trim().to_string())
            .collect(),
        _ => default,
    }
}

fn str_list(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.jwt_expiration_minutes, 60);
        assert_eq!(config.nats_address, "nats://localhost:4222");
    }

    #[test]
    fn test_log_level_normalization() {
        assert_eq!(normalize_log_level("DEBUG"), "debug");
        assert_eq!(normalize_log_level("warn"), "warn");
        assert_eq!(normalize_log_level("fatal"), "info");
        assert_eq!(normalize_log_level(""), "info");
    }
}
