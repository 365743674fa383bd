use std::env;
use std::time::Duration;

/// Immutable snapshot of process configuration, read once at startup.
///
/// Runtime-mutable knobs (`poolSize`, `currentDuration`, `paused`, IP
/// policy sets) are *seeded* from here but then live in the owning
/// component's mutex-guarded state; re-reading the environment after
/// startup is never correct.
#[derive(Debug, Clone)]
pub struct Config {
    pub pool_size: usize,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub container_image: String,
    pub session_duration: Duration,
    pub rate_limit_per_day: u32,
    pub frontend_url: String,
    pub admin_user: String,
    pub admin_password: String,
    pub data_dir: String,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process environment, loading a local
    /// `.env` first if one is present (development convenience only).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            pool_size: env_parse("POOL_SIZE", 3),
            port_range_start: env_parse("PORT_RANGE_START", 4000),
            port_range_end: env_parse("PORT_RANGE_END", 4100),
            container_image: env::var("CONTAINER_IMAGE")
                .unwrap_or_else(|_| "cloudbrowser/kiosk:latest".to_string()),
            session_duration: Duration::from_secs(env_parse("SESSION_DURATION", 300)),
            rate_limit_per_day: env_parse("RATE_LIMIT_PER_DAY", 10),
            frontend_url: env::var("FRONTEND_URL").unwrap_or_else(|_| "*".to_string()),
            admin_user: env::var("ADMIN_USER").unwrap_or_else(|_| "admin".to_string()),
            admin_password: env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "changeme".to_string()),
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_unset() {
        // Use a key unlikely to be set in the test environment.
        let cfg = Config {
            pool_size: env_parse("CLOUDBROWSER_TEST_UNSET_POOL_SIZE", 3usize),
            ..Config::from_env()
        };
        assert_eq!(cfg.pool_size, 3);
    }
}
