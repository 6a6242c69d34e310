//! Tracker configuration loaded from environment variables.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::client::DEFAULT_API_BASE;

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Client identifier sent as `Client-ID` (required for remote calls).
    pub client_id: Option<String>,

    /// Optional bearer token.
    pub oauth: Option<String>,

    /// Login of the tracked account.
    pub username: Option<String>,

    /// Numeric id of the tracked account; resolved from `username` when absent.
    pub user_id: Option<String>,

    /// Store file.
    pub db_path: PathBuf,

    /// Time between passes in `watch` mode.
    pub update_interval: Duration,

    pub api_base: String,
    pub request_timeout: Duration,

    /// Retries for a transient page failure before the pass is aborted.
    pub max_retries: u32,

    /// Backoff before the first retry; doubled on each further attempt.
    pub retry_backoff: Duration,

    /// Pause until the quota resets once this few requests remain.
    pub min_remaining: u32,

    /// Upper bound for a single pacing pause.
    pub max_pacing_wait: Duration,

    /// Re-fetch cached profiles older than this.
    pub profile_refresh: Option<Duration>,
}

fn var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional:
    /// - `TWITCH_CLIENT_ID`: client identifier (required by remote commands)
    /// - `TWITCH_OAUTH`: bearer token
    /// - `TRACKER_USERNAME` / `TRACKER_USER_ID`: tracked account
    /// - `TRACKER_DB_PATH`: store file (default: "follows.db")
    /// - `TRACKER_UPDATE_INTERVAL_SECS`: default 300
    /// - `TRACKER_API_BASE`: default "https://api.twitch.tv/helix"
    /// - `TRACKER_REQUEST_TIMEOUT_SECS`: default 10
    /// - `TRACKER_MAX_RETRIES`: default 3
    /// - `TRACKER_RETRY_BACKOFF_MS`: default 500
    /// - `TRACKER_MIN_REMAINING`: default 5
    /// - `TRACKER_MAX_PACING_WAIT_SECS`: default 60
    /// - `TRACKER_PROFILE_REFRESH_HOURS`: unset disables refresh
    pub fn from_env() -> Result<Self> {
        let update_interval = parse_var::<u64>("TRACKER_UPDATE_INTERVAL_SECS", 300)?;
        if update_interval == 0 {
            return Err(anyhow!("TRACKER_UPDATE_INTERVAL_SECS must be greater than zero"));
        }

        let profile_refresh = match var("TRACKER_PROFILE_REFRESH_HOURS") {
            Some(_) => {
                let hours = parse_var::<u64>("TRACKER_PROFILE_REFRESH_HOURS", 0)?;
                let secs = hours.checked_mul(3600).ok_or_else(|| {
                    anyhow!("TRACKER_PROFILE_REFRESH_HOURS is too large: {hours}")
                })?;
                Some(Duration::from_secs(secs))
            }
            None => None,
        };

        let config = Config {
            client_id: var("TWITCH_CLIENT_ID"),
            oauth: var("TWITCH_OAUTH"),
            username: var("TRACKER_USERNAME"),
            user_id: var("TRACKER_USER_ID"),
            db_path: PathBuf::from(var("TRACKER_DB_PATH").unwrap_or_else(|| "follows.db".to_string())),
            update_interval: Duration::from_secs(update_interval),
            api_base: var("TRACKER_API_BASE")
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            request_timeout: Duration::from_secs(parse_var("TRACKER_REQUEST_TIMEOUT_SECS", 10)?),
            max_retries: parse_var("TRACKER_MAX_RETRIES", 3)?,
            retry_backoff: Duration::from_millis(parse_var("TRACKER_RETRY_BACKOFF_MS", 500)?),
            min_remaining: parse_var("TRACKER_MIN_REMAINING", 5)?,
            max_pacing_wait: Duration::from_secs(parse_var("TRACKER_MAX_PACING_WAIT_SECS", 60)?),
            profile_refresh,
        };

        tracing::info!(
            db_path = %config.db_path.display(),
            api_base = %config.api_base,
            username = config.username.as_deref().unwrap_or(""),
            user_id = config.user_id.as_deref().unwrap_or(""),
            has_token = config.oauth.is_some(),
            interval_secs = config.update_interval.as_secs(),
            "tracker configuration loaded"
        );

        Ok(config)
    }

    pub fn require_client_id(&self) -> Result<&str> {
        self.client_id
            .as_deref()
            .ok_or_else(|| anyhow!("TWITCH_CLIENT_ID is not set"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize config tests that manipulate env vars.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "TWITCH_CLIENT_ID",
        "TWITCH_OAUTH",
        "TRACKER_USERNAME",
        "TRACKER_USER_ID",
        "TRACKER_DB_PATH",
        "TRACKER_UPDATE_INTERVAL_SECS",
        "TRACKER_API_BASE",
        "TRACKER_REQUEST_TIMEOUT_SECS",
        "TRACKER_MAX_RETRIES",
        "TRACKER_RETRY_BACKOFF_MS",
        "TRACKER_MIN_REMAINING",
        "TRACKER_MAX_PACING_WAIT_SECS",
        "TRACKER_PROFILE_REFRESH_HOURS",
    ];

    /// Run `f` with only `vars` set among the tracker's keys.
    fn with_env_vars<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

        let saved: Vec<_> = ENV_KEYS
            .iter()
            .map(|k| (*k, std::env::var(k).ok()))
            .collect();

        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
        for (k, v) in vars {
            std::env::set_var(k, v);
        }

        f();

        for (k, v) in saved {
            match v {
                Some(v) => std::env::set_var(k, v),
                None => std::env::remove_var(k),
            }
        }
    }

    #[test]
    fn test_defaults() {
        with_env_vars(&[], || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.db_path, PathBuf::from("follows.db"));
            assert_eq!(config.update_interval, Duration::from_secs(300));
            assert_eq!(config.api_base, DEFAULT_API_BASE);
            assert_eq!(config.max_retries, 3);
            assert!(config.profile_refresh.is_none());
            assert!(config.require_client_id().is_err());
        });
    }

    #[test]
    fn test_overrides() {
        with_env_vars(
            &[
                ("TWITCH_CLIENT_ID", "abc"),
                ("TWITCH_OAUTH", "  "),
                ("TRACKER_USERNAME", "someone"),
                ("TRACKER_API_BASE", "http://localhost:8080/helix/"),
                ("TRACKER_PROFILE_REFRESH_HOURS", "24"),
                ("TRACKER_RETRY_BACKOFF_MS", "0"),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.require_client_id().unwrap(), "abc");
                assert!(config.oauth.is_none(), "blank token counts as unset");
                assert_eq!(config.username.as_deref(), Some("someone"));
                assert_eq!(config.api_base, "http://localhost:8080/helix");
                assert_eq!(config.profile_refresh, Some(Duration::from_secs(24 * 3600)));
                assert_eq!(config.retry_backoff, Duration::ZERO);
            },
        );
    }

    #[test]
    fn test_invalid_numbers_are_errors() {
        with_env_vars(&[("TRACKER_MAX_RETRIES", "lots")], || {
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("TRACKER_MAX_RETRIES"));
        });

        with_env_vars(&[("TRACKER_UPDATE_INTERVAL_SECS", "0")], || {
            assert!(Config::from_env().is_err());
        });

        let huge = u64::MAX.to_string();
        with_env_vars(&[("TRACKER_PROFILE_REFRESH_HOURS", huge.as_str())], || {
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("TRACKER_PROFILE_REFRESH_HOURS"));
        });
    }
}
