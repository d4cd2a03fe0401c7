//! Runtime configuration read from the environment (after `dotenvy` has loaded
//! any `.env` file).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

pub const DEFAULT_BASE_URL: &str = "https://itranvias.com/queryitr_v3.php";

/// Pacing constants for the live poller and the sync retry loop.
///
/// The upstream publishes no rate limit. These values approximate a token
/// bucket that has kept the poller under the throttle in practice and can be
/// tuned without code changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pacing {
    /// Pause after every line request.
    pub short_pause: Duration,
    /// Pause after every `burst_size`-th line instead of the short one.
    pub long_pause: Duration,
    pub burst_size: usize,
    /// Wait after a generic transient failure.
    pub backoff: Duration,
    /// Wait after a rate-limit rejection.
    pub cooldown: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            short_pause: Duration::from_secs(1),
            long_pause: Duration::from_secs(10),
            burst_size: 10,
            backoff: Duration::from_secs(15),
            cooldown: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub store_path: String,
    pub language: String,
    pub http_timeout: Duration,
    pub pacing: Pacing,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Pacing::default();
        let pacing = Pacing {
            short_pause: millis("ITR_SHORT_PAUSE_MS", defaults.short_pause)?,
            long_pause: millis("ITR_LONG_PAUSE_MS", defaults.long_pause)?,
            burst_size: parsed("ITR_BURST_SIZE", defaults.burst_size)?.max(1),
            backoff: millis("ITR_BACKOFF_MS", defaults.backoff)?,
            cooldown: millis("ITR_COOLDOWN_MS", defaults.cooldown)?,
        };

        Ok(Self {
            base_url: env::var("ITR_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            store_path: env::var("ITR_STORE_PATH")
                .unwrap_or_else(|_| "data/itranvias.sqlite".to_string()),
            language: env::var("ITR_LANGUAGE").unwrap_or_else(|_| "en".to_string()),
            http_timeout: Duration::from_secs(parsed("ITR_HTTP_TIMEOUT_SECS", 30u64)?),
            pacing,
        })
    }
}

fn parsed<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn millis(key: &str, default: Duration) -> Result<Duration> {
    let ms = parsed(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}
