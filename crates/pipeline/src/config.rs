// Pipeline configuration
//
// Values come from the process environment; `main` loads a `.env` file
// with dotenvy before calling `PipelineConfig::from_env`.

use std::str::FromStr;
use std::time::Duration;

use reelflow_durable::RetryPolicy;

use crate::models::TranscodeProfile;

/// Longest approval timeout or periodic interval accepted
pub const MAX_WAIT: Duration = Duration::from_secs(365 * 86_400);

/// Runtime configuration for the video pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Address the HTTP server binds to
    pub bind_address: String,
    /// Base URL used in status links and approval links
    pub public_base_url: String,
    /// Default approval timeout when the caller gives none
    pub approval_timeout: Duration,
    /// Retries after the first thumbnail extraction attempt
    pub thumbnail_max_retries: u32,
    /// Fixed wait between thumbnail extraction attempts
    pub thumbnail_retry_interval: Duration,
    /// Clip prepended to every processed video
    pub intro_location: String,
    /// Bitrates the transcode fan-out produces
    pub transcode_bitrates: Vec<u32>,
    /// Sleep between periodic ticks
    pub periodic_interval: Duration,
    /// Maximum concurrently running steps
    pub worker_concurrency: usize,
    /// Simulated work time of the mock processor
    pub mock_work: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9000".to_string(),
            public_base_url: "http://localhost:9000".to_string(),
            approval_timeout: Duration::from_secs(30),
            thumbnail_max_retries: 4,
            thumbnail_retry_interval: Duration::from_secs(5),
            intro_location: "intro.mp4".to_string(),
            transcode_bitrates: vec![1000, 2000, 3000, 4000],
            periodic_interval: Duration::from_secs(60),
            worker_concurrency: 10,
            mock_work: Duration::from_millis(500),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `BIND_ADDRESS` (default: "0.0.0.0:9000")
    /// - `PUBLIC_BASE_URL` (default: "http://localhost:9000")
    /// - `APPROVAL_TIMEOUT_SECS` (default: 30)
    /// - `THUMBNAIL_MAX_RETRIES` (default: 4)
    /// - `THUMBNAIL_RETRY_INTERVAL_SECS` (default: 5)
    /// - `INTRO_LOCATION` (default: "intro.mp4")
    /// - `TRANSCODE_BITRATES`: comma separated (default: "1000,2000,3000,4000")
    /// - `PERIODIC_INTERVAL_SECS` (default: 60)
    /// - `WORKER_CONCURRENCY` (default: 10)
    /// - `MOCK_WORK_MILLIS` (default: 500)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let transcode_bitrates = match lookup("TRANSCODE_BITRATES") {
            Some(raw) => parse_bitrates(&raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "invalid TRANSCODE_BITRATES, using defaults");
                defaults.transcode_bitrates.clone()
            }),
            None => defaults.transcode_bitrates.clone(),
        };

        Self {
            bind_address: lookup("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            public_base_url: lookup("PUBLIC_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.public_base_url),
            approval_timeout: parsed_wait(&lookup, "APPROVAL_TIMEOUT_SECS")
                .unwrap_or(defaults.approval_timeout),
            thumbnail_max_retries: parsed(&lookup, "THUMBNAIL_MAX_RETRIES")
                .unwrap_or(defaults.thumbnail_max_retries),
            thumbnail_retry_interval: parsed(&lookup, "THUMBNAIL_RETRY_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.thumbnail_retry_interval),
            intro_location: lookup("INTRO_LOCATION").unwrap_or(defaults.intro_location),
            transcode_bitrates,
            periodic_interval: parsed_wait(&lookup, "PERIODIC_INTERVAL_SECS")
                .unwrap_or(defaults.periodic_interval),
            worker_concurrency: parsed::<usize, _>(&lookup, "WORKER_CONCURRENCY")
                .map(|n| n.max(1))
                .unwrap_or(defaults.worker_concurrency),
            mock_work: parsed(&lookup, "MOCK_WORK_MILLIS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.mock_work),
        }
    }

    /// Retry policy applied to thumbnail extraction
    pub fn thumbnail_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.thumbnail_retry_interval, self.thumbnail_max_retries)
    }

    /// Transcode profiles for the configured bitrates
    pub fn transcode_profiles(&self) -> Vec<TranscodeProfile> {
        self.transcode_bitrates
            .iter()
            .map(|&bitrate| TranscodeProfile::mp4(bitrate))
            .collect()
    }

    /// Absolute URL for a path on this service
    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.public_base_url, path)
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "invalid configuration value, using default");
            None
        }
    }
}

/// Seconds between 1 and `MAX_WAIT`
fn parsed_wait<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let wait = Duration::from_secs(parsed(lookup, key)?);
    if wait.is_zero() || wait > MAX_WAIT {
        tracing::warn!(key, seconds = wait.as_secs(), "wait out of range, using default");
        return None;
    }
    Some(wait)
}

fn parse_bitrates(raw: &str) -> Option<Vec<u32>> {
    let bitrates: Vec<u32> = raw
        .split(',')
        .map(|part| part.trim().parse().ok())
        .collect::<Option<_>>()?;
    (!bitrates.is_empty()).then_some(bitrates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> PipelineConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.approval_timeout, Duration::from_secs(30));
        assert_eq!(config.transcode_bitrates, vec![1000, 2000, 3000, 4000]);

        let retry = config.thumbnail_retry_policy();
        assert_eq!(retry.max_attempts(), 5);
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(retry.delay_for_attempt(5), Duration::from_secs(5));
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("APPROVAL_TIMEOUT_SECS", "120"),
            ("THUMBNAIL_MAX_RETRIES", "2"),
            ("TRANSCODE_BITRATES", " 500, 1500 "),
            ("PUBLIC_BASE_URL", "https://videos.example.com/"),
            ("WORKER_CONCURRENCY", "0"),
        ]);

        assert_eq!(config.approval_timeout, Duration::from_secs(120));
        assert_eq!(config.thumbnail_max_retries, 2);
        assert_eq!(config.transcode_bitrates, vec![500, 1500]);
        assert_eq!(config.public_base_url, "https://videos.example.com");
        assert_eq!(config.worker_concurrency, 1);
        assert_eq!(
            config.url_for("/api/workflows/1"),
            "https://videos.example.com/api/workflows/1"
        );
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_from(&[
            ("APPROVAL_TIMEOUT_SECS", "soon"),
            ("TRANSCODE_BITRATES", "1000,fast"),
            ("INTRO_LOCATION", "  "),
        ]);

        assert_eq!(config.approval_timeout, Duration::from_secs(30));
        assert_eq!(config.transcode_bitrates, vec![1000, 2000, 3000, 4000]);
        assert_eq!(config.intro_location, "intro.mp4");
    }

    #[test]
    fn test_out_of_range_waits_fall_back() {
        let config = config_from(&[
            ("APPROVAL_TIMEOUT_SECS", "0"),
            ("PERIODIC_INTERVAL_SECS", "4611686018427387903"),
        ]);

        assert_eq!(config.approval_timeout, Duration::from_secs(30));
        assert_eq!(config.periodic_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_transcode_profiles() {
        let config = config_from(&[("TRANSCODE_BITRATES", "1000,4000")]);
        let profiles = config.transcode_profiles();

        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[1].bitrate, 4000);
        assert_eq!(profiles[1].output_extension, ".mp4");
    }
}
