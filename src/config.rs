//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Service configuration.
///
/// Retry base/cap and breaker parameters are inputs here, not constants in
/// the algorithms that use them.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    /// Retries allowed per item before dead-lettering.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub retry_base: Duration,
    /// Backoff cap.
    pub retry_max: Duration,
    /// Idle delay between claim attempts when the queue is empty.
    pub poll_interval: Duration,
    /// Timeout applied to a classifier call.
    pub classify_timeout: Duration,
    /// Timeout applied to a single tool execution.
    pub tool_timeout: Duration,
    /// Consecutive failures before a service breaker opens.
    pub breaker_threshold: u32,
    /// How long an open breaker short-circuits checks.
    pub breaker_cooldown: Duration,
    /// TTL for the in-process service-status result cache.
    pub status_cache_ttl: Duration,
    /// DNS resolution timeout for health probes.
    pub dns_timeout: Duration,
    /// HTTP connect timeout for health probes.
    pub connect_timeout: Duration,
    /// HTTP read timeout for health probes.
    pub read_timeout: Duration,
    /// Replay calls allowed per API key per minute.
    pub replay_per_key_per_minute: u32,
    /// Replay calls allowed per evidence id per hour.
    pub replay_per_evidence_per_hour: u32,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base: Duration::from_secs(5),
            retry_max: Duration::from_secs(300), // 5 minutes
            poll_interval: Duration::from_secs(3),
            classify_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(30),
            breaker_threshold: 3,
            breaker_cooldown: Duration::from_secs(300), // 5 minutes
            status_cache_ttl: Duration::from_secs(60),
            dns_timeout: Duration::from_millis(1000),
            connect_timeout: Duration::from_millis(1500),
            read_timeout: Duration::from_millis(1500),
            replay_per_key_per_minute: 10,
            replay_per_evidence_per_hour: 5,
        }
    }
}

fn env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: name.to_string(),
            message: format!("expected integer, got {raw:?}"),
        }),
        _ => Ok(default),
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(
        env_u32(name, default.as_secs() as u32)? as u64,
    ))
}

impl TriageConfig {
    /// Build a configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_retries: env_u32("TRIAGE_MAX_RETRIES", defaults.max_retries)?,
            retry_base: env_secs("TRIAGE_RETRY_BASE_SECONDS", defaults.retry_base)?,
            retry_max: env_secs("TRIAGE_RETRY_MAX_SECONDS", defaults.retry_max)?,
            poll_interval: env_secs("TRIAGE_POLL_INTERVAL_SECONDS", defaults.poll_interval)?,
            classify_timeout: env_secs("TRIAGE_CLASSIFY_TIMEOUT_SECONDS", defaults.classify_timeout)?,
            tool_timeout: env_secs("TRIAGE_TOOL_TIMEOUT_SECONDS", defaults.tool_timeout)?,
            breaker_threshold: env_u32("TRIAGE_BREAKER_THRESHOLD", defaults.breaker_threshold)?,
            breaker_cooldown: env_secs("TRIAGE_BREAKER_COOLDOWN_SECONDS", defaults.breaker_cooldown)?,
            status_cache_ttl: env_secs("TRIAGE_STATUS_CACHE_TTL_SECONDS", defaults.status_cache_ttl)?,
            replay_per_key_per_minute: env_u32(
                "TRIAGE_REPLAY_PER_KEY_PER_MINUTE",
                defaults.replay_per_key_per_minute,
            )?,
            replay_per_evidence_per_hour: env_u32(
                "TRIAGE_REPLAY_PER_EVIDENCE_PER_HOUR",
                defaults.replay_per_evidence_per_hour,
            )?,
            ..defaults
        })
    }

    /// Exponential backoff with a cap: `min(base * 2^retry_count, max)`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let base = self.retry_base.as_secs().max(1);
        let capped = base.saturating_mul(2u64.saturating_pow(retry_count));
        Duration::from_secs(capped.min(self.retry_max.as_secs().max(base)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_with_cap() {
        let config = TriageConfig {
            retry_base: Duration::from_secs(5),
            retry_max: Duration::from_secs(60),
            ..TriageConfig::default()
        };
        assert_eq!(config.backoff_delay(0), Duration::from_secs(5));
        assert_eq!(config.backoff_delay(1), Duration::from_secs(10));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(20));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(40));
        // Capped
        assert_eq!(config.backoff_delay(4), Duration::from_secs(60));
        assert_eq!(config.backoff_delay(30), Duration::from_secs(60));
    }

    #[test]
    fn backoff_survives_overflow() {
        let config = TriageConfig::default();
        assert_eq!(config.backoff_delay(u32::MAX), config.retry_max);
    }
}
