//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;

use super::AppConfig;

/// Environment variable prefix
const ENV_PREFIX: &str = "SUITE_CONDUCTOR";

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Config file from SUITE_CONDUCTOR_CONFIG
    pub config_file: Option<String>,
    /// Worker count from SUITE_CONDUCTOR_CONCURRENCY
    pub concurrency: Option<usize>,
    /// Soft limit from SUITE_CONDUCTOR_SOFT_TIME_LIMIT
    pub soft_time_limit_secs: Option<u64>,
    /// Hard limit from SUITE_CONDUCTOR_HARD_TIME_LIMIT
    pub hard_time_limit_secs: Option<u64>,
    /// Retries from SUITE_CONDUCTOR_MAX_RETRIES
    pub max_retries: Option<u32>,
    /// Stuck threshold from SUITE_CONDUCTOR_STUCK_THRESHOLD
    pub stuck_threshold_minutes: Option<u64>,
    /// Connection record TTL from SUITE_CONDUCTOR_CONNECTION_TTL
    pub connection_ttl_secs: Option<u64>,
    /// Router wait from SUITE_CONDUCTOR_RPC_TIMEOUT_MS
    pub rpc_timeout_ms: Option<u64>,
    /// Output format from SUITE_CONDUCTOR_FORMAT
    pub format: Option<String>,
    /// State file from SUITE_CONDUCTOR_STATE_FILE
    pub state_file: Option<String>,
    /// Verbose from SUITE_CONDUCTOR_VERBOSE
    pub verbose: Option<bool>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            config_file: get_env("CONFIG"),
            concurrency: get_env_parse("CONCURRENCY"),
            soft_time_limit_secs: get_env_parse("SOFT_TIME_LIMIT"),
            hard_time_limit_secs: get_env_parse("HARD_TIME_LIMIT"),
            max_retries: get_env_parse("MAX_RETRIES"),
            stuck_threshold_minutes: get_env_parse("STUCK_THRESHOLD"),
            connection_ttl_secs: get_env_parse("CONNECTION_TTL"),
            rpc_timeout_ms: get_env_parse("RPC_TIMEOUT_MS"),
            format: get_env("FORMAT"),
            state_file: get_env("STATE_FILE"),
            verbose: get_env_bool("VERBOSE"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.config_file.is_some()
            || self.concurrency.is_some()
            || self.soft_time_limit_secs.is_some()
            || self.hard_time_limit_secs.is_some()
            || self.max_retries.is_some()
            || self.stuck_threshold_minutes.is_some()
            || self.connection_ttl_secs.is_some()
            || self.rpc_timeout_ms.is_some()
            || self.format.is_some()
            || self.state_file.is_some()
            || self.verbose.is_some()
    }

    /// Overlay the set variables onto a loaded configuration
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(v) = self.concurrency {
            config.workers.concurrency = v;
        }
        if let Some(v) = self.soft_time_limit_secs {
            config.workers.soft_time_limit_secs = v;
        }
        if let Some(v) = self.hard_time_limit_secs {
            config.workers.hard_time_limit_secs = v;
        }
        if let Some(v) = self.max_retries {
            config.retry.max_retries = v;
        }
        if let Some(v) = self.stuck_threshold_minutes {
            config.monitor.stuck_threshold_minutes = v;
        }
        if let Some(v) = self.connection_ttl_secs {
            config.registry.ttl_secs = v;
        }
        if let Some(v) = self.rpc_timeout_ms {
            config.router.timeout_ms = v;
        }
    }

    /// Print current environment configuration
    pub fn print_summary(&self) {
        println!("Environment Configuration:");
        println!("  {}_CONFIG:           {:?}", ENV_PREFIX, self.config_file);
        println!("  {}_CONCURRENCY:      {:?}", ENV_PREFIX, self.concurrency);
        println!("  {}_SOFT_TIME_LIMIT:  {:?}", ENV_PREFIX, self.soft_time_limit_secs);
        println!("  {}_HARD_TIME_LIMIT:  {:?}", ENV_PREFIX, self.hard_time_limit_secs);
        println!("  {}_MAX_RETRIES:      {:?}", ENV_PREFIX, self.max_retries);
        println!("  {}_STUCK_THRESHOLD:  {:?}", ENV_PREFIX, self.stuck_threshold_minutes);
        println!("  {}_CONNECTION_TTL:   {:?}", ENV_PREFIX, self.connection_ttl_secs);
        println!("  {}_RPC_TIMEOUT_MS:   {:?}", ENV_PREFIX, self.rpc_timeout_ms);
        println!("  {}_FORMAT:           {:?}", ENV_PREFIX, self.format);
        println!("  {}_STATE_FILE:       {:?}", ENV_PREFIX, self.state_file);
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Print all SUITE_CONDUCTOR environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_CONFIG            Path to configuration file");
    println!("  {ENV_PREFIX}_CONCURRENCY       Units executing at once");
    println!("  {ENV_PREFIX}_SOFT_TIME_LIMIT   Soft per-unit limit in seconds");
    println!("  {ENV_PREFIX}_HARD_TIME_LIMIT   Hard per-unit limit in seconds");
    println!("  {ENV_PREFIX}_MAX_RETRIES       Retries after the first attempt");
    println!("  {ENV_PREFIX}_STUCK_THRESHOLD   Minutes before an open group is stuck");
    println!("  {ENV_PREFIX}_CONNECTION_TTL    Connection record lifetime in seconds");
    println!("  {ENV_PREFIX}_RPC_TIMEOUT_MS    Cross-instance invocation wait");
    println!("  {ENV_PREFIX}_FORMAT            Output format (table, json, csv)");
    println!("  {ENV_PREFIX}_STATE_FILE        Path to the persisted cluster state");
    println!("  {ENV_PREFIX}_VERBOSE           Enable verbose output (true/false)");
    println!();
    println!("Example:");
    println!("  export {ENV_PREFIX}_CONCURRENCY=8");
    println!("  suite-conductor run --tests 20");
}

#[cfg(test)]
pub(crate) struct EnvBuilder {
    vars: Vec<(String, String)>,
}

#[cfg(test)]
impl EnvBuilder {
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    pub fn var(mut self, name: &str, value: impl ToString) -> Self {
        self.vars
            .push((format!("{ENV_PREFIX}_{name}"), value.to_string()));
        self
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();
        for (key, value) in self.vars {
            env::set_var(key, value);
        }
        EnvGuard { previous }
    }
}

/// Guard that restores environment variables on drop
#[cfg(test)]
pub(crate) struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

#[cfg(test)]
impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_config_default() {
        let config = EnvConfig::default();
        assert!(config.concurrency.is_none());
        assert!(!config.has_any());
    }

    #[test]
    fn test_env_overrides_apply() {
        let _guard = EnvBuilder::new()
            .var("CONCURRENCY", 12)
            .var("STUCK_THRESHOLD", 45)
            .var("RPC_TIMEOUT_MS", 2500)
            .var("VERBOSE", "yes")
            .apply_scoped();

        let env = EnvConfig::load();
        assert!(env.has_any());
        assert_eq!(env.verbose, Some(true));

        let mut config = AppConfig::default();
        env.apply(&mut config);
        assert_eq!(config.workers.concurrency, 12);
        assert_eq!(config.monitor.stuck_threshold_minutes, 45);
        assert_eq!(config.router.timeout_ms, 2500);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_unparseable_value_is_ignored() {
        let _guard = EnvBuilder::new()
            .var("CONNECTION_TTL", "forever")
            .apply_scoped();
        assert_eq!(EnvConfig::load().connection_ttl_secs, None);
    }
}
