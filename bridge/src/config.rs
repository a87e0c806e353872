//! Environment-driven configuration.

use std::sync::OnceLock;

/// env_logger filter for the bridge, e.g. `debug` or `nativebridge=trace`.
pub const LOG_ENV: &str = "NATIVEBRIDGE_LOG";
/// Log per-invocation argument capture and callback dispositions.
pub const HOOK_DEBUG_ENV: &str = "NATIVEBRIDGE_HOOK_DEBUG";

const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub log_filter: String,
    pub hook_debug: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            hook_debug: false,
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let log_filter = lookup(LOG_ENV)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        let hook_debug = lookup(HOOK_DEBUG_ENV).is_some_and(|v| is_truthy(&v));
        Self { log_filter, hook_debug }
    }

    /// Process-wide config, read from the environment on first use.
    pub fn global() -> &'static BridgeConfig {
        static CONFIG: OnceLock<BridgeConfig> = OnceLock::new();
        CONFIG.get_or_init(Self::from_env)
    }
}

/// Install env_logger with the configured filter. A logger that is already
/// installed is left alone.
pub fn init_logging(config: &BridgeConfig) {
    let _ = env_logger::Builder::new()
        .parse_filters(&config.log_filter)
        .try_init();
}
