//! Configuration validation utilities.

use super::error::{ConfigError, ConfigResult};
use super::schema::{LogOutput, LoggingConfig, PluginsConfig, RuntimeConfig, SinterConfig};
use sinter_core::HistoryConfig;

/// Validates the entire configuration.
pub fn validate_config(config: &SinterConfig) -> ConfigResult<()> {
    validate_logging_config(&config.logging)?;
    validate_plugins_config(&config.plugins)?;
    validate_history_config(&config.history)?;
    validate_runtime_config(&config.runtime)?;
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::validation(
            "logging.file_path is required when logging.output is \"file\"",
        ));
    }
    if let Some(target) = logging.filters.keys().find(|t| t.trim().is_empty()) {
        return Err(ConfigError::validation(format!(
            "Empty log filter target: {target:?}"
        )));
    }
    Ok(())
}

fn validate_plugins_config(plugins: &PluginsConfig) -> ConfigResult<()> {
    if plugins.init_timeout_ms == 0 {
        return Err(ConfigError::validation(
            "plugins.init_timeout_ms must be greater than 0",
        ));
    }
    if !plugins.hot_reload {
        return Ok(());
    }
    if plugins.dirs.is_empty() {
        return Err(ConfigError::validation(
            "plugins.dirs must not be empty when hot reload is enabled",
        ));
    }
    if plugins.poll_interval_ms == 0 {
        return Err(ConfigError::validation(
            "plugins.poll_interval_ms must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_history_config(history: &HistoryConfig) -> ConfigResult<()> {
    if history.soft_cap == 0 {
        return Err(ConfigError::validation(
            "history.soft_cap must be greater than 0",
        ));
    }
    if history.hard_cap < history.soft_cap {
        return Err(ConfigError::validation(format!(
            "history.hard_cap ({}) must be at least history.soft_cap ({})",
            history.hard_cap, history.soft_cap
        )));
    }
    Ok(())
}

fn validate_runtime_config(runtime: &RuntimeConfig) -> ConfigResult<()> {
    if runtime.compaction_interval_secs == 0 {
        return Err(ConfigError::validation(
            "runtime.compaction_interval_secs must be greater than 0",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&SinterConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_history_caps() {
        let mut config = SinterConfig::default();
        config.history.soft_cap = 800;
        config.history.hard_cap = 600;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ValidationError { message }) if message.contains("hard_cap")
        ));
    }

    #[test]
    fn test_validate_plugin_dirs_only_with_hot_reload() {
        let mut config = SinterConfig::default();
        config.plugins.dirs.clear();
        assert!(validate_config(&config).is_err());

        config.plugins.hot_reload = false;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_zero_intervals() {
        let mut config = SinterConfig::default();
        config.runtime.compaction_interval_secs = 0;
        assert!(validate_config(&config).is_err());

        let mut config = SinterConfig::default();
        config.plugins.poll_interval_ms = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_file_output_needs_path() {
        let mut config = SinterConfig::default();
        config.logging.output = LogOutput::File;
        assert!(validate_config(&config).is_err());

        config.logging.file_path = Some("logs/sinter.log".into());
        assert!(validate_config(&config).is_ok());
    }
}
