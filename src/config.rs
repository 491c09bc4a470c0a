//! Configuration loading and schema definitions for guestfarm.
//!
//! This module provides types and functions for loading guestfarm
//! configuration from TOML files or strings. The configuration schema
//! defines the provisioning backend, concurrency caps, polling and retry
//! policies, step execution, and reporting.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads guestfarm configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
/// - A `retry.fatal_patterns` entry is not a valid regular expression
///
/// # Example
///
/// ```no_run
/// use guestfarm::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("guestfarm.toml"))?;
/// println!("Acquisition cap: {}", config.farm.max_concurrent_acquisitions);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    validate(&config)?;

    Ok(config)
}

/// Loads guestfarm configuration from a TOML string.
///
/// # Example
///
/// ```
/// use guestfarm::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [provider]
///     type = "static"
/// "#)?;
///
/// assert_eq!(config.farm.max_concurrent_acquisitions, 8);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    validate(&config)?;

    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    config
        .retry
        .compile_patterns()
        .context("Invalid retry.fatal_patterns")?;

    if let ProviderConfig::Artemis(artemis) = &config.provider
        && artemis.api_url.trim().is_empty()
    {
        anyhow::bail!("provider.api_url must not be empty");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_fatal_pattern_is_reported() {
        let err = load_config_str(
            r#"
            [provider]
            type = "static"

            [retry]
            fatal_patterns = ["(unclosed"]
        "#,
        )
        .unwrap_err();

        assert!(format!("{:#}", err).contains("fatal_patterns"));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/guestfarm.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
