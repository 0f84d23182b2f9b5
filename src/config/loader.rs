// Configuration loader
// Builds the run configuration from defaults, an optional TOML file and
// command-line KEY=VALUE overrides

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use super::settings::Config;
use crate::errors::{config_parse_error, ConfigError, UserFriendlyError};

/// Load configuration, apply overrides in order, and validate the result
pub fn load_config(path: Option<&Path>, overrides: &[String]) -> Result<Config> {
    let base = match path {
        Some(path) => {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")
                .user_context(&config_parse_error(&path.display().to_string()))?;
            config
        }
        None => Config::default(),
    };

    let parsed = overrides
        .iter()
        .map(|raw| parse_override(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let config = apply_overrides(base, &parsed)?;
    config.validate()?;

    tracing::debug!(
        batch_size = config.batch_size,
        horizon = config.horizon,
        epochs = config.epochs,
        overrides = parsed.len(),
        "Loaded configuration"
    );

    Ok(config)
}

/// Split `KEY=VALUE` on the first `=` and parse the value as a TOML literal
pub fn parse_override(raw: &str) -> Result<(String, toml::Value), ConfigError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| ConfigError::MalformedOverride(raw.to_string()))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ConfigError::MalformedOverride(raw.to_string()));
    }
    Ok((key.to_string(), parse_value(value.trim())))
}

fn parse_value(raw: &str) -> toml::Value {
    match raw {
        "True" => return toml::Value::Boolean(true),
        "False" => return toml::Value::Boolean(false),
        _ => {}
    }

    // Reuse the TOML grammar for numbers, bools and arrays
    toml::from_str::<toml::Table>(&format!("v = {}", raw))
        .ok()
        .and_then(|mut table| table.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

/// Apply parsed overrides on top of `config`
pub fn apply_overrides(config: Config, overrides: &[(String, toml::Value)]) -> Result<Config> {
    if overrides.is_empty() {
        return Ok(config);
    }

    let mut root = toml::Value::try_from(&config).context("Failed to encode configuration")?;

    for (key, value) in overrides {
        let mut slot = &mut root;
        for part in key.split('.') {
            slot = slot
                .as_table_mut()
                .and_then(|table| table.get_mut(part))
                .ok_or_else(|| ConfigError::UnknownKey(key.clone()))?;
        }

        *slot = match (&*slot, value) {
            (toml::Value::Float(_), toml::Value::Integer(i)) => toml::Value::Float(*i as f64),
            (toml::Value::Array(_), toml::Value::Array(items)) => toml::Value::Array(
                items
                    .iter()
                    .map(|item| match item {
                        toml::Value::Integer(i) => toml::Value::Float(*i as f64),
                        other => other.clone(),
                    })
                    .collect(),
            ),
            _ => value.clone(),
        };
    }

    let config: Config = root
        .try_into()
        .context("Override has the wrong type for its parameter")?;
    Ok(config)
}
