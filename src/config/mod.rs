mod schema;

pub use schema::*;

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    validate(&config)?;
    Ok(config)
}

/// Reject configurations the routers cannot work with
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.servers.is_empty() {
        return Err(ConfigError::Invalid("no servers configured".into()));
    }

    let mut names = std::collections::HashSet::new();
    for server in &config.servers {
        if !names.insert(server.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate server name '{}'",
                server.name
            )));
        }
    }

    for user in &config.users {
        if let Some(hash) = &user.password_hash {
            let hex_part = hash.strip_prefix('*').unwrap_or(hash);
            if hex_part.len() != 40 || hex::decode(hex_part).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "password_hash of user '{}' is not a 40 digit hex string",
                    user.name
                )));
            }
        }
    }

    Ok(())
}
