//! Configuration for the `lunar` debugger.
//!
//! Loaded from TOML; every field has a default so an empty file (or no file)
//! is a valid configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod logging;

pub use logging::init_tracing;

/// Environment variable consulted when no `--config` path is given.
pub const CONFIG_ENV_VAR: &str = "LUNAR_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LunarConfig {
    pub debugger: DebuggerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebuggerConfig {
    /// Host the game's debug server listens on.
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// How long a command may go unanswered before the connection is dropped.
    pub reply_timeout_ms: u64,
    /// Table nesting depth requested from the debuggee and accepted back.
    pub max_depth: usize,
    pub max_body_bytes: usize,
    /// Project root sent to the debuggee so breakpoint paths can be relative.
    pub basedir: Option<String>,
}

impl DebuggerConfig {
    pub const DEFAULT_PORT: u16 = 8172;
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: Self::DEFAULT_PORT,
            connect_timeout_ms: 5_000,
            reply_timeout_ms: 10_000,
            max_depth: 8,
            max_body_bytes: 16 * 1024 * 1024,
            basedir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Either a plain level (`info`, `debug`, ...) or an `EnvFilter` directive.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json: bool,

    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to this file as well. Ignored if it cannot be opened.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            "off" | "none" => "off".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective filter: the configured level with `RUST_LOG` merged on top.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` quotes the offending source line; keep only
        // the message and where it happened.
        let message = err.message().trim_end();
        match err.span() {
            Some(span) => ConfigError::Toml(format!("{message} (at byte {})", span.start)),
            None => ConfigError::Toml(message.to_owned()),
        }
    }
}

impl LunarConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config: LunarConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolves the config file from `explicit`, then `LUNAR_CONFIG`.
    /// With neither set the defaults are used.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from_path(path);
        }
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) if !path.is_empty() => Self::load_from_path(PathBuf::from(path)),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let debugger = &self.debugger;
        if debugger.host.trim().is_empty() {
            return Err(ConfigError::Invalid("debugger.host must not be empty".into()));
        }
        if debugger.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "debugger.connect_timeout_ms must be greater than zero".into(),
            ));
        }
        if debugger.reply_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "debugger.reply_timeout_ms must be greater than zero".into(),
            ));
        }
        if debugger.max_depth == 0 {
            return Err(ConfigError::Invalid(
                "debugger.max_depth must be at least 1".into(),
            ));
        }
        if debugger.max_body_bytes == 0 {
            return Err(ConfigError::Invalid(
                "debugger.max_body_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_document_is_the_default() {
        assert_eq!(LunarConfig::load_from_str("").unwrap(), LunarConfig::default());
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let config = LunarConfig::load_from_str(
            r#"
            [debugger]
            port = 9000
            basedir = "/work/game/"

            [logging]
            level = "Warning"
            "#,
        )
        .unwrap();
        assert_eq!(config.debugger.port, 9000);
        assert_eq!(config.debugger.host, "127.0.0.1");
        assert_eq!(config.debugger.basedir.as_deref(), Some("/work/game/"));
        assert_eq!(config.debugger.reply_timeout_ms, 10_000);
        assert!(config.logging.stderr);
        assert_eq!(
            LoggingConfig::normalize_level_directives(&config.logging.level),
            "warn"
        );
    }

    #[test]
    fn level_directives_pass_through() {
        assert_eq!(
            LoggingConfig::normalize_level_directives(" lunar.debug=trace,info "),
            "lunar.debug=trace,info"
        );
        assert_eq!(LoggingConfig::normalize_level_directives(""), "info");
    }

    #[test]
    fn invalid_values_are_rejected() {
        for text in [
            "[debugger]\nhost = \"\"",
            "[debugger]\nreply_timeout_ms = 0",
            "[debugger]\nconnect_timeout_ms = 0",
            "[debugger]\nmax_depth = 0",
        ] {
            assert!(
                matches!(LunarConfig::load_from_str(text), Err(ConfigError::Invalid(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn toml_errors_do_not_echo_the_source() {
        let err = LunarConfig::load_from_str("[debugger]\nport = \"secret-value\"").unwrap_err();
        let ConfigError::Toml(message) = &err else {
            panic!("unexpected error {err:?}");
        };
        assert!(!message.contains("port = "), "{message}");

        assert!(matches!(
            LunarConfig::load_from_str("[debuger]\nport = 1"),
            Err(ConfigError::Toml(_))
        ));
    }
}
