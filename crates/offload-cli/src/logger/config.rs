use std::io::IsTerminal;

use crate::logger::error::LoggerError;
use crate::logger::format::LoggerFormat;

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub format: LoggerFormat,
    pub level: String,
    pub with_targets: bool,
    pub use_color: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            format: LoggerFormat::Text,
            level: "info".to_string(),
            with_targets: true,
            use_color: std::io::stdout().is_terminal(),
        }
    }
}

impl LoggerConfig {
    /// Defaults overridden by `OFFLOAD_LOG` (filter directives) and
    /// `OFFLOAD_LOG_FORMAT` (text|json).
    pub fn from_env() -> Result<Self, LoggerError> {
        let mut cfg = Self::default();
        if let Ok(level) = std::env::var("OFFLOAD_LOG") {
            cfg.level = level;
        }
        if let Ok(format) = std::env::var("OFFLOAD_LOG_FORMAT") {
            cfg.format = format.parse()?;
        }
        Ok(cfg)
    }
}
