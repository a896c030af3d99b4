use log::{LevelFilter, ParseLevelError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of off, error, warn, info, debug, trace
    pub level: String,

    /// Print the module path of each record
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            show_target: false,
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> Result<LevelFilter, ParseLevelError> {
        LevelFilter::from_str(self.level.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_level_names() {
        let mut config = LoggingConfig::default();
        assert_eq!(config.level_filter(), Ok(LevelFilter::Info));

        config.level = "DEBUG".into();
        assert_eq!(config.level_filter(), Ok(LevelFilter::Debug));

        config.level = "chatty".into();
        assert!(config.level_filter().is_err());
    }
}
