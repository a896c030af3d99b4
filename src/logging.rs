//! Log output setup
//! Library code logs through the `log` facade; this installs `env_logger`
//! as the backend for the daemon and for anyone embedding the crate.

use anyhow::{Context, Result};
use chrono::Local;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::logging_config::LoggingConfig;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Installs the logger. `RUST_LOG` takes precedence over the configured level.
///
/// Returns `Ok(false)` if a logger was already installed.
pub fn init(config: &LoggingConfig) -> Result<bool> {
    let level = config
        .level_filter()
        .with_context(|| format!("Invalid log level {:?}", config.level))?;
    if INITIALIZED.load(Ordering::SeqCst) {
        return Ok(false);
    }
    let show_target = config.show_target;

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.format(move |buf, record| {
        let timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z");
        if show_target {
            writeln!(buf, "[{} {:<5} {}] {}", timestamp, record.level(), record.target(), record.args())
        } else {
            writeln!(buf, "[{} {:<5}] {}", timestamp, record.level(), record.args())
        }
    });

    let installed = builder.try_init().is_ok();
    INITIALIZED.store(true, Ordering::SeqCst);
    if installed {
        log::info!("Logging initialized at level {}", level);
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_reports_false() {
        let config = LoggingConfig::default();
        let _ = init(&config).unwrap();
        assert!(!init(&config).unwrap());
    }

    #[test]
    fn invalid_level_is_rejected() {
        let config = LoggingConfig {
            level: "loud".into(),
            show_target: false,
        };
        assert!(init(&config).is_err());
    }
}
