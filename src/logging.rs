use crate::config::{Config, LogFormat, LogLevel};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::io::Write;

/// Initializes the global logger from the loaded configuration.
///
/// The `silent` flag wins over everything else and turns logging off
/// entirely. `RUST_LOG` still overrides the configured default level.
pub fn init(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let level = effective_level(config);

    let format = config
        .logging
        .as_ref()
        .and_then(|l| l.format.clone())
        .unwrap_or_default();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&level));

    if matches!(format, LogFormat::Json) {
        builder.format(|buf, record| {
            let timestamp: DateTime<Utc> = Utc::now();
            let entry = json!({
                "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "module": record.module_path().unwrap_or("unknown"),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", entry)
        });
    }

    builder.try_init()?;
    Ok(())
}

fn effective_level(config: &Config) -> String {
    if config.silent {
        return "off".to_string();
    }
    config
        .logging
        .as_ref()
        .and_then(|l| l.level.clone())
        .unwrap_or(LogLevel::Info)
        .to_string()
}
