use std::{fs::File, io::Read, path::Path, str::FromStr};

use log::LevelFilter;
use serde::Deserialize;

/// Engine-wide tunables, separate from any single client's `ConnectOptions`.
///
/// Not part of the wire protocol: loaded once by a host application (or the CLI)
/// to avoid hard-coding retry/keepalive defaults and persistence locations.
#[derive(Deserialize)]
pub struct EngineConfig {
    engine: Engine,
    logger: Logger,
}

impl EngineConfig {
    pub fn retry_interval_secs(&self) -> u64 {
        self.engine.retry_interval_secs
    }

    pub fn default_keep_alive_secs(&self) -> u64 {
        self.engine.default_keep_alive_secs
    }

    pub fn max_buffered_messages(&self) -> usize {
        self.engine.max_buffered_messages
    }

    pub fn persistence_dir(&self) -> Option<&str> {
        self.engine.persistence_dir.as_deref()
    }

    pub fn log_level(&self) -> LevelFilter {
        LevelFilter::from_str(&self.logger.level).unwrap_or_else(|_| {
            panic!(
                "Invalid log level provided: {}. Accepted levels are: Off, Error, Warn, Info, Debug, Trace",
                self.logger.level
            )
        })
    }

    pub fn should_log_file(&self) -> bool {
        self.logger.file
    }

    pub fn should_log_console(&self) -> bool {
        self.logger.console
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine: Engine {
                retry_interval_secs: 20,
                default_keep_alive_secs: 60,
                max_buffered_messages: 100,
                persistence_dir: None,
            },
            logger: Logger {
                console: true,
                file: false,
                level: String::from("Info"),
            },
        }
    }
}

impl TryFrom<&Path> for EngineConfig {
    type Error = toml::de::Error;

    fn try_from(value: &Path) -> Result<Self, toml::de::Error> {
        let mut file = match File::open(value) {
            Ok(file) => file,
            Err(err) => {
                log::warn!(
                    "Could not load file: {} to initialize the configuration, falling back to defaults.",
                    value.to_str().unwrap_or("")
                );
                log::error!("{err}");
                return Ok(EngineConfig::default());
            }
        };

        let mut buf = String::new();
        if let Err(err) = file.read_to_string(&mut buf) {
            log::warn!("Could not read file {}", value.to_str().unwrap_or(""));
            log::error!("{err}");
        }

        toml::from_str(&buf)
    }
}

#[derive(Deserialize)]
struct Engine {
    retry_interval_secs: u64,
    default_keep_alive_secs: u64,
    max_buffered_messages: usize,
    persistence_dir: Option<String>,
}

#[derive(Deserialize)]
struct Logger {
    console: bool,
    file: bool,
    level: String,
}
