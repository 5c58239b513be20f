use std::{fs, io::Write};

use colored::*;
use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};
use time::{format_description::FormatItem, OffsetDateTime};

use crate::config::EngineConfig;

const TIMESTAMP_FORMAT_UTC: &[FormatItem] = time::macros::format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
);

pub struct EngineLogger {
    write_file: bool,
    write_console: bool,
}

impl EngineLogger {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            write_file: config.should_log_file(),
            write_console: config.should_log_console(),
        }
    }

    pub fn init(self, level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_max_level(level);
        log::set_boxed_logger(Box::new(self))
    }

    fn log_console(&self, record: &Record, colorized_level: &str, timestamp: &str) {
        println!("{colorized_level} - {} - {timestamp}", record.args());
    }

    fn log_file(&self, record: &Record, timestamp: &str) {
        let line = format!("{};{};{}\n", record.level(), record.args(), timestamp);
        let path = match record.level() {
            Level::Error => "logs/error.log",
            Level::Debug | Level::Trace => "logs/debug.log",
            Level::Warn | Level::Info => "logs/main.log",
        };

        match fs::OpenOptions::new().append(true).create(true).open(path) {
            Ok(mut file) => {
                let _ = file.write_all(line.as_bytes());
            }
            Err(err) => {
                eprintln!("could not write log entry to {path}: {err}");
            }
        }
    }
}

impl log::Log for EngineLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = OffsetDateTime::now_utc()
            .format(TIMESTAMP_FORMAT_UTC)
            .expect("system clock does not support UTC formatting");

        let colorized_level = match record.level() {
            Level::Error => format!("{:<5}", record.level()).red().to_string(),
            Level::Warn => format!("{:<5}", record.level()).yellow().to_string(),
            Level::Info => format!("{:<5}", record.level()).cyan().to_string(),
            Level::Debug => format!("{:<5}", record.level()).purple().to_string(),
            Level::Trace => format!("{:<5}", record.level()).normal().to_string(),
        };

        if self.write_console {
            self.log_console(record, &colorized_level, &timestamp);
        }
        if self.write_file {
            self.log_file(record, &timestamp);
        }
    }

    fn flush(&self) {}
}
