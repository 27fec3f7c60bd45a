use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use crate::error::{ProxyError, Result};
use chrono::{DateTime, Utc};
use log::{LevelFilter, Metadata, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
        }
    }
}

struct Sink {
    level: LevelFilter,
    writer: Mutex<BufWriter<Box<dyn Write + Send>>>,
}

/// Logger writing text or JSON lines to stdout and/or files, each target with
/// its own level.
pub struct CustomLogger {
    level: LevelFilter,
    format: LogFormat,
    sinks: Vec<Sink>,
}

impl CustomLogger {
    pub fn new(config: LoggingConfig) -> Result<Self> {
        let level: LevelFilter = config.level.unwrap_or_default().into();
        let format = config.format.unwrap_or_default();
        let targets = config.targets.unwrap_or_else(|| {
            vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]
        });

        let mut sinks = Vec::with_capacity(targets.len());
        for target in targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target
                        .path
                        .as_ref()
                        .ok_or_else(|| ProxyError::Config("File log target requires a path".to_string()))?;
                    Box::new(OpenOptions::new().create(true).append(true).open(path)?)
                }
            };
            sinks.push(Sink {
                level: target.level.map(LevelFilter::from).unwrap_or(level),
                writer: Mutex::new(BufWriter::new(writer)),
            });
        }

        Ok(Self { level, format, sinks })
    }

    pub fn init(config: LoggingConfig) -> Result<()> {
        let logger = Self::new(config)?;
        let max_level = logger.sinks.iter().map(|s| s.level).max().unwrap_or(logger.level);

        log::set_boxed_logger(Box::new(logger))
            .map_err(|e| ProxyError::Config(format!("Logger already initialized: {}", e)))?;
        log::set_max_level(max_level);
        Ok(())
    }

    fn format_record(&self, record: &Record) -> String {
        match self.format {
            LogFormat::Text => format_text(record),
            LogFormat::Json => format_json(record),
        }
    }
}

fn format_text(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    format!(
        "{} [{}] [{}] {}",
        timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level(),
        record.target(),
        record.args()
    )
}

fn format_json(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    json!({
        "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().as_str().to_lowercase(),
        "target": record.target(),
        "module": record.module_path().unwrap_or("unknown"),
        "line": record.line().unwrap_or(0),
        "thread": std::thread::current().name().unwrap_or("unnamed"),
        "message": record.args().to_string(),
    })
    .to_string()
}

impl log::Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.sinks.iter().any(|sink| metadata.level() <= sink.level)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = self.format_record(record);
        for sink in &self.sinks {
            if record.level() <= sink.level {
                if let Ok(mut writer) = sink.writer.lock() {
                    let _ = writeln!(writer, "{}", line);
                    let _ = writer.flush();
                }
            }
        }
    }

    fn flush(&self) {
        for sink in &self.sinks {
            if let Ok(mut writer) = sink.writer.lock() {
                let _ = writer.flush();
            }
        }
    }
}

/// `env_logger` setup used when the config file has no logging section.
/// `RUST_LOG` still takes precedence over `level`.
pub fn init_fallback(level: LogLevel, format: LogFormat) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.to_string()));
    if format == LogFormat::Json {
        builder.format(|buf, record| writeln!(buf, "{}", format_json(record)));
    }
    // a logger may already be installed, e.g. by a test harness
    let _ = builder.try_init();
}

pub fn parse_log_level(s: &str) -> Result<LogLevel> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(ProxyError::Config(format!(
            "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
            s
        ))),
    }
}

pub fn parse_log_format(s: &str) -> Result<LogFormat> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(ProxyError::Config(format!("Invalid log format: {}. Must be one of: text, json", s))),
    }
}
