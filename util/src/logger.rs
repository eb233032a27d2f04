//! Logging set up for the executables
//!
//! Log records go both to stdout, with coloured level tags, and to the session's log file without
//! colour. Every line is stamped with the number of seconds since the session started. Records
//! from threads other than the main thread carry the thread's name, so output from the controller
//! worker can be told apart from the network loop.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External imports
use colored::Colorize;
use log::{info, Level};
use std::fmt::Display;
use thiserror::Error;

// Internal imports
use crate::session;

// Re-exports
pub use log::LevelFilter;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Settings of the logger.
#[derive(Debug, Clone)]
pub struct LoggerSettings {
    /// Least severe level written. Must be at least as verbose as `Info`.
    pub min_level: LevelFilter,

    /// Levels overriding `min_level` for particular targets (module paths)
    pub target_levels: Vec<(String, LevelFilter)>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Errors associated with initialising the logger.
#[derive(Debug, Error)]
pub enum LoggerInitError {
    #[error("Expected a log level at least as verbose as `INFO`, found `{0}`")]
    InvalidMinLogLevel(LevelFilter),

    #[error("Error initialising the log file: {0}")]
    LogFileInitError(std::io::Error),

    #[error("An error occured while setting up the logger: {0}")]
    FernInitError(log::SetLoggerError),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            min_level: LevelFilter::Debug,
            // The zmq bindings and the QP solver are chatty below info
            target_levels: vec![
                ("zmq".into(), LevelFilter::Info),
                ("osqp".into(), LevelFilter::Info),
            ],
        }
    }
}

impl LoggerSettings {
    /// Default settings with the given minimum level.
    pub fn with_min_level(min_level: LevelFilter) -> Self {
        Self {
            min_level,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), LoggerInitError> {
        match self.min_level < Level::Info {
            true => Err(LoggerInitError::InvalidMinLogLevel(self.min_level)),
            false => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Initialise the logger for this execution.
///
/// May only succeed once per process, later calls return `FernInitError`.
pub fn logger_init(
    settings: &LoggerSettings,
    session: &session::Session,
) -> Result<(), LoggerInitError> {
    settings.validate()?;

    let log_file = fern::log_file(session.log_file_path.clone())
        .map_err(LoggerInitError::LogFileInitError)?;

    let stdout = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("{}", format_record(record, message, true)))
        })
        .chain(std::io::stdout());

    let file = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("{}", format_record(record, message, false)))
        })
        .chain(log_file);

    settings
        .target_levels
        .iter()
        .fold(fern::Dispatch::new().level(settings.min_level), |d, (target, level)| {
            d.level_for(target.clone(), *level)
        })
        .chain(stdout)
        .chain(file)
        .apply()
        .map_err(LoggerInitError::FernInitError)?;

    info!("Logging initialised");
    if let Ok(epoch) = session::get_epoch() {
        info!("    Session epoch: {}", epoch);
    }
    info!("    Log level: {:?}", settings.min_level);
    for (target, level) in settings.target_levels.iter() {
        info!("    Log level of {}: {:?}", target, level);
    }
    info!("    Log file path: {:?}", session.log_file_path);

    Ok(())
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn format_record(record: &log::Record, message: &dyn Display, colour: bool) -> String {
    format_line(
        session::get_elapsed_seconds(),
        record.level(),
        record.target(),
        std::thread::current().name(),
        message,
        colour,
    )
}

/// Format one log line.
///
/// Debug and trace lines include the target. The thread is only named if it isn't `main`.
fn format_line(
    elapsed_s: f64,
    level: Level,
    target: &str,
    thread: Option<&str>,
    message: &dyn Display,
    colour: bool,
) -> String {
    let tag = match colour {
        true => coloured_tag(level),
        false => level_tag(level).to_string(),
    };

    let thread = match thread {
        Some(t) if t != "main" => format!(" {}", t),
        Some(_) => String::new(),
        None => " <unnamed>".to_string(),
    };

    match level > Level::Info {
        true => format!("[{:10.6} {}{}] {}: {}", elapsed_s, tag, thread, target, message),
        false => format!("[{:10.6} {}{}] {}", elapsed_s, tag, thread, message),
    }
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Trace => "TRC",
        Level::Debug => "DBG",
        Level::Info => "INF",
        Level::Warn => "WRN",
        Level::Error => "ERR",
    }
}

fn coloured_tag(level: Level) -> String {
    let tag = level_tag(level);

    match level {
        Level::Trace => tag.dimmed().italic(),
        Level::Debug => tag.dimmed(),
        Level::Info => tag.normal(),
        Level::Warn => tag.yellow(),
        Level::Error => tag.red().bold(),
    }
    .to_string()
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_format_line() {
        let info = format_line(
            1.5,
            Level::Info,
            "mpc_lib::worker",
            Some("main"),
            &"started",
            false,
        );
        assert_eq!(info, "[  1.500000 INF] started");

        let debug = format_line(
            2.0,
            Level::Debug,
            "mpc_lib::worker",
            Some("traj_ctrl_worker"),
            &"solved",
            false,
        );
        assert_eq!(debug, "[  2.000000 DBG traj_ctrl_worker] mpc_lib::worker: solved");
    }

    #[test]
    fn test_settings() {
        assert!(LoggerSettings::default().validate().is_ok());
        assert!(LoggerSettings::with_min_level(LevelFilter::Trace).validate().is_ok());
        assert!(matches!(
            LoggerSettings::with_min_level(LevelFilter::Warn).validate(),
            Err(LoggerInitError::InvalidMinLogLevel(LevelFilter::Warn))
        ));

        let settings = LoggerSettings::default();
        let targets: Vec<&str> = settings
            .target_levels
            .iter()
            .map(|(t, _)| t.as_str())
            .collect();
        assert!(targets.contains(&"zmq"));
    }
}
