use std::{env, path::Path, str::FromStr, time::SystemTime};

use herald_models::errors::{RuntimeError, SendableError};
use log::{LevelFilter, info};

/// Accepts the usual level names (`error` .. `trace`, `off`) in any case.
pub fn parse_level(value: &str) -> Result<LevelFilter, SendableError> {
    LevelFilter::from_str(value.trim()).map_err(|_| {
        RuntimeError::boxed(
            "utilities.logger.level",
            format!("'{value}' is not a log level"),
        )
    })
}

pub fn setup_logger(level: LevelFilter, log_file: Option<&Path>) -> Result<(), SendableError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        // lapin and async-nats are chatty at debug
        .level_for("lapin", level.min(LevelFilter::Info))
        .level_for("async_nats", level.min(LevelFilter::Info))
        .chain(std::io::stdout());

    if let Some(path) = log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

pub fn print_env() -> std::io::Result<()> {
    let path = env::current_dir()?;
    info!("The current directory is {}", path.display());
    Ok(())
}
