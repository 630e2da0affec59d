use crate::cli::{
    actions::Action,
    commands::{self, ARG_VERBOSITY},
    dispatch::handler,
    globals::GlobalArgs,
    telemetry,
};
use anyhow::Result;
use tracing::Level;

fn get_verbosity_level(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Start the CLI
///
/// # Errors
/// Returns an error if logging cannot be initialized or the arguments do not
/// map to an action.
pub fn start() -> Result<(GlobalArgs, Action)> {
    let matches = commands::new().get_matches();

    let verbosity = matches.get_one::<u8>(ARG_VERBOSITY).copied().unwrap_or(0);
    telemetry::init(Some(get_verbosity_level(verbosity)))?;

    handler(&matches)
}
