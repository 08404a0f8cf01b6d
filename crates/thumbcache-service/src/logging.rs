use std::io::IsTerminal;

use tracing_subscriber::fmt::fmt;

use crate::config::{LogFormat, Logging};

/// Initializes the logging system according to the configuration.
pub fn init(config: &Logging) {
    let format = match config.format {
        LogFormat::Auto if std::io::stderr().is_terminal() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        other => other,
    };

    let subscriber = fmt()
        .with_max_level(config.level)
        .with_target(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Pretty => subscriber.pretty().init(),
        LogFormat::Simplified => subscriber.compact().init(),
        LogFormat::Json => subscriber.json().flatten_event(true).init(),
        LogFormat::Auto => unreachable!("resolved above"),
    }
}
