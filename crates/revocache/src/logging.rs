use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, Logging};

/// Initializes the global tracing subscriber from the logging config.
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init(config: &Logging) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    let builder = fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(filter);

    match config.format {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_file(true)
            .with_line_number(true)
            .finish()
            .init(),
        LogFormat::Pretty => builder.pretty().finish().init(),
        LogFormat::Simplified => builder.compact().finish().init(),
        LogFormat::Auto => {
            if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
                builder.pretty().finish().init()
            } else {
                builder.compact().finish().init()
            }
        }
    }
}
