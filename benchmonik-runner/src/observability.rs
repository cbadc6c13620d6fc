//! Logging setup of the `benchmonik` binary.

use std::env;

use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, prelude::*};

/// Installs the global subscriber, writing to stderr.
///
/// With `trace`, closing spans are logged too, which reports the timing of every scenario,
/// iteration and phase.
pub fn init_tracing(trace: bool) {
    let (mut level, env_filter) = parse_rust_log();
    let span_events = if trace {
        level = level.max(Level::DEBUG);
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let format = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_span_events(span_events);

    tracing_subscriber::registry()
        .with(format.with_filter(LevelFilter::from(level)))
        .with(env_filter)
        .init();
}

/// Reads `RUST_LOG` as either a bare level or a full filter directive.
///
/// A bare level is applied on top of the default per-crate filter. Anything else is used
/// literally.
pub fn parse_rust_log() -> (Level, EnvFilter) {
    let level = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => match value.parse::<Level>() {
            Ok(level) => level,
            Err(_) => return (Level::TRACE, EnvFilter::new(value)),
        },
        Err(_) => Level::INFO,
    };

    let env_filter = EnvFilter::new(
        "WARN,\
        benchmonik_core=TRACE,\
        benchmonik_runner=TRACE,\
        ",
    );

    (level, env_filter)
}
