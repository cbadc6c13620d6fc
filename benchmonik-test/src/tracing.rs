//! Log capture for tests.

use tracing_subscriber::EnvFilter;

/// Crates whose logs are captured at full verbosity.
const CAPTURED: &[&str] = &["benchmonik_core", "benchmonik_runner", "benchmonik_test"];

/// Installs a global subscriber writing to the test runner's captured output.
///
/// `RUST_LOG` takes precedence when set. Otherwise, the benchmonik crates log at `TRACE` and
/// everything else at `ERROR`. Calling this more than once is harmless.
///
/// # Example
///
/// ```
/// benchmonik_test::tracing::init();
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        CAPTURED.iter().fold(EnvFilter::new("ERROR"), |filter, name| {
            filter.add_directive(format!("{name}=TRACE").parse().unwrap())
        })
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .compact()
        .try_init()
        .ok();
}
