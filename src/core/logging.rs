//! Logging initialization and utilities

/// Initialize the logging system
///
/// Uses env_logger with default filter level of `info`.
/// Override with RUST_LOG environment variable, e.g.
/// `RUST_LOG=vocache::store=debug` to trace skipped cache writes.
///
/// # Example
/// ```
/// vocache::core::logging::init();
/// log::info!("Object cache tool started");
/// ```
pub fn init() {
    // A second init (tests, embedding apps) is harmless.
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    )
    .format_timestamp_millis()
    .try_init();
}
