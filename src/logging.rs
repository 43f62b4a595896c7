use log::{debug, error, info, log_enabled, warn, Level};

/// Initializes the logger with the `env_logger` crate (honours `RUST_LOG`).
pub fn init_logger() {
    env_logger::init();
}

/// Initializes `env_logger` with an explicit filter such as `"info"` or
/// `"lorans_rs::processing=debug"`, ignoring `RUST_LOG`.
///
/// # Examples
/// ```rust,no_run
/// use lorans_rs::logging::init_logging_with_filter;
///
/// init_logging_with_filter("debug").expect("Failed to initialize logging");
/// ```
pub fn init_logging_with_filter(filter: &str) -> Result<(), log::SetLoggerError> {
    env_logger::Builder::new()
        .parse_filters(filter)
        .format_timestamp_millis()
        .try_init()
}

/// Logs an error message for a device.
pub fn log_device_error(dev_eui: impl std::fmt::Display, message: &str) {
    if log_enabled!(Level::Error) {
        error!("{dev_eui}: {message}");
    }
}

/// Logs a warning message for a device.
pub fn log_device_warn(dev_eui: impl std::fmt::Display, message: &str) {
    if log_enabled!(Level::Warn) {
        warn!("{dev_eui}: {message}");
    }
}

/// Logs an informational message for a device.
pub fn log_device_info(dev_eui: impl std::fmt::Display, message: &str) {
    if log_enabled!(Level::Info) {
        info!("{dev_eui}: {message}");
    }
}

/// Logs a debug message for a device.
pub fn log_device_debug(dev_eui: impl std::fmt::Display, message: &str) {
    if log_enabled!(Level::Debug) {
        debug!("{dev_eui}: {message}");
    }
}
