use std::sync::Once;

use env_logger::Env;

static INIT: Once = Once::new();

/// Initialize stderr logging based on `SERVOSCREEN_LOG`/`RUST_LOG` (default `info`).
///
/// Safe to call more than once; the logger is installed on the first call.
pub fn init_logging() {
    INIT.call_once(|| {
        let filter = std::env::var("SERVOSCREEN_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| "info".to_string());
        env_logger::Builder::from_env(Env::default().default_filter_or(filter))
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}
