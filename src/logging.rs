use env_logger::{Builder, Env};

/// Env var consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "PINCHPAD_LOG";

pub fn init() {
    let filter = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());

    let _ = Builder::from_env(Env::default())
        .parse_filters(&filter)
        .format_timestamp_millis()
        .try_init();
}
