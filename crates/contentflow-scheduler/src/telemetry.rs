//! Tracing setup for processes that embed the scheduler.

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns false if a subscriber was already installed.
pub fn init_tracing(json: bool) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_refused() {
        init_tracing(false);
        assert!(!init_tracing(true));
    }
}
