use std::sync::Once;

static INIT: Once = Once::new();

/// Installs the process tracing subscriber with env-filter control
/// (`RUST_LOG`). Safe to call repeatedly; only the first call installs.
pub fn init_tracing() {
    INIT.call_once(|| {
        #[cfg(any(test, feature = "subscriber"))]
        {
            use tracing_subscriber::{EnvFilter, fmt};
            let _ = fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_target(true)
                .try_init();
        }
    });
}
