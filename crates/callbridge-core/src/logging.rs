use std::sync::Once;

const DEFAULT_FILTER: &str = "callbridge_core=debug,callbridge_demo=debug";

/// Initialize tracing/logging. Call once from the host before placing calls;
/// later calls are no-ops. `RUST_LOG` overrides the default filter.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .try_init();
    });
}
