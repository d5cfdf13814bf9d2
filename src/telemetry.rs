use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Installs a fmt subscriber filtered by `RUST_LOG` (default
/// `indexflow=info`). Safe to call more than once; only the first call
/// installs anything.
pub fn init_from_env() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "indexflow=info".into()),
    );
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
