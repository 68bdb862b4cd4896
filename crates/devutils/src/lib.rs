use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install a global fmt subscriber, filtered by `RUST_LOG` and falling back to `default`.
pub fn init_logging(default: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    // Demos and tests may race to install a subscriber, the first one wins
    let _ = tracing::subscriber::set_global_default(subscriber);
}
