use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins when set; otherwise both crates log at info.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ledger_service=info,ledger_client=info,warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
