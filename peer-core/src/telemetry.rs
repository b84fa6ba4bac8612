use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Defaults to INFO, overridable via
/// `RUST_LOG`. Logs go to stderr so the data plane owns stdout.
pub fn setup_logging() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();
}

pub mod testing {
	use std::sync::Once;

	use tracing_subscriber::EnvFilter;

	static INITIALIZED: Once = Once::new();

	/// Best-effort subscriber for tests. Safe to call from every test; only
	/// the first call installs anything.
	pub fn setup_test_logging() {
		INITIALIZED.call_once(|| {
			let _ = tracing_subscriber::fmt()
				.with_env_filter(
					EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
				)
				.with_test_writer()
				.try_init();
		});
	}
}
