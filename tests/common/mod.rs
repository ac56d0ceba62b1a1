//! Shared test setup.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a `tracing` subscriber that writes through the test harness's
/// captured-output writer, so `tracing::debug!`/`error!` calls inside the
/// collection and transaction state machines show up in `cargo test -- --nocapture`
/// instead of being silently dropped (no subscriber is installed by default).
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}
