use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a `DEBUG` subscriber for the test binary, capturing `log` records of the library.
pub fn setup_test_environment() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing_core::Level::DEBUG)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .init();
    });
}
