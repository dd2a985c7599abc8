use std::{sync::Once, time::Duration};

static INIT_LOGGING: Once = Once::new();

/// Upper bound for anything a test waits on.
#[allow(dead_code)]
pub const PATIENCE: Duration = Duration::from_secs(5);

/// Installs a trace-level subscriber writing to the test harness. Only the
/// first call does anything.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}
