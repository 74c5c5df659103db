//! Shared helpers for unit and integration tests.
//!
//! Provides consistent logging initialization plus the phase/assertion macros
//! used across the test suites. Logging is active when the crate is built
//! with the `test-util` feature; without it the helpers are no-ops so the
//! assertions still run in default builds.

/// Initialize test logging.
///
/// Safe to call multiple times; only the first call takes effect.
pub fn init_test_logging() {
    #[cfg(feature = "test-util")]
    {
        use std::sync::Once;
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_max_level(tracing::Level::TRACE)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .try_init();
        });
    }
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        $crate::tracing_compat::info!(phase = %$name, "========================================");
        $crate::tracing_compat::info!(phase = %$name, "TEST PHASE: {}", $name);
        $crate::tracing_compat::info!(phase = %$name, "========================================");
    };
}

/// Log test completion.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        $crate::tracing_compat::info!(test = %$name, "test completed successfully: {}", $name);
    };
}

/// Log before asserting, for context in failure triage.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        $crate::tracing_compat::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
