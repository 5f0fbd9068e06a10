use std::path::PathBuf;
use std::sync::Once;

pub static INIT_TEST_ONCE: Once = Once::new();

pub struct TestContext {
    pub crate_root: PathBuf,
    pub test_name: String,
}

/// Test names as produced by the test harness (`module::test_fn`) flattened so
/// they can be used as a directory name.
pub fn escape_test_name(test_name: &str) -> String {
    test_name
        .replace("::", "_")
        .replace([':', '/', '\\'], "_")
}

/// One-time env and logging initialisation for tests. Returns a
/// [`TestContext`] describing the running test.
#[macro_export]
macro_rules! setup_test {
    () => {{
        $crate::test_utils::helpers::INIT_TEST_ONCE.call_once(|| {
            $crate::env::load_optional_env_files();
            let _ = $crate::logging::configure_logging();
        });

        let cur_thread = std::thread::current();
        let test_name = $crate::test_utils::helpers::escape_test_name(
            cur_thread.name().unwrap_or("unknown"),
        );

        $crate::test_utils::helpers::TestContext {
            crate_root: std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")),
            test_name,
        }
    }};
}
