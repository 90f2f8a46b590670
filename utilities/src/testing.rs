//! Helpers shared by tests across the workspace. Enabled with the
//! `test-utils` feature.

use std::path::PathBuf;
use tempfile::TempDir;

/// A temp directory plus a path inside it that does not exist yet. Handy for
/// exercising database-creation paths; the directory lives as long as the
/// returned guard.
pub fn new_temp_directory_with_nonexistent_file() -> (TempDir, PathBuf) {
	let dir = tempfile::tempdir().expect("should create temp dir");
	let file = dir.path().join("db");
	assert!(!file.exists());
	(dir, file)
}

/// Best-effort tracing init for tests; repeated calls are fine.
pub fn init_test_tracing() {
	let _ = tracing_subscriber::FmtSubscriber::builder()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}
