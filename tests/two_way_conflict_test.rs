/// Two-way (database-driven) direction resolution against real directories:
/// change propagation, conflict detection when both sides moved on, and the
/// initial-run behavior without a database.
use std::path::Path;
use std::sync::Arc;

use bisync::config::{Config, FolderPairConfig};
use bisync::status::{LogStatusHandler, StatusHandler};
use bisync::strategies::{DeletionPolicy, DirectionPolicy};
use bisync::sync::synchronize;

fn create_file(dir: &Path, name: &str, content: &[u8], mtime: i64) {
	let path = dir.join(name);
	std::fs::write(&path, content).unwrap();
	filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(mtime, 0)).unwrap();
}

fn config_for(left: &Path, right: &Path) -> Config {
	Config {
		folder_pairs: vec![FolderPairConfig {
			left: left.display().to_string(),
			right: right.display().to_string(),
		}],
		direction_policy: DirectionPolicy::TwoWay,
		deletion_policy: DeletionPolicy::Permanent,
		..Default::default()
	}
}

fn handler() -> Arc<dyn StatusHandler> {
	Arc::new(LogStatusHandler::new(false))
}

/// Establish a database recording both sides as equal
async fn establish(config: &Config) {
	let result = synchronize(config, handler()).await.unwrap();
	assert_eq!(result.conflicts, 0, "baseline sync must be clean");
}

#[tokio::test]
async fn test_both_sides_changed_is_a_conflict() {
	let left = tempfile::tempdir().unwrap();
	let right = tempfile::tempdir().unwrap();
	create_file(left.path(), "doc.txt", b"common", 100_000);
	create_file(right.path(), "doc.txt", b"common", 100_000);

	let config = config_for(left.path(), right.path());
	establish(&config).await;

	// both sides diverge after the recorded state
	create_file(left.path(), "doc.txt", b"left version", 200_000);
	create_file(right.path(), "doc.txt", b"right version!", 150_000);

	let result = synchronize(&config, handler()).await.unwrap();
	assert_eq!(result.conflicts, 1);
	assert_eq!(result.files_copied, 0);

	// no side was touched
	assert_eq!(std::fs::read(left.path().join("doc.txt")).unwrap(), b"left version");
	assert_eq!(std::fs::read(right.path().join("doc.txt")).unwrap(), b"right version!");
}

#[tokio::test]
async fn test_single_side_change_propagates() {
	let left = tempfile::tempdir().unwrap();
	let right = tempfile::tempdir().unwrap();
	create_file(left.path(), "doc.txt", b"common", 100_000);
	create_file(right.path(), "doc.txt", b"common", 100_000);

	let config = config_for(left.path(), right.path());
	establish(&config).await;

	// only the right side changed: the change moves left
	create_file(right.path(), "doc.txt", b"newer right", 200_000);

	let result = synchronize(&config, handler()).await.unwrap();
	assert_eq!(result.conflicts, 0);
	assert_eq!(result.files_copied, 1);
	assert_eq!(std::fs::read(left.path().join("doc.txt")).unwrap(), b"newer right");
}

#[tokio::test]
async fn test_initial_run_with_overlap_conflicts() {
	let left = tempfile::tempdir().unwrap();
	let right = tempfile::tempdir().unwrap();
	// no database, different content on both sides: nothing to decide with
	create_file(left.path(), "doc.txt", b"left version", 200_000);
	create_file(right.path(), "doc.txt", b"right version!", 150_000);

	let config = config_for(left.path(), right.path());
	let result = synchronize(&config, handler()).await.unwrap();

	assert_eq!(result.conflicts, 1);
	assert_eq!(result.files_copied, 0);
	assert_eq!(std::fs::read(left.path().join("doc.txt")).unwrap(), b"left version");
}

#[tokio::test]
async fn test_tolerance_boundary_two_seconds() {
	let left = tempfile::tempdir().unwrap();
	let right = tempfile::tempdir().unwrap();
	// exactly 2 seconds apart: equal under the default tolerance
	create_file(left.path(), "a.txt", b"12345", 100_000);
	create_file(right.path(), "a.txt", b"12345", 100_002);
	// 3 seconds apart: the left one is newer
	create_file(left.path(), "b.txt", b"12345", 100_003);
	create_file(right.path(), "b.txt", b"12345", 100_000);

	let config = config_for(left.path(), right.path());
	let result = synchronize(&config, handler()).await.unwrap();

	// a.txt needs no operation; b.txt is an initial-run overlap conflict
	assert_eq!(result.files_copied, 0);
	assert_eq!(result.conflicts, 1);
}

#[tokio::test]
async fn test_corrupt_database_falls_back_to_prefer_newer() {
	let left = tempfile::tempdir().unwrap();
	let right = tempfile::tempdir().unwrap();
	create_file(left.path(), "doc.txt", b"newer", 200_000);
	create_file(right.path(), "doc.txt", b"old..", 100_000);
	std::fs::write(left.path().join(bisync::afs::SYNC_DB_NAME), b"garbage, not a database")
		.unwrap();

	let config = config_for(left.path(), right.path());
	let result = synchronize(&config, handler()).await.unwrap();

	// prefer-newer still propagates the newer left file
	assert_eq!(result.conflicts, 0);
	assert_eq!(result.files_copied, 1);
	assert_eq!(std::fs::read(right.path().join("doc.txt")).unwrap(), b"newer");
}

#[tokio::test]
async fn test_abandoned_temp_files_are_cleaned_up() {
	let left = tempfile::tempdir().unwrap();
	let right = tempfile::tempdir().unwrap();
	create_file(left.path(), "doc-ab12.bsy_tmp", b"leftover", 100_000);
	create_file(left.path(), "real.txt", b"real", 100_000);

	let config = config_for(left.path(), right.path());
	let result = synchronize(&config, handler()).await.unwrap();

	assert!(!left.path().join("doc-ab12.bsy_tmp").exists(), "temp leftover must be removed");
	assert!(right.path().join("real.txt").exists());
	assert!(result.items_deleted >= 1);
}

// vim: ts=4
