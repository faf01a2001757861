/// Move/rename detection: a rename on one side must be executed as a rename
/// on the other instead of a copy plus delete.
use std::path::Path;
use std::sync::Arc;

use bisync::config::{Config, FolderPairConfig};
use bisync::status::{LogStatusHandler, StatusHandler};
use bisync::strategies::{DeletionPolicy, DirectionPolicy};
use bisync::sync::synchronize;

fn create_file(dir: &Path, name: &str, content: &[u8], mtime: i64) {
	let path = dir.join(name);
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).unwrap();
	}
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

#[tokio::test]
async fn test_rename_is_executed_as_move() {
	let left = tempfile::tempdir().unwrap();
	let right = tempfile::tempdir().unwrap();
	let payload = vec![0x5au8; 1024];
	create_file(left.path(), "x.dat", &payload, 100_000);

	let config = config_for(left.path(), right.path());
	synchronize(&config, handler()).await.unwrap();
	assert!(right.path().join("x.dat").exists());

	// rename on the left keeps inode, size and mtime
	std::fs::rename(left.path().join("x.dat"), left.path().join("renamed.dat")).unwrap();

	let result = synchronize(&config, handler()).await.unwrap();

	assert_eq!(result.items_moved, 1, "rename must be detected as a move");
	assert_eq!(result.files_copied, 0, "no byte copy for a pure rename");
	assert!(right.path().join("renamed.dat").exists());
	assert!(!right.path().join("x.dat").exists());
	assert_eq!(std::fs::read(right.path().join("renamed.dat")).unwrap(), payload);
}

#[tokio::test]
async fn test_move_into_new_folder() {
	let left = tempfile::tempdir().unwrap();
	let right = tempfile::tempdir().unwrap();
	let payload = vec![0x42u8; 1024];
	create_file(left.path(), "old/x.dat", &payload, 100_000);

	let config = config_for(left.path(), right.path());
	synchronize(&config, handler()).await.unwrap();
	assert!(right.path().join("old/x.dat").exists());

	std::fs::create_dir_all(left.path().join("new")).unwrap();
	std::fs::rename(left.path().join("old/x.dat"), left.path().join("new/x.dat")).unwrap();

	let result = synchronize(&config, handler()).await.unwrap();

	assert_eq!(result.items_moved, 1);
	assert_eq!(result.files_copied, 0);
	assert!(right.path().join("new/x.dat").exists());
	assert!(!right.path().join("old/x.dat").exists());
	assert_eq!(std::fs::read(right.path().join("new/x.dat")).unwrap(), payload);
}

#[tokio::test]
async fn test_modified_file_is_not_treated_as_move() {
	let left = tempfile::tempdir().unwrap();
	let right = tempfile::tempdir().unwrap();
	create_file(left.path(), "x.dat", b"original content", 100_000);

	let config = config_for(left.path(), right.path());
	synchronize(&config, handler()).await.unwrap();

	// renamed AND rewritten: size and time no longer match the database,
	// so this must be a plain copy + delete
	std::fs::remove_file(left.path().join("x.dat")).unwrap();
	create_file(left.path(), "renamed.dat", b"changed content entirely", 200_000);

	let result = synchronize(&config, handler()).await.unwrap();

	assert_eq!(result.items_moved, 0);
	assert_eq!(result.files_copied, 1);
	assert_eq!(result.items_deleted, 1);
	assert!(right.path().join("renamed.dat").exists());
	assert!(!right.path().join("x.dat").exists());
}

#[tokio::test]
async fn test_move_detection_can_be_disabled() {
	let left = tempfile::tempdir().unwrap();
	let right = tempfile::tempdir().unwrap();
	let payload = vec![0x11u8; 512];
	create_file(left.path(), "x.dat", &payload, 100_000);

	let mut config = config_for(left.path(), right.path());
	synchronize(&config, handler()).await.unwrap();

	config.detect_moved_files = false;
	std::fs::rename(left.path().join("x.dat"), left.path().join("renamed.dat")).unwrap();

	let result = synchronize(&config, handler()).await.unwrap();

	// without detection the rename degrades to copy + delete
	assert_eq!(result.items_moved, 0);
	assert_eq!(result.files_copied, 1);
	assert_eq!(result.items_deleted, 1);
	assert!(right.path().join("renamed.dat").exists());
	assert!(!right.path().join("x.dat").exists());
}

// vim: ts=4
