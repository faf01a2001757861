/// Versioning: deletes and overwrites divert into the versioning tree under
/// the configured naming style, and limit enforcement trims old versions.
use std::path::Path;
use std::sync::Arc;

use bisync::afs::{local::LocalFs, FsRegistry};
use bisync::config::{Config, FolderPairConfig};
use bisync::path::{AbstractPath, Device};
use bisync::session::DeviceLimiter;
use bisync::status::{LogStatusHandler, StatusHandler};
use bisync::strategies::{DeletionPolicy, DirectionPolicy, VersioningStyle};
use bisync::sync::synchronize;
use bisync::versioning::{
	apply_versioning_limits, format_version_time, list_versions, parse_versioned_file_name,
	VersioningLimitFolder, VersioningLimits,
};
use chrono::TimeZone;

fn create_file(dir: &Path, name: &str, content: &[u8], mtime: i64) {
	let path = dir.join(name);
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).unwrap();
	}
	std::fs::write(&path, content).unwrap();
	filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(mtime, 0)).unwrap();
}

fn config_for(left: &Path, right: &Path, versions: &Path, style: VersioningStyle) -> Config {
	Config {
		folder_pairs: vec![FolderPairConfig {
			left: left.display().to_string(),
			right: right.display().to_string(),
		}],
		direction_policy: DirectionPolicy::TwoWay,
		deletion_policy: DeletionPolicy::Versioning,
		versioning_folder: Some(versions.display().to_string()),
		versioning_style: style,
		..Default::default()
	}
}

fn handler() -> Arc<dyn StatusHandler> {
	Arc::new(LogStatusHandler::new(false))
}

fn tree_files(root: &Path) -> Vec<String> {
	let mut out = Vec::new();
	fn walk(dir: &Path, rel: &str, out: &mut Vec<String>) {
		for entry in std::fs::read_dir(dir).unwrap().filter_map(|e| e.ok()) {
			let name = entry.file_name().to_string_lossy().into_owned();
			let child_rel =
				if rel.is_empty() { name.clone() } else { format!("{}/{}", rel, name) };
			if entry.path().is_dir() {
				walk(&entry.path(), &child_rel, out);
			} else {
				out.push(child_rel);
			}
		}
	}
	walk(root, "", &mut out);
	out.sort();
	out
}

#[tokio::test]
async fn test_delete_diverts_to_timestamp_file_versioning() {
	let left = tempfile::tempdir().unwrap();
	let right = tempfile::tempdir().unwrap();
	let versions = tempfile::tempdir().unwrap();
	create_file(left.path(), "doc.txt", b"precious", 100_000);

	let config =
		config_for(left.path(), right.path(), versions.path(), VersioningStyle::TimestampFile);
	synchronize(&config, handler()).await.unwrap();
	assert!(right.path().join("doc.txt").exists());

	// deleting on the left sends the right copy into the versioning tree
	std::fs::remove_file(left.path().join("doc.txt")).unwrap();
	let result = synchronize(&config, handler()).await.unwrap();
	assert_eq!(result.items_deleted, 1);
	assert!(!right.path().join("doc.txt").exists());

	let versioned = tree_files(versions.path());
	assert_eq!(versioned.len(), 1, "exactly one version expected: {:?}", versioned);
	let (_, original) = parse_versioned_file_name(&versioned[0])
		.expect("versioned name must parse back");
	assert_eq!(original, "doc.txt");
	assert_eq!(
		std::fs::read(versions.path().join(&versioned[0])).unwrap(),
		b"precious"
	);
}

#[tokio::test]
async fn test_overwrite_diverts_old_content_to_timestamp_folder() {
	let left = tempfile::tempdir().unwrap();
	let right = tempfile::tempdir().unwrap();
	let versions = tempfile::tempdir().unwrap();
	create_file(left.path(), "doc.txt", b"old content", 100_000);

	let config =
		config_for(left.path(), right.path(), versions.path(), VersioningStyle::TimestampFolder);
	synchronize(&config, handler()).await.unwrap();

	create_file(left.path(), "doc.txt", b"brand new content", 200_000);
	let result = synchronize(&config, handler()).await.unwrap();
	assert_eq!(result.files_copied, 1);
	assert_eq!(std::fs::read(right.path().join("doc.txt")).unwrap(), b"brand new content");

	// the replaced right-side content lives under <root>/<stamp>/doc.txt
	let versioned = tree_files(versions.path());
	assert_eq!(versioned.len(), 1, "old version expected: {:?}", versioned);
	assert!(versioned[0].ends_with("/doc.txt"), "dated subfolder expected: {}", versioned[0]);
	assert_eq!(
		std::fs::read(versions.path().join(&versioned[0])).unwrap(),
		b"old content"
	);
}

#[tokio::test]
async fn test_versioning_inside_synced_tree_is_refused() {
	let left = tempfile::tempdir().unwrap();
	let right = tempfile::tempdir().unwrap();
	create_file(left.path(), "doc.txt", b"x", 100_000);

	let versions_inside = left.path().join("versions");
	let config =
		config_for(left.path(), right.path(), &versions_inside, VersioningStyle::Replace);
	assert!(synchronize(&config, handler()).await.is_err());
}

#[tokio::test]
async fn test_limit_enforcement_by_age_and_count() {
	// ages in days: 1, 2, 3, 10, 20, 40, 50, 60; max_age 30 keeps five,
	// the floor of 2 is already satisfied, the cap of 5 bites nothing more:
	// the versions aged 40, 50 and 60 days go
	let versions = tempfile::tempdir().unwrap();
	let midnight = chrono::Local::now()
		.with_time(chrono::NaiveTime::MIN)
		.single()
		.unwrap();

	let mut names = std::collections::HashMap::new();
	for age_days in [1i64, 2, 3, 10, 20, 40, 50, 60] {
		let stamp_time = midnight - chrono::Duration::days(age_days) - chrono::Duration::hours(1);
		let name = format!("report.txt {}.txt", format_version_time(stamp_time));
		std::fs::write(versions.path().join(&name), b"v").unwrap();
		names.insert(age_days, name);
	}

	let root = AbstractPath::device_root(Device::Local { root: versions.path().to_path_buf() });
	let mut registry = FsRegistry::new();
	registry.insert(Arc::new(LocalFs::new(versions.path().to_path_buf())));

	apply_versioning_limits(
		&[VersioningLimitFolder {
			root,
			limits: VersioningLimits { max_age_days: 30, count_min: 2, count_max: 5 },
		}],
		&registry,
		Arc::new(DeviceLimiter::new([], 2)),
		handler(),
	)
	.await
	.unwrap();

	for age_days in [1i64, 2, 3, 10, 20] {
		assert!(
			versions.path().join(&names[&age_days]).exists(),
			"version aged {} days must survive",
			age_days
		);
	}
	for age_days in [40i64, 50, 60] {
		assert!(
			!versions.path().join(&names[&age_days]).exists(),
			"version aged {} days must be trimmed",
			age_days
		);
	}
}

#[tokio::test]
async fn test_count_floor_keeps_versions_beyond_age() {
	// all versions are old; count_min 2 keeps the two newest of them
	let versions = tempfile::tempdir().unwrap();
	let midnight = chrono::Local::now()
		.with_time(chrono::NaiveTime::MIN)
		.single()
		.unwrap();

	let mut names = Vec::new();
	for age_days in [40i64, 50, 60] {
		let stamp_time = midnight - chrono::Duration::days(age_days) - chrono::Duration::hours(1);
		let name = format!("report.txt {}.txt", format_version_time(stamp_time));
		std::fs::write(versions.path().join(&name), b"v").unwrap();
		names.push((age_days, name));
	}

	let root = AbstractPath::device_root(Device::Local { root: versions.path().to_path_buf() });
	let mut registry = FsRegistry::new();
	registry.insert(Arc::new(LocalFs::new(versions.path().to_path_buf())));

	apply_versioning_limits(
		&[VersioningLimitFolder {
			root,
			limits: VersioningLimits { max_age_days: 30, count_min: 2, count_max: 0 },
		}],
		&registry,
		Arc::new(DeviceLimiter::new([], 2)),
		handler(),
	)
	.await
	.unwrap();

	let survivors = tree_files(versions.path());
	assert_eq!(survivors.len(), 2);
	// the oldest one went
	assert!(!versions.path().join(&names[2].1).exists());
}

#[tokio::test]
async fn test_list_stored_versions() {
	let versions = tempfile::tempdir().unwrap();
	let t1 = chrono::Local.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).single().unwrap();
	let t2 = chrono::Local.with_ymd_and_hms(2024, 6, 7, 8, 9, 10).single().unwrap();

	// two timestamp-file versions of doc.txt
	std::fs::write(
		versions.path().join(format!("doc.txt {}.txt", format_version_time(t2))),
		b"newer",
	)
	.unwrap();
	std::fs::write(
		versions.path().join(format!("doc.txt {}.txt", format_version_time(t1))),
		b"older",
	)
	.unwrap();
	// a dated folder holding sub/x.txt
	std::fs::create_dir_all(versions.path().join(format!("{}/sub", format_version_time(t1))))
		.unwrap();
	std::fs::write(
		versions.path().join(format!("{}/sub/x.txt", format_version_time(t1))),
		b"x",
	)
	.unwrap();
	// a name that is no version is not listed
	std::fs::write(versions.path().join("stray.txt"), b"ignored").unwrap();

	let root = AbstractPath::device_root(Device::Local { root: versions.path().to_path_buf() });
	let mut registry = FsRegistry::new();
	registry.insert(Arc::new(LocalFs::new(versions.path().to_path_buf())));

	let listed = list_versions(&root, &registry, Arc::new(DeviceLimiter::new([], 2)), handler())
		.await
		.unwrap();

	assert_eq!(listed.len(), 2, "unexpected originals: {:?}", listed.keys());

	let doc = &listed["doc.txt"];
	assert_eq!(doc.len(), 2);
	// oldest first
	assert_eq!(doc[0].time, t1.timestamp());
	assert_eq!(doc[1].time, t2.timestamp());
	assert_eq!(doc[0].stamp(), format_version_time(t1));
	assert!(!doc[0].is_symlink);

	let sub = &listed["sub/x.txt"];
	assert_eq!(sub.len(), 1);
	assert_eq!(sub[0].time, t1.timestamp());
	assert!(sub[0].path.display_path().ends_with("x.txt"));
}

#[tokio::test]
async fn test_empty_folder_cascade_after_trim() {
	let versions = tempfile::tempdir().unwrap();
	let midnight = chrono::Local::now()
		.with_time(chrono::NaiveTime::MIN)
		.single()
		.unwrap();
	let stamp_time = midnight - chrono::Duration::days(90) - chrono::Duration::hours(1);
	let name = format!("doc.txt {}.txt", format_version_time(stamp_time));
	std::fs::create_dir_all(versions.path().join("deep/sub")).unwrap();
	std::fs::write(versions.path().join("deep/sub").join(&name), b"v").unwrap();

	let root = AbstractPath::device_root(Device::Local { root: versions.path().to_path_buf() });
	let mut registry = FsRegistry::new();
	registry.insert(Arc::new(LocalFs::new(versions.path().to_path_buf())));

	apply_versioning_limits(
		&[VersioningLimitFolder {
			root,
			limits: VersioningLimits { max_age_days: 30, count_min: 0, count_max: 0 },
		}],
		&registry,
		Arc::new(DeviceLimiter::new([], 2)),
		handler(),
	)
	.await
	.unwrap();

	// the emptied folders disappear; the versioning root itself stays
	assert!(!versions.path().join("deep").exists());
	assert!(versions.path().exists());
}

// vim: ts=4
