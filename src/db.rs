//! Per-pair sync state database
//!
//! A recursive snapshot of the last known in-sync tree, stored alongside the
//! left base folder under a reserved name. An entry means "these two sides
//! were considered equal at commit time"; the executor rewrites the file
//! only after all intended operations of the pair succeeded or were ignored
//! by policy.
//!
//! Loading is tolerant: a missing database is a normal initial run; corrupt
//! or wrong-version content is reported and two-way mode falls back to
//! prefer-newer directions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::afs::{VirtualFs, SYNC_DB_NAME};
use crate::error::{DbError, FsErrorKind};
use crate::path::AbstractPath;
use crate::strategies::CompareVariant;
use crate::transact::temp_target_name;

pub const DB_FORMAT: &str = "bisync.db";
pub const DB_VERSION: u32 = 1;

/// One side's file state at commit time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InSyncDescr {
	pub mtime: i64,
	pub size: u64,
	#[serde(default)]
	pub fingerprint: String,
}

/// A file considered equal on both sides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InSyncFile {
	pub left: InSyncDescr,
	pub right: InSyncDescr,

	/// The compare variant that judged this entry equal
	pub cmp_var: CompareVariant,
}

/// A symlink considered equal on both sides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InSyncSymlink {
	pub left_mtime: i64,
	pub right_mtime: i64,
	pub cmp_var: CompareVariant,
}

/// Distinguishes folders that really existed on both sides from placeholder
/// rows materialized only to host in-sync descendants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FolderStatus {
	#[default]
	Real,
	Placeholder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InSyncFolder {
	#[serde(default)]
	pub status: FolderStatus,
	#[serde(default)]
	pub files: BTreeMap<String, InSyncFile>,
	#[serde(default)]
	pub symlinks: BTreeMap<String, InSyncSymlink>,
	#[serde(default)]
	pub folders: BTreeMap<String, InSyncFolder>,
}

impl InSyncFolder {
	pub fn placeholder() -> Self {
		InSyncFolder { status: FolderStatus::Placeholder, ..Default::default() }
	}

	pub fn is_empty(&self) -> bool {
		self.files.is_empty() && self.symlinks.is_empty() && self.folders.is_empty()
	}
}

/// On-disk document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDb {
	pub format: String,
	pub version: u32,

	/// Variant of the run that produced this snapshot
	pub cmp_var: CompareVariant,

	pub root: InSyncFolder,
}

impl SyncDb {
	pub fn new(cmp_var: CompareVariant, root: InSyncFolder) -> Self {
		SyncDb { format: DB_FORMAT.to_string(), version: DB_VERSION, cmp_var, root }
	}
}

fn db_path(left_base: &AbstractPath) -> AbstractPath {
	left_base.join(SYNC_DB_NAME)
}

/// Load the database of a folder pair. `Ok(None)` on the initial run.
pub async fn load_db(
	fs: &dyn VirtualFs,
	left_base: &AbstractPath,
) -> Result<Option<SyncDb>, DbError> {
	let path = db_path(left_base);
	let display = path.display_path();

	let mut reader = match fs.open_input(&path).await {
		Ok(reader) => reader,
		Err(e) if e.kind == FsErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(DbError::LoadFailed { path: display, source: Box::new(e) }),
	};

	let mut bytes = Vec::new();
	let mut buf = vec![0u8; reader.block_size()];
	loop {
		let n = reader
			.try_read(&mut buf)
			.await
			.map_err(|e| DbError::LoadFailed { path: display.clone(), source: Box::new(e) })?;
		if n == 0 {
			break;
		}
		bytes.extend_from_slice(&buf[..n]);
	}

	let db: SyncDb = serde_json::from_slice(&bytes)
		.map_err(|e| DbError::Corrupted { path: display.clone(), message: e.to_string() })?;

	if db.format != DB_FORMAT {
		return Err(DbError::Corrupted {
			path: display,
			message: format!("unexpected format descriptor {:?}", db.format),
		});
	}
	if db.version != DB_VERSION {
		return Err(DbError::WrongVersion { path: display, found: db.version });
	}
	Ok(Some(db))
}

/// Write the database transactionally: temp sibling, then rename into place.
pub async fn save_db(
	fs: &dyn VirtualFs,
	left_base: &AbstractPath,
	db: &SyncDb,
) -> Result<(), DbError> {
	let path = db_path(left_base);
	let display = path.display_path();
	let bytes = serde_json::to_vec(db)
		.map_err(|e| DbError::SaveFailed { path: display.clone(), source: Box::new(e) })?;

	let tmp = left_base.join(&temp_target_name(SYNC_DB_NAME));

	let write = async {
		let mut writer = fs.open_output(&tmp, Some(bytes.len() as u64), None).await?;
		let mut offset = 0;
		while offset < bytes.len() {
			offset += writer.try_write(&bytes[offset..]).await?;
		}
		writer.finalize().await?;
		fs.move_and_rename(&tmp, &path).await
	}
	.await;

	match write {
		Ok(()) => Ok(()),
		Err(e) => {
			let _ = fs.remove_file(&tmp).await;
			Err(DbError::SaveFailed { path: display, source: Box::new(e) })
		}
	}
}

/// Snapshot the paired tree after synchronization. Only pairs that ended up
/// `Equal` with both sides present are recorded; folders hosting nothing but
/// single-sided leftovers become placeholders or disappear.
pub fn build_db_from_tree(base: &crate::tree::BaseFolderPair, cmp_var: CompareVariant) -> InSyncFolder {
	use crate::tree::{Category, FilePair, FolderPair, Side, SymlinkPair};

	fn collect(
		files: &[FilePair],
		symlinks: &[SymlinkPair],
		folders: &[FolderPair],
		cmp_var: CompareVariant,
	) -> InSyncFolder {
		let mut out = InSyncFolder::default();

		for pair in files {
			if pair.category != Category::Equal {
				continue;
			}
			let (left, right) = match (&pair.left, &pair.right) {
				(Some(l), Some(r)) => (l, r),
				_ => continue,
			};
			out.files.insert(
				left.name.clone(),
				InSyncFile {
					left: InSyncDescr {
						mtime: left.attrs.mtime,
						size: left.attrs.size,
						fingerprint: left.attrs.fingerprint.clone(),
					},
					right: InSyncDescr {
						mtime: right.attrs.mtime,
						size: right.attrs.size,
						fingerprint: right.attrs.fingerprint.clone(),
					},
					cmp_var,
				},
			);
		}

		for pair in symlinks {
			if pair.category != Category::Equal {
				continue;
			}
			let (left, right) = match (&pair.left, &pair.right) {
				(Some(l), Some(r)) => (l, r),
				_ => continue,
			};
			out.symlinks.insert(
				left.name.clone(),
				InSyncSymlink {
					left_mtime: left.attrs.mtime,
					right_mtime: right.attrs.mtime,
					cmp_var,
				},
			);
		}

		for pair in folders {
			let sub = collect(&pair.files, &pair.symlinks, &pair.folders, cmp_var);
			let both_sides =
				pair.exists_on(Side::Left) && pair.exists_on(Side::Right);
			if both_sides && pair.category == Category::Equal {
				out.folders.insert(pair.name_on(Side::Left).to_string(), sub);
			} else if !sub.is_empty() {
				// keep descendants reachable without claiming the folder
				// itself was in sync
				let mut sub = sub;
				sub.status = FolderStatus::Placeholder;
				out.folders.insert(pair.display_name().to_string(), sub);
			}
		}
		out
	}

	collect(&base.files, &base.symlinks, &base.folders, cmp_var)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::afs::local::LocalFs;
	use crate::path::Device;

	fn sample_db() -> SyncDb {
		let mut root = InSyncFolder::default();
		root.files.insert(
			"a.txt".to_string(),
			InSyncFile {
				left: InSyncDescr { mtime: 100, size: 3, fingerprint: "1:2".into() },
				right: InSyncDescr { mtime: 100, size: 3, fingerprint: String::new() },
				cmp_var: CompareVariant::TimeSize,
			},
		);
		let mut sub = InSyncFolder::default();
		sub.symlinks.insert(
			"link".to_string(),
			InSyncSymlink { left_mtime: 50, right_mtime: 50, cmp_var: CompareVariant::TimeSize },
		);
		root.folders.insert("sub".to_string(), sub);
		SyncDb::new(CompareVariant::TimeSize, root)
	}

	#[tokio::test]
	async fn test_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let fs_impl = LocalFs::new(dir.path().to_path_buf());
		let base = AbstractPath::device_root(Device::Local { root: dir.path().to_path_buf() });

		let db = sample_db();
		save_db(&fs_impl, &base, &db).await.unwrap();

		let loaded = load_db(&fs_impl, &base).await.unwrap().unwrap();
		assert_eq!(loaded, db);

		// no temp leftovers from the transactional write
		let leftovers: Vec<_> = std::fs::read_dir(dir.path())
			.unwrap()
			.filter_map(|e| e.ok())
			.filter(|e| e.file_name().to_string_lossy().ends_with(".bsy_tmp"))
			.collect();
		assert!(leftovers.is_empty());
	}

	#[tokio::test]
	async fn test_missing_db_is_initial_run() {
		let dir = tempfile::tempdir().unwrap();
		let fs_impl = LocalFs::new(dir.path().to_path_buf());
		let base = AbstractPath::device_root(Device::Local { root: dir.path().to_path_buf() });
		assert!(load_db(&fs_impl, &base).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_corrupt_db_is_reported() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join(SYNC_DB_NAME), b"not json at all").unwrap();

		let fs_impl = LocalFs::new(dir.path().to_path_buf());
		let base = AbstractPath::device_root(Device::Local { root: dir.path().to_path_buf() });
		assert!(matches!(load_db(&fs_impl, &base).await, Err(DbError::Corrupted { .. })));
	}

	#[tokio::test]
	async fn test_wrong_version_is_reported() {
		let dir = tempfile::tempdir().unwrap();
		let mut db = sample_db();
		db.version = 999;
		std::fs::write(dir.path().join(SYNC_DB_NAME), serde_json::to_vec(&db).unwrap()).unwrap();

		let fs_impl = LocalFs::new(dir.path().to_path_buf());
		let base = AbstractPath::device_root(Device::Local { root: dir.path().to_path_buf() });
		assert!(matches!(
			load_db(&fs_impl, &base).await,
			Err(DbError::WrongVersion { found: 999, .. })
		));
	}

	#[test]
	fn test_placeholder_status_serialization() {
		let folder = InSyncFolder::placeholder();
		let json = serde_json::to_string(&folder).unwrap();
		assert!(json.contains("placeholder"));
		let back: InSyncFolder = serde_json::from_str(&json).unwrap();
		assert_eq!(back.status, FolderStatus::Placeholder);
	}
}

// vim: ts=4
