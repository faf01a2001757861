//! Abstract file system contract
//!
//! A uniform capability surface over heterogeneous backends. Backends supply
//! the primitives (stat, directory read, streams, create/remove/rename,
//! recycle); recursive removal and tolerant existence checks are provided in
//! terms of those primitives.

pub mod local;
#[cfg(feature = "sftp")]
pub mod sftp;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{FsError, FsErrorKind};
use crate::path::{AbstractPath, Device};

/// Reserved extension of temporary copy targets. Anything carrying it is
/// fair game for cleanup during sync.
pub const TEMP_FILE_ENDING: &str = ".bsy_tmp";

/// Reserved file name of the per-pair sync database; excluded from traversal.
pub const SYNC_DB_NAME: &str = "sync.bsy_db";

/// Reserved extension of lock files; excluded from traversal.
pub const LOCK_FILE_ENDING: &str = ".bsy_lock";

/// Opaque per-(device, item) identity used as a move-detection hint.
/// Empty when the backend cannot report one; never used for equality.
pub type Fingerprint = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
	File,
	Folder,
	Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttrs {
	pub size: u64,

	/// Seconds since the Unix epoch
	pub mtime: i64,

	pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkAttrs {
	pub mtime: i64,
}

/// One directory entry as reported by a backend.
///
/// A backend that can list a folder but not stat one of its members reports
/// that member as `Failed` instead of failing the whole folder read.
#[derive(Debug, Clone)]
pub enum DirEntry {
	File { name: String, attrs: FileAttrs },
	Folder { name: String },
	Symlink { name: String, attrs: SymlinkAttrs },
	Failed { name: String, error: FsError },
}

impl DirEntry {
	pub fn name(&self) -> &str {
		match self {
			DirEntry::File { name, .. } => name,
			DirEntry::Folder { name } => name,
			DirEntry::Symlink { name, .. } => name,
			DirEntry::Failed { name, .. } => name,
		}
	}
}

/// Outcome of a completed file copy
#[derive(Debug, Clone)]
pub struct FileCopyResult {
	pub file_size: u64,
	pub mod_time: i64,
	pub source_fingerprint: Fingerprint,
	pub target_fingerprint: Fingerprint,

	/// Failing to set the target's modification time is not fatal; several
	/// backends cannot set it reliably. Recorded here instead of thrown.
	pub error_mod_time: Option<FsError>,
}

/// Outcome of finalizing an output stream
#[derive(Debug, Clone)]
pub struct FinalizeResult {
	pub fingerprint: Fingerprint,
	pub error_mod_time: Option<FsError>,
}

/// Byte-granular input stream
#[async_trait]
pub trait FsReader: Send {
	/// Preferred transfer granularity of this stream
	fn block_size(&self) -> usize;

	/// Read into `buf`, returning the number of bytes transferred; 0 means
	/// end of stream.
	async fn try_read(&mut self, buf: &mut [u8]) -> Result<usize, FsError>;
}

/// Byte-granular output stream with transactional finalization
#[async_trait]
pub trait FsWriter: Send {
	fn block_size(&self) -> usize;

	/// Write from `buf`, returning the number of bytes transferred
	async fn try_write(&mut self, buf: &[u8]) -> Result<usize, FsError>;

	/// Flush buffers, apply the modification-time hint and report the
	/// target's fingerprint.
	async fn finalize(self: Box<Self>) -> Result<FinalizeResult, FsError>;
}

/// Capability surface every backend exposes.
///
/// All operations take abstract paths on this backend's device; handing a
/// path of a different device to a backend is a caller bug.
#[async_trait]
pub trait VirtualFs: Send + Sync {
	fn device(&self) -> &Device;

	async fn item_type(&self, path: &AbstractPath) -> Result<ItemType, FsError>;

	/// Enumerate the direct children of a folder
	async fn read_dir(&self, path: &AbstractPath) -> Result<Vec<DirEntry>, FsError>;

	async fn open_input(&self, path: &AbstractPath) -> Result<Box<dyn FsReader>, FsError>;

	/// `size_hint` and `mtime_hint` allow backends to pre-allocate and to
	/// set the modification time during finalization.
	async fn open_output(
		&self,
		path: &AbstractPath,
		size_hint: Option<u64>,
		mtime_hint: Option<i64>,
	) -> Result<Box<dyn FsWriter>, FsError>;

	/// Fast-path copy when source and target live on the same backend type.
	/// Backends without one report `MoveUnsupported` and the caller falls
	/// back to a stream copy.
	async fn copy_file_native(
		&self,
		_src: &AbstractPath,
		_attrs: &FileAttrs,
		dst: &AbstractPath,
		_copy_permissions: bool,
	) -> Result<FileCopyResult, FsError> {
		Err(FsError::new(
			FsErrorKind::MoveUnsupported,
			dst.display_path(),
			"Native copy not supported by this backend",
		))
	}

	async fn create_folder(&self, path: &AbstractPath) -> Result<(), FsError>;

	async fn remove_file(&self, path: &AbstractPath) -> Result<(), FsError>;

	async fn remove_symlink(&self, path: &AbstractPath) -> Result<(), FsError>;

	async fn remove_folder_empty(&self, path: &AbstractPath) -> Result<(), FsError>;

	/// Rename/move within this device; `MoveUnsupported` when the backend
	/// cannot (caller degrades to copy + delete).
	async fn move_and_rename(&self, from: &AbstractPath, to: &AbstractPath)
		-> Result<(), FsError>;

	/// Link target as stored (uninterpreted bytes in backend-native form)
	async fn read_symlink(&self, path: &AbstractPath) -> Result<String, FsError>;

	async fn create_symlink(
		&self,
		path: &AbstractPath,
		target: &str,
		mtime_hint: Option<i64>,
	) -> Result<(), FsError>;

	/// Move the item to the device's recycler; `RecycleUnavailable` when the
	/// device has none.
	async fn recycle_item(&self, path: &AbstractPath) -> Result<(), FsError>;

	async fn supports_recycle(&self, root: &AbstractPath) -> bool;

	/// Set a file's modification time; best effort, callers record failures
	/// as non-fatal.
	async fn set_mtime(&self, path: &AbstractPath, mtime: i64) -> Result<(), FsError>;

	/// Type and attributes of the item a symlink points at; Ok(None) for
	/// dangling links.
	async fn stat_symlink_target(
		&self,
		path: &AbstractPath,
	) -> Result<Option<(ItemType, FileAttrs)>, FsError>;

	/// True when overwrite-on-rename is atomic and tunneling-safe on this
	/// backend, making the temp-file dance unnecessary.
	fn has_native_transactional_copy(&self) -> bool {
		false
	}

	/// Deadline for non-blocking existence checks on this device
	fn access_timeout(&self) -> Duration {
		Duration::from_secs(20)
	}

	/// Like `item_type`, but returns None on not-found. Walks upward when
	/// needed so that "path absent" is distinguished from "parent absent or
	/// inaccessible": an inaccessible ancestor surfaces its own error.
	async fn item_type_if_exists(&self, path: &AbstractPath) -> Result<Option<ItemType>, FsError> {
		match self.item_type(path).await {
			Ok(t) => return Ok(Some(t)),
			Err(e) if e.kind == FsErrorKind::NotFound => {}
			Err(e) => return Err(e),
		}

		let mut ancestor = path.parent();
		while let Some(p) = ancestor {
			match self.item_type(&p).await {
				// accessible parent chain: the item is genuinely absent;
				// a file in the chain also proves the path cannot exist
				Ok(_) => return Ok(None),
				Err(e) if e.kind == FsErrorKind::NotFound => ancestor = p.parent(),
				Err(e) => return Err(e),
			}
		}
		Ok(None)
	}

	/// Remove a folder with everything below it, built on `read_dir` and the
	/// removal primitives. Children are deleted before their parents.
	async fn remove_folder_recursive(&self, path: &AbstractPath) -> Result<(), FsError> {
		let mut stack = vec![path.clone()];
		let mut folders = Vec::new();

		while let Some(folder) = stack.pop() {
			for entry in self.read_dir(&folder).await? {
				match entry {
					DirEntry::File { name, .. } => self.remove_file(&folder.join(&name)).await?,
					DirEntry::Symlink { name, .. } => {
						self.remove_symlink(&folder.join(&name)).await?
					}
					DirEntry::Folder { name } => stack.push(folder.join(&name)),
					DirEntry::Failed { error, .. } => return Err(error),
				}
			}
			folders.push(folder);
		}

		// every descendant was discovered after its ancestor
		for folder in folders.iter().rev() {
			self.remove_folder_empty(folder).await?;
		}
		Ok(())
	}

	/// Create a folder and any missing ancestors. The path most likely
	/// exists already (base folders, versioning targets), so check first.
	async fn create_folder_if_missing(&self, path: &AbstractPath) -> Result<(), FsError> {
		// find the deepest existing ancestor
		let mut missing = Vec::new();
		let mut probe = path.clone();
		loop {
			match self.item_type(&probe).await {
				Ok(ItemType::Folder) => break,
				Ok(_) => {
					return Err(FsError::new(
						FsErrorKind::AlreadyExists,
						probe.display_path(),
						"The name is already used by another item",
					))
				}
				Err(e) if e.kind == FsErrorKind::NotFound => match probe.parent() {
					Some(parent) => {
						missing.push(probe.item_name().to_string());
						probe = parent;
					}
					None => {
						// the device root itself is absent (a local base
						// folder is its device's root): create it directly
						self.create_folder(&probe).await?;
						break;
					}
				},
				Err(e) => return Err(e),
			}
		}

		for name in missing.iter().rev() {
			probe = probe.join(name);
			match self.create_folder(&probe).await {
				Ok(()) => {}
				// lost a race against a concurrent creator: fine
				Err(e) if e.kind == FsErrorKind::AlreadyExists => {}
				Err(e) => return Err(e),
			}
		}
		Ok(())
	}
}

/// Backend instances of one run, keyed by device.
///
/// Explicit dependency handed into the core instead of an ambient singleton.
pub struct FsRegistry {
	map: std::collections::HashMap<Device, std::sync::Arc<dyn VirtualFs>>,
}

impl FsRegistry {
	pub fn new() -> Self {
		FsRegistry { map: std::collections::HashMap::new() }
	}

	pub fn insert(&mut self, fs: std::sync::Arc<dyn VirtualFs>) {
		self.map.insert(fs.device().clone(), fs);
	}

	pub fn get(&self, device: &Device) -> Result<std::sync::Arc<dyn VirtualFs>, FsError> {
		self.map.get(device).cloned().ok_or_else(|| {
			FsError::new(
				FsErrorKind::Fatal,
				device.display_root(),
				"No backend registered for device",
			)
		})
	}

	pub fn devices(&self) -> impl Iterator<Item = &Device> {
		self.map.keys()
	}
}

impl Default for FsRegistry {
	fn default() -> Self {
		FsRegistry::new()
	}
}

/// Copy a symlink across arbitrary backends via its target bytes
pub async fn copy_symlink(
	src_fs: &dyn VirtualFs,
	src: &AbstractPath,
	src_attrs: &SymlinkAttrs,
	dst_fs: &dyn VirtualFs,
	dst: &AbstractPath,
) -> Result<(), FsError> {
	let target = src_fs.read_symlink(src).await?;
	dst_fs.create_symlink(dst, &target, Some(src_attrs.mtime)).await
}

/// Whether a name belongs to this tool's bookkeeping and must never be
/// synchronized.
pub fn is_reserved_item_name(name: &str) -> bool {
	name == SYNC_DB_NAME || name.ends_with(LOCK_FILE_ENDING)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_reserved_names() {
		assert!(is_reserved_item_name(SYNC_DB_NAME));
		assert!(is_reserved_item_name("run.bsy_lock"));
		assert!(!is_reserved_item_name("report.txt"));
		assert!(!is_reserved_item_name("data.bsy_tmp")); // cleaned up, not hidden
	}
}

// vim: ts=4
