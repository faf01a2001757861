//! Local filesystem backend
//!
//! Streams go through tokio's file IO; the blocking leftovers (mtime,
//! permissions, recycler moves) run on the blocking pool.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{
	DirEntry, FileAttrs, FileCopyResult, FinalizeResult, Fingerprint, FsReader, FsWriter,
	ItemType, SymlinkAttrs, VirtualFs,
};
use crate::error::{FsError, FsErrorKind};
use crate::path::{AbstractPath, Device};

const STREAM_BLOCK_SIZE: usize = 128 * 1024;

/// Local backend rooted at a native absolute path
pub struct LocalFs {
	device: Device,
}

impl LocalFs {
	pub fn new(root: PathBuf) -> Self {
		LocalFs { device: Device::Local { root } }
	}

	fn to_native(&self, path: &AbstractPath) -> PathBuf {
		match &path.device {
			Device::Local { root } => {
				let mut native = root.clone();
				for comp in path.rel.components() {
					native.push(comp);
				}
				native
			}
			_ => unreachable!("local backend handed a non-local path"),
		}
	}
}

fn mtime_of(md: &std::fs::Metadata) -> i64 {
	#[cfg(unix)]
	{
		use std::os::unix::fs::MetadataExt;
		md.mtime()
	}
	#[cfg(not(unix))]
	{
		md.modified()
			.ok()
			.and_then(|t| t.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs() as i64))
			.unwrap_or(0)
	}
}

fn fingerprint_of(md: &std::fs::Metadata) -> Fingerprint {
	#[cfg(unix)]
	{
		use std::os::unix::fs::MetadataExt;
		format!("{:x}:{:x}", md.dev(), md.ino())
	}
	#[cfg(not(unix))]
	{
		String::new()
	}
}

fn system_time_from_unix(secs: i64) -> SystemTime {
	if secs >= 0 {
		UNIX_EPOCH + Duration::from_secs(secs as u64)
	} else {
		UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
	}
}

fn set_mtime_blocking(native: &Path, mtime: i64) -> io::Result<()> {
	let file = std::fs::File::options().write(true).open(native)?;
	file.set_modified(system_time_from_unix(mtime))
}

/// XDG trash location, the conventional recycler for a headless tool
fn trash_files_dir() -> Option<PathBuf> {
	if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
		return Some(PathBuf::from(data_home).join("Trash/files"));
	}
	std::env::var("HOME").ok().map(|home| PathBuf::from(home).join(".local/share/Trash/files"))
}

fn is_cross_device(err: &io::Error) -> bool {
	#[cfg(unix)]
	{
		err.raw_os_error() == Some(libc::EXDEV)
	}
	#[cfg(not(unix))]
	{
		let _ = err;
		false
	}
}

struct LocalReader {
	file: fs::File,
	path: String,
}

#[async_trait]
impl FsReader for LocalReader {
	fn block_size(&self) -> usize {
		STREAM_BLOCK_SIZE
	}

	async fn try_read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
		self.file
			.read(buf)
			.await
			.map_err(|e| FsError::from_io(&e, &self.path, "Cannot read file"))
	}
}

struct LocalWriter {
	file: Option<fs::File>,
	path: String,
	mtime_hint: Option<i64>,
}

#[async_trait]
impl FsWriter for LocalWriter {
	fn block_size(&self) -> usize {
		STREAM_BLOCK_SIZE
	}

	async fn try_write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
		let file = self.file.as_mut().expect("write after finalize");
		file.write(buf).await.map_err(|e| FsError::from_io(&e, &self.path, "Cannot write file"))
	}

	async fn finalize(mut self: Box<Self>) -> Result<FinalizeResult, FsError> {
		let mut file = self.file.take().expect("finalize called twice");
		file.flush()
			.await
			.map_err(|e| FsError::from_io(&e, &self.path, "Cannot write file"))?;
		file.sync_all()
			.await
			.map_err(|e| FsError::from_io(&e, &self.path, "Cannot write file"))?;

		let std_file = file.into_std().await;

		let mut error_mod_time = None;
		if let Some(mtime) = self.mtime_hint {
			if let Err(e) = std_file.set_modified(system_time_from_unix(mtime)) {
				error_mod_time =
					Some(FsError::from_io(&e, &self.path, "Cannot set modification time"));
			}
		}

		let fingerprint = match std_file.metadata() {
			Ok(md) => fingerprint_of(&md),
			Err(_) => String::new(),
		};
		Ok(FinalizeResult { fingerprint, error_mod_time })
	}
}

#[async_trait]
impl VirtualFs for LocalFs {
	fn device(&self) -> &Device {
		&self.device
	}

	async fn item_type(&self, path: &AbstractPath) -> Result<ItemType, FsError> {
		let native = self.to_native(path);
		let md = fs::symlink_metadata(&native)
			.await
			.map_err(|e| FsError::from_io(&e, path.display_path(), "Cannot find item"))?;
		Ok(if md.file_type().is_symlink() {
			ItemType::Symlink
		} else if md.is_dir() {
			ItemType::Folder
		} else {
			ItemType::File
		})
	}

	async fn read_dir(&self, path: &AbstractPath) -> Result<Vec<DirEntry>, FsError> {
		let native = self.to_native(path);
		let mut reader = fs::read_dir(&native)
			.await
			.map_err(|e| FsError::from_io(&e, path.display_path(), "Cannot read directory"))?;

		let mut entries = Vec::new();
		loop {
			let entry = reader
				.next_entry()
				.await
				.map_err(|e| FsError::from_io(&e, path.display_path(), "Cannot read directory"))?;
			let entry = match entry {
				Some(e) => e,
				None => break,
			};

			let name = match entry.file_name().into_string() {
				Ok(name) => name,
				Err(bad) => {
					return Err(FsError::new(
						FsErrorKind::TransportError,
						path.display_path(),
						format!("Directory entry is not valid Unicode: {:?}", bad),
					))
				}
			};

			let item_path = path.join(&name);
			let md = match fs::symlink_metadata(entry.path()).await {
				Ok(md) => md,
				Err(e) => {
					// one unreadable member must not hide its siblings
					entries.push(DirEntry::Failed {
						name,
						error: FsError::from_io(&e, item_path.display_path(), "Cannot find item"),
					});
					continue;
				}
			};

			if md.file_type().is_symlink() {
				entries.push(DirEntry::Symlink { name, attrs: SymlinkAttrs { mtime: mtime_of(&md) } });
			} else if md.is_dir() {
				entries.push(DirEntry::Folder { name });
			} else {
				entries.push(DirEntry::File {
					name,
					attrs: FileAttrs {
						size: md.len(),
						mtime: mtime_of(&md),
						fingerprint: fingerprint_of(&md),
					},
				});
			}
		}
		Ok(entries)
	}

	async fn open_input(&self, path: &AbstractPath) -> Result<Box<dyn FsReader>, FsError> {
		let native = self.to_native(path);
		let file = fs::File::open(&native)
			.await
			.map_err(|e| FsError::from_io(&e, path.display_path(), "Cannot open file"))?;
		Ok(Box::new(LocalReader { file, path: path.display_path() }))
	}

	async fn open_output(
		&self,
		path: &AbstractPath,
		size_hint: Option<u64>,
		mtime_hint: Option<i64>,
	) -> Result<Box<dyn FsWriter>, FsError> {
		let native = self.to_native(path);
		let file = fs::File::create(&native)
			.await
			.map_err(|e| FsError::from_io(&e, path.display_path(), "Cannot write file"))?;

		if let Some(size) = size_hint {
			// pre-allocation is advisory only
			let _ = file.set_len(size).await;
		}

		Ok(Box::new(LocalWriter { file: Some(file), path: path.display_path(), mtime_hint }))
	}

	async fn copy_file_native(
		&self,
		src: &AbstractPath,
		attrs: &FileAttrs,
		dst: &AbstractPath,
		copy_permissions: bool,
	) -> Result<FileCopyResult, FsError> {
		let src_native = self.to_native(src);
		let dst_native = self.to_native(dst);

		fs::copy(&src_native, &dst_native)
			.await
			.map_err(|e| FsError::from_io(&e, dst.display_path(), "Cannot copy file"))?;

		let mut error_mod_time = None;
		{
			let dst_native = dst_native.clone();
			let dst_display = dst.display_path();
			let mtime = attrs.mtime;
			if let Err(e) = tokio::task::spawn_blocking(move || set_mtime_blocking(&dst_native, mtime))
				.await
				.map_err(|e| {
					FsError::new(FsErrorKind::Fatal, dst.display_path(), e.to_string())
				})? {
				error_mod_time =
					Some(FsError::from_io(&e, dst_display, "Cannot set modification time"));
			}
		}

		if copy_permissions {
			copy_permissions_blocking(&src_native, &dst_native, dst.display_path()).await?;
		}

		let md = fs::symlink_metadata(&dst_native)
			.await
			.map_err(|e| FsError::from_io(&e, dst.display_path(), "Cannot find item"))?;

		Ok(FileCopyResult {
			file_size: attrs.size,
			mod_time: attrs.mtime,
			source_fingerprint: attrs.fingerprint.clone(),
			target_fingerprint: fingerprint_of(&md),
			error_mod_time,
		})
	}

	async fn create_folder(&self, path: &AbstractPath) -> Result<(), FsError> {
		fs::create_dir(self.to_native(path))
			.await
			.map_err(|e| FsError::from_io(&e, path.display_path(), "Cannot create directory"))
	}

	async fn remove_file(&self, path: &AbstractPath) -> Result<(), FsError> {
		fs::remove_file(self.to_native(path))
			.await
			.map_err(|e| FsError::from_io(&e, path.display_path(), "Cannot delete file"))
	}

	async fn remove_symlink(&self, path: &AbstractPath) -> Result<(), FsError> {
		fs::remove_file(self.to_native(path))
			.await
			.map_err(|e| FsError::from_io(&e, path.display_path(), "Cannot delete symbolic link"))
	}

	async fn remove_folder_empty(&self, path: &AbstractPath) -> Result<(), FsError> {
		fs::remove_dir(self.to_native(path))
			.await
			.map_err(|e| FsError::from_io(&e, path.display_path(), "Cannot delete directory"))
	}

	async fn move_and_rename(&self, from: &AbstractPath, to: &AbstractPath) -> Result<(), FsError> {
		fs::rename(self.to_native(from), self.to_native(to)).await.map_err(|e| {
			if is_cross_device(&e) {
				FsError::new(
					FsErrorKind::MoveUnsupported,
					to.display_path(),
					"Cannot move item between devices",
				)
				.with_detail(e.to_string())
			} else {
				FsError::from_io(&e, to.display_path(), "Cannot move item")
			}
		})
	}

	async fn read_symlink(&self, path: &AbstractPath) -> Result<String, FsError> {
		let target = fs::read_link(self.to_native(path))
			.await
			.map_err(|e| FsError::from_io(&e, path.display_path(), "Cannot read symbolic link"))?;
		Ok(target.to_string_lossy().into_owned())
	}

	async fn create_symlink(
		&self,
		path: &AbstractPath,
		target: &str,
		_mtime_hint: Option<i64>,
	) -> Result<(), FsError> {
		#[cfg(unix)]
		{
			fs::symlink(target, self.to_native(path)).await.map_err(|e| {
				FsError::from_io(&e, path.display_path(), "Cannot create symbolic link")
			})
		}
		#[cfg(not(unix))]
		{
			let _ = target;
			Err(FsError::new(
				FsErrorKind::MoveUnsupported,
				path.display_path(),
				"Symbolic links not supported on this platform",
			))
		}
	}

	async fn recycle_item(&self, path: &AbstractPath) -> Result<(), FsError> {
		let trash = trash_files_dir().ok_or_else(|| {
			FsError::new(
				FsErrorKind::RecycleUnavailable,
				path.display_path(),
				"No recycler available on this device",
			)
		})?;

		fs::create_dir_all(&trash)
			.await
			.map_err(|e| FsError::from_io(&e, path.display_path(), "Cannot access recycler"))?;

		// keep distinct deletions of equally named items apart
		let unique = format!(
			"{}.{}",
			path.item_name(),
			crate::util::short_hex_digest(uuid::Uuid::new_v4().as_bytes())
		);
		match fs::rename(self.to_native(path), trash.join(unique)).await {
			Ok(()) => Ok(()),
			Err(e) if is_cross_device(&e) => Err(FsError::new(
				FsErrorKind::RecycleUnavailable,
				path.display_path(),
				"No recycler available on this device",
			)
			.with_detail(e.to_string())),
			Err(e) => Err(FsError::from_io(&e, path.display_path(), "Cannot recycle item")),
		}
	}

	async fn supports_recycle(&self, root: &AbstractPath) -> bool {
		let trash = match trash_files_dir() {
			Some(dir) => dir,
			None => return false,
		};
		if fs::create_dir_all(&trash).await.is_err() {
			return false;
		}

		// recycling is a rename: both ends must live on one device
		#[cfg(unix)]
		{
			use std::os::unix::fs::MetadataExt;
			let root_md = match fs::metadata(self.to_native(root)).await {
				Ok(md) => md,
				Err(_) => return false,
			};
			let trash_md = match fs::metadata(&trash).await {
				Ok(md) => md,
				Err(_) => return false,
			};
			root_md.dev() == trash_md.dev()
		}
		#[cfg(not(unix))]
		{
			let _ = root;
			false
		}
	}

	async fn set_mtime(&self, path: &AbstractPath, mtime: i64) -> Result<(), FsError> {
		let native = self.to_native(path);
		let display = path.display_path();
		tokio::task::spawn_blocking(move || set_mtime_blocking(&native, mtime))
			.await
			.map_err(|e| FsError::new(FsErrorKind::Fatal, &display, e.to_string()))?
			.map_err(|e| FsError::from_io(&e, &display, "Cannot set modification time"))
	}

	async fn stat_symlink_target(
		&self,
		path: &AbstractPath,
	) -> Result<Option<(ItemType, FileAttrs)>, FsError> {
		match fs::metadata(self.to_native(path)).await {
			Ok(md) => {
				let item_type = if md.is_dir() { ItemType::Folder } else { ItemType::File };
				Ok(Some((
					item_type,
					FileAttrs {
						size: if md.is_dir() { 0 } else { md.len() },
						mtime: mtime_of(&md),
						fingerprint: fingerprint_of(&md),
					},
				)))
			}
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(FsError::from_io(&e, path.display_path(), "Cannot resolve symbolic link")),
		}
	}
}

async fn copy_permissions_blocking(
	src: &Path,
	dst: &Path,
	dst_display: String,
) -> Result<(), FsError> {
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		let src = src.to_path_buf();
		let dst = dst.to_path_buf();
		tokio::task::spawn_blocking(move || -> io::Result<()> {
			let md = std::fs::metadata(&src)?;
			std::fs::set_permissions(&dst, std::fs::Permissions::from_mode(md.permissions().mode()))
		})
		.await
		.map_err(|e| FsError::new(FsErrorKind::Fatal, &dst_display, e.to_string()))?
		.map_err(|e| FsError::from_io(&e, &dst_display, "Cannot write permissions"))
	}
	#[cfg(not(unix))]
	{
		let _ = (src, dst, dst_display);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn local_path(root: &Path, rel: &str) -> AbstractPath {
		let base = AbstractPath::device_root(Device::Local { root: root.to_path_buf() });
		if rel.is_empty() {
			base
		} else {
			base.join(rel)
		}
	}

	#[tokio::test]
	async fn test_item_type_and_streams() {
		let dir = tempfile::tempdir().unwrap();
		let fs_impl = LocalFs::new(dir.path().to_path_buf());

		std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
		std::fs::create_dir(dir.path().join("sub")).unwrap();

		let file = local_path(dir.path(), "a.txt");
		let folder = local_path(dir.path(), "sub");
		assert_eq!(fs_impl.item_type(&file).await.unwrap(), ItemType::File);
		assert_eq!(fs_impl.item_type(&folder).await.unwrap(), ItemType::Folder);

		let mut reader = fs_impl.open_input(&file).await.unwrap();
		let mut buf = vec![0u8; 16];
		let n = reader.try_read(&mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"hello");
	}

	#[tokio::test]
	async fn test_item_type_if_exists_distinguishes_parent() {
		let dir = tempfile::tempdir().unwrap();
		let fs_impl = LocalFs::new(dir.path().to_path_buf());

		let absent = local_path(dir.path(), "missing.txt");
		assert_eq!(fs_impl.item_type_if_exists(&absent).await.unwrap(), None);

		let deep_absent = local_path(dir.path(), "no/such/chain.txt");
		assert_eq!(fs_impl.item_type_if_exists(&deep_absent).await.unwrap(), None);
	}

	#[tokio::test]
	async fn test_writer_sets_mtime() {
		let dir = tempfile::tempdir().unwrap();
		let fs_impl = LocalFs::new(dir.path().to_path_buf());
		let target = local_path(dir.path(), "out.bin");

		let mut writer = fs_impl.open_output(&target, Some(3), Some(1_000_000)).await.unwrap();
		assert_eq!(writer.try_write(b"abc").await.unwrap(), 3);
		let result = writer.finalize().await.unwrap();
		assert!(result.error_mod_time.is_none());

		let md = std::fs::metadata(dir.path().join("out.bin")).unwrap();
		assert_eq!(md.len(), 3);
		assert_eq!(mtime_of(&md), 1_000_000);
	}

	#[tokio::test]
	async fn test_remove_folder_recursive() {
		let dir = tempfile::tempdir().unwrap();
		let fs_impl = LocalFs::new(dir.path().to_path_buf());

		std::fs::create_dir_all(dir.path().join("top/mid/leaf")).unwrap();
		std::fs::write(dir.path().join("top/a.txt"), b"1").unwrap();
		std::fs::write(dir.path().join("top/mid/b.txt"), b"2").unwrap();

		let top = local_path(dir.path(), "top");
		fs_impl.remove_folder_recursive(&top).await.unwrap();
		assert!(!dir.path().join("top").exists());
	}

	#[tokio::test]
	async fn test_create_folder_if_missing() {
		let dir = tempfile::tempdir().unwrap();
		let fs_impl = LocalFs::new(dir.path().to_path_buf());

		let deep = local_path(dir.path(), "a/b/c");
		fs_impl.create_folder_if_missing(&deep).await.unwrap();
		assert!(dir.path().join("a/b/c").is_dir());

		// second call is a no-op
		fs_impl.create_folder_if_missing(&deep).await.unwrap();
	}

	#[tokio::test]
	async fn test_move_and_rename() {
		let dir = tempfile::tempdir().unwrap();
		let fs_impl = LocalFs::new(dir.path().to_path_buf());

		std::fs::write(dir.path().join("old.txt"), b"x").unwrap();
		fs_impl
			.move_and_rename(&local_path(dir.path(), "old.txt"), &local_path(dir.path(), "new.txt"))
			.await
			.unwrap();
		assert!(!dir.path().join("old.txt").exists());
		assert!(dir.path().join("new.txt").exists());
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn test_symlink_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let fs_impl = LocalFs::new(dir.path().to_path_buf());

		let link = local_path(dir.path(), "link");
		fs_impl.create_symlink(&link, "target/file.txt", None).await.unwrap();
		assert_eq!(fs_impl.item_type(&link).await.unwrap(), ItemType::Symlink);
		assert_eq!(fs_impl.read_symlink(&link).await.unwrap(), "target/file.txt");
	}
}

// vim: ts=4
