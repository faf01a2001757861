//! Temp-file buffer
//!
//! Materializes remote files in a per-run local folder so that external
//! tools needing a real path can open them. Requests are cached by content
//! identity, so two versions of the same path never collide. The buffer
//! folder disappears with the buffer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::afs::{FileAttrs, VirtualFs};
use crate::error::FsError;
use crate::path::{AbstractPath, Device};
use crate::transact::{copy_file_transactional, no_progress};

/// Cache key: distinct versions of one path must land in distinct copies
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BufKey {
	mtime: i64,
	size: u64,
	fingerprint: String,
	followed_symlink: bool,
	device_phrase: String,
	rel: String,
}

/// Per-run materialization cache for non-local files
pub struct TempFileBuffer {
	/// Lazily created; None until the first request
	run_dir: Mutex<Option<PathBuf>>,
	cache: Mutex<HashMap<BufKey, PathBuf>>,
}

impl TempFileBuffer {
	pub fn new() -> Self {
		TempFileBuffer { run_dir: Mutex::new(None), cache: Mutex::new(HashMap::new()) }
	}

	fn ensure_run_dir(&self) -> Result<PathBuf, FsError> {
		let mut slot = self.run_dir.lock().unwrap_or_else(|e| e.into_inner());
		if let Some(dir) = slot.as_ref() {
			return Ok(dir.clone());
		}
		let name = format!(
			"BSY-{}",
			hex::encode(&uuid::Uuid::new_v4().as_bytes()[..4]).to_uppercase()
		);
		let dir = std::env::temp_dir().join(name);
		std::fs::create_dir_all(&dir).map_err(|e| {
			FsError::from_io(&e, dir.display().to_string(), "Cannot create temporary folder")
		})?;
		*slot = Some(dir.clone());
		Ok(dir)
	}

	/// Local path of `src`, copying it on first request. Each requested
	/// version is copied exactly once per run.
	pub async fn get_buffered(
		&self,
		src_fs: &dyn VirtualFs,
		src: &AbstractPath,
		attrs: &FileAttrs,
		followed_symlink: bool,
	) -> Result<PathBuf, FsError> {
		let key = BufKey {
			mtime: attrs.mtime,
			size: attrs.size,
			fingerprint: attrs.fingerprint.clone(),
			followed_symlink,
			device_phrase: src.device.display_root(),
			rel: src.rel.as_str().to_string(),
		};

		if let Some(cached) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(&key) {
			return Ok(cached.clone());
		}

		let run_dir = self.ensure_run_dir()?;
		// keep the original name recognizable, avoid collisions by content
		let local_name = format!(
			"{}-{}",
			crate::util::short_hex_digest(format!("{:?}", key).as_bytes()),
			src.item_name()
		);
		let local_path = run_dir.join(&local_name);

		let dst_fs = crate::afs::local::LocalFs::new(run_dir.clone());
		let dst = AbstractPath::device_root(Device::Local { root: run_dir }).join(&local_name);

		let progress = no_progress();
		copy_file_transactional(src_fs, src, attrs, &dst_fs, &dst, false, true, None, &progress)
			.await?;

		self.cache
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.insert(key, local_path.clone());
		Ok(local_path)
	}

	/// Location of the buffer folder, if any file was materialized
	pub fn run_dir(&self) -> Option<PathBuf> {
		self.run_dir.lock().unwrap_or_else(|e| e.into_inner()).clone()
	}
}

impl Default for TempFileBuffer {
	fn default() -> Self {
		TempFileBuffer::new()
	}
}

impl Drop for TempFileBuffer {
	fn drop(&mut self) {
		if let Some(dir) = self.run_dir.lock().unwrap_or_else(|e| e.into_inner()).take() {
			let _ = std::fs::remove_dir_all(dir);
		}
	}
}


// vim: ts=4
