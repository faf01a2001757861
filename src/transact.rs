//! Transactional file copy
//!
//! Contract: after success the target exists with the source's content and
//! modification time; on failure the target is either absent or identical to
//! its pre-call state. The non-native path copies into a uniquely named
//! temporary sibling and renames it into place.

use futures::future::BoxFuture;

use crate::afs::{FileAttrs, FileCopyResult, VirtualFs, TEMP_FILE_ENDING};
use crate::error::{FsError, FsErrorKind};
use crate::logging::*;
use crate::path::AbstractPath;
use crate::util::{short_hex_digest, truncate_code_points};

/// Byte-level progress callback; also the copy's abort checkpoint (an error
/// return unwinds the operation).
pub type IoProgress<'a> = &'a (dyn Fn(u64) -> Result<(), FsError> + Send + Sync);

/// No-op progress callback
pub fn no_progress() -> impl Fn(u64) -> Result<(), FsError> + Send + Sync {
	|_| Ok(())
}

/// Name of the temporary copy target for `file_name`.
///
/// The stem is cut to at most 200 code points to respect component-length
/// limits, but short names are never trimmed so that name-related failures
/// surface immediately. The short digest keeps clashes with abandoned temp
/// files unlikely without looping.
pub fn temp_target_name(file_name: &str) -> String {
	let stem = match file_name.rfind('.') {
		Some(pos) if pos > 0 => &file_name[..pos],
		_ => file_name,
	};
	let stem = truncate_code_points(stem, 200);
	let digest = short_hex_digest(uuid::Uuid::new_v4().as_bytes());
	// '-' rather than '~': some FTP servers silently replace '~' with '_'
	format!("{}-{}{}", stem, digest, TEMP_FILE_ENDING)
}

/// Copy `src` to `dst`, replacing an existing target through the
/// `on_delete_target` hook.
///
/// The hook runs only after both endpoints have proven accessible (source
/// read and temp write succeeded), immediately before the rename, so the
/// pre-existing target survives every earlier failure.
pub async fn copy_file_transactional(
	src_fs: &dyn VirtualFs,
	src: &AbstractPath,
	src_attrs: &FileAttrs,
	dst_fs: &dyn VirtualFs,
	dst: &AbstractPath,
	copy_permissions: bool,
	transactional: bool,
	on_delete_target: Option<BoxFuture<'_, Result<(), FsError>>>,
	progress: IoProgress<'_>,
) -> Result<FileCopyResult, FsError> {
	if transactional && !dst_fs.has_native_transactional_copy() {
		let parent = dst.parent().ok_or_else(|| {
			FsError::new(FsErrorKind::Fatal, dst.display_path(), "Cannot write to a device root")
		})?;
		let tmp = parent.join(&temp_target_name(dst.item_name()));

		let result =
			match copy_plain(src_fs, src, src_attrs, dst_fs, &tmp, copy_permissions, progress)
				.await
			{
				Ok(result) => result,
				Err(e) => {
					// don't leave a partial temp file behind
					if let Err(cleanup) = dst_fs.remove_file(&tmp).await {
						if cleanup.kind != FsErrorKind::NotFound {
							warn!("cannot remove temporary file: {}", cleanup);
						}
					}
					return Err(e);
				}
			};

		let finish = async {
			if let Some(hook) = on_delete_target {
				hook.await?;
			}
			dst_fs.move_and_rename(&tmp, dst).await
		}
		.await;

		if let Err(e) = finish {
			// cleanup failures are logged, never raised over the primary error
			if let Err(cleanup) = dst_fs.remove_file(&tmp).await {
				warn!("cannot remove temporary file: {}", cleanup);
			}
			return Err(e);
		}
		Ok(result)
	} else {
		// the backend renames atomically, or the caller opted out: delete
		// first, then copy straight to the target
		if let Some(hook) = on_delete_target {
			hook.await?;
		}
		copy_plain(src_fs, src, src_attrs, dst_fs, dst, copy_permissions, progress).await
	}
}

async fn copy_plain(
	src_fs: &dyn VirtualFs,
	src: &AbstractPath,
	src_attrs: &FileAttrs,
	dst_fs: &dyn VirtualFs,
	dst: &AbstractPath,
	copy_permissions: bool,
	progress: IoProgress<'_>,
) -> Result<FileCopyResult, FsError> {
	if src_fs.device().kind() == dst_fs.device().kind() {
		match dst_fs.copy_file_native(src, src_attrs, dst, copy_permissions).await {
			Ok(result) => {
				progress(result.file_size)?;
				return Ok(result);
			}
			Err(e) if e.kind == FsErrorKind::MoveUnsupported => {} // stream fallback
			Err(e) => return Err(e),
		}
	} else if copy_permissions {
		return Err(FsError::new(
			FsErrorKind::Fatal,
			dst.display_path(),
			"Cannot write permissions between different device types",
		));
	}

	copy_as_stream(src_fs, src, src_attrs, dst_fs, dst, progress).await
}

/// Stream copy with independent read/write accounting. Either count
/// disagreeing with the declared source size is a hard error: the file
/// changed mid-copy or the transport lied.
async fn copy_as_stream(
	src_fs: &dyn VirtualFs,
	src: &AbstractPath,
	src_attrs: &FileAttrs,
	dst_fs: &dyn VirtualFs,
	dst: &AbstractPath,
	progress: IoProgress<'_>,
) -> Result<FileCopyResult, FsError> {
	let mut reader = src_fs.open_input(src).await?;
	let mut writer = dst_fs.open_output(dst, Some(src_attrs.size), Some(src_attrs.mtime)).await?;

	let block = reader.block_size().max(writer.block_size());
	let mut buf = vec![0u8; block];
	let mut bytes_read: u64 = 0;
	let mut bytes_written: u64 = 0;

	loop {
		let n = reader.try_read(&mut buf).await?;
		if n == 0 {
			break;
		}
		bytes_read += n as u64;

		let mut offset = 0;
		while offset < n {
			let written = writer.try_write(&buf[offset..n]).await?;
			if written == 0 {
				return Err(FsError::new(
					FsErrorKind::TransportError,
					dst.display_path(),
					"Write stream made no progress",
				));
			}
			offset += written;
			bytes_written += written as u64;
		}
		progress(n as u64)?;
	}

	if bytes_read != src_attrs.size {
		return Err(FsError::new(
			FsErrorKind::TransportError,
			src.display_path(),
			format!(
				"File size changed during copy: expected {} bytes, read {}",
				src_attrs.size, bytes_read
			),
		));
	}
	if bytes_written != bytes_read {
		return Err(FsError::new(
			FsErrorKind::TransportError,
			dst.display_path(),
			format!("Incomplete write: read {} bytes, wrote {}", bytes_read, bytes_written),
		));
	}

	let fin = writer.finalize().await?;
	Ok(FileCopyResult {
		file_size: src_attrs.size,
		mod_time: src_attrs.mtime,
		source_fingerprint: src_attrs.fingerprint.clone(),
		target_fingerprint: fin.fingerprint,
		error_mod_time: fin.error_mod_time,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::afs::local::LocalFs;
	use crate::path::Device;
	use std::path::Path;

	fn local_path(root: &Path, rel: &str) -> AbstractPath {
		AbstractPath::device_root(Device::Local { root: root.to_path_buf() }).join(rel)
	}

	fn attrs_of(path: &Path) -> FileAttrs {
		let md = std::fs::metadata(path).unwrap();
		#[cfg(unix)]
		let (mtime, fingerprint) = {
			use std::os::unix::fs::MetadataExt;
			(md.mtime(), format!("{:x}:{:x}", md.dev(), md.ino()))
		};
		#[cfg(not(unix))]
		let (mtime, fingerprint) = (0i64, String::new());
		FileAttrs { size: md.len(), mtime, fingerprint }
	}

	#[test]
	fn test_temp_name_shape() {
		let name = temp_target_name("report.txt");
		assert!(name.starts_with("report-"));
		assert!(name.ends_with(TEMP_FILE_ENDING));
		// "report-" + 4 hex digits + suffix
		assert_eq!(name.len(), "report-".len() + 4 + TEMP_FILE_ENDING.len());
	}

	#[test]
	fn test_temp_name_keeps_short_stems() {
		let name = temp_target_name("a.b");
		assert!(name.starts_with("a-"));
	}

	#[test]
	fn test_temp_name_truncates_long_stems() {
		let long: String = std::iter::repeat('x').take(300).collect();
		let name = temp_target_name(&format!("{}.dat", long));
		let stem_len = name.len() - 5 - TEMP_FILE_ENDING.len(); // "-" + 4 hex
		assert!(stem_len <= 200);
	}

	#[test]
	fn test_temp_name_hidden_file() {
		// a leading dot is not an extension separator
		let name = temp_target_name(".profile");
		assert!(name.starts_with(".profile-"));
	}

	#[tokio::test]
	async fn test_copy_preserves_content_and_mtime() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(dir.path().join("src")).unwrap();
		std::fs::create_dir_all(dir.path().join("dst")).unwrap();
		std::fs::write(dir.path().join("src/a.bin"), b"payload").unwrap();
		filetime::set_file_mtime(
			dir.path().join("src/a.bin"),
			filetime::FileTime::from_unix_time(1_500_000, 0),
		)
		.unwrap();

		let fs_impl = LocalFs::new(dir.path().to_path_buf());
		let src = local_path(dir.path(), "src").join("a.bin");
		let dst = local_path(dir.path(), "dst").join("a.bin");
		let attrs = attrs_of(&dir.path().join("src/a.bin"));

		let progress = no_progress();
		let result = copy_file_transactional(
			&fs_impl, &src, &attrs, &fs_impl, &dst, false, true, None, &progress,
		)
		.await
		.unwrap();

		assert_eq!(result.file_size, 7);
		assert_eq!(std::fs::read(dir.path().join("dst/a.bin")).unwrap(), b"payload");
		let dst_md = std::fs::metadata(dir.path().join("dst/a.bin")).unwrap();
		assert_eq!(dst_md.len(), 7);
		#[cfg(unix)]
		{
			use std::os::unix::fs::MetadataExt;
			assert_eq!(dst_md.mtime(), 1_500_000);
		}
	}

	#[tokio::test]
	async fn test_failed_overwrite_keeps_old_target_and_no_temp() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("src.txt"), b"new content").unwrap();
		std::fs::write(dir.path().join("file.txt"), b"old content").unwrap();

		let fs_impl = LocalFs::new(dir.path().to_path_buf());
		let src = local_path(dir.path(), "src.txt");
		let dst = local_path(dir.path(), "file.txt");
		let attrs = attrs_of(&dir.path().join("src.txt"));

		// failure injected between copy and rename
		let hook: BoxFuture<'_, Result<(), FsError>> = Box::pin(async {
			Err(FsError::new(FsErrorKind::AccessDenied, "file.txt", "Cannot delete file"))
		});

		let progress = no_progress();
		let err = copy_file_transactional(
			&fs_impl,
			&src,
			&attrs,
			&fs_impl,
			&dst,
			false,
			true,
			Some(hook),
			&progress,
		)
		.await
		.unwrap_err();
		assert_eq!(err.kind, FsErrorKind::AccessDenied);

		// old target untouched, no temp file left behind
		assert_eq!(std::fs::read(dir.path().join("file.txt")).unwrap(), b"old content");
		let leftovers: Vec<_> = std::fs::read_dir(dir.path())
			.unwrap()
			.filter_map(|e| e.ok())
			.filter(|e| e.file_name().to_string_lossy().ends_with(TEMP_FILE_ENDING))
			.collect();
		assert!(leftovers.is_empty());
	}

	#[tokio::test]
	async fn test_size_mismatch_is_hard_error() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("src.txt"), b"abc").unwrap();

		let fs_impl = LocalFs::new(dir.path().to_path_buf());
		let src = local_path(dir.path(), "src.txt");
		let dst = local_path(dir.path(), "dst.txt");
		let mut attrs = attrs_of(&dir.path().join("src.txt"));
		attrs.size = 999; // declared size disagrees with reality

		let progress = no_progress();
		// force the stream path: the native fast path trusts the backend
		let err = copy_as_stream(&fs_impl, &src, &attrs, &fs_impl, &dst, &progress)
			.await
			.unwrap_err();
		assert!(err.message.contains("size changed"));
	}

	#[tokio::test]
	async fn test_overwrite_replaces_via_hook() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("src.txt"), b"new").unwrap();
		std::fs::write(dir.path().join("dst.txt"), b"old").unwrap();

		let fs_impl = LocalFs::new(dir.path().to_path_buf());
		let src = local_path(dir.path(), "src.txt");
		let dst = local_path(dir.path(), "dst.txt");
		let attrs = attrs_of(&dir.path().join("src.txt"));

		let dst_native = dir.path().join("dst.txt");
		let hook: BoxFuture<'_, Result<(), FsError>> = Box::pin(async move {
			std::fs::remove_file(&dst_native)
				.map_err(|e| FsError::from_io(&e, "dst.txt", "Cannot delete file"))
		});

		let progress = no_progress();
		copy_file_transactional(
			&fs_impl,
			&src,
			&attrs,
			&fs_impl,
			&dst,
			false,
			true,
			Some(hook),
			&progress,
		)
		.await
		.unwrap();

		assert_eq!(std::fs::read(dir.path().join("dst.txt")).unwrap(), b"new");
	}
}

// vim: ts=4
