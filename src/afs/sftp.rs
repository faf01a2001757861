//! SFTP backend over pooled libssh2 sessions
//!
//! Every operation checks a session out of the process-wide pool, runs the
//! blocking libssh2 call on the blocking pool and returns the session when
//! it is still healthy. Streams keep their session for the stream's
//! lifetime, as one logical operation group.
//!
//! Remote paths are absolute: the device root maps to `/`.

use async_trait::async_trait;
use ssh2::{ErrorCode, OpenFlags, OpenType, RenameFlags};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;

use super::{
	DirEntry, FileAttrs, FinalizeResult, FsReader, FsWriter, ItemType, SymlinkAttrs, VirtualFs,
};
use crate::error::{FsError, FsErrorKind};
use crate::path::{AbstractPath, Device};
use crate::session::{PoolableSession, SessionCounter, SessionKey, SessionPool, SessionTicket};

const STREAM_BLOCK_SIZE: usize = 32 * 1024;

// libssh2 session-level codes worth distinguishing
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

// SFTP status codes (SSH_FXP_STATUS)
const SSH_FX_NO_SUCH_FILE: i32 = 2;
const SSH_FX_PERMISSION_DENIED: i32 = 3;
const SSH_FX_FILE_ALREADY_EXISTS: i32 = 11;

/// One authenticated connection plus its SFTP channel
pub struct SftpSession {
	_session: ssh2::Session,
	sftp: ssh2::Sftp,
	healthy: bool,
	_ticket: SessionTicket,
}

impl PoolableSession for SftpSession {
	fn is_healthy(&self) -> bool {
		self.healthy
	}
}

/// SFTP backend bound to one device identity
pub struct SftpFs {
	device: Device,
	key: SessionKey,
	pool: Arc<SessionPool<SftpSession>>,
	counter: Arc<SessionCounter>,
}

impl SftpFs {
	pub fn new(
		device: Device,
		password: String,
		use_zlib: bool,
		pool: Arc<SessionPool<SftpSession>>,
		counter: Arc<SessionCounter>,
	) -> Self {
		let key = match &device {
			Device::Sftp { host, port, user } => SessionKey {
				host: host.clone(),
				port: *port,
				user: user.clone(),
				password,
				use_tls: false,
				use_zlib,
			},
			_ => unreachable!("SFTP backend handed a non-SFTP device"),
		};
		SftpFs { device, key, pool, counter }
	}

	fn to_native(path: &AbstractPath) -> PathBuf {
		PathBuf::from(format!("/{}", path.rel.as_str()))
	}

	async fn checkout(&self) -> Result<SftpSession, FsError> {
		let key = self.key.clone();
		let counter = Arc::clone(&self.counter);
		let root = self.device.display_root();
		self.pool
			.checkout(&self.key, move || async move {
				let ticket = counter.register()?;
				let join_root = root.clone();
				tokio::task::spawn_blocking(move || {
					let (session, sftp) = connect_blocking(&key, &root)?;
					Ok(SftpSession { _session: session, sftp, healthy: true, _ticket: ticket })
				})
				.await
				.map_err(|e| FsError::new(FsErrorKind::Fatal, join_root, e.to_string()))?
			})
			.await
	}

	/// Run one blocking SFTP call on a pooled session
	async fn with_session<T, F>(
		&self,
		path: &AbstractPath,
		message: &'static str,
		f: F,
	) -> Result<T, FsError>
	where
		T: Send + 'static,
		F: FnOnce(&ssh2::Sftp) -> Result<T, ssh2::Error> + Send + 'static,
	{
		let session = self.checkout().await?;
		let display = path.display_path();

		let (session, result) = tokio::task::spawn_blocking(move || {
			let mut session = session;
			let result = f(&session.sftp);
			if let Err(e) = &result {
				if is_transport_error(e) {
					session.healthy = false;
				}
			}
			(session, result)
		})
		.await
		.map_err(|e| FsError::new(FsErrorKind::Fatal, &display, e.to_string()))?;

		self.pool.checkin(&self.key, session).await;
		result.map_err(|e| map_ssh2_error(&e, display, message))
	}
}

fn connect_blocking(key: &SessionKey, root: &str) -> Result<(ssh2::Session, ssh2::Sftp), FsError> {
	let stream = TcpStream::connect((key.host.as_str(), key.port)).map_err(|e| {
		FsError::from_io(&e, root, "Cannot connect to server")
	})?;

	let mut session = ssh2::Session::new()
		.map_err(|e| map_ssh2_error(&e, root.to_string(), "Cannot initialize SSH session"))?;
	session.set_compress(key.use_zlib);
	session.set_tcp_stream(stream);
	session
		.handshake()
		.map_err(|e| map_ssh2_error(&e, root.to_string(), "SSH handshake failed"))?;
	session
		.userauth_password(&key.user, &key.password)
		.map_err(|e| map_ssh2_error(&e, root.to_string(), "Authentication failed"))?;
	if !session.authenticated() {
		return Err(FsError::new(FsErrorKind::AuthFailed, root, "Authentication failed"));
	}
	let sftp = session
		.sftp()
		.map_err(|e| map_ssh2_error(&e, root.to_string(), "Cannot open SFTP channel"))?;
	Ok((session, sftp))
}

fn is_transport_error(e: &ssh2::Error) -> bool {
	matches!(e.code(), ErrorCode::Session(_))
}

fn map_ssh2_error(e: &ssh2::Error, path: String, message: &str) -> FsError {
	let kind = match e.code() {
		ErrorCode::SFTP(SSH_FX_NO_SUCH_FILE) => FsErrorKind::NotFound,
		ErrorCode::SFTP(SSH_FX_PERMISSION_DENIED) => FsErrorKind::AccessDenied,
		ErrorCode::SFTP(SSH_FX_FILE_ALREADY_EXISTS) => FsErrorKind::AlreadyExists,
		ErrorCode::SFTP(_) => FsErrorKind::TransportError,
		ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED) => FsErrorKind::AuthFailed,
		ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => FsErrorKind::Timeout,
		ErrorCode::Session(_) => FsErrorKind::TransportError,
	};
	FsError::new(kind, path, message).with_detail(e.to_string())
}

fn classify(stat: &ssh2::FileStat) -> ItemType {
	const S_IFMT: u32 = 0o170000;
	const S_IFLNK: u32 = 0o120000;
	const S_IFDIR: u32 = 0o040000;
	match stat.perm.map(|p| p & S_IFMT) {
		Some(S_IFLNK) => ItemType::Symlink,
		Some(S_IFDIR) => ItemType::Folder,
		Some(_) => ItemType::File,
		None => {
			if stat.is_dir() {
				ItemType::Folder
			} else {
				ItemType::File
			}
		}
	}
}

struct SftpReader {
	session: Option<SftpSession>,
	file: Option<ssh2::File>,
	pool: Arc<SessionPool<SftpSession>>,
	key: SessionKey,
	path: String,
}

#[async_trait]
impl FsReader for SftpReader {
	fn block_size(&self) -> usize {
		STREAM_BLOCK_SIZE
	}

	async fn try_read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
		let mut file = self.file.take().expect("read after end of stream");
		let want = buf.len().min(STREAM_BLOCK_SIZE);
		let path = self.path.clone();

		let (file, result) = tokio::task::spawn_blocking(move || {
			let mut chunk = vec![0u8; want];
			let result = file.read(&mut chunk).map(|n| {
				chunk.truncate(n);
				chunk
			});
			(file, result)
		})
		.await
		.map_err(|e| FsError::new(FsErrorKind::Fatal, &path, e.to_string()))?;

		match result {
			Ok(chunk) => {
				let n = chunk.len();
				buf[..n].copy_from_slice(&chunk);
				if n == 0 {
					// end of stream: the session's operation group is over
					drop(file);
					if let Some(session) = self.session.take() {
						self.pool.checkin(&self.key, session).await;
					}
				} else {
					self.file = Some(file);
				}
				Ok(n)
			}
			Err(e) => {
				// the session is dropped with the broken stream
				self.session.take();
				Err(FsError::from_io(&e, &self.path, "Cannot read file"))
			}
		}
	}
}

struct SftpWriter {
	session: Option<SftpSession>,
	file: Option<ssh2::File>,
	pool: Arc<SessionPool<SftpSession>>,
	key: SessionKey,
	native: PathBuf,
	path: String,
	mtime_hint: Option<i64>,
}

#[async_trait]
impl FsWriter for SftpWriter {
	fn block_size(&self) -> usize {
		STREAM_BLOCK_SIZE
	}

	async fn try_write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
		let mut file = self.file.take().expect("write after finalize");
		let chunk = buf[..buf.len().min(STREAM_BLOCK_SIZE)].to_vec();
		let path = self.path.clone();

		let (file, result) = tokio::task::spawn_blocking(move || {
			let result = file.write(&chunk);
			(file, result)
		})
		.await
		.map_err(|e| FsError::new(FsErrorKind::Fatal, &path, e.to_string()))?;

		match result {
			Ok(n) => {
				self.file = Some(file);
				Ok(n)
			}
			Err(e) => {
				self.session.take();
				Err(FsError::from_io(&e, &self.path, "Cannot write file"))
			}
		}
	}

	async fn finalize(mut self: Box<Self>) -> Result<FinalizeResult, FsError> {
		let file = self.file.take().expect("finalize called twice");
		let session = self.session.take().expect("finalize called twice");
		let native = self.native.clone();
		let mtime_hint = self.mtime_hint;
		let path = self.path.clone();

		let (session, result) = tokio::task::spawn_blocking(move || {
			// closing flushes the handle; only then is setstat meaningful
			drop(file);
			let result = match mtime_hint {
				Some(mtime) => session.sftp.setstat(
					&native,
					ssh2::FileStat {
						size: None,
						uid: None,
						gid: None,
						perm: None,
						atime: Some(mtime.max(0) as u64),
						mtime: Some(mtime.max(0) as u64),
					},
				),
				None => Ok(()),
			};
			(session, result)
		})
		.await
		.map_err(|e| FsError::new(FsErrorKind::Fatal, &path, e.to_string()))?;

		self.pool.checkin(&self.key, session).await;

		// SFTP reports no stable file identity
		Ok(FinalizeResult {
			fingerprint: String::new(),
			error_mod_time: result
				.err()
				.map(|e| map_ssh2_error(&e, path, "Cannot set modification time")),
		})
	}
}

#[async_trait]
impl VirtualFs for SftpFs {
	fn device(&self) -> &Device {
		&self.device
	}

	async fn item_type(&self, path: &AbstractPath) -> Result<ItemType, FsError> {
		let native = Self::to_native(path);
		self.with_session(path, "Cannot find item", move |sftp| {
			sftp.lstat(&native).map(|stat| classify(&stat))
		})
		.await
	}

	async fn read_dir(&self, path: &AbstractPath) -> Result<Vec<DirEntry>, FsError> {
		let native = Self::to_native(path);
		let listing = self
			.with_session(path, "Cannot read directory", move |sftp| sftp.readdir(&native))
			.await?;

		let mut entries = Vec::new();
		for (entry_path, stat) in listing {
			let name = match entry_path.file_name().and_then(|n| n.to_str()) {
				Some(name) => name.to_string(),
				None => continue,
			};
			let mtime = stat.mtime.unwrap_or(0) as i64;
			match classify(&stat) {
				ItemType::Folder => entries.push(DirEntry::Folder { name }),
				ItemType::Symlink => {
					entries.push(DirEntry::Symlink { name, attrs: SymlinkAttrs { mtime } })
				}
				ItemType::File => entries.push(DirEntry::File {
					name,
					attrs: FileAttrs {
						size: stat.size.unwrap_or(0),
						mtime,
						fingerprint: String::new(),
					},
				}),
			}
		}
		Ok(entries)
	}

	async fn open_input(&self, path: &AbstractPath) -> Result<Box<dyn FsReader>, FsError> {
		let session = self.checkout().await?;
		let native = Self::to_native(path);
		let display = path.display_path();

		let (session, result) = tokio::task::spawn_blocking(move || {
			let result = session.sftp.open(&native);
			(session, result)
		})
		.await
		.map_err(|e| FsError::new(FsErrorKind::Fatal, &display, e.to_string()))?;

		match result {
			Ok(file) => Ok(Box::new(SftpReader {
				session: Some(session),
				file: Some(file),
				pool: Arc::clone(&self.pool),
				key: self.key.clone(),
				path: display,
			})),
			Err(e) => {
				self.pool.checkin(&self.key, session).await;
				Err(map_ssh2_error(&e, display, "Cannot open file"))
			}
		}
	}

	async fn open_output(
		&self,
		path: &AbstractPath,
		_size_hint: Option<u64>,
		mtime_hint: Option<i64>,
	) -> Result<Box<dyn FsWriter>, FsError> {
		let session = self.checkout().await?;
		let native = Self::to_native(path);
		let display = path.display_path();

		let (session, result) = {
			let native = native.clone();
			tokio::task::spawn_blocking(move || {
				let result = session.sftp.open_mode(
					&native,
					OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
					0o644,
					OpenType::File,
				);
				(session, result)
			})
			.await
			.map_err(|e| FsError::new(FsErrorKind::Fatal, &display, e.to_string()))?
		};

		match result {
			Ok(file) => Ok(Box::new(SftpWriter {
				session: Some(session),
				file: Some(file),
				pool: Arc::clone(&self.pool),
				key: self.key.clone(),
				native,
				path: display,
				mtime_hint,
			})),
			Err(e) => {
				self.pool.checkin(&self.key, session).await;
				Err(map_ssh2_error(&e, display, "Cannot write file"))
			}
		}
	}

	async fn create_folder(&self, path: &AbstractPath) -> Result<(), FsError> {
		let native = Self::to_native(path);
		self.with_session(path, "Cannot create directory", move |sftp| sftp.mkdir(&native, 0o755))
			.await
	}

	async fn remove_file(&self, path: &AbstractPath) -> Result<(), FsError> {
		let native = Self::to_native(path);
		self.with_session(path, "Cannot delete file", move |sftp| sftp.unlink(&native)).await
	}

	async fn remove_symlink(&self, path: &AbstractPath) -> Result<(), FsError> {
		let native = Self::to_native(path);
		self.with_session(path, "Cannot delete symbolic link", move |sftp| sftp.unlink(&native))
			.await
	}

	async fn remove_folder_empty(&self, path: &AbstractPath) -> Result<(), FsError> {
		let native = Self::to_native(path);
		self.with_session(path, "Cannot delete directory", move |sftp| sftp.rmdir(&native)).await
	}

	async fn move_and_rename(&self, from: &AbstractPath, to: &AbstractPath) -> Result<(), FsError> {
		let from_native = Self::to_native(from);
		let to_native = Self::to_native(to);
		self.with_session(to, "Cannot move item", move |sftp| {
			sftp.rename(
				&from_native,
				&to_native,
				Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE),
			)
		})
		.await
	}

	async fn read_symlink(&self, path: &AbstractPath) -> Result<String, FsError> {
		let native = Self::to_native(path);
		let target = self
			.with_session(path, "Cannot read symbolic link", move |sftp| sftp.readlink(&native))
			.await?;
		Ok(target.to_string_lossy().into_owned())
	}

	async fn create_symlink(
		&self,
		path: &AbstractPath,
		target: &str,
		_mtime_hint: Option<i64>,
	) -> Result<(), FsError> {
		let native = Self::to_native(path);
		let target = PathBuf::from(target);
		self.with_session(path, "Cannot create symbolic link", move |sftp| {
			// creates a link at `native` pointing at `target`
			sftp.symlink(&target, &native)
		})
		.await
	}

	async fn recycle_item(&self, path: &AbstractPath) -> Result<(), FsError> {
		Err(FsError::new(
			FsErrorKind::RecycleUnavailable,
			path.display_path(),
			"No recycler available on this device",
		))
	}

	async fn supports_recycle(&self, _root: &AbstractPath) -> bool {
		false
	}

	async fn set_mtime(&self, path: &AbstractPath, mtime: i64) -> Result<(), FsError> {
		let native = Self::to_native(path);
		self.with_session(path, "Cannot set modification time", move |sftp| {
			sftp.setstat(
				&native,
				ssh2::FileStat {
					size: None,
					uid: None,
					gid: None,
					perm: None,
					atime: Some(mtime.max(0) as u64),
					mtime: Some(mtime.max(0) as u64),
				},
			)
		})
		.await
	}

	async fn stat_symlink_target(
		&self,
		path: &AbstractPath,
	) -> Result<Option<(ItemType, FileAttrs)>, FsError> {
		let native = Self::to_native(path);
		let result = self
			.with_session(path, "Cannot resolve symbolic link", move |sftp| {
				// stat (unlike lstat) follows the link
				sftp.stat(&native)
			})
			.await;
		match result {
			Ok(stat) => Ok(Some((
				classify(&stat),
				FileAttrs {
					size: stat.size.unwrap_or(0),
					mtime: stat.mtime.unwrap_or(0) as i64,
					fingerprint: String::new(),
				},
			))),
			Err(e) if e.kind == FsErrorKind::NotFound => Ok(None),
			Err(e) => Err(e),
		}
	}
}

// vim: ts=4
