//! Synchronization executor
//!
//! Applies resolved directions with at-most-once semantics per item. Moves
//! run first (their source would otherwise be deleted), then deletions,
//! then folder creates top-down so parents exist before children, then file
//! and symlink transfers. Expensive transfers run concurrently under the
//! per-device caps; the paired tree itself is only mutated on the
//! coordinator side after tasks report back.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;

use crate::afs::{copy_symlink, FileAttrs, FsRegistry, SymlinkAttrs, VirtualFs};
use crate::error::{AbortTrigger, FsError, FsErrorKind, SyncError};
use crate::path::{AbstractPath, RelPath};
use crate::session::DeviceLimiter;
use crate::status::{ErrorDecision, Phase, StatusHandler};
use crate::strategies::{DeletionPolicy, SyncDirection};
use crate::tree::{
	BaseFolderPair, Category, FilePair, FileSide, FolderPair, FolderSide, LinkSide, PairId, Side,
	SymlinkPair,
};
use crate::transact::copy_file_transactional;
use crate::versioning::FileVersioner;

/// Executor tuning knobs taken from the configuration
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
	pub automatic_retry_count: usize,
	pub automatic_retry_delay: Duration,
	pub deletion_policy: DeletionPolicy,
	pub copy_permissions: bool,
	pub fail_safe_file_copy: bool,
}

/// Counters of one synchronization run
#[derive(Debug, Default)]
pub struct SyncStats {
	pub files_copied: AtomicU64,
	pub folders_created: AtomicU64,
	pub items_deleted: AtomicU64,
	pub items_moved: AtomicU64,
	pub metadata_updates: AtomicU64,
	pub bytes_copied: AtomicU64,
	pub errors: Mutex<Vec<String>>,
}

impl SyncStats {
	fn note_error(&self, message: String) {
		self.errors.lock().unwrap_or_else(|e| e.into_inner()).push(message);
	}

	pub fn error_count(&self) -> usize {
		self.errors.lock().unwrap_or_else(|e| e.into_inner()).len()
	}

	pub fn error_messages(&self) -> Vec<String> {
		self.errors.lock().unwrap_or_else(|e| e.into_inner()).clone()
	}

	/// Total operations performed (errors not included)
	pub fn operations(&self) -> u64 {
		self.files_copied.load(Ordering::Relaxed)
			+ self.folders_created.load(Ordering::Relaxed)
			+ self.items_deleted.load(Ordering::Relaxed)
			+ self.items_moved.load(Ordering::Relaxed)
			+ self.metadata_updates.load(Ordering::Relaxed)
	}
}

enum OpResult<T> {
	Done(T),
	Ignored(String),
}

pub struct Executor {
	registry: Arc<FsRegistry>,
	limiter: Arc<DeviceLimiter>,
	handler: Arc<dyn StatusHandler>,
	options: ExecutorOptions,
	versioner: Option<Arc<FileVersioner>>,
	ignore_all: AtomicBool,
	recycle_warned: Mutex<HashSet<String>>,
	pub stats: SyncStats,
}

impl Executor {
	pub fn new(
		registry: Arc<FsRegistry>,
		limiter: Arc<DeviceLimiter>,
		handler: Arc<dyn StatusHandler>,
		options: ExecutorOptions,
		versioner: Option<Arc<FileVersioner>>,
	) -> Arc<Self> {
		Arc::new(Executor {
			registry,
			limiter,
			handler,
			options,
			versioner,
			ignore_all: AtomicBool::new(false),
			recycle_warned: Mutex::new(HashSet::new()),
			stats: SyncStats::default(),
		})
	}

	/// Apply all directions. Folder pairs are processed in merge order; the
	/// DB rewrite afterwards is the caller's job.
	pub async fn execute(self: &Arc<Self>, bases: &mut [BaseFolderPair]) -> Result<(), SyncError> {
		let (items, bytes) = count_totals(bases);
		self.handler.init_phase(items, bytes, Phase::Synchronizing);

		for base in bases.iter_mut() {
			let left_fs = self.registry.get(&base.left_base.device)?;
			let right_fs = self.registry.get(&base.right_base.device)?;

			self.run_moves(base, &left_fs, &right_fs).await?;
			self.run_deletes(base, &left_fs, &right_fs).await?;
			self.run_folder_creates(base, &left_fs, &right_fs).await?;
			self.run_transfers(base, &left_fs, &right_fs).await?;
		}
		Ok(())
	}

	fn fs_on<'a>(
		&self,
		side: Side,
		left_fs: &'a Arc<dyn VirtualFs>,
		right_fs: &'a Arc<dyn VirtualFs>,
	) -> &'a Arc<dyn VirtualFs> {
		match side {
			Side::Left => left_fs,
			Side::Right => right_fs,
		}
	}

	/// Retry loop around one operation: automatic retries with a fixed
	/// delay for transient failures, then the status handler decides.
	async fn with_retries<T, F, Fut>(&self, op: F) -> Result<OpResult<T>, SyncError>
	where
		F: Fn() -> Fut,
		Fut: std::future::Future<Output = Result<T, FsError>>,
	{
		let mut retry_number = 0;
		loop {
			self.handler.abort_if_requested()?;
			match op().await {
				Ok(value) => return Ok(OpResult::Done(value)),
				Err(e) => {
					// an abort surfacing as a stream error wins
					self.handler.abort_if_requested()?;
					if e.kind == FsErrorKind::Fatal {
						return Err(SyncError::Fs(e));
					}
					if retry_number < self.options.automatic_retry_count && e.kind.is_transient()
					{
						tokio::time::sleep(self.options.automatic_retry_delay).await;
						retry_number += 1;
						continue;
					}
					if self.ignore_all.load(Ordering::Relaxed) {
						return Ok(OpResult::Ignored(e.to_string()));
					}
					match self.handler.report_error(&e.to_string(), retry_number) {
						ErrorDecision::Retry => {
							retry_number += 1;
						}
						ErrorDecision::Ignore => return Ok(OpResult::Ignored(e.to_string())),
						ErrorDecision::IgnoreAll => {
							self.ignore_all.store(true, Ordering::Relaxed);
							return Ok(OpResult::Ignored(e.to_string()));
						}
						ErrorDecision::Abort => {
							self.handler.request_abort(AbortTrigger::User);
							return Err(SyncError::Aborted(AbortTrigger::User));
						}
					}
				}
			}
		}
	}

	// ========================================================================
	// DELETE PATHWAY
	// ========================================================================

	/// Delete-to-versioning pathway shared by deletions and overwrites.
	/// `rel` is the item's path relative to its base folder.
	async fn delete_file_item(
		&self,
		fs: &Arc<dyn VirtualFs>,
		base_root: &AbstractPath,
		path: &AbstractPath,
		rel: &RelPath,
		is_symlink: bool,
	) -> Result<(), FsError> {
		match self.effective_deletion_policy(fs, base_root).await {
			DeletionPolicy::Versioning => {
				let versioner = self.versioner.as_ref().expect("policy checked at config time");
				if is_symlink {
					versioner.revision_symlink(&**fs, path, rel).await?;
				} else {
					let progress = |_: u64| Ok(());
					versioner.revision_file(&**fs, path, rel, &progress).await?;
				}
				Ok(())
			}
			DeletionPolicy::Recycler => match fs.recycle_item(path).await {
				Ok(()) => Ok(()),
				Err(e) if e.kind == FsErrorKind::RecycleUnavailable => {
					self.warn_recycle_unavailable(base_root);
					self.remove_plain(fs, path, is_symlink).await
				}
				Err(e) => Err(e),
			},
			DeletionPolicy::Permanent => self.remove_plain(fs, path, is_symlink).await,
		}
	}

	async fn remove_plain(
		&self,
		fs: &Arc<dyn VirtualFs>,
		path: &AbstractPath,
		is_symlink: bool,
	) -> Result<(), FsError> {
		if is_symlink {
			fs.remove_symlink(path).await
		} else {
			fs.remove_file(path).await
		}
	}

	async fn delete_folder_item(
		&self,
		fs: &Arc<dyn VirtualFs>,
		base_root: &AbstractPath,
		path: &AbstractPath,
		rel: &RelPath,
	) -> Result<(), FsError> {
		match self.effective_deletion_policy(fs, base_root).await {
			DeletionPolicy::Versioning => {
				let versioner = self.versioner.as_ref().expect("policy checked at config time");
				let progress = |_: u64| Ok(());
				versioner.revision_folder(&**fs, path, rel, &progress).await?;
				match fs.remove_folder_empty(path).await {
					Ok(()) => Ok(()),
					Err(e) if e.kind == FsErrorKind::NotFound => Ok(()),
					Err(e) => Err(e),
				}
			}
			DeletionPolicy::Recycler => match fs.recycle_item(path).await {
				Ok(()) => Ok(()),
				Err(e) if e.kind == FsErrorKind::RecycleUnavailable => {
					self.warn_recycle_unavailable(base_root);
					fs.remove_folder_recursive(path).await
				}
				Err(e) => Err(e),
			},
			DeletionPolicy::Permanent => fs.remove_folder_recursive(path).await,
		}
	}

	/// Recycler policy on a device without one falls back to permanent
	/// deletion; the warning surfaces once per base folder.
	async fn effective_deletion_policy(
		&self,
		fs: &Arc<dyn VirtualFs>,
		base_root: &AbstractPath,
	) -> DeletionPolicy {
		if self.options.deletion_policy == DeletionPolicy::Recycler
			&& !fs.supports_recycle(base_root).await
		{
			self.warn_recycle_unavailable(base_root);
			return DeletionPolicy::Permanent;
		}
		self.options.deletion_policy
	}

	fn warn_recycle_unavailable(&self, base_root: &AbstractPath) {
		let key = base_root.display_path();
		let first = self.recycle_warned.lock().unwrap_or_else(|e| e.into_inner()).insert(key);
		if first {
			let mut active = true;
			self.handler.report_warning(
				&format!(
					"The recycle bin is not available for {}; deleting permanently instead",
					base_root.display_path()
				),
				&mut active,
			);
		}
	}

	// ========================================================================
	// PHASE: MOVES
	// ========================================================================

	async fn run_moves(
		&self,
		base: &mut BaseFolderPair,
		left_fs: &Arc<dyn VirtualFs>,
		right_fs: &Arc<dyn VirtualFs>,
	) -> Result<(), SyncError> {
		struct MoveJob {
			new_id: PairId,
			old_id: PairId,
			target: Side,
			from: AbstractPath,
			to: AbstractPath,
			new_name: String,
			attrs: FileAttrs,
		}

		// index every linked row, then pick the "new path" rows
		let mut row_info: HashMap<PairId, (Option<Side>, Side, AbstractPath)> = HashMap::new();
		let left_base = base.left_base.clone();
		let right_base = base.right_base.clone();
		base.for_each_file(|pair| {
			if pair.move_ref.is_none() {
				return;
			}
			let present = if pair.exists_on(Side::Left) { Side::Left } else { Side::Right };
			let path = match present {
				Side::Left => left_base.join_rel(&pair.rel_on(Side::Left)),
				Side::Right => right_base.join_rel(&pair.rel_on(Side::Right)),
			};
			row_info.insert(pair.id, (pair.target_side(), present, path));
		});

		let mut jobs: Vec<MoveJob> = Vec::new();
		let mut linked: HashSet<PairId> = HashSet::new();
		base.for_each_file(|pair| {
			let other_id = match pair.move_ref {
				Some(id) => id,
				None => return,
			};
			if linked.contains(&pair.id) || linked.contains(&other_id) {
				return;
			}
			let target = match pair.target_side() {
				Some(t) => t,
				None => return,
			};
			let source = target.opposite();
			// this row carries the new path on the source side
			if !pair.exists_on(source) || pair.exists_on(target) {
				return;
			}
			let (other_target, other_present, other_path) = match row_info.get(&other_id) {
				Some(info) => info.clone(),
				None => return,
			};
			// the linked row must hold the old path on the target side and
			// agree on the direction; otherwise fall back to copy + delete
			if other_target != Some(target) || other_present != target {
				return;
			}
			let attrs = match pair.attrs_on(source) {
				Some(a) => a.clone(),
				None => return,
			};
			let to = match target {
				Side::Left => left_base.join_rel(&pair.rel_on(Side::Left)),
				Side::Right => right_base.join_rel(&pair.rel_on(Side::Right)),
			};
			linked.insert(pair.id);
			linked.insert(other_id);
			jobs.push(MoveJob {
				new_id: pair.id,
				old_id: other_id,
				target,
				from: other_path,
				to,
				new_name: pair.name_on(source).to_string(),
				attrs,
			});
		});

		for job in jobs {
			let fs = self.fs_on(job.target, left_fs, right_fs);
			self.handler.report_status(&format!(
				"Moving file {} to {}",
				job.from.display_path(),
				job.to.display_path()
			));

			let _slot = self.limiter.acquire(fs.device()).await;
			let fs_ref: &dyn VirtualFs = &**fs;
			let from = &job.from;
			let to = &job.to;
			let outcome = self
				.with_retries(|| async move {
					if let Some(parent) = to.parent() {
						fs_ref.create_folder_if_missing(&parent).await?;
					}
					fs_ref.move_and_rename(from, to).await
				})
				.await?;

			match outcome {
				OpResult::Done(()) => {
					self.stats.items_moved.fetch_add(1, Ordering::Relaxed);
					self.handler.update_processed(2, 0);
					base.for_each_file_mut(|pair| {
						if pair.id == job.new_id {
							let side = FileSide {
								name: job.new_name.clone(),
								attrs: FileAttrs {
									size: job.attrs.size,
									mtime: job.attrs.mtime,
									fingerprint: String::new(),
								},
							};
							match job.target {
								Side::Left => pair.left = Some(side),
								Side::Right => pair.right = Some(side),
							}
							pair.category = Category::Equal;
							pair.direction = SyncDirection::None;
						} else if pair.id == job.old_id {
							pair.left = None;
							pair.right = None;
							pair.category = Category::Equal;
							pair.direction = SyncDirection::None;
						}
					});
				}
				OpResult::Ignored(message) => {
					// break the link: the regular create and delete passes
					// pick both rows up
					self.stats.note_error(message);
					base.for_each_file_mut(|pair| {
						if pair.id == job.new_id || pair.id == job.old_id {
							pair.move_ref = None;
						}
					});
				}
			}
		}
		Ok(())
	}

	// ========================================================================
	// PHASE: DELETES
	// ========================================================================

	async fn run_deletes(
		&self,
		base: &mut BaseFolderPair,
		left_fs: &Arc<dyn VirtualFs>,
		right_fs: &Arc<dyn VirtualFs>,
	) -> Result<(), SyncError> {
		let left_base = base.left_base.clone();
		let right_base = base.right_base.clone();
		let mut files = std::mem::take(&mut base.files);
		let mut symlinks = std::mem::take(&mut base.symlinks);
		let mut folders = std::mem::take(&mut base.folders);
		let result = self
			.delete_level(
				&left_base,
				&right_base,
				left_fs,
				right_fs,
				&mut files,
				&mut symlinks,
				&mut folders,
			)
			.await;
		base.files = files;
		base.symlinks = symlinks;
		base.folders = folders;
		result
	}

	#[allow(clippy::too_many_arguments)]
	fn delete_level<'a>(
		&'a self,
		left_base: &'a AbstractPath,
		right_base: &'a AbstractPath,
		left_fs: &'a Arc<dyn VirtualFs>,
		right_fs: &'a Arc<dyn VirtualFs>,
		files: &'a mut [FilePair],
		symlinks: &'a mut [SymlinkPair],
		folders: &'a mut [FolderPair],
	) -> BoxFuture<'a, Result<(), SyncError>> {
		async move {
			let base_of = |side: Side| match side {
				Side::Left => left_base,
				Side::Right => right_base,
			};

			for pair in files.iter_mut() {
				if !pair.active || pair.move_ref.is_some() {
					continue;
				}
				let target = match pair.target_side() {
					Some(t) => t,
					None => continue,
				};
				if pair.exists_on(target.opposite()) || !pair.exists_on(target) {
					continue;
				}
				let rel = pair.rel_on(target);
				let path = base_of(target).join_rel(&rel);
				let fs = self.fs_on(target, left_fs, right_fs);
				self.handler.report_status(&format!("Deleting file {}", path.display_path()));

				let _slot = self.limiter.acquire(fs.device()).await;
				let this = self;
				let base_root = base_of(target);
				let path_ref = &path;
				let rel_ref = &rel;
				let outcome = self
					.with_retries(|| async move {
						match this.delete_file_item(fs, base_root, path_ref, rel_ref, false).await
						{
							Ok(()) => Ok(()),
							Err(e) if e.kind == FsErrorKind::NotFound => Ok(()),
							Err(e) => Err(e),
						}
					})
					.await?;
				match outcome {
					OpResult::Done(()) => {
						self.stats.items_deleted.fetch_add(1, Ordering::Relaxed);
						self.handler.update_processed(1, 0);
						clear_side_file(pair, target);
					}
					OpResult::Ignored(message) => self.stats.note_error(message),
				}
			}

			for pair in symlinks.iter_mut() {
				if !pair.active {
					continue;
				}
				let target = match pair.target_side() {
					Some(t) => t,
					None => continue,
				};
				if pair.exists_on(target.opposite()) || !pair.exists_on(target) {
					continue;
				}
				let rel = pair.rel_on(target);
				let path = base_of(target).join_rel(&rel);
				let fs = self.fs_on(target, left_fs, right_fs);
				self.handler
					.report_status(&format!("Deleting symbolic link {}", path.display_path()));

				let _slot = self.limiter.acquire(fs.device()).await;
				let this = self;
				let base_root = base_of(target);
				let path_ref = &path;
				let rel_ref = &rel;
				let outcome = self
					.with_retries(|| async move {
						match this.delete_file_item(fs, base_root, path_ref, rel_ref, true).await {
							Ok(()) => Ok(()),
							Err(e) if e.kind == FsErrorKind::NotFound => Ok(()),
							Err(e) => Err(e),
						}
					})
					.await?;
				match outcome {
					OpResult::Done(()) => {
						self.stats.items_deleted.fetch_add(1, Ordering::Relaxed);
						self.handler.update_processed(1, 0);
						clear_side_symlink(pair, target);
					}
					OpResult::Ignored(message) => self.stats.note_error(message),
				}
			}

			for pair in folders.iter_mut() {
				let target = pair.target_side();
				let is_delete = pair.active
					&& matches!(target, Some(t) if !pair.exists_on(t.opposite()) && pair.exists_on(t));

				if is_delete {
					let target = target.expect("checked above");
					let rel = pair.rel_on(target);
					let path = base_of(target).join_rel(&rel);
					let fs = self.fs_on(target, left_fs, right_fs);
					self.handler
						.report_status(&format!("Deleting folder {}", path.display_path()));

					let _slot = self.limiter.acquire(fs.device()).await;
					let this = self;
					let base_root = base_of(target);
					let path_ref = &path;
					let rel_ref = &rel;
					let outcome = self
						.with_retries(|| async move {
							match this.delete_folder_item(fs, base_root, path_ref, rel_ref).await
							{
								Ok(()) => Ok(()),
								Err(e) if e.kind == FsErrorKind::NotFound => Ok(()),
								Err(e) => Err(e),
							}
						})
						.await?;
					match outcome {
						OpResult::Done(()) => {
							let descendant_ops = count_subtree_ops(pair);
							self.stats
								.items_deleted
								.fetch_add(1 + descendant_ops, Ordering::Relaxed);
							self.handler.update_processed(1 + descendant_ops, 0);
							clear_subtree(pair, target);
						}
						OpResult::Ignored(message) => self.stats.note_error(message),
					}
					continue; // subtree handled as one recursive deletion
				}

				self.delete_level(
					left_base,
					right_base,
					left_fs,
					right_fs,
					&mut pair.files,
					&mut pair.symlinks,
					&mut pair.folders,
				)
				.await?;
			}
			Ok(())
		}
		.boxed()
	}

	// ========================================================================
	// PHASE: FOLDER CREATES & METADATA
	// ========================================================================

	async fn run_folder_creates(
		&self,
		base: &mut BaseFolderPair,
		left_fs: &Arc<dyn VirtualFs>,
		right_fs: &Arc<dyn VirtualFs>,
	) -> Result<(), SyncError> {
		let left_base = base.left_base.clone();
		let right_base = base.right_base.clone();
		let mut folders = std::mem::take(&mut base.folders);
		let result = self
			.folder_create_level(&left_base, &right_base, left_fs, right_fs, &mut folders)
			.await;
		base.folders = folders;
		result
	}

	fn folder_create_level<'a>(
		&'a self,
		left_base: &'a AbstractPath,
		right_base: &'a AbstractPath,
		left_fs: &'a Arc<dyn VirtualFs>,
		right_fs: &'a Arc<dyn VirtualFs>,
		folders: &'a mut [FolderPair],
	) -> BoxFuture<'a, Result<(), SyncError>> {
		async move {
			let base_of = |side: Side| match side {
				Side::Left => left_base,
				Side::Right => right_base,
			};

			for pair in folders.iter_mut() {
				if pair.active {
					if let Some(target) = pair.target_side() {
						let source = target.opposite();
						if pair.exists_on(source) && !pair.exists_on(target) {
							let path = base_of(target)
								.join_rel(&pair.parent_rel)
								.join(pair.name_on(source));
							let fs = self.fs_on(target, left_fs, right_fs);
							self.handler.report_status(&format!(
								"Creating folder {}",
								path.display_path()
							));

							let _slot = self.limiter.acquire(fs.device()).await;
							let fs_ref: &dyn VirtualFs = &**fs;
							let path_ref = &path;
							let outcome = self
								.with_retries(|| async move {
									fs_ref.create_folder_if_missing(path_ref).await
								})
								.await?;
							match outcome {
								OpResult::Done(()) => {
									self.stats.folders_created.fetch_add(1, Ordering::Relaxed);
									self.handler.update_processed(1, 0);
									let name = pair.name_on(source).to_string();
									match target {
										Side::Left => pair.left = Some(FolderSide { name }),
										Side::Right => pair.right = Some(FolderSide { name }),
									}
									pair.category = Category::Equal;
									pair.direction = SyncDirection::None;
								}
								OpResult::Ignored(message) => {
									// nothing below can proceed without the
									// parent folder
									self.stats.note_error(message);
									continue;
								}
							}
						} else if pair.category == Category::DifferentMetadata
							&& pair.exists_on(source)
							&& pair.exists_on(target)
						{
							let from = base_of(target).join_rel(&pair.rel_on(target));
							let to = base_of(target)
								.join_rel(&pair.parent_rel)
								.join(pair.name_on(source));
							let fs = self.fs_on(target, left_fs, right_fs);
							self.handler.report_status(&format!(
								"Updating folder name {}",
								from.display_path()
							));

							let _slot = self.limiter.acquire(fs.device()).await;
							let fs_ref: &dyn VirtualFs = &**fs;
							let from_ref = &from;
							let to_ref = &to;
							let outcome = self
								.with_retries(|| async move {
									fs_ref.move_and_rename(from_ref, to_ref).await
								})
								.await?;
							match outcome {
								OpResult::Done(()) => {
									self.stats
										.metadata_updates
										.fetch_add(1, Ordering::Relaxed);
									self.handler.update_processed(1, 0);
									let name = pair.name_on(source).to_string();
									match target {
										Side::Left => pair.left = Some(FolderSide { name }),
										Side::Right => pair.right = Some(FolderSide { name }),
									}
									pair.category = Category::Equal;
									pair.direction = SyncDirection::None;
								}
								OpResult::Ignored(message) => self.stats.note_error(message),
							}
						}
					}
				}

				self.folder_create_level(
					left_base,
					right_base,
					left_fs,
					right_fs,
					&mut pair.folders,
				)
				.await?;
			}
			Ok(())
		}
		.boxed()
	}

	// ========================================================================
	// PHASE: FILE & SYMLINK TRANSFERS
	// ========================================================================

	async fn run_transfers(
		self: &Arc<Self>,
		base: &mut BaseFolderPair,
		left_fs: &Arc<dyn VirtualFs>,
		right_fs: &Arc<dyn VirtualFs>,
	) -> Result<(), SyncError> {
		let (file_jobs, link_jobs) = collect_transfer_jobs(base);

		let mut tasks: JoinSet<Result<(PairId, Side, String, TransferOutcome), SyncError>> =
			JoinSet::new();

		for job in file_jobs {
			let this = Arc::clone(self);
			let left_fs = Arc::clone(left_fs);
			let right_fs = Arc::clone(right_fs);
			tasks.spawn(async move { this.transfer_file(job, left_fs, right_fs).await });
		}
		for job in link_jobs {
			let this = Arc::clone(self);
			let left_fs = Arc::clone(left_fs);
			let right_fs = Arc::clone(right_fs);
			tasks.spawn(async move { this.transfer_symlink(job, left_fs, right_fs).await });
		}

		let mut results: Vec<(PairId, Side, String, TransferOutcome)> = Vec::new();
		while let Some(joined) = tasks.join_next().await {
			let item = joined.map_err(|e| SyncError::Other { message: e.to_string() })?;
			results.push(item?);
		}

		for (id, target, src_name, outcome) in results {
			self.apply_transfer_outcome(base, id, target, src_name, outcome);
		}
		Ok(())
	}

	async fn transfer_file(
		self: Arc<Self>,
		job: FileJob,
		left_fs: Arc<dyn VirtualFs>,
		right_fs: Arc<dyn VirtualFs>,
	) -> Result<(PairId, Side, String, TransferOutcome), SyncError> {
		let src_fs =
			if job.src.device == *left_fs.device() { &left_fs } else { &right_fs };
		let dst_fs = match job.target {
			Side::Left => &left_fs,
			Side::Right => &right_fs,
		};

		let _slot = self.limiter.acquire_pair(src_fs.device(), dst_fs.device()).await;
		self.handler.abort_if_requested()?;

		if job.metadata_only {
			self.handler
				.report_status(&format!("Updating file name {}", job.dst_current.display_path()));
			let dst_ref: &dyn VirtualFs = &**dst_fs;
			let from = &job.dst_current;
			let to = &job.dst;
			let outcome = self
				.with_retries(|| async move { dst_ref.move_and_rename(from, to).await })
				.await?;
			let result = match outcome {
				OpResult::Done(()) => TransferOutcome::Renamed,
				OpResult::Ignored(m) => TransferOutcome::Ignored(m),
			};
			return Ok((job.id, job.target, job.src_name, result));
		}

		self.handler.report_status(&format!(
			"{} {}",
			if job.overwrite { "Updating file" } else { "Creating file" },
			job.dst.display_path()
		));

		let handler = Arc::clone(&self.handler);
		let dst_display = job.dst.display_path();
		let progress = move |bytes: u64| -> Result<(), FsError> {
			handler.update_processed(0, bytes);
			match handler.abort_requested() {
				Some(_) => Err(FsError::new(
					FsErrorKind::TransportError,
					dst_display.clone(),
					"Operation aborted",
				)),
				None => Ok(()),
			}
		};

		let copy_permissions =
			self.options.copy_permissions && src_fs.device().kind() == dst_fs.device().kind();
		let fail_safe = self.options.fail_safe_file_copy;

		let this: &Executor = &self;
		let job_ref = &job;
		let src_ref: &dyn VirtualFs = &**src_fs;
		let dst_arc = dst_fs;
		let progress_ref: &(dyn Fn(u64) -> Result<(), FsError> + Send + Sync) = &progress;

		let outcome = self
			.with_retries(|| async move {
				let hook: Option<BoxFuture<'_, Result<(), FsError>>> = if job_ref.overwrite {
					Some(
						async move {
							this.delete_file_item(
								dst_arc,
								&job_ref.target_base,
								&job_ref.dst_current,
								&job_ref.rel_current,
								false,
							)
							.await
						}
						.boxed(),
					)
				} else {
					None
				};
				copy_file_transactional(
					src_ref,
					&job_ref.src,
					&job_ref.src_attrs,
					&**dst_arc,
					&job_ref.dst,
					copy_permissions,
					fail_safe,
					hook,
					progress_ref,
				)
				.await
			})
			.await?;

		let result = match outcome {
			OpResult::Done(copy) => {
				self.handler.update_processed(1, 0);
				TransferOutcome::Copied(FileAttrs {
					size: copy.file_size,
					mtime: copy.mod_time,
					fingerprint: copy.target_fingerprint,
				})
			}
			OpResult::Ignored(m) => TransferOutcome::Ignored(m),
		};
		Ok((job.id, job.target, job.src_name, result))
	}

	async fn transfer_symlink(
		self: Arc<Self>,
		job: LinkJob,
		left_fs: Arc<dyn VirtualFs>,
		right_fs: Arc<dyn VirtualFs>,
	) -> Result<(PairId, Side, String, TransferOutcome), SyncError> {
		let src_fs =
			if job.src.device == *left_fs.device() { &left_fs } else { &right_fs };
		let dst_fs = match job.target {
			Side::Left => &left_fs,
			Side::Right => &right_fs,
		};

		let _slot = self.limiter.acquire_pair(src_fs.device(), dst_fs.device()).await;
		self.handler.abort_if_requested()?;
		self.handler.report_status(&format!(
			"{} {}",
			if job.overwrite { "Updating symbolic link" } else { "Creating symbolic link" },
			job.dst.display_path()
		));

		let this: &Executor = &self;
		let job_ref = &job;
		let src_ref: &dyn VirtualFs = &**src_fs;
		let dst_arc = dst_fs;
		let outcome = self
			.with_retries(|| async move {
				if job_ref.overwrite {
					this.delete_file_item(
						dst_arc,
						&job_ref.target_base,
						&job_ref.dst_current,
						&job_ref.rel_current,
						true,
					)
					.await?;
				}
				copy_symlink(src_ref, &job_ref.src, &job_ref.src_attrs, &**dst_arc, &job_ref.dst)
					.await
			})
			.await?;

		let result = match outcome {
			OpResult::Done(()) => {
				self.handler.update_processed(1, 0);
				let mtime =
					stat_symlink_mtime(&**dst_fs, &job.dst).await.unwrap_or(job.src_attrs.mtime);
				TransferOutcome::LinkCopied(mtime)
			}
			OpResult::Ignored(m) => TransferOutcome::Ignored(m),
		};
		Ok((job.id, job.target, job.src_name, result))
	}

	fn apply_transfer_outcome(
		&self,
		base: &mut BaseFolderPair,
		id: PairId,
		target: Side,
		src_name: String,
		outcome: TransferOutcome,
	) {
		match outcome {
			TransferOutcome::Copied(attrs) => {
				self.stats.files_copied.fetch_add(1, Ordering::Relaxed);
				self.stats.bytes_copied.fetch_add(attrs.size, Ordering::Relaxed);
				base.for_each_file_mut(|pair| {
					if pair.id == id {
						let side = FileSide { name: src_name.clone(), attrs: attrs.clone() };
						match target {
							Side::Left => pair.left = Some(side),
							Side::Right => pair.right = Some(side),
						}
						pair.category = Category::Equal;
						pair.direction = SyncDirection::None;
					}
				});
			}
			TransferOutcome::Renamed => {
				self.stats.metadata_updates.fetch_add(1, Ordering::Relaxed);
				self.handler.update_processed(1, 0);
				base.for_each_file_mut(|pair| {
					if pair.id == id {
						if let Some(side) = match target {
							Side::Left => pair.left.as_mut(),
							Side::Right => pair.right.as_mut(),
						} {
							side.name = src_name.clone();
						}
						pair.category = Category::Equal;
						pair.direction = SyncDirection::None;
					}
				});
			}
			TransferOutcome::LinkCopied(mtime) => {
				self.stats.files_copied.fetch_add(1, Ordering::Relaxed);
				base.for_each_symlink_mut(|pair| {
					if pair.id == id {
						let side = LinkSide {
							name: src_name.clone(),
							attrs: SymlinkAttrs { mtime },
						};
						match target {
							Side::Left => pair.left = Some(side),
							Side::Right => pair.right = Some(side),
						}
						pair.category = Category::Equal;
						pair.direction = SyncDirection::None;
					}
				});
			}
			TransferOutcome::Ignored(message) => self.stats.note_error(message),
		}
	}
}

#[derive(Clone)]
struct FileJob {
	id: PairId,
	target: Side,
	overwrite: bool,
	metadata_only: bool,
	src: AbstractPath,
	dst: AbstractPath,
	dst_current: AbstractPath,
	target_base: AbstractPath,
	rel_current: RelPath,
	src_attrs: FileAttrs,
	src_name: String,
}

#[derive(Clone)]
struct LinkJob {
	id: PairId,
	target: Side,
	overwrite: bool,
	src: AbstractPath,
	dst: AbstractPath,
	dst_current: AbstractPath,
	target_base: AbstractPath,
	rel_current: RelPath,
	src_attrs: SymlinkAttrs,
	src_name: String,
}

enum TransferOutcome {
	Copied(FileAttrs),
	LinkCopied(i64),
	Renamed,
	Ignored(String),
}

fn collect_transfer_jobs(base: &BaseFolderPair) -> (Vec<FileJob>, Vec<LinkJob>) {
	let left_base = base.left_base.clone();
	let right_base = base.right_base.clone();
	let base_of = |side: Side| match side {
		Side::Left => left_base.clone(),
		Side::Right => right_base.clone(),
	};

	let mut file_jobs = Vec::new();
	base.for_each_file(|pair| {
		if !pair.active || pair.move_ref.is_some() {
			return;
		}
		let target = match pair.target_side() {
			Some(t) => t,
			None => return,
		};
		let source = target.opposite();
		if !pair.exists_on(source) {
			return; // delete, handled earlier
		}
		let src_attrs = pair.attrs_on(source).expect("source present").clone();
		let metadata_only =
			pair.exists_on(target) && pair.category == Category::DifferentMetadata;
		file_jobs.push(FileJob {
			id: pair.id,
			target,
			overwrite: pair.exists_on(target) && !metadata_only,
			metadata_only,
			src: base_of(source).join_rel(&pair.rel_on(source)),
			dst: base_of(target).join_rel(&pair.parent_rel).join(pair.name_on(source)),
			dst_current: base_of(target).join_rel(&pair.rel_on(target)),
			target_base: base_of(target),
			rel_current: pair.rel_on(target),
			src_attrs,
			src_name: pair.name_on(source).to_string(),
		});
	});

	let mut link_jobs = Vec::new();
	fn walk_links<F: FnMut(&SymlinkPair)>(links: &[SymlinkPair], folders: &[FolderPair], f: &mut F) {
		for link in links {
			f(link);
		}
		for folder in folders {
			walk_links(&folder.symlinks, &folder.folders, f);
		}
	}
	let mut push_link = |pair: &SymlinkPair| {
		if !pair.active {
			return;
		}
		let target = match pair.target_side() {
			Some(t) => t,
			None => return,
		};
		let source = target.opposite();
		if !pair.exists_on(source) {
			return;
		}
		let src_attrs = pair.attrs_on(source).expect("source present").clone();
		link_jobs.push(LinkJob {
			id: pair.id,
			target,
			overwrite: pair.exists_on(target),
			src: base_of(source).join_rel(&pair.rel_on(source)),
			dst: base_of(target).join_rel(&pair.parent_rel).join(pair.name_on(source)),
			dst_current: base_of(target).join_rel(&pair.rel_on(target)),
			target_base: base_of(target),
			rel_current: pair.rel_on(target),
			src_attrs,
			src_name: pair.name_on(source).to_string(),
		});
	};
	walk_links(&base.symlinks, &base.folders, &mut push_link);

	(file_jobs, link_jobs)
}

/// Actual mtime of a created symlink, through its parent listing
async fn stat_symlink_mtime(fs: &dyn VirtualFs, path: &AbstractPath) -> Option<i64> {
	let parent = path.parent()?;
	let name = path.item_name();
	for entry in fs.read_dir(&parent).await.ok()? {
		if let crate::afs::DirEntry::Symlink { name: n, attrs } = entry {
			if n == name {
				return Some(attrs.mtime);
			}
		}
	}
	None
}

/// Planned items and bytes of the synchronizing phase
pub fn count_totals(bases: &[BaseFolderPair]) -> (u64, u64) {
	fn visit(
		files: &[FilePair],
		symlinks: &[SymlinkPair],
		folders: &[FolderPair],
		items: &mut u64,
		bytes: &mut u64,
	) {
		for pair in files {
			if !pair.active {
				continue;
			}
			if let Some(target) = pair.target_side() {
				*items += 1;
				if pair.category != Category::DifferentMetadata {
					if let Some(attrs) = pair.attrs_on(target.opposite()) {
						*bytes += attrs.size;
					}
				}
			}
		}
		for pair in symlinks {
			if pair.active && pair.target_side().is_some() {
				*items += 1;
			}
		}
		for pair in folders {
			if pair.active && pair.target_side().is_some() {
				*items += 1;
			}
			visit(&pair.files, &pair.symlinks, &pair.folders, items, bytes);
		}
	}

	let mut items = 0u64;
	let mut bytes = 0u64;
	for base in bases {
		visit(&base.files, &base.symlinks, &base.folders, &mut items, &mut bytes);
	}
	(items, bytes)
}

/// Operations inside a folder subtree that is deleted as one unit
fn count_subtree_ops(folder: &FolderPair) -> u64 {
	fn visit(folder: &FolderPair, count: &mut u64) {
		for pair in &folder.files {
			if pair.active && pair.target_side().is_some() {
				*count += 1;
			}
		}
		for pair in &folder.symlinks {
			if pair.active && pair.target_side().is_some() {
				*count += 1;
			}
		}
		for pair in &folder.folders {
			if pair.active && pair.target_side().is_some() {
				*count += 1;
			}
			visit(pair, count);
		}
	}
	let mut count = 0u64;
	visit(folder, &mut count);
	count
}

fn clear_side_file(pair: &mut FilePair, target: Side) {
	match target {
		Side::Left => pair.left = None,
		Side::Right => pair.right = None,
	}
	pair.category = Category::Equal;
	pair.direction = SyncDirection::None;
}

fn clear_side_symlink(pair: &mut SymlinkPair, target: Side) {
	match target {
		Side::Left => pair.left = None,
		Side::Right => pair.right = None,
	}
	pair.category = Category::Equal;
	pair.direction = SyncDirection::None;
}

/// After a recursive deletion the whole subtree is gone on the target side
fn clear_subtree(folder: &mut FolderPair, target: Side) {
	match target {
		Side::Left => folder.left = None,
		Side::Right => folder.right = None,
	}
	folder.category = Category::Equal;
	folder.direction = SyncDirection::None;
	for pair in folder.files.iter_mut() {
		clear_side_file(pair, target);
	}
	for pair in folder.symlinks.iter_mut() {
		clear_side_symlink(pair, target);
	}
	for pair in folder.folders.iter_mut() {
		clear_subtree(pair, target);
	}
}

// vim: ts=4
