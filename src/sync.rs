//! Run orchestration
//!
//! Ties the subsystems together: validate the folder pairs, traverse every
//! unique (device, folder) key once, merge and categorize, apply filters,
//! resolve directions (database-driven for two-way), execute, enforce
//! versioning limits and finally rewrite the per-pair databases.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::afs::{local::LocalFs, FsRegistry, ItemType, VirtualFs};
use crate::compare::{compare_content, merge_trees, CompareSettings, MergeOutput};
use crate::config::Config;
use crate::db::{build_db_from_tree, load_db, save_db, InSyncFolder, SyncDb};
use crate::dependency::{check_pair_dependencies, check_versioning_dependencies, PairBases};
use crate::error::SyncError;
use crate::executor::{Executor, ExecutorOptions};
use crate::filter::{PathFilter, SoftFilter};
use crate::logging::*;
use crate::error::AbortTrigger;
use crate::path::{AbstractPath, Device, RelPath};
use crate::status::ErrorDecision;
use crate::resolve::{apply_direction_table, detect_moves, resolve_two_way, TwoWaySettings};
use crate::session::{DeviceLimiter, SessionCounter};
use crate::status::{Phase, StatusHandler};
use crate::strategies::{DeletionPolicy, DirectionConfig, DirectionPolicy};
use crate::traverse::{traverse_all, TraverseJob};
use crate::tree::{BaseFolderPair, Category, PairIdSource};
use crate::versioning::{
	apply_versioning_limits, FileVersioner, StoredVersion, VersioningLimitFolder,
};

/// Result of a completed synchronization run
#[derive(Debug, Clone, Default)]
pub struct SyncRunResult {
	pub files_copied: u64,
	pub folders_created: u64,
	pub items_deleted: u64,
	pub items_moved: u64,
	pub metadata_updates: u64,
	pub bytes_copied: u64,

	/// Pairs left unresolved (category or direction conflicts)
	pub conflicts: u64,

	/// Non-fatal errors that were ignored by policy
	pub errors: Vec<String>,

	pub duration: Duration,
}

impl SyncRunResult {
	pub fn operations(&self) -> u64 {
		self.files_copied
			+ self.folders_created
			+ self.items_deleted
			+ self.items_moved
			+ self.metadata_updates
	}
}

/// Everything the comparison produced, kept for the execution step
pub struct ComparedRun {
	pub registry: Arc<FsRegistry>,
	pub limiter: Arc<DeviceLimiter>,
	pub pair_bases: Vec<PairBases>,
	pub bases: Vec<BaseFolderPair>,
	pub dbs: Vec<DbState>,
	session_counter: Arc<SessionCounter>,
	reaper: Option<tokio::task::JoinHandle<()>>,
}

/// Per-pair database state after the tolerant load
pub enum DbState {
	/// Initial run: no database yet
	Missing,
	Loaded(SyncDb),
	/// Corrupt or wrong version; two-way falls back to prefer-newer
	Unusable(String),
}

impl ComparedRun {
	/// Wait for pooled network sessions to drain
	pub async fn shutdown(self) {
		if let Some(reaper) = self.reaper {
			reaper.abort();
		}
		self.session_counter.shutdown().await;
	}
}

fn build_registry(
	config: &Config,
	devices: &[Device],
	session_counter: &Arc<SessionCounter>,
) -> Result<(FsRegistry, Option<tokio::task::JoinHandle<()>>), SyncError> {
	let _ = (config, session_counter);
	let mut registry = FsRegistry::new();
	#[cfg_attr(not(feature = "sftp"), allow(unused_mut))]
	let mut reaper = None;

	// one process-wide pool per network backend kind; its reaper evicts one
	// idle session per wake
	#[cfg(feature = "sftp")]
	let sftp_pool = {
		let pool = crate::session::SessionPool::new();
		reaper = Some(pool.spawn_reaper());
		pool
	};

	for device in devices {
		let fs: Arc<dyn VirtualFs> = match device {
			Device::Local { root } => Arc::new(LocalFs::new(root.clone())),
			#[cfg(feature = "sftp")]
			Device::Sftp { .. } => Arc::new(crate::afs::sftp::SftpFs::new(
				device.clone(),
				config.sftp_password.clone().unwrap_or_default(),
				config.sftp_compress,
				Arc::clone(&sftp_pool),
				Arc::clone(session_counter),
			)),
			other => {
				return Err(SyncError::InvalidConfig {
					message: format!(
						"No backend available for {} in this build",
						other.display_root()
					),
				});
			}
		};
		registry.insert(fs);
	}
	Ok((registry, reaper))
}

fn build_limiter(config: &Config, devices: &[Device]) -> DeviceLimiter {
	let limits: Vec<(Device, usize)> = devices
		.iter()
		.map(|device| {
			let configured = config
				.device_parallelism
				.get(&device.display_root())
				.copied()
				.unwrap_or(config.default_parallelism);
			(device.clone(), configured)
		})
		.collect();
	DeviceLimiter::new(limits, config.default_parallelism)
}

fn unique_devices(paths: &[AbstractPath]) -> Vec<Device> {
	let mut devices: Vec<Device> = Vec::new();
	for path in paths {
		if !devices.contains(&path.device) {
			devices.push(path.device.clone());
		}
	}
	devices
}

/// Deactivate pairs the soft filter excludes; never deletes them
fn apply_soft_filter(bases: &mut [BaseFolderPair], soft: &SoftFilter) {
	if soft.is_null() {
		return;
	}
	for base in bases.iter_mut() {
		base.for_each_file_mut(|pair| {
			if pair.active
				&& !soft.matches_pair(
					pair.left.as_ref().map(|s| &s.attrs),
					pair.right.as_ref().map(|s| &s.attrs),
				) {
				pair.active = false;
			}
		});
	}
}

fn count_conflicts(bases: &[BaseFolderPair]) -> u64 {
	let mut conflicts = 0u64;
	for base in bases {
		base.for_each_file(|pair| {
			if pair.category == Category::Conflict || pair.direction_conflict.is_some() {
				conflicts += 1;
			}
		});
	}
	conflicts
}

/// Compare all folder pairs and resolve directions. The returned run holds
/// everything the execution step needs.
pub async fn compare(
	config: &Config,
	handler: Arc<dyn StatusHandler>,
) -> Result<ComparedRun, SyncError> {
	config.validate()?;

	// ---- resolve folder pairs and check dependencies ----
	let mut pair_bases = Vec::new();
	for pair in &config.folder_pairs {
		pair_bases.push(PairBases {
			left: AbstractPath::parse(&pair.left)?,
			right: AbstractPath::parse(&pair.right)?,
		});
	}
	for warning in check_pair_dependencies(&pair_bases) {
		let mut active = true;
		handler.report_warning(&warning, &mut active);
	}

	let versioning_root = match (&config.deletion_policy, &config.versioning_folder) {
		(DeletionPolicy::Versioning, Some(folder)) => {
			let root = AbstractPath::parse(folder)?;
			check_versioning_dependencies(&pair_bases, &root)?;
			Some(root)
		}
		_ => None,
	};

	// ---- backends and per-device limits ----
	let mut all_paths: Vec<AbstractPath> = Vec::new();
	for pair in &pair_bases {
		all_paths.push(pair.left.clone());
		all_paths.push(pair.right.clone());
	}
	if let Some(root) = &versioning_root {
		all_paths.push(root.clone());
	}
	let devices = unique_devices(&all_paths);

	let session_counter = SessionCounter::new();
	let (registry, reaper) = build_registry(config, &devices, &session_counter)?;
	let registry = Arc::new(registry);
	let limiter = Arc::new(build_limiter(config, &devices));

	// ---- traverse every unique (device, folder) key once ----
	handler.init_phase(0, 0, Phase::Scanning);
	let filter = Arc::new(PathFilter::new(&config.include_patterns, &config.exclude_patterns)?);

	let mut job_index: HashMap<AbstractPath, usize> = HashMap::new();
	let mut jobs: Vec<TraverseJob> = Vec::new();
	for pair in &pair_bases {
		for base in [&pair.left, &pair.right] {
			if !job_index.contains_key(base) {
				job_index.insert(base.clone(), jobs.len());
				jobs.push(TraverseJob {
					fs: registry.get(&base.device)?,
					base: base.clone(),
					filter: Arc::clone(&filter),
					symlink_policy: config.symlink_policy,
				});
			}
		}
	}
	// bounded existence check per base folder: a hanging device must not
	// stall the whole run before it even started
	for base in job_index.keys() {
		let fs = registry.get(&base.device)?;
		let mut active = true;
		match tokio::time::timeout(fs.access_timeout(), fs.item_type_if_exists(base)).await {
			Err(_) => handler.report_warning(
				&format!("Timeout while checking folder: {}", base.display_path()),
				&mut active,
			),
			Ok(Ok(Some(ItemType::Folder))) => {}
			Ok(Ok(Some(_))) => handler.report_warning(
				&format!("The name is not a folder: {}", base.display_path()),
				&mut active,
			),
			// a missing base folder is created on demand so that a first
			// run into a fresh target just works
			Ok(Ok(None)) => match fs.create_folder_if_missing(base).await {
				Ok(()) => handler.log_info(&format!("Created folder: {}", base.display_path())),
				Err(e) => handler.report_warning(&e.to_string(), &mut active),
			},
			Ok(Err(e)) => handler.report_warning(&e.to_string(), &mut active),
		}
	}

	let traversals = traverse_all(jobs, Arc::clone(&limiter), Arc::clone(&handler)).await?;

	// ---- load per-pair databases (lazy and tolerant) ----
	// move detection consults the database in the fixed-direction policies
	// too, so those runs keep a snapshot as well
	let need_db =
		config.direction_policy == DirectionPolicy::TwoWay || config.detect_moved_files;
	let mut dbs: Vec<DbState> = Vec::new();
	for pair in &pair_bases {
		if !need_db {
			dbs.push(DbState::Missing);
			continue;
		}
		let fs = registry.get(&pair.left.device)?;
		match load_db(&*fs, &pair.left).await {
			Ok(Some(db)) => dbs.push(DbState::Loaded(db)),
			Ok(None) => dbs.push(DbState::Missing),
			Err(e) => {
				let mut active = true;
				handler.report_warning(&e.to_string(), &mut active);
				dbs.push(DbState::Unusable(e.to_string()));
			}
		}
	}

	// ---- merge and categorize ----
	let mut ids = PairIdSource::default();
	let mut bases: Vec<BaseFolderPair> = Vec::new();
	let mut undecided_files: Vec<(usize, crate::tree::PairId)> = Vec::new();
	let mut undecided_symlinks: Vec<(usize, crate::tree::PairId)> = Vec::new();

	for (bi, pair) in pair_bases.iter().enumerate() {
		let left_res = &traversals[job_index[&pair.left]];
		let right_res = &traversals[job_index[&pair.right]];

		// an unreadable base folder must not make the other side look like
		// a tree of one-sided changes (a mirror run would wipe it)
		let root_failure = left_res
			.failed_folder_reads
			.get(&RelPath::root())
			.or_else(|| right_res.failed_folder_reads.get(&RelPath::root()));
		if let Some(message) = root_failure {
			match handler.report_error(&format!("Cannot read base folder: {}", message), 0) {
				ErrorDecision::Abort => return Err(SyncError::Aborted(AbortTrigger::User)),
				_ => {
					// pair is skipped for this run
					bases.push(BaseFolderPair::new(pair.left.clone(), pair.right.clone()));
					continue;
				}
			}
		}

		let mut settings = CompareSettings::new(
			config.compare_variant,
			config.file_time_tolerance_secs,
			config.ignore_time_shift_minutes.clone(),
		);
		settings.case_sensitive =
			CompareSettings::case_sensitive_for(pair.left.device.kind(), pair.right.device.kind());

		let MergeOutput { base, undecided_files: uf, undecided_symlinks: us } = merge_trees(
			pair.left.clone(),
			pair.right.clone(),
			left_res,
			right_res,
			&settings,
			&mut ids,
		);
		undecided_files.extend(uf.into_iter().map(|id| (bi, id)));
		undecided_symlinks.extend(us.into_iter().map(|id| (bi, id)));
		bases.push(base);
	}

	// soft filters flip the active flag before content comparison, so
	// filtered pairs are skipped there
	apply_soft_filter(&mut bases, &config.soft_filter());

	if !undecided_files.is_empty() || !undecided_symlinks.is_empty() {
		compare_content(
			&mut bases,
			&undecided_files,
			&undecided_symlinks,
			&registry,
			Arc::clone(&limiter),
			Arc::clone(&handler),
		)
		.await?;
	}

	// ---- resolve directions ----
	let two_way = TwoWaySettings {
		cmp_var: config.compare_variant,
		tolerance: config.file_time_tolerance_secs,
		ignore_minutes: config.ignore_time_shift_minutes.clone(),
	};
	for (bi, base) in bases.iter_mut().enumerate() {
		match &config.direction_policy {
			DirectionPolicy::Mirror => {
				apply_direction_table(base, &DirectionConfig::mirror());
				if config.detect_moved_files {
					if let DbState::Loaded(db) = &dbs[bi] {
						detect_moves(base, &db.root, &two_way);
					}
				}
			}
			DirectionPolicy::Update => apply_direction_table(base, &DirectionConfig::update()),
			DirectionPolicy::Custom(table) => {
				apply_direction_table(base, table);
				if config.detect_moved_files {
					if let DbState::Loaded(db) = &dbs[bi] {
						detect_moves(base, &db.root, &two_way);
					}
				}
			}
			DirectionPolicy::TwoWay => match &dbs[bi] {
				DbState::Loaded(db) => {
					resolve_two_way(base, &db.root, &two_way);
					if config.detect_moved_files {
						detect_moves(base, &db.root, &two_way);
					}
				}
				DbState::Missing => {
					// initial run: single-sided changes propagate, genuine
					// overlap conflicts
					let empty = InSyncFolder::default();
					resolve_two_way(base, &empty, &two_way);
				}
				DbState::Unusable(message) => {
					info!("sync database unusable ({}); falling back to prefer-newer", message);
					apply_direction_table(base, &DirectionConfig::prefer_newer());
				}
			},
		}
	}

	Ok(ComparedRun { registry, limiter, pair_bases, bases, dbs, session_counter, reaper })
}

/// Reserved lock file name; carries the reserved lock extension and is
/// therefore invisible to traversal.
pub const LOCK_FILE_NAME: &str = "sync.bsy_lock";

/// Exclusive per-pair lock alongside the left base folder
async fn acquire_lock(
	fs: &dyn VirtualFs,
	left_base: &AbstractPath,
) -> Result<AbstractPath, SyncError> {
	let path = left_base.join(LOCK_FILE_NAME);
	if fs.item_type_if_exists(&path).await.map_err(SyncError::Fs)?.is_some() {
		return Err(SyncError::Other {
			message: format!(
				"Sync already in progress (lock file exists). If stale, delete: {}",
				path.display_path()
			),
		});
	}

	let pid = std::process::id().to_string();
	let bytes = pid.as_bytes();
	let mut writer =
		fs.open_output(&path, Some(bytes.len() as u64), None).await.map_err(SyncError::Fs)?;
	let mut offset = 0;
	while offset < bytes.len() {
		offset += writer.try_write(&bytes[offset..]).await.map_err(SyncError::Fs)?;
	}
	writer.finalize().await.map_err(SyncError::Fs)?;
	Ok(path)
}

/// Compare and execute: the full synchronization of all folder pairs.
pub async fn synchronize(
	config: &Config,
	handler: Arc<dyn StatusHandler>,
) -> Result<SyncRunResult, SyncError> {
	let started = Instant::now();
	let sync_start = chrono::Local::now();

	let mut run = compare(config, Arc::clone(&handler)).await?;

	// ---- versioning target ----
	let versioner = match (&config.deletion_policy, &config.versioning_folder) {
		(DeletionPolicy::Versioning, Some(folder)) => {
			let root = AbstractPath::parse(folder)?;
			let fs = run.registry.get(&root.device)?;
			Some(Arc::new(FileVersioner::new(
				fs,
				root,
				config.versioning_style,
				sync_start,
			)?))
		}
		_ => None,
	};

	// ---- per-pair locks ----
	let mut locks: Vec<AbstractPath> = Vec::new();
	for pair in &run.pair_bases {
		let fs = run.registry.get(&pair.left.device)?;
		locks.push(acquire_lock(&*fs, &pair.left).await?);
	}

	// ---- execute ----
	let executor = Executor::new(
		Arc::clone(&run.registry),
		Arc::clone(&run.limiter),
		Arc::clone(&handler),
		ExecutorOptions {
			automatic_retry_count: config.automatic_retry_count,
			automatic_retry_delay: Duration::from_secs(config.automatic_retry_delay_secs),
			deletion_policy: config.deletion_policy,
			copy_permissions: config.copy_permissions,
			fail_safe_file_copy: config.fail_safe_file_copy,
		},
		versioner.clone(),
	);

	let outcome: Result<(), SyncError> = async {
		executor.execute(&mut run.bases).await?;

		// ---- versioning limits ----
		if let Some(versioner) = &versioner {
			let limits = config.versioning_limits();
			if !limits.is_unlimited() {
				apply_versioning_limits(
					&[VersioningLimitFolder {
						root: versioner.versioning_root().clone(),
						limits,
					}],
					&run.registry,
					Arc::clone(&run.limiter),
					Arc::clone(&handler),
				)
				.await?;
			}
		}

		// ---- rewrite the databases ----
		if config.direction_policy == DirectionPolicy::TwoWay || config.detect_moved_files {
			for (bi, pair) in run.pair_bases.iter().enumerate() {
				let root = build_db_from_tree(&run.bases[bi], config.compare_variant);
				let db = SyncDb::new(config.compare_variant, root);
				let fs = run.registry.get(&pair.left.device)?;
				if let Err(e) = save_db(&*fs, &pair.left, &db).await {
					let mut active = true;
					handler.report_warning(&e.to_string(), &mut active);
					executor
						.stats
						.errors
						.lock()
						.unwrap_or_else(|p| p.into_inner())
						.push(e.to_string());
				}
			}
		}
		Ok(())
	}
	.await;

	// release the locks before surfacing whatever happened inside
	for lock in &locks {
		if let Ok(fs) = run.registry.get(&lock.device) {
			let _ = fs.remove_file(lock).await;
		}
	}
	outcome?;

	let conflicts = count_conflicts(&run.bases);
	let stats = &executor.stats;
	let result = SyncRunResult {
		files_copied: stats.files_copied.load(std::sync::atomic::Ordering::Relaxed),
		folders_created: stats.folders_created.load(std::sync::atomic::Ordering::Relaxed),
		items_deleted: stats.items_deleted.load(std::sync::atomic::Ordering::Relaxed),
		items_moved: stats.items_moved.load(std::sync::atomic::Ordering::Relaxed),
		metadata_updates: stats.metadata_updates.load(std::sync::atomic::Ordering::Relaxed),
		bytes_copied: stats.bytes_copied.load(std::sync::atomic::Ordering::Relaxed),
		conflicts,
		errors: stats.error_messages(),
		duration: started.elapsed(),
	};

	info!(
		"sync finished: {} operations, {} bytes, {} conflicts, {} errors in {:.1?}",
		result.operations(),
		result.bytes_copied,
		result.conflicts,
		result.errors.len(),
		result.duration
	);

	run.shutdown().await;
	Ok(result)
}

/// Enumerate the versions stored in a versioning tree, grouped by original
/// relative path and ordered oldest first (the `versions` CLI surface).
pub async fn list_versions(
	config: &Config,
	folder: &str,
	handler: Arc<dyn StatusHandler>,
) -> Result<BTreeMap<String, Vec<StoredVersion>>, SyncError> {
	let root = AbstractPath::parse(folder)?;
	let devices = vec![root.device.clone()];

	let session_counter = SessionCounter::new();
	let (registry, reaper) = build_registry(config, &devices, &session_counter)?;
	let registry = Arc::new(registry);
	let limiter = Arc::new(build_limiter(config, &devices));

	handler.init_phase(0, 0, Phase::Scanning);
	let result = crate::versioning::list_versions(&root, &registry, limiter, handler).await;

	if let Some(reaper) = reaper {
		reaper.abort();
	}
	session_counter.shutdown().await;
	result
}

/// One display line per pair that is not in sync, newline terminated
pub fn format_differences(bases: &[BaseFolderPair]) -> String {
	let mut out = String::new();
	for base in bases {
		base.for_each_file(|pair| {
			if pair.category == Category::Equal {
				return;
			}
			let path = base.left_base.join_rel(&pair.rel_on(crate::tree::Side::Left));
			let tag = match pair.category {
				Category::LeftOnly => "left only",
				Category::RightOnly => "right only",
				Category::LeftNewer => "left newer",
				Category::RightNewer => "right newer",
				Category::DifferentContent => "different",
				Category::DifferentMetadata => "metadata",
				Category::Conflict => "conflict",
				Category::Equal => unreachable!(),
			};
			out.push_str(&format!("{}\t{}\n", tag, path.display_path()));
		});
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::FolderPairConfig;
	use crate::status::LogStatusHandler;

	fn config_for(left: &std::path::Path, right: &std::path::Path) -> Config {
		Config {
			folder_pairs: vec![FolderPairConfig {
				left: left.display().to_string(),
				right: right.display().to_string(),
			}],
			deletion_policy: DeletionPolicy::Permanent,
			..Default::default()
		}
	}

	#[test]
	fn test_lock_file_name_is_reserved() {
		assert!(LOCK_FILE_NAME.ends_with(crate::afs::LOCK_FILE_ENDING));
		assert!(crate::afs::is_reserved_item_name(LOCK_FILE_NAME));
	}

	#[tokio::test]
	async fn test_compare_empty_folders() {
		let left = tempfile::tempdir().unwrap();
		let right = tempfile::tempdir().unwrap();
		let handler: Arc<dyn StatusHandler> = Arc::new(LogStatusHandler::new(false));

		let run =
			compare(&config_for(left.path(), right.path()), Arc::clone(&handler)).await.unwrap();
		assert_eq!(run.bases.len(), 1);
		assert!(run.bases[0].all_equal());
		run.shutdown().await;
	}

	#[tokio::test]
	async fn test_synchronize_two_way_initial_run() {
		let left = tempfile::tempdir().unwrap();
		let right = tempfile::tempdir().unwrap();
		std::fs::write(left.path().join("a.txt"), b"abc").unwrap();
		std::fs::create_dir(left.path().join("sub")).unwrap();
		std::fs::write(left.path().join("sub/b.bin"), b"defgh").unwrap();

		let config = config_for(left.path(), right.path());
		let handler: Arc<dyn StatusHandler> = Arc::new(LogStatusHandler::new(false));

		let result = synchronize(&config, Arc::clone(&handler)).await.unwrap();
		assert_eq!(result.files_copied, 2);
		assert_eq!(result.folders_created, 1);
		assert!(result.errors.is_empty());
		assert_eq!(std::fs::read(right.path().join("a.txt")).unwrap(), b"abc");
		assert_eq!(std::fs::read(right.path().join("sub/b.bin")).unwrap(), b"defgh");

		// the database was committed alongside the left base folder
		assert!(left.path().join(crate::afs::SYNC_DB_NAME).exists());

		// a second run performs no operations
		let again = synchronize(&config, handler).await.unwrap();
		assert_eq!(again.operations(), 0);
		assert_eq!(again.conflicts, 0);
	}
}

// vim: ts=4
