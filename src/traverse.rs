//! Parallel directory traversal
//!
//! Every unique (device, folder) key is enumerated exactly once,
//! concurrently where devices differ, bounded by the per-device caps.
//! Failures are collected per item and per folder; a folder failure marks
//! the whole subtree and later surfaces as a conflict in the paired tree.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::afs::{DirEntry, FileAttrs, ItemType, SymlinkAttrs, VirtualFs};
use crate::afs::is_reserved_item_name;
use crate::error::{AbortTrigger, SyncError};
use crate::filter::PathFilter;
use crate::path::{AbstractPath, RelPath};
use crate::session::DeviceLimiter;
use crate::status::{ErrorDecision, StatusHandler};
use crate::strategies::SymlinkPolicy;

/// Scanning status is reported at most this often
const STATUS_INTERVAL: Duration = Duration::from_millis(50);

/// Recursion cap while following symlinked folders
const MAX_FOLLOW_DEPTH: usize = 64;

/// Contents of one enumerated folder, children sorted by name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirContents {
	pub files: BTreeMap<String, FileAttrs>,
	pub symlinks: BTreeMap<String, SymlinkAttrs>,
	pub folders: BTreeMap<String, DirContents>,
}

impl DirContents {
	pub fn is_empty(&self) -> bool {
		self.files.is_empty() && self.symlinks.is_empty() && self.folders.is_empty()
	}
}

/// Output of enumerating one base folder
#[derive(Debug, Default)]
pub struct TraversalResult {
	pub root: DirContents,

	/// Per-path read failures; key is the item's relative path
	pub failed_item_reads: BTreeMap<RelPath, String>,

	/// Per-folder read failures; the empty relative path denotes a failure
	/// of the base folder itself
	pub failed_folder_reads: BTreeMap<RelPath, String>,
}

/// One enumeration job
pub struct TraverseJob {
	pub fs: Arc<dyn VirtualFs>,
	pub base: AbstractPath,
	pub filter: Arc<PathFilter>,
	pub symlink_policy: SymlinkPolicy,
}

struct ScanCtx {
	fs: Arc<dyn VirtualFs>,
	base: AbstractPath,
	filter: Arc<PathFilter>,
	symlink_policy: SymlinkPolicy,
	handler: Arc<dyn StatusHandler>,
	items_found: Arc<AtomicU64>,
	last_status: Arc<Mutex<Instant>>,
	failed_items: Mutex<BTreeMap<RelPath, String>>,
	failed_folders: Mutex<BTreeMap<RelPath, String>>,
}

impl ScanCtx {
	fn tick(&self, display: &str) {
		let count = self.items_found.fetch_add(1, Ordering::Relaxed) + 1;
		let mut last = self.last_status.lock().unwrap_or_else(|e| e.into_inner());
		if last.elapsed() >= STATUS_INTERVAL {
			*last = Instant::now();
			drop(last);
			self.handler.report_status(&format!("Scanning: {} ({} items)", display, count));
		}
	}

	/// Surface an error; translates the decision into the traversal's
	/// retry/record protocol. Ok(true) means "retry the folder".
	fn handle_error(&self, message: &str, retry_number: usize) -> Result<bool, SyncError> {
		match self.handler.report_error(message, retry_number) {
			ErrorDecision::Retry => Ok(true),
			ErrorDecision::Ignore | ErrorDecision::IgnoreAll => Ok(false),
			ErrorDecision::Abort => {
				self.handler.request_abort(AbortTrigger::User);
				Err(SyncError::Aborted(AbortTrigger::User))
			}
		}
	}
}

/// Enumerate all jobs, concurrently across devices, each bounded by the
/// device limiter. Results come back in job order.
pub async fn traverse_all(
	jobs: Vec<TraverseJob>,
	limiter: Arc<DeviceLimiter>,
	handler: Arc<dyn StatusHandler>,
) -> Result<Vec<TraversalResult>, SyncError> {
	let items_found = Arc::new(AtomicU64::new(0));
	let last_status = Arc::new(Mutex::new(Instant::now()));

	let mut tasks: JoinSet<(usize, Result<TraversalResult, SyncError>)> = JoinSet::new();
	for (index, job) in jobs.into_iter().enumerate() {
		let limiter = Arc::clone(&limiter);
		let handler = Arc::clone(&handler);
		let items_found = Arc::clone(&items_found);
		let last_status = Arc::clone(&last_status);

		tasks.spawn(async move {
			let _slot = limiter.acquire(job.fs.device()).await;
			let ctx = ScanCtx {
				fs: job.fs,
				base: job.base,
				filter: job.filter,
				symlink_policy: job.symlink_policy,
				handler,
				items_found,
				last_status,
				failed_items: Mutex::new(BTreeMap::new()),
				failed_folders: Mutex::new(BTreeMap::new()),
			};
			let result = scan_folder(&ctx, RelPath::root(), 0).await.map(|root| {
				TraversalResult {
					root,
					failed_item_reads: ctx
						.failed_items
						.into_inner()
						.unwrap_or_else(|e| e.into_inner()),
					failed_folder_reads: ctx
						.failed_folders
						.into_inner()
						.unwrap_or_else(|e| e.into_inner()),
				}
			});
			(index, result)
		});
	}

	let mut results: Vec<Option<TraversalResult>> = Vec::new();
	results.resize_with(tasks.len(), || None);

	while let Some(joined) = tasks.join_next().await {
		let (index, result) = joined.map_err(|e| SyncError::Other { message: e.to_string() })?;
		results[index] = Some(result?);
	}

	Ok(results.into_iter().map(|r| r.expect("every job reports exactly once")).collect())
}

fn scan_folder<'a>(
	ctx: &'a ScanCtx,
	rel: RelPath,
	follow_depth: usize,
) -> BoxFuture<'a, Result<DirContents, SyncError>> {
	async move {
		let folder_path = join_rel(&ctx.base, &rel);

		'retry: for retry_number in 0.. {
			ctx.handler.abort_if_requested()?;

			let entries = match ctx.fs.read_dir(&folder_path).await {
				Ok(entries) => entries,
				Err(e) => {
					if ctx.handle_error(&e.to_string(), retry_number)? {
						continue 'retry;
					}
					ctx.failed_folders
						.lock()
						.unwrap_or_else(|p| p.into_inner())
						.insert(rel.clone(), e.to_string());
					return Ok(DirContents::default());
				}
			};

			let mut contents = DirContents::default();
			for entry in entries {
				ctx.handler.abort_if_requested()?;

				match entry {
					DirEntry::Failed { name, error } => {
						if ctx.handle_error(&error.to_string(), retry_number)? {
							continue 'retry; // re-enumerate the whole folder
						}
						ctx.failed_items
							.lock()
							.unwrap_or_else(|p| p.into_inner())
							.insert(rel.join(&name), error.to_string());
					}
					DirEntry::File { name, attrs } => {
						if is_reserved_item_name(&name) {
							continue;
						}
						let item_rel = rel.join(&name);
						if !ctx.filter.passes_item(&item_rel) {
							continue;
						}
						ctx.tick(&join_rel(&ctx.base, &item_rel).display_path());
						contents.files.insert(name, attrs);
					}
					DirEntry::Symlink { name, attrs } => {
						if is_reserved_item_name(&name) {
							continue;
						}
						let item_rel = rel.join(&name);
						match ctx.symlink_policy {
							SymlinkPolicy::Exclude => {}
							SymlinkPolicy::Direct => {
								if ctx.filter.passes_item(&item_rel) {
									ctx.tick(&join_rel(&ctx.base, &item_rel).display_path());
									contents.symlinks.insert(name, attrs);
								}
							}
							SymlinkPolicy::Follow => {
								match follow_symlink(ctx, &rel, &name, follow_depth, retry_number)
									.await?
								{
									FollowOutcome::File(attrs) => {
										if ctx.filter.passes_item(&item_rel) {
											ctx.tick(
												&join_rel(&ctx.base, &item_rel).display_path(),
											);
											contents.files.insert(name, attrs);
										}
									}
									FollowOutcome::Folder(sub) => {
										contents.folders.insert(name, sub);
									}
									FollowOutcome::Skipped => {}
								}
							}
						}
					}
					DirEntry::Folder { name } => {
						let sub_rel = rel.join(&name);
						if !ctx.filter.child_might_match(&sub_rel) {
							continue; // excluded subtree: not even enumerated
						}
						let sub = scan_folder(ctx, sub_rel, follow_depth).await?;
						contents.folders.insert(name, sub);
					}
				}
			}
			return Ok(contents);
		}
		unreachable!("retry loop always returns")
	}
	.boxed()
}

enum FollowOutcome {
	File(FileAttrs),
	Folder(DirContents),
	Skipped,
}

async fn follow_symlink(
	ctx: &ScanCtx,
	rel: &RelPath,
	name: &str,
	follow_depth: usize,
	retry_number: usize,
) -> Result<FollowOutcome, SyncError> {
	let item_rel = rel.join(name);
	let item_path = join_rel(&ctx.base, &item_rel);

	match ctx.fs.stat_symlink_target(&item_path).await {
		Ok(Some((ItemType::Folder, _))) => {
			if follow_depth >= MAX_FOLLOW_DEPTH {
				ctx.failed_folders
					.lock()
					.unwrap_or_else(|p| p.into_inner())
					.insert(item_rel, format!("Symbolic link nesting too deep: {}", item_path));
				return Ok(FollowOutcome::Skipped);
			}
			if !ctx.filter.child_might_match(&item_rel) {
				return Ok(FollowOutcome::Skipped);
			}
			// path resolution follows the link during the sub-scan
			let sub = scan_folder(ctx, item_rel, follow_depth + 1).await?;
			Ok(FollowOutcome::Folder(sub))
		}
		Ok(Some((_, attrs))) => Ok(FollowOutcome::File(attrs)),
		Ok(None) => {
			ctx.failed_items
				.lock()
				.unwrap_or_else(|p| p.into_inner())
				.insert(item_rel, format!("Symbolic link target is missing: {}", item_path));
			Ok(FollowOutcome::Skipped)
		}
		Err(e) => {
			if ctx.handle_error(&e.to_string(), retry_number)? {
				// retrying a single link is pointless; record it instead
			}
			ctx.failed_items
				.lock()
				.unwrap_or_else(|p| p.into_inner())
				.insert(item_rel, e.to_string());
			Ok(FollowOutcome::Skipped)
		}
	}
}

fn join_rel(base: &AbstractPath, rel: &RelPath) -> AbstractPath {
	if rel.is_root() {
		base.clone()
	} else {
		base.join(rel.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::afs::local::LocalFs;
	use crate::path::Device;
	use crate::status::LogStatusHandler;

	fn job(root: &std::path::Path, policy: SymlinkPolicy, filter: PathFilter) -> TraverseJob {
		TraverseJob {
			fs: Arc::new(LocalFs::new(root.to_path_buf())),
			base: AbstractPath::device_root(Device::Local { root: root.to_path_buf() }),
			filter: Arc::new(filter),
			symlink_policy: policy,
		}
	}

	async fn run_one(job: TraverseJob) -> TraversalResult {
		let limiter = Arc::new(DeviceLimiter::new([], 4));
		let handler: Arc<dyn StatusHandler> = Arc::new(LogStatusHandler::new(false));
		traverse_all(vec![job], limiter, handler).await.unwrap().remove(0)
	}

	#[tokio::test]
	async fn test_basic_tree() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(dir.path().join("sub/inner")).unwrap();
		std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
		std::fs::write(dir.path().join("sub/b.bin"), b"defgh").unwrap();

		let result = run_one(job(dir.path(), SymlinkPolicy::Direct, PathFilter::pass_all())).await;

		assert_eq!(result.root.files["a.txt"].size, 3);
		assert_eq!(result.root.folders["sub"].files["b.bin"].size, 5);
		assert!(result.root.folders["sub"].folders["inner"].is_empty());
		assert!(result.failed_item_reads.is_empty());
		assert!(result.failed_folder_reads.is_empty());
	}

	#[tokio::test]
	async fn test_root_failure_uses_empty_rel_path() {
		let dir = tempfile::tempdir().unwrap();
		let missing = dir.path().join("not-there");

		let result = run_one(job(&missing, SymlinkPolicy::Direct, PathFilter::pass_all())).await;
		assert!(result.root.is_empty());
		assert!(result.failed_folder_reads.contains_key(&RelPath::root()));
	}

	#[tokio::test]
	async fn test_filter_prunes_excluded_subtree() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(dir.path().join("node_modules/dep")).unwrap();
		std::fs::create_dir_all(dir.path().join("src")).unwrap();
		std::fs::write(dir.path().join("node_modules/dep/x.js"), b"x").unwrap();
		std::fs::write(dir.path().join("src/main.rs"), b"fn main() {}").unwrap();

		let filter = PathFilter::new(&[], &["node_modules".to_string()]).unwrap();
		let result = run_one(job(dir.path(), SymlinkPolicy::Direct, filter)).await;

		assert!(result.root.folders.contains_key("src"));
		assert!(!result.root.folders.contains_key("node_modules"));
	}

	#[tokio::test]
	async fn test_reserved_names_are_invisible() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("sync.bsy_db"), b"{}").unwrap();
		std::fs::write(dir.path().join("run.bsy_lock"), b"1").unwrap();
		std::fs::write(dir.path().join("real.txt"), b"x").unwrap();

		let result = run_one(job(dir.path(), SymlinkPolicy::Direct, PathFilter::pass_all())).await;
		assert_eq!(result.root.files.len(), 1);
		assert!(result.root.files.contains_key("real.txt"));
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn test_symlink_policies() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("real.txt"), b"content").unwrap();
		std::os::unix::fs::symlink("real.txt", dir.path().join("link")).unwrap();

		let excluded =
			run_one(job(dir.path(), SymlinkPolicy::Exclude, PathFilter::pass_all())).await;
		assert!(excluded.root.symlinks.is_empty());

		let direct = run_one(job(dir.path(), SymlinkPolicy::Direct, PathFilter::pass_all())).await;
		assert!(direct.root.symlinks.contains_key("link"));

		let followed =
			run_one(job(dir.path(), SymlinkPolicy::Follow, PathFilter::pass_all())).await;
		assert_eq!(followed.root.files["link"].size, 7);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn test_dangling_symlink_followed_is_item_error() {
		let dir = tempfile::tempdir().unwrap();
		std::os::unix::fs::symlink("gone.txt", dir.path().join("broken")).unwrap();

		let result = run_one(job(dir.path(), SymlinkPolicy::Follow, PathFilter::pass_all())).await;
		assert!(result.root.files.is_empty());
		assert!(result.failed_item_reads.contains_key(&RelPath::new("broken").unwrap()));
	}
}

// vim: ts=4
