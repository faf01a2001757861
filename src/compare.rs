//! Pair-and-categorize
//!
//! Merges two traversal outputs into the paired tree with a linear merge
//! over sorted children (files, symlinks and folders are three parallel
//! streams), then classifies every pair according to the compare variant.
//! Byte-wise content comparison runs as a separate bounded-parallel phase.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::afs::{FileAttrs, FsRegistry, VirtualFs};
use crate::error::SyncError;
use crate::path::{AbstractPath, DeviceKind, RelPath};
use crate::session::DeviceLimiter;
use crate::status::{Phase, StatusHandler};
use crate::strategies::{CompareVariant, SyncDirection};
use crate::traverse::{DirContents, TraversalResult};
use crate::tree::{
	BaseFolderPair, Category, FilePair, FileSide, FolderPair, FolderSide, LinkSide, PairId,
	PairIdSource, Side, SymlinkPair,
};

pub(crate) const TXT_SKIPPED_CONTENT: &str = "Skipped content comparison (excluded by filter)";
pub(crate) const TXT_KIND_CLASH: &str = "Items have different types on the two sides";

// ============================================================================
// FILE TIME COMPARISON
// ============================================================================

/// Whether two timestamps are equal within `tolerance` seconds, additionally
/// accepting any configured whole-minute shift (DST quirks on FAT).
pub fn same_file_time(lhs: i64, rhs: i64, tolerance: i64, ignore_minutes: &[u32]) -> bool {
	let (lhs, rhs) = if lhs < rhs { (rhs, lhs) } else { (lhs, rhs) };

	if rhs > i64::MAX - tolerance {
		return true;
	}
	if lhs <= rhs + tolerance {
		return true;
	}

	for &minutes in ignore_minutes {
		let shift = i64::from(minutes) * 60;

		let mut low = rhs;
		let mut high = lhs;
		if low <= i64::MAX - shift {
			low += shift;
		} else {
			high -= shift;
		}
		if high < low {
			std::mem::swap(&mut high, &mut low);
		}

		if low > i64::MAX - tolerance {
			return true;
		}
		if high <= low + tolerance {
			return true;
		}
	}
	false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeResult {
	Equal,
	LeftNewer,
	RightNewer,
	LeftInvalid,
	RightInvalid,
}

/// Classify two modification times. `time_horizon` is "now + one year":
/// anything beyond it, or before the epoch, is an erroneous date.
pub fn compare_file_time(
	lhs: i64,
	rhs: i64,
	tolerance: i64,
	ignore_minutes: &[u32],
	time_horizon: i64,
) -> TimeResult {
	if same_file_time(lhs, rhs, tolerance, ignore_minutes) {
		return TimeResult::Equal;
	}
	if lhs < 0 || lhs > time_horizon {
		return TimeResult::LeftInvalid;
	}
	if rhs < 0 || rhs > time_horizon {
		return TimeResult::RightInvalid;
	}
	if lhs < rhs {
		TimeResult::RightNewer
	} else {
		TimeResult::LeftNewer
	}
}

/// "now + one year"; needn't be precise
pub fn time_horizon_now() -> i64 {
	chrono::Local::now().timestamp() + 365 * 24 * 3600
}

// ============================================================================
// MERGE
// ============================================================================

/// Settings of one comparison run
#[derive(Debug, Clone)]
pub struct CompareSettings {
	pub cmp_var: CompareVariant,

	/// User tolerance in seconds (default 2, accommodates FAT)
	pub tolerance: i64,

	/// Whole-minute offsets additionally considered equal
	pub ignore_minutes: Vec<u32>,

	pub time_horizon: i64,

	/// False when either backend folds name case, making case-only
	/// differences a metadata mismatch instead of two separate items
	pub case_sensitive: bool,
}

impl CompareSettings {
	pub fn new(cmp_var: CompareVariant, tolerance: i64, ignore_minutes: Vec<u32>) -> Self {
		CompareSettings {
			cmp_var,
			tolerance,
			ignore_minutes,
			time_horizon: time_horizon_now(),
			case_sensitive: true,
		}
	}

	/// Whether the devices of both sides keep name case distinct
	pub fn case_sensitive_for(left: DeviceKind, right: DeviceKind) -> bool {
		fn folds(kind: DeviceKind) -> bool {
			matches!(kind, DeviceKind::GDrive)
		}
		!(folds(left) || folds(right))
	}
}

/// Merge output: the paired tree plus the pairs still awaiting byte-wise
/// comparison.
pub struct MergeOutput {
	pub base: BaseFolderPair,
	pub undecided_files: Vec<PairId>,
	pub undecided_symlinks: Vec<PairId>,
}

struct MergeCtx<'a> {
	settings: &'a CompareSettings,
	left_res: &'a TraversalResult,
	right_res: &'a TraversalResult,
	ids: &'a mut PairIdSource,
	undecided_files: Vec<PairId>,
	undecided_symlinks: Vec<PairId>,
}

/// Build the paired tree of one folder pair from its two traversal outputs.
pub fn merge_trees(
	left_base: AbstractPath,
	right_base: AbstractPath,
	left_res: &TraversalResult,
	right_res: &TraversalResult,
	settings: &CompareSettings,
	ids: &mut PairIdSource,
) -> MergeOutput {
	let mut ctx = MergeCtx {
		settings,
		left_res,
		right_res,
		ids,
		undecided_files: Vec::new(),
		undecided_symlinks: Vec::new(),
	};

	let mut base = BaseFolderPair::new(left_base, right_base);
	let (files, symlinks, folders) =
		merge_level(&mut ctx, &RelPath::root(), &left_res.root, &right_res.root);
	base.files = files;
	base.symlinks = symlinks;
	base.folders = folders;

	MergeOutput {
		base,
		undecided_files: ctx.undecided_files,
		undecided_symlinks: ctx.undecided_symlinks,
	}
}

/// Pair up two sorted name maps. With case-insensitive merging the streams
/// are re-sorted by folded name first.
fn merge_by_name<'a, L, R>(
	left: &'a BTreeMap<String, L>,
	right: &'a BTreeMap<String, R>,
	case_sensitive: bool,
) -> Vec<(Option<(&'a str, &'a L)>, Option<(&'a str, &'a R)>)> {
	fn fold(name: &str, case_sensitive: bool) -> String {
		if case_sensitive {
			name.to_string()
		} else {
			name.to_lowercase()
		}
	}

	let mut lefts: Vec<(&str, &L)> = left.iter().map(|(n, v)| (n.as_str(), v)).collect();
	let mut rights: Vec<(&str, &R)> = right.iter().map(|(n, v)| (n.as_str(), v)).collect();
	if !case_sensitive {
		lefts.sort_by_key(|(n, _)| fold(n, false));
		rights.sort_by_key(|(n, _)| fold(n, false));
	}

	let mut out = Vec::with_capacity(lefts.len().max(rights.len()));
	let mut li = 0;
	let mut ri = 0;
	while li < lefts.len() || ri < rights.len() {
		if li >= lefts.len() {
			out.push((None, Some(rights[ri])));
			ri += 1;
		} else if ri >= rights.len() {
			out.push((Some(lefts[li]), None));
			li += 1;
		} else {
			let lk = fold(lefts[li].0, case_sensitive);
			let rk = fold(rights[ri].0, case_sensitive);
			match lk.cmp(&rk) {
				std::cmp::Ordering::Less => {
					out.push((Some(lefts[li]), None));
					li += 1;
				}
				std::cmp::Ordering::Greater => {
					out.push((None, Some(rights[ri])));
					ri += 1;
				}
				std::cmp::Ordering::Equal => {
					out.push((Some(lefts[li]), Some(rights[ri])));
					li += 1;
					ri += 1;
				}
			}
		}
	}
	out
}

fn read_failure<'a>(res: &'a TraversalResult, rel: &RelPath) -> Option<&'a String> {
	res.failed_item_reads.get(rel).or_else(|| res.failed_folder_reads.get(rel))
}

fn merge_level(
	ctx: &mut MergeCtx<'_>,
	parent_rel: &RelPath,
	left: &DirContents,
	right: &DirContents,
) -> (Vec<FilePair>, Vec<SymlinkPair>, Vec<FolderPair>) {
	let case_sensitive = ctx.settings.case_sensitive;

	// ---- files ----
	let mut files = Vec::new();
	for (l, r) in merge_by_name(&left.files, &right.files, case_sensitive) {
		let id = ctx.ids.next_id();
		let mut pair = FilePair {
			id,
			parent_rel: parent_rel.clone(),
			left: l.map(|(n, a)| FileSide { name: n.to_string(), attrs: a.clone() }),
			right: r.map(|(n, a)| FileSide { name: n.to_string(), attrs: a.clone() }),
			category: Category::Equal,
			conflict: None,
			direction: SyncDirection::None,
			direction_conflict: None,
			active: true,
			move_ref: None,
		};
		classify_file(ctx, &mut pair);
		files.push(pair);
	}

	// ---- symlinks ----
	let mut symlinks = Vec::new();
	for (l, r) in merge_by_name(&left.symlinks, &right.symlinks, case_sensitive) {
		let id = ctx.ids.next_id();
		let mut pair = SymlinkPair {
			id,
			parent_rel: parent_rel.clone(),
			left: l.map(|(n, a)| LinkSide { name: n.to_string(), attrs: a.clone() }),
			right: r.map(|(n, a)| LinkSide { name: n.to_string(), attrs: a.clone() }),
			category: Category::Equal,
			conflict: None,
			direction: SyncDirection::None,
			direction_conflict: None,
			active: true,
		};
		classify_symlink(ctx, &mut pair);
		symlinks.push(pair);
	}

	// ---- folders ----
	let empty = DirContents::default();
	let mut folders = Vec::new();
	for (l, r) in merge_by_name(&left.folders, &right.folders, case_sensitive) {
		let id = ctx.ids.next_id();
		let rel = parent_rel.join(l.map(|(n, _)| n).unwrap_or_else(|| r.expect("one side").0));

		let mut pair = FolderPair {
			id,
			parent_rel: parent_rel.clone(),
			left: l.map(|(n, _)| FolderSide { name: n.to_string() }),
			right: r.map(|(n, _)| FolderSide { name: n.to_string() }),
			category: match (l.is_some(), r.is_some()) {
				(true, true) => {
					if names_case_match(l.expect("present").0, r.expect("present").0) {
						Category::Equal
					} else {
						Category::DifferentMetadata
					}
				}
				(true, false) => Category::LeftOnly,
				(false, true) => Category::RightOnly,
				(false, false) => unreachable!(),
			},
			conflict: None,
			direction: SyncDirection::None,
			direction_conflict: None,
			active: true,
			files: Vec::new(),
			symlinks: Vec::new(),
			folders: Vec::new(),
		};

		// a failed folder read poisons the subtree: surface it as a conflict
		// and do not pair up whatever half-truths were enumerated below
		let failure = ctx
			.left_res
			.failed_folder_reads
			.get(&rel)
			.or_else(|| ctx.right_res.failed_folder_reads.get(&rel));
		if let Some(message) = failure {
			pair.set_conflict(message.clone());
			pair.active = false;
			folders.push(pair);
			continue;
		}

		let (sub_files, sub_symlinks, sub_folders) = merge_level(
			ctx,
			&rel,
			l.map(|(_, c)| c).unwrap_or(&empty),
			r.map(|(_, c)| c).unwrap_or(&empty),
		);
		pair.files = sub_files;
		pair.symlinks = sub_symlinks;
		pair.folders = sub_folders;
		folders.push(pair);
	}

	mark_kind_clashes(&mut files, &mut symlinks, &mut folders, case_sensitive);

	(files, symlinks, folders)
}

/// A name that is a folder on one side and a file/symlink on the other is a
/// hard conflict on both rows.
fn mark_kind_clashes(
	files: &mut [FilePair],
	symlinks: &mut [SymlinkPair],
	folders: &mut [FolderPair],
	case_sensitive: bool,
) {
	fn fold(name: &str, case_sensitive: bool) -> String {
		if case_sensitive {
			name.to_string()
		} else {
			name.to_lowercase()
		}
	}

	let folder_names: HashSet<(String, Side)> = folders
		.iter()
		.filter(|f| f.category == Category::LeftOnly || f.category == Category::RightOnly)
		.map(|f| {
			let side = if f.category == Category::LeftOnly { Side::Left } else { Side::Right };
			(fold(f.display_name(), case_sensitive), side)
		})
		.collect();
	if folder_names.is_empty() {
		return;
	}

	let mut clashed: HashSet<String> = HashSet::new();
	for file in files.iter_mut() {
		let (single, side) = match file.category {
			Category::LeftOnly => (true, Side::Left),
			Category::RightOnly => (true, Side::Right),
			_ => (false, Side::Left),
		};
		if single {
			let key = fold(file.display_name(), case_sensitive);
			if folder_names.contains(&(key.clone(), side.opposite())) {
				file.set_conflict(TXT_KIND_CLASH);
				file.active = false;
				clashed.insert(key);
			}
		}
	}
	for link in symlinks.iter_mut() {
		let (single, side) = match link.category {
			Category::LeftOnly => (true, Side::Left),
			Category::RightOnly => (true, Side::Right),
			_ => (false, Side::Left),
		};
		if single {
			let key = fold(link.display_name(), case_sensitive);
			if folder_names.contains(&(key.clone(), side.opposite())) {
				link.set_conflict(TXT_KIND_CLASH);
				link.active = false;
				clashed.insert(key);
			}
		}
	}
	if clashed.is_empty() {
		return;
	}
	for folder in folders.iter_mut() {
		if folder.category == Category::LeftOnly || folder.category == Category::RightOnly {
			let key = fold(folder.display_name(), case_sensitive);
			if clashed.contains(&key) {
				folder.set_conflict(TXT_KIND_CLASH);
				folder.active = false;
			}
		}
	}
}

fn names_case_match(left: &str, right: &str) -> bool {
	left == right
}

fn classify_file(ctx: &mut MergeCtx<'_>, pair: &mut FilePair) {
	// read failure of either side taints the pair
	let rel = pair.rel_on(Side::Left);
	let rel_r = pair.rel_on(Side::Right);
	if let Some(message) = read_failure(ctx.left_res, &rel)
		.or_else(|| read_failure(ctx.right_res, &rel_r))
		.cloned()
	{
		pair.set_conflict(message);
		pair.active = false;
		return;
	}

	let (case_ok, left_size, right_size) = match (&pair.left, &pair.right) {
		(Some(_), None) => {
			pair.category = Category::LeftOnly;
			return;
		}
		(None, Some(_)) => {
			pair.category = Category::RightOnly;
			return;
		}
		(Some(l), Some(r)) => {
			(names_case_match(&l.name, &r.name), l.attrs.size, r.attrs.size)
		}
		(None, None) => unreachable!("merge never creates empty pairs"),
	};

	match ctx.settings.cmp_var {
		CompareVariant::TimeSize => classify_file_time_size(ctx.settings, pair, case_ok),
		CompareVariant::Content => {
			if left_size != right_size {
				pair.category = Category::DifferentContent;
			} else {
				pair.category = Category::DifferentContent; // provisional
				ctx.undecided_files.push(pair.id);
			}
		}
		CompareVariant::Size => {
			if left_size == right_size {
				pair.category =
					if case_ok { Category::Equal } else { Category::DifferentMetadata };
			} else {
				pair.category = Category::DifferentContent;
			}
		}
	}
}

fn classify_file_time_size(settings: &CompareSettings, pair: &mut FilePair, case_ok: bool) {
	let l = pair.left.as_ref().expect("both sides present").attrs.clone();
	let r = pair.right.as_ref().expect("both sides present").attrs.clone();

	match compare_file_time(
		l.mtime,
		r.mtime,
		settings.tolerance,
		&settings.ignore_minutes,
		settings.time_horizon,
	) {
		TimeResult::Equal => {
			if l.size == r.size {
				pair.category =
					if case_ok { Category::Equal } else { Category::DifferentMetadata };
			} else {
				pair.set_conflict(
					"Items have the same modification time but a different size".to_string(),
				);
			}
		}
		TimeResult::LeftNewer => pair.category = Category::LeftNewer,
		TimeResult::RightNewer => pair.category = Category::RightNewer,
		TimeResult::LeftInvalid => {
			pair.set_conflict(format!("Item has an invalid modification time: {}", l.mtime));
		}
		TimeResult::RightInvalid => {
			pair.set_conflict(format!("Item has an invalid modification time: {}", r.mtime));
		}
	}
}

fn classify_symlink(ctx: &mut MergeCtx<'_>, pair: &mut SymlinkPair) {
	let rel = pair.rel_on(Side::Left);
	let rel_r = pair.rel_on(Side::Right);
	if let Some(message) = read_failure(ctx.left_res, &rel)
		.or_else(|| read_failure(ctx.right_res, &rel_r))
		.cloned()
	{
		pair.set_conflict(message);
		pair.active = false;
		return;
	}

	let (case_ok, left_mtime, right_mtime) = match (&pair.left, &pair.right) {
		(Some(_), None) => {
			pair.category = Category::LeftOnly;
			return;
		}
		(None, Some(_)) => {
			pair.category = Category::RightOnly;
			return;
		}
		(Some(l), Some(r)) => {
			(names_case_match(&l.name, &r.name), l.attrs.mtime, r.attrs.mtime)
		}
		(None, None) => unreachable!("merge never creates empty pairs"),
	};

	match ctx.settings.cmp_var {
		CompareVariant::TimeSize => {
			match compare_file_time(
				left_mtime,
				right_mtime,
				ctx.settings.tolerance,
				&ctx.settings.ignore_minutes,
				ctx.settings.time_horizon,
			) {
				TimeResult::Equal => {
					pair.category =
						if case_ok { Category::Equal } else { Category::DifferentMetadata };
				}
				TimeResult::LeftNewer => pair.category = Category::LeftNewer,
				TimeResult::RightNewer => pair.category = Category::RightNewer,
				TimeResult::LeftInvalid => pair.set_conflict(format!(
					"Item has an invalid modification time: {}",
					left_mtime
				)),
				TimeResult::RightInvalid => pair.set_conflict(format!(
					"Item has an invalid modification time: {}",
					right_mtime
				)),
			}
		}
		// symlinks are compared by their target bytes
		CompareVariant::Content | CompareVariant::Size => {
			pair.category = Category::DifferentContent; // provisional
			ctx.undecided_symlinks.push(pair.id);
		}
	}
}

// ============================================================================
// CONTENT COMPARISON PHASE
// ============================================================================

enum ContentOutcome {
	Equal,
	Different,
	Failed(String),
}

struct ContentJob {
	base_index: usize,
	id: PairId,
	is_symlink: bool,
	left: AbstractPath,
	right: AbstractPath,
	bytes: u64,
	case_ok: bool,
}

/// Byte-wise comparison of the still-undecided pairs, bounded by the
/// effective per-device cap on both sides. Deactivated pairs are skipped
/// with a conflict marker so the stats stay meaningful.
pub async fn compare_content(
	bases: &mut [BaseFolderPair],
	undecided_files: &[(usize, PairId)],
	undecided_symlinks: &[(usize, PairId)],
	registry: &FsRegistry,
	limiter: Arc<DeviceLimiter>,
	handler: Arc<dyn StatusHandler>,
) -> Result<(), SyncError> {
	let file_ids: Vec<HashSet<PairId>> = group_ids(bases.len(), undecided_files);
	let link_ids: Vec<HashSet<PairId>> = group_ids(bases.len(), undecided_symlinks);

	// collect jobs; mark filtered-out pairs right away
	let mut jobs: Vec<ContentJob> = Vec::new();
	for (bi, base) in bases.iter_mut().enumerate() {
		let left_base = base.left_base.clone();
		let right_base = base.right_base.clone();

		let ids = &file_ids[bi];
		base.for_each_file_mut(|pair| {
			if !ids.contains(&pair.id) {
				return;
			}
			if !pair.active {
				pair.set_conflict(TXT_SKIPPED_CONTENT);
				return;
			}
			let (l, r) = match (&pair.left, &pair.right) {
				(Some(l), Some(r)) => (l, r),
				_ => return,
			};
			jobs.push(ContentJob {
				base_index: bi,
				id: pair.id,
				is_symlink: false,
				left: join_base(&left_base, &pair.rel_on(Side::Left)),
				right: join_base(&right_base, &pair.rel_on(Side::Right)),
				bytes: l.attrs.size + r.attrs.size,
				case_ok: names_case_match(&l.name, &r.name),
			});
		});

		let ids = &link_ids[bi];
		base.for_each_symlink_mut(|pair| {
			if !ids.contains(&pair.id) {
				return;
			}
			if !pair.active {
				pair.set_conflict(TXT_SKIPPED_CONTENT);
				return;
			}
			let (l, r) = match (&pair.left, &pair.right) {
				(Some(l), Some(r)) => (l, r),
				_ => return,
			};
			jobs.push(ContentJob {
				base_index: bi,
				id: pair.id,
				is_symlink: true,
				left: join_base(&left_base, &pair.rel_on(Side::Left)),
				right: join_base(&right_base, &pair.rel_on(Side::Right)),
				bytes: 0,
				case_ok: names_case_match(&l.name, &r.name),
			});
		});
	}

	let total_items = jobs.len() as u64;
	let total_bytes: u64 = jobs.iter().map(|j| j.bytes).sum();
	handler.init_phase(total_items, total_bytes, Phase::ComparingContent);

	let mut tasks: JoinSet<Result<(usize, PairId, bool, ContentOutcome), SyncError>> =
		JoinSet::new();
	for job in jobs {
		let left_fs = registry.get(&job.left.device)?;
		let right_fs = registry.get(&job.right.device)?;
		let limiter = Arc::clone(&limiter);
		let handler = Arc::clone(&handler);

		tasks.spawn(async move {
			let _slot = limiter.acquire_pair(left_fs.device(), right_fs.device()).await;
			handler.abort_if_requested()?;
			handler.report_status(&format!("Comparing content: {}", job.left.display_path()));

			let outcome = if job.is_symlink {
				compare_symlink_targets(&*left_fs, &job.left, &*right_fs, &job.right).await
			} else {
				compare_file_content(&*left_fs, &job.left, &*right_fs, &job.right, &*handler)
					.await?
			};
			handler.update_processed(1, 0);
			Ok((job.base_index, job.id, job.case_ok, outcome))
		});
	}

	let mut results: Vec<(usize, PairId, bool, ContentOutcome)> = Vec::new();
	while let Some(joined) = tasks.join_next().await {
		let item = joined.map_err(|e| SyncError::Other { message: e.to_string() })?;
		results.push(item?);
	}

	// single-threaded application back onto the coordinator-owned tree
	for (bi, id, case_ok, outcome) in results {
		let category = match &outcome {
			ContentOutcome::Equal => {
				if case_ok {
					Category::Equal
				} else {
					Category::DifferentMetadata
				}
			}
			ContentOutcome::Different => Category::DifferentContent,
			ContentOutcome::Failed(_) => Category::Conflict,
		};
		let message = match outcome {
			ContentOutcome::Failed(m) => Some(m),
			_ => None,
		};
		bases[bi].for_each_file_mut(|pair| {
			if pair.id == id {
				pair.category = category;
				if let Some(m) = &message {
					pair.set_conflict(m.clone());
				}
			}
		});
		bases[bi].for_each_symlink_mut(|pair| {
			if pair.id == id {
				pair.category = category;
				if let Some(m) = &message {
					pair.set_conflict(m.clone());
				}
			}
		});
	}

	Ok(())
}

fn group_ids(base_count: usize, entries: &[(usize, PairId)]) -> Vec<HashSet<PairId>> {
	let mut groups = vec![HashSet::new(); base_count];
	for (bi, id) in entries {
		groups[*bi].insert(*id);
	}
	groups
}

fn join_base(base: &AbstractPath, rel: &RelPath) -> AbstractPath {
	if rel.is_root() {
		base.clone()
	} else {
		base.join(rel.as_str())
	}
}

async fn compare_file_content(
	left_fs: &dyn VirtualFs,
	left: &AbstractPath,
	right_fs: &dyn VirtualFs,
	right: &AbstractPath,
	handler: &dyn StatusHandler,
) -> Result<ContentOutcome, SyncError> {
	let left_digest = match hash_stream(left_fs, left, handler).await {
		Ok(d) => d,
		Err(SyncError::Fs(e)) => return Ok(ContentOutcome::Failed(e.to_string())),
		Err(e) => return Err(e),
	};
	let right_digest = match hash_stream(right_fs, right, handler).await {
		Ok(d) => d,
		Err(SyncError::Fs(e)) => return Ok(ContentOutcome::Failed(e.to_string())),
		Err(e) => return Err(e),
	};
	if left_digest == right_digest {
		Ok(ContentOutcome::Equal)
	} else {
		Ok(ContentOutcome::Different)
	}
}

async fn hash_stream(
	fs: &dyn VirtualFs,
	path: &AbstractPath,
	handler: &dyn StatusHandler,
) -> Result<String, SyncError> {
	let mut reader = fs.open_input(path).await.map_err(SyncError::Fs)?;
	let mut hasher = blake3::Hasher::new();
	let mut buf = vec![0u8; reader.block_size()];
	loop {
		handler.abort_if_requested()?;
		let n = reader.try_read(&mut buf).await.map_err(SyncError::Fs)?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
		handler.update_processed(0, n as u64);
	}
	Ok(crate::util::hash_to_base64(hasher.finalize().as_bytes()))
}

async fn compare_symlink_targets(
	left_fs: &dyn VirtualFs,
	left: &AbstractPath,
	right_fs: &dyn VirtualFs,
	right: &AbstractPath,
) -> ContentOutcome {
	let l = match left_fs.read_symlink(left).await {
		Ok(t) => t,
		Err(e) => return ContentOutcome::Failed(e.to_string()),
	};
	let r = match right_fs.read_symlink(right).await {
		Ok(t) => t,
		Err(e) => return ContentOutcome::Failed(e.to_string()),
	};
	if l == r {
		ContentOutcome::Equal
	} else {
		ContentOutcome::Different
	}
}


// vim: ts=4
