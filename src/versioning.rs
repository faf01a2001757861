//! File versioning
//!
//! Deletes and overwrites are diverted into a versioning tree instead of
//! being destructive. Three naming styles; moving prefers a rename and
//! degrades to copy + delete across devices. Limit enforcement runs after a
//! sync and trims versions by age and count, removing directories that
//! become empty along the way.

use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, TimeZone};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::afs::{FsRegistry, VirtualFs};
use crate::error::{FsError, FsErrorKind, SyncError};
use crate::filter::PathFilter;
use crate::path::{AbstractPath, RelPath};
use crate::session::DeviceLimiter;
use crate::status::StatusHandler;
use crate::strategies::{SymlinkPolicy, VersioningStyle};
use crate::transact::{copy_file_transactional, IoProgress};
use crate::traverse::{traverse_all, DirContents, TraverseJob};

pub const VERSION_TIME_FORMAT: &str = "%Y-%m-%d %H%M%S";

/// ".ext" of the last dot, empty when there is none. A leading dot does not
/// count as an extension separator.
fn dot_extension(name: &str) -> &str {
	match name.rfind('.') {
		Some(pos) if pos > 0 => &name[pos..],
		_ => "",
	}
}

/// Format a local time as the 17-character versioning stamp
pub fn format_version_time(time: DateTime<Local>) -> String {
	time.format(VERSION_TIME_FORMAT).to_string()
}

/// Parse `<name> YYYY-MM-DD HHMMSS<ext>` back into `(local_time,
/// original_name)`; the extension is duplicated, so `<name>` itself ends
/// with `<ext>`.
pub fn parse_versioned_file_name(file_name: &str) -> Option<(i64, String)> {
	let ext = dot_extension(file_name);
	let suffix_len = 2 * ext.len() + 18;
	if file_name.len() < suffix_len {
		return None;
	}

	let ext1_start = file_name.len() - suffix_len;
	let ext1 = file_name.get(ext1_start..ext1_start + ext.len())?;
	if ext1 != ext {
		return None;
	}

	let ts_start = ext1_start + ext.len();
	let stamp = file_name.get(ts_start..ts_start + 18)?;
	if !stamp.starts_with(' ') {
		return None;
	}
	let time = parse_local_stamp(&stamp[1..])?;

	let original = file_name.get(..ts_start)?;
	if original.is_empty() {
		return None;
	}
	Some((time, original.to_string()))
}

/// Parse a folder literally named `YYYY-MM-DD HHMMSS`
pub fn parse_versioned_folder_name(folder_name: &str) -> Option<i64> {
	if folder_name.len() != 17 {
		return None;
	}
	parse_local_stamp(folder_name)
}

fn parse_local_stamp(stamp: &str) -> Option<i64> {
	let naive = NaiveDateTime::parse_from_str(stamp, VERSION_TIME_FORMAT).ok()?;
	Local.from_local_datetime(&naive).earliest().map(|t| t.timestamp())
}

/// Diverts items of one sync run into the versioning tree.
///
/// All items of a run share one timestamp, so a timestamp-folder run lands
/// in a single dated folder.
pub struct FileVersioner {
	fs: Arc<dyn VirtualFs>,
	versioning_root: AbstractPath,
	style: VersioningStyle,
	stamp: String,
	sync_start: i64,
}

impl FileVersioner {
	pub fn new(
		fs: Arc<dyn VirtualFs>,
		versioning_root: AbstractPath,
		style: VersioningStyle,
		sync_start: DateTime<Local>,
	) -> Result<Self, SyncError> {
		let stamp = format_version_time(sync_start);
		if stamp.len() != 17 {
			return Err(SyncError::InvalidConfig {
				message: format!("Unable to create a versioning time stamp: {:?}", stamp),
			});
		}
		Ok(FileVersioner {
			fs,
			versioning_root,
			style,
			stamp,
			sync_start: sync_start.timestamp(),
		})
	}

	pub fn versioning_root(&self) -> &AbstractPath {
		&self.versioning_root
	}

	fn versioned_path(&self, rel: &RelPath) -> AbstractPath {
		let versioned_rel = match self.style {
			VersioningStyle::Replace => rel.as_str().to_string(),
			VersioningStyle::TimestampFolder => format!("{}/{}", self.stamp, rel.as_str()),
			VersioningStyle::TimestampFile => {
				let with_stamp =
					format!("{} {}{}", rel.as_str(), self.stamp, dot_extension(rel.item_name()));
				debug_assert_eq!(
					parse_versioned_file_name(
						RelPath::new(&with_stamp).expect("stamped path stays valid").item_name()
					),
					Some((self.sync_start, rel.item_name().to_string()))
				);
				with_stamp
			}
		};
		self.versioning_root.join(&versioned_rel)
	}

	/// Move a file into the versioning tree. Returns false when the source
	/// no longer exists (fine: someone else was faster).
	pub async fn revision_file(
		&self,
		src_fs: &dyn VirtualFs,
		src: &AbstractPath,
		rel: &RelPath,
		progress: IoProgress<'_>,
	) -> Result<bool, FsError> {
		let target = self.versioned_path(rel);

		match src_fs.item_type_if_exists(src).await? {
			None => return Ok(false),
			Some(_) => {}
		}

		self.move_existing_item(src_fs, src, &target, false, progress).await?;
		Ok(true)
	}

	/// Move a symlink into the versioning tree; false when already gone
	pub async fn revision_symlink(
		&self,
		src_fs: &dyn VirtualFs,
		src: &AbstractPath,
		rel: &RelPath,
	) -> Result<bool, FsError> {
		let target = self.versioned_path(rel);

		match src_fs.item_type_if_exists(src).await? {
			None => return Ok(false),
			Some(_) => {}
		}

		self.move_existing_item(src_fs, src, &target, true, progress_noop()).await?;
		Ok(true)
	}

	/// Move a folder's contents into the versioning tree, depth first, then
	/// delete the emptied folders. Missing source is ignored.
	pub async fn revision_folder(
		&self,
		src_fs: &dyn VirtualFs,
		src: &AbstractPath,
		rel: &RelPath,
		progress: IoProgress<'_>,
	) -> Result<(), FsError> {
		match src_fs.item_type_if_exists(src).await? {
			None => return Ok(()),
			Some(_) => {}
		}

		let mut stack = vec![(src.clone(), rel.clone())];
		let mut folders = Vec::new();
		while let Some((folder, folder_rel)) = stack.pop() {
			for entry in src_fs.read_dir(&folder).await? {
				match entry {
					crate::afs::DirEntry::File { name, .. } => {
						let child = folder.join(&name);
						let child_rel = folder_rel.join(&name);
						self.move_existing_item(
							src_fs,
							&child,
							&self.versioned_path(&child_rel),
							false,
							progress,
						)
						.await?;
					}
					crate::afs::DirEntry::Symlink { name, .. } => {
						let child = folder.join(&name);
						let child_rel = folder_rel.join(&name);
						self.move_existing_item(
							src_fs,
							&child,
							&self.versioned_path(&child_rel),
							true,
							progress,
						)
						.await?;
					}
					crate::afs::DirEntry::Folder { name } => {
						stack.push((folder.join(&name), folder_rel.join(&name)));
					}
					crate::afs::DirEntry::Failed { error, .. } => return Err(error),
				}
			}
			folders.push(folder);
		}
		for folder in folders.iter().rev() {
			src_fs.remove_folder_empty(folder).await?;
		}
		Ok(())
	}

	/// Move one item: replace an existing version, rename when possible,
	/// copy + delete across devices, creating parent folders on demand.
	async fn move_existing_item(
		&self,
		src_fs: &dyn VirtualFs,
		src: &AbstractPath,
		target: &AbstractPath,
		is_symlink: bool,
		progress: IoProgress<'_>,
	) -> Result<(), FsError> {
		// replace an existing version first; a not-found error is the
		// common case and the move below yields the better error otherwise
		let _ = if is_symlink {
			self.fs.remove_symlink(target).await
		} else {
			self.fs.remove_file(target).await
		};

		let same_device = src_fs.device() == self.fs.device();
		if same_device {
			match src_fs.move_and_rename(src, target).await {
				Ok(()) => return Ok(()),
				Err(e) if e.kind == FsErrorKind::NotFound => {
					// parent folder likely missing: create and retry
					if let Some(parent) = target.parent() {
						self.fs.create_folder_if_missing(&parent).await?;
					}
					src_fs.move_and_rename(src, target).await?;
					return Ok(());
				}
				Err(e) if e.kind == FsErrorKind::MoveUnsupported => {} // fall through
				Err(e) => return Err(e),
			}
		}

		if let Some(parent) = target.parent() {
			self.fs.create_folder_if_missing(&parent).await?;
		}

		if is_symlink {
			let link_target = src_fs.read_symlink(src).await?;
			self.fs.create_symlink(target, &link_target, None).await?;
			src_fs.remove_symlink(src).await
		} else {
			let attrs = stat_file(src_fs, src).await?;
			copy_file_transactional(
				src_fs, src, &attrs, &*self.fs, target, false, false, None, progress,
			)
			.await?;
			src_fs.remove_file(src).await
		}
	}
}

fn progress_noop() -> IoProgress<'static> {
	static NOOP: fn(u64) -> Result<(), FsError> = |_| Ok(());
	&NOOP
}

async fn stat_file(fs: &dyn VirtualFs, path: &AbstractPath) -> Result<crate::afs::FileAttrs, FsError> {
	// the parent listing carries the attributes; a lone stat goes through
	// the parent's read_dir to stay on the primitive surface
	let parent = path.parent().ok_or_else(|| {
		FsError::new(FsErrorKind::Fatal, path.display_path(), "Cannot version a device root")
	})?;
	let name = path.item_name();
	for entry in fs.read_dir(&parent).await? {
		if let crate::afs::DirEntry::File { name: n, attrs } = entry {
			if n == name {
				return Ok(attrs);
			}
		}
	}
	Err(FsError::new(FsErrorKind::NotFound, path.display_path(), "Cannot find file"))
}

// ============================================================================
// LIMIT ENFORCEMENT
// ============================================================================

/// One stored version of an original relative path
#[derive(Debug, Clone)]
pub struct StoredVersion {
	pub original: String,
	pub time: i64,
	pub path: AbstractPath,
	pub is_symlink: bool,
}

impl StoredVersion {
	/// The version's local time in the versioning stamp format
	pub fn stamp(&self) -> String {
		Local
			.timestamp_opt(self.time, 0)
			.single()
			.map(format_version_time)
			.unwrap_or_else(|| self.time.to_string())
	}
}

/// Enumerate the versions stored in a versioning tree, grouped by the
/// original relative path and ordered oldest first. Items whose names do
/// not parse as versions are ignored, like during limit enforcement.
pub async fn list_versions(
	root: &AbstractPath,
	registry: &FsRegistry,
	limiter: Arc<DeviceLimiter>,
	handler: Arc<dyn StatusHandler>,
) -> Result<BTreeMap<String, Vec<StoredVersion>>, SyncError> {
	let jobs = vec![TraverseJob {
		fs: registry.get(&root.device)?,
		base: root.clone(),
		filter: Arc::new(PathFilter::pass_all()),
		symlink_policy: SymlinkPolicy::Direct,
	}];
	let mut results = traverse_all(jobs, limiter, handler).await?;
	let result = results.remove(0);

	let mut map = VersionInfoMap::new();
	find_file_versions(&mut map, &result.root, root, "", None);

	let mut out = BTreeMap::new();
	for (original, mut versions) in map {
		versions.sort_by_key(|v| v.time);
		let stored = versions
			.into_iter()
			.map(|v| StoredVersion {
				original: original.clone(),
				time: v.time,
				path: v.path,
				is_symlink: v.is_symlink,
			})
			.collect();
		out.insert(original, stored);
	}
	Ok(out)
}

/// 0 disables the respective limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersioningLimits {
	pub max_age_days: u32,
	pub count_min: u32,
	pub count_max: u32,
}

impl VersioningLimits {
	pub fn is_unlimited(&self) -> bool {
		self.max_age_days == 0 && self.count_min == 0 && self.count_max == 0
	}

	pub fn validate(&self) -> Result<(), SyncError> {
		if self.count_min > 0 && self.count_max > 0 && self.count_min >= self.count_max {
			return Err(SyncError::InvalidConfig {
				message: format!(
					"Versioning count-min ({}) must be below count-max ({})",
					self.count_min, self.count_max
				),
			});
		}
		Ok(())
	}
}

/// One versioning tree to trim
pub struct VersioningLimitFolder {
	pub root: AbstractPath,
	pub limits: VersioningLimits,
}

#[derive(Debug, Clone)]
struct VersionInfo {
	time: i64,
	path: AbstractPath,
	is_symlink: bool,
}

type VersionInfoMap = BTreeMap<String, Vec<VersionInfo>>;

fn find_file_versions(
	versions: &mut VersionInfoMap,
	contents: &DirContents,
	folder_path: &AbstractPath,
	rel_orig_parent: &str,
	version_time_parent: Option<i64>,
) {
	let join = |parent: &str, name: &str| {
		if parent.is_empty() {
			name.to_string()
		} else {
			format!("{}/{}", parent, name)
		}
	};

	for (name, _attrs) in &contents.files {
		let item_path = folder_path.join(name);
		if let Some(vt) = version_time_parent {
			// inside a timestamp folder every item is one version
			versions.entry(join(rel_orig_parent, name)).or_default().push(VersionInfo {
				time: vt,
				path: item_path,
				is_symlink: false,
			});
		} else if let Some((time, original)) = parse_versioned_file_name(name) {
			versions.entry(join(rel_orig_parent, &original)).or_default().push(VersionInfo {
				time,
				path: item_path,
				is_symlink: false,
			});
		}
	}

	for (name, _attrs) in &contents.symlinks {
		let item_path = folder_path.join(name);
		if let Some(vt) = version_time_parent {
			versions.entry(join(rel_orig_parent, name)).or_default().push(VersionInfo {
				time: vt,
				path: item_path,
				is_symlink: true,
			});
		} else if let Some((time, original)) = parse_versioned_file_name(name) {
			versions.entry(join(rel_orig_parent, &original)).or_default().push(VersionInfo {
				time,
				path: item_path,
				is_symlink: true,
			});
		}
	}

	for (name, sub) in &contents.folders {
		let sub_path = folder_path.join(name);
		match (version_time_parent, parse_versioned_folder_name(name)) {
			// a timestamp folder starts a dated subtree; its name is not
			// part of the original relative path
			(None, Some(time)) => {
				find_file_versions(versions, sub, &sub_path, rel_orig_parent, Some(time))
			}
			(vt, _) => find_file_versions(
				versions,
				sub,
				&sub_path,
				&join(rel_orig_parent, name),
				vt,
			),
		}
	}
}

fn count_folder_items(
	counts: &mut HashMap<AbstractPath, usize>,
	contents: &DirContents,
	folder_path: &AbstractPath,
) {
	let direct = contents.files.len() + contents.symlinks.len() + contents.folders.len();
	*counts.entry(folder_path.clone()).or_insert(0) += direct;
	for (name, sub) in &contents.folders {
		count_folder_items(counts, sub, &folder_path.join(name));
	}
}

fn last_midnight() -> i64 {
	let now = Local::now();
	now.with_time(NaiveTime::MIN).single().map(|t| t.timestamp()).unwrap_or(0)
}

/// Trim old versions in every versioning tree, then delete directories that
/// became empty, cascading up to (but excluding) the versioning root.
pub async fn apply_versioning_limits(
	folders: &[VersioningLimitFolder],
	registry: &FsRegistry,
	limiter: Arc<DeviceLimiter>,
	handler: Arc<dyn StatusHandler>,
) -> Result<(), SyncError> {
	let work: Vec<&VersioningLimitFolder> =
		folders.iter().filter(|f| !f.limits.is_unlimited()).collect();
	if work.is_empty() {
		return Ok(());
	}
	for folder in &work {
		folder.limits.validate()?;
	}

	// enumerate all versioning trees (deduplicated by root)
	let mut roots: Vec<AbstractPath> = Vec::new();
	for folder in &work {
		if !roots.contains(&folder.root) {
			roots.push(folder.root.clone());
		}
	}
	let jobs = roots
		.iter()
		.map(|root| {
			Ok(TraverseJob {
				fs: registry.get(&root.device)?,
				base: root.clone(),
				filter: Arc::new(PathFilter::pass_all()),
				symlink_policy: SymlinkPolicy::Direct,
			})
		})
		.collect::<Result<Vec<_>, FsError>>()?;

	let results = traverse_all(jobs, Arc::clone(&limiter), Arc::clone(&handler)).await?;

	let mut version_details: HashMap<AbstractPath, VersionInfoMap> = HashMap::new();
	let mut folder_item_count: HashMap<AbstractPath, usize> = HashMap::new();
	for (root, result) in roots.iter().zip(&results) {
		let mut map = VersionInfoMap::new();
		find_file_versions(&mut map, &result.root, root, "", None);
		version_details.insert(root.clone(), map);

		count_folder_items(&mut folder_item_count, &result.root, root);
		// the versioning root itself is never considered empty
		*folder_item_count.entry(root.clone()).or_insert(0) += 1;

		// failed reads must not make folders look empty
		for rel in result.failed_folder_reads.keys() {
			let p = if rel.is_root() { root.clone() } else { root.join(rel.as_str()) };
			*folder_item_count.entry(p).or_insert(0) += 1;
		}
		for rel in result.failed_item_reads.keys() {
			let p = match rel.parent() {
				Some(parent) if !parent.is_root() => root.join(parent.as_str()),
				_ => root.clone(),
			};
			*folder_item_count.entry(p).or_insert(0) += 1;
		}
	}

	// ---- calculate excess versions ----
	let midnight = last_midnight();
	let mut to_delete: Vec<VersionInfo> = Vec::new();

	for folder in &work {
		let details = match version_details.get(&folder.root) {
			Some(d) => d,
			None => continue,
		};
		for versions in details.values() {
			let mut versions: Vec<VersionInfo> = versions.clone();
			let mut keep = versions.len();

			if folder.limits.max_age_days > 0 {
				let cutoff = midnight - i64::from(folder.limits.max_age_days) * 24 * 3600;
				keep = versions.iter().filter(|v| v.time >= cutoff).count();
				if folder.limits.count_min > 0 {
					keep = keep.max(folder.limits.count_min as usize);
				}
			}
			if folder.limits.count_max > 0 {
				keep = keep.min(folder.limits.count_max as usize);
			}

			if versions.len() > keep {
				let excess = versions.len() - keep;
				// oldest versions first; full ordering is not required
				if excess < versions.len() {
					versions.select_nth_unstable_by_key(excess - 1, |v| v.time);
				}
				to_delete.extend(versions.drain(..excess));
			}
		}
	}

	if to_delete.is_empty() {
		return Ok(());
	}

	handler.update_total(to_delete.len() as u64, 0);

	// ---- remove excess versions and emptied folders ----
	for info in to_delete {
		handler.abort_if_requested()?;
		handler.report_status(&format!("Removing old file version: {}", info.path.display_path()));

		let fs = registry.get(&info.path.device)?;
		let result = if info.is_symlink {
			fs.remove_symlink(&info.path).await
		} else {
			fs.remove_file(&info.path).await
		};
		match result {
			Ok(()) | Err(FsError { kind: FsErrorKind::NotFound, .. }) => {}
			Err(e) => match handler.report_error(&e.to_string(), 0) {
				crate::status::ErrorDecision::Abort => {
					return Err(SyncError::Aborted(crate::error::AbortTrigger::User))
				}
				_ => continue,
			},
		}
		handler.update_processed(1, 0);

		// empty-directory cascade, versioning root exclusive
		let mut parent = info.path.parent();
		while let Some(folder) = parent {
			let count = folder_item_count.entry(folder.clone()).or_insert(1);
			*count = count.saturating_sub(1);
			if *count > 0 {
				break;
			}
			handler
				.report_status(&format!("Deleting folder: {}", folder.display_path()));
			if let Err(e) = fs.remove_folder_empty(&folder).await {
				if e.kind != FsErrorKind::NotFound {
					break; // leave non-empty or busy folders alone
				}
			}
			parent = folder.parent();
		}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_versioned_file_name_round_trip() {
		let time = Local.with_ymd_and_hms(2023, 5, 15, 13, 15, 13).single().unwrap();
		let stamp = format_version_time(time);
		assert_eq!(stamp, "2023-05-15 131513");

		for original in ["Sample.txt", "archive.tar.gz", "no-extension", ".profile"] {
			let versioned =
				format!("{} {}{}", original, stamp, dot_extension(original));
			let (parsed_time, parsed_name) = parse_versioned_file_name(&versioned).unwrap();
			assert_eq!(parsed_time, time.timestamp(), "time of {}", versioned);
			assert_eq!(parsed_name, original, "name of {}", versioned);
		}
	}

	#[test]
	fn test_versioned_folder_name_round_trip() {
		let time = Local.with_ymd_and_hms(2024, 12, 31, 23, 59, 58).single().unwrap();
		let stamp = format_version_time(time);
		assert_eq!(parse_versioned_folder_name(&stamp), Some(time.timestamp()));
	}

	#[test]
	fn test_parse_rejects_non_versions() {
		assert_eq!(parse_versioned_file_name("Sample.txt"), None);
		assert_eq!(parse_versioned_file_name("Sample 2023-13-45 999999.txt"), None);
		// extension not duplicated
		assert_eq!(parse_versioned_file_name("Sample.doc 2023-05-15 131513.txt"), None);
		assert_eq!(parse_versioned_folder_name("not a stamp"), None);
		assert_eq!(parse_versioned_folder_name("2023-05-15"), None);
	}

	#[test]
	fn test_dot_extension() {
		assert_eq!(dot_extension("a.txt"), ".txt");
		assert_eq!(dot_extension("archive.tar.gz"), ".gz");
		assert_eq!(dot_extension("none"), "");
		assert_eq!(dot_extension(".profile"), "");
	}

	#[test]
	fn test_limits_validation() {
		assert!(VersioningLimits { max_age_days: 30, count_min: 2, count_max: 5 }
			.validate()
			.is_ok());
		assert!(VersioningLimits { max_age_days: 0, count_min: 5, count_max: 5 }
			.validate()
			.is_err());
		assert!(VersioningLimits { max_age_days: 0, count_min: 7, count_max: 5 }
			.validate()
			.is_err());
		// a zero disables the respective bound
		assert!(VersioningLimits { max_age_days: 0, count_min: 7, count_max: 0 }
			.validate()
			.is_ok());
	}

	#[test]
	fn test_version_selection_age_and_count() {
		// ages in days: 1, 2, 3, 10, 20, 40, 50, 60; max_age 30 keeps 5,
		// floored by min 2, capped by max 5 -> delete the three oldest
		let midnight = 1_000_000_000i64;
		let day = 24 * 3600;
		let ages = [1i64, 2, 3, 10, 20, 40, 50, 60];
		let mut versions: Vec<VersionInfo> = ages
			.iter()
			.map(|age| VersionInfo {
				time: midnight - age * day,
				path: AbstractPath::device_root(crate::path::Device::Local {
					root: std::path::PathBuf::from("/v"),
				}),
				is_symlink: false,
			})
			.collect();

		let limits = VersioningLimits { max_age_days: 30, count_min: 2, count_max: 5 };
		let cutoff = midnight - i64::from(limits.max_age_days) * day;
		let mut keep = versions.iter().filter(|v| v.time >= cutoff).count();
		assert_eq!(keep, 5);
		keep = keep.max(limits.count_min as usize);
		keep = keep.min(limits.count_max as usize);
		assert_eq!(keep, 5);

		let excess = versions.len() - keep;
		versions.select_nth_unstable_by_key(excess - 1, |v| v.time);
		let deleted: Vec<i64> =
			versions[..excess].iter().map(|v| (midnight - v.time) / day).collect();
		let mut deleted_sorted = deleted.clone();
		deleted_sorted.sort_unstable();
		assert_eq!(deleted_sorted, vec![40, 50, 60]);
	}
}

// vim: ts=4
