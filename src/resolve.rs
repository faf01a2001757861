//! Direction resolver
//!
//! Turns categories into per-pair sync directions. Fixed-direction policies
//! use a table indexed by category; two-way mode derives the changed side
//! from the last-in-sync database. Move detection links single-sided file
//! pairs across sides afterwards.

use std::collections::{HashMap, HashSet};

use crate::afs::{FileAttrs, TEMP_FILE_ENDING};
use crate::compare::same_file_time;
use crate::db::{FolderStatus, InSyncDescr, InSyncFile, InSyncFolder, InSyncSymlink};
use crate::strategies::{CompareVariant, DirectionConfig, SyncDirection};
use crate::tree::{BaseFolderPair, Category, FilePair, FolderPair, PairId, Side, SymlinkPair};

pub const TXT_BOTH_SIDES_CHANGED: &str = "Both sides have changed since last synchronization.";
pub const TXT_NO_SIDE_CHANGED: &str =
	"Cannot determine sync-direction: No change since last synchronization.";
pub const TXT_DB_NOT_IN_SYNC: &str =
	"Cannot determine sync-direction: The database entry is not in sync considering current settings.";

/// Change-detection tolerance against the database. Copying to FAT shifts
/// modification times by up to 2 seconds; this is not user-configurable.
const DB_TIME_TOLERANCE: i64 = 2;

// ============================================================================
// FIXED DIRECTIONS
// ============================================================================

fn table_direction(table: &DirectionConfig, category: Category) -> SyncDirection {
	match category {
		Category::Equal => SyncDirection::None,
		Category::LeftOnly => table.left_only,
		Category::RightOnly => table.right_only,
		Category::LeftNewer => table.left_newer,
		Category::RightNewer => table.right_newer,
		Category::DifferentContent => table.different,
		Category::DifferentMetadata | Category::Conflict => table.conflict,
	}
}

/// Apply a fixed per-category direction table to the whole tree
pub fn apply_direction_table(base: &mut BaseFolderPair, table: &DirectionConfig) {
	fn walk(
		files: &mut [FilePair],
		symlinks: &mut [SymlinkPair],
		folders: &mut [FolderPair],
		table: &DirectionConfig,
	) {
		for pair in files.iter_mut() {
			pair.direction = table_direction(table, pair.category);
		}
		for pair in symlinks.iter_mut() {
			pair.direction = table_direction(table, pair.category);
		}
		for pair in folders.iter_mut() {
			pair.direction = table_direction(table, pair.category);
			walk(&mut pair.files, &mut pair.symlinks, &mut pair.folders, table);
		}
	}
	walk(&mut base.files, &mut base.symlinks, &mut base.folders, table);
}

// ============================================================================
// TWO-WAY RESOLUTION
// ============================================================================

/// Settings the resolver needs from the comparison configuration
#[derive(Debug, Clone)]
pub struct TwoWaySettings {
	pub cmp_var: CompareVariant,

	/// User tolerance, consulted for the still-in-sync check only
	pub tolerance: i64,

	pub ignore_minutes: Vec<u32>,
}

/// Database match irrespective of current comparison settings: visible state
/// (mtime within 2 s, size) against the recorded side.
fn matches_db_file(
	side: Option<&FileAttrs>,
	descr: Option<&InSyncDescr>,
	ignore_minutes: &[u32],
) -> bool {
	match (side, descr) {
		(None, None) => true,
		(None, Some(_)) | (Some(_), None) => false,
		(Some(attrs), Some(descr)) => {
			same_file_time(attrs.mtime, descr.mtime, DB_TIME_TOLERANCE, ignore_minutes)
				&& attrs.size == descr.size
		}
	}
}

fn matches_db_symlink(mtime: Option<i64>, db_mtime: Option<i64>, ignore_minutes: &[u32]) -> bool {
	match (mtime, db_mtime) {
		(None, None) => true,
		(None, Some(_)) | (Some(_), None) => false,
		(Some(a), Some(b)) => same_file_time(a, b, DB_TIME_TOLERANCE, ignore_minutes),
	}
}

fn matches_db_folder(present: bool, entry: Option<&InSyncFolder>) -> bool {
	let have_db = matches!(entry, Some(e) if e.status != FolderStatus::Placeholder);
	have_db == present
}

/// Whether a database entry still counts as in-sync under the current
/// comparison settings.
fn still_in_sync_file(db: &InSyncFile, s: &TwoWaySettings) -> bool {
	match s.cmp_var {
		CompareVariant::TimeSize => {
			// a content-equal snapshot is certainly good enough
			if db.cmp_var == CompareVariant::Content {
				return true;
			}
			same_file_time(db.left.mtime, db.right.mtime, s.tolerance, &s.ignore_minutes)
		}
		CompareVariant::Content => db.cmp_var == CompareVariant::Content,
		CompareVariant::Size => true,
	}
}

fn still_in_sync_symlink(db: &InSyncSymlink, s: &TwoWaySettings) -> bool {
	match s.cmp_var {
		CompareVariant::TimeSize => {
			if db.cmp_var == CompareVariant::Content || db.cmp_var == CompareVariant::Size {
				return true;
			}
			same_file_time(db.left_mtime, db.right_mtime, s.tolerance, &s.ignore_minutes)
		}
		// symlinks were categorized by target content in both variants
		CompareVariant::Content | CompareVariant::Size => {
			db.cmp_var == CompareVariant::Content || db.cmp_var == CompareVariant::Size
		}
	}
}

fn db_file<'a>(folder: Option<&'a InSyncFolder>, name: &str) -> Option<&'a InSyncFile> {
	folder.and_then(|f| f.files.get(name))
}

fn db_symlink<'a>(folder: Option<&'a InSyncFolder>, name: &str) -> Option<&'a InSyncSymlink> {
	folder.and_then(|f| f.symlinks.get(name))
}

fn db_folder<'a>(folder: Option<&'a InSyncFolder>, name: &str) -> Option<&'a InSyncFolder> {
	folder.and_then(|f| f.folders.get(name))
}

/// Resolve directions of the whole tree against the last-in-sync database
pub fn resolve_two_way(base: &mut BaseFolderPair, db: &InSyncFolder, s: &TwoWaySettings) {
	walk_two_way(&mut base.files, &mut base.symlinks, &mut base.folders, Some(db), Some(db), s);
}

fn walk_two_way(
	files: &mut [FilePair],
	symlinks: &mut [SymlinkPair],
	folders: &mut [FolderPair],
	db_l: Option<&InSyncFolder>,
	db_r: Option<&InSyncFolder>,
	s: &TwoWaySettings,
) {
	for pair in files.iter_mut() {
		process_file(pair, db_l, db_r, s);
	}
	for pair in symlinks.iter_mut() {
		process_symlink(pair, db_l, db_r, s);
	}
	for pair in folders.iter_mut() {
		process_folder(pair, db_l, db_r, s);
	}
}

/// Look up both sides independently: case-only name differences are real
fn lookup_both<'a, T, F>(
	db_l: Option<&'a InSyncFolder>,
	db_r: Option<&'a InSyncFolder>,
	name_l: &str,
	name_r: &str,
	get: F,
) -> (Option<&'a T>, Option<&'a T>)
where
	F: Fn(Option<&'a InSyncFolder>, &str) -> Option<&'a T>,
{
	(get(db_l, name_l), get(db_r, name_r))
}

fn process_file(
	pair: &mut FilePair,
	db_l: Option<&InSyncFolder>,
	db_r: Option<&InSyncFolder>,
	s: &TwoWaySettings,
) {
	if pair.category == Category::Equal {
		return;
	}

	// schedule abandoned temporary files for deletion
	if pair.category == Category::LeftOnly && pair.name_on(Side::Left).ends_with(TEMP_FILE_ENDING)
	{
		pair.direction = SyncDirection::Left;
		return;
	}
	if pair.category == Category::RightOnly
		&& pair.name_on(Side::Right).ends_with(TEMP_FILE_ENDING)
	{
		pair.direction = SyncDirection::Right;
		return;
	}

	let name_l = name_for_lookup(pair.name_on(Side::Left), pair.display_name());
	let name_r = name_for_lookup(pair.name_on(Side::Right), pair.display_name());
	let (entry_l, entry_r) = lookup_both(db_l, db_r, name_l, name_r, db_file);

	let changed_left =
		!matches_db_file(pair.attrs_on(Side::Left), entry_l.map(|e| &e.left), &s.ignore_minutes);
	let changed_right =
		!matches_db_file(pair.attrs_on(Side::Right), entry_r.map(|e| &e.right), &s.ignore_minutes);

	if changed_left != changed_right {
		let db_stale = entry_l.map(|e| !still_in_sync_file(e, s)).unwrap_or(false)
			|| entry_r.map(|e| !still_in_sync_file(e, s)).unwrap_or(false);
		if db_stale {
			pair.set_direction_conflict(TXT_DB_NOT_IN_SYNC);
		} else {
			pair.direction =
				if changed_left { SyncDirection::Right } else { SyncDirection::Left };
		}
	} else if changed_left {
		pair.set_direction_conflict(TXT_BOTH_SIDES_CHANGED);
	} else {
		pair.set_direction_conflict(TXT_NO_SIDE_CHANGED);
	}
}

fn process_symlink(
	pair: &mut SymlinkPair,
	db_l: Option<&InSyncFolder>,
	db_r: Option<&InSyncFolder>,
	s: &TwoWaySettings,
) {
	if pair.category == Category::Equal {
		return;
	}

	let name_l = name_for_lookup(pair.name_on(Side::Left), pair.display_name());
	let name_r = name_for_lookup(pair.name_on(Side::Right), pair.display_name());
	let (entry_l, entry_r) = lookup_both(db_l, db_r, name_l, name_r, db_symlink);

	let changed_left = !matches_db_symlink(
		pair.attrs_on(Side::Left).map(|a| a.mtime),
		entry_l.map(|e| e.left_mtime),
		&s.ignore_minutes,
	);
	let changed_right = !matches_db_symlink(
		pair.attrs_on(Side::Right).map(|a| a.mtime),
		entry_r.map(|e| e.right_mtime),
		&s.ignore_minutes,
	);

	if changed_left != changed_right {
		let db_stale = entry_l.map(|e| !still_in_sync_symlink(e, s)).unwrap_or(false)
			|| entry_r.map(|e| !still_in_sync_symlink(e, s)).unwrap_or(false);
		if db_stale {
			pair.set_direction_conflict(TXT_DB_NOT_IN_SYNC);
		} else {
			pair.direction =
				if changed_left { SyncDirection::Right } else { SyncDirection::Left };
		}
	} else if changed_left {
		pair.set_direction_conflict(TXT_BOTH_SIDES_CHANGED);
	} else {
		pair.set_direction_conflict(TXT_NO_SIDE_CHANGED);
	}
}

fn process_folder(
	pair: &mut FolderPair,
	db_l: Option<&InSyncFolder>,
	db_r: Option<&InSyncFolder>,
	s: &TwoWaySettings,
) {
	// schedule abandoned temporary folders for deletion, subtree and all
	if pair.category == Category::LeftOnly && pair.name_on(Side::Left).ends_with(TEMP_FILE_ENDING)
	{
		return set_direction_rec(pair, SyncDirection::Left);
	}
	if pair.category == Category::RightOnly
		&& pair.name_on(Side::Right).ends_with(TEMP_FILE_ENDING)
	{
		return set_direction_rec(pair, SyncDirection::Right);
	}

	let name_l = name_for_lookup(pair.name_on(Side::Left), pair.display_name());
	let name_r = name_for_lookup(pair.name_on(Side::Right), pair.display_name());
	let (entry_l, entry_r) = lookup_both(db_l, db_r, name_l, name_r, db_folder);

	if pair.category != Category::Equal {
		let changed_left = !matches_db_folder(pair.exists_on(Side::Left), entry_l);
		let changed_right = !matches_db_folder(pair.exists_on(Side::Right), entry_r);

		if changed_left != changed_right {
			pair.direction =
				if changed_left { SyncDirection::Right } else { SyncDirection::Left };
		} else if changed_left {
			pair.set_direction_conflict(TXT_BOTH_SIDES_CHANGED);
		} else {
			pair.set_direction_conflict(TXT_NO_SIDE_CHANGED);
		}
	}

	walk_two_way(&mut pair.files, &mut pair.symlinks, &mut pair.folders, entry_l, entry_r, s);
}

/// A side may be absent; fall back to the present side's spelling
fn name_for_lookup<'a>(side_name: &'a str, display: &'a str) -> &'a str {
	if side_name.is_empty() {
		display
	} else {
		side_name
	}
}

/// Set one direction on a folder pair and everything below it
pub fn set_direction_rec(folder: &mut FolderPair, direction: SyncDirection) {
	folder.direction = direction;
	for pair in folder.files.iter_mut() {
		pair.direction = direction;
	}
	for pair in folder.symlinks.iter_mut() {
		pair.direction = direction;
	}
	for pair in folder.folders.iter_mut() {
		set_direction_rec(pair, direction);
	}
}

// ============================================================================
// MOVE DETECTION
// ============================================================================

#[derive(Default)]
struct MoveIndex {
	left_by_path: HashMap<String, (PairId, FileAttrs)>,
	left_by_id: HashMap<String, Option<(PairId, FileAttrs)>>,
	right_by_path: HashMap<String, (PairId, FileAttrs)>,
	right_by_id: HashMap<String, Option<(PairId, FileAttrs)>>,
}

/// Detect renamed/moved files: a deleted row on one side and a created row
/// on the other that both still match the database's size and time. The
/// matched rows are linked through their move references.
///
/// Database path lookup takes precedence; the opaque fingerprint is the
/// fallback. Duplicate fingerprints cancel the match (hard links, aliasing).
pub fn detect_moves(base: &mut BaseFolderPair, db: &InSyncFolder, s: &TwoWaySettings) {
	let mut index = MoveIndex::default();
	index_single_sided(
		&base.files,
		&base.folders,
		Some((db, String::new())),
		Some((db, String::new())),
		&mut index,
	);

	let empty_left = index.left_by_path.is_empty() && index.left_by_id.is_empty();
	let empty_right = index.right_by_path.is_empty() && index.right_by_id.is_empty();
	if empty_left || empty_right {
		return;
	}

	let mut links: Vec<(PairId, PairId)> = Vec::new();
	let mut used: HashSet<PairId> = HashSet::new();
	collect_move_pairs(db, "", s, &index, &mut links, &mut used);

	if links.is_empty() {
		return;
	}
	let by_id: HashMap<PairId, PairId> = links
		.iter()
		.flat_map(|&(l, r)| [(l, r), (r, l)])
		.collect();
	base.for_each_file_mut(|pair| {
		if let Some(other) = by_id.get(&pair.id) {
			pair.move_ref = Some(*other);
		}
	});
}

fn index_single_sided(
	files: &[FilePair],
	folders: &[FolderPair],
	db_l: Option<(&InSyncFolder, String)>,
	db_r: Option<(&InSyncFolder, String)>,
	index: &mut MoveIndex,
) {
	for pair in files {
		match pair.category {
			Category::LeftOnly => {
				let attrs = pair.attrs_on(Side::Left).expect("left side present").clone();
				let name = pair.name_on(Side::Left);
				if let Some((folder, path)) = &db_l {
					if folder.files.contains_key(name) {
						index.left_by_path.insert(join_db_path(path, name), (pair.id, attrs));
						continue;
					}
				}
				if !attrs.fingerprint.is_empty() {
					index
						.left_by_id
						.entry(attrs.fingerprint.clone())
						.and_modify(|slot| *slot = None) // duplicate id: 1-1 mapping only
						.or_insert(Some((pair.id, attrs)));
				}
			}
			Category::RightOnly => {
				let attrs = pair.attrs_on(Side::Right).expect("right side present").clone();
				let name = pair.name_on(Side::Right);
				if let Some((folder, path)) = &db_r {
					if folder.files.contains_key(name) {
						index.right_by_path.insert(join_db_path(path, name), (pair.id, attrs));
						continue;
					}
				}
				if !attrs.fingerprint.is_empty() {
					index
						.right_by_id
						.entry(attrs.fingerprint.clone())
						.and_modify(|slot| *slot = None)
						.or_insert(Some((pair.id, attrs)));
				}
			}
			_ => {}
		}
	}

	for pair in folders {
		let lookup_l = name_for_lookup(pair.name_on(Side::Left), pair.display_name());
		let lookup_r = name_for_lookup(pair.name_on(Side::Right), pair.display_name());

		let sub_l = match &db_l {
			Some((folder, path)) => {
				let folder = *folder;
				folder.folders.get(lookup_l).map(|sub| (sub, join_db_path(path, lookup_l)))
			}
			None => None,
		};
		let sub_r = match &db_r {
			Some((folder, path)) => {
				let folder = *folder;
				folder.folders.get(lookup_r).map(|sub| (sub, join_db_path(path, lookup_r)))
			}
			None => None,
		};
		index_single_sided(&pair.files, &pair.folders, sub_l, sub_r, index);
	}
}

fn join_db_path(parent: &str, name: &str) -> String {
	if parent.is_empty() {
		name.to_string()
	} else {
		format!("{}/{}", parent, name)
	}
}

fn collect_move_pairs(
	db: &InSyncFolder,
	db_path: &str,
	s: &TwoWaySettings,
	index: &MoveIndex,
	links: &mut Vec<(PairId, PairId)>,
	used: &mut HashSet<PairId>,
) {
	for (name, db_file) in &db.files {
		if !still_in_sync_file(db_file, s) {
			continue;
		}
		let key = join_db_path(db_path, name);

		let left = index
			.left_by_path
			.get(&key)
			.cloned()
			.or_else(|| lookup_by_id(&index.left_by_id, &db_file.left.fingerprint));
		let right = index
			.right_by_path
			.get(&key)
			.cloned()
			.or_else(|| lookup_by_id(&index.right_by_id, &db_file.right.fingerprint));

		if let (Some((left_id, left_attrs)), Some((right_id, right_attrs))) = (left, right) {
			if same_size_and_date(&left_attrs, &db_file.left)
				&& same_size_and_date(&right_attrs, &db_file.right)
				&& !used.contains(&left_id)
				&& !used.contains(&right_id)
			{
				used.insert(left_id);
				used.insert(right_id);
				links.push((left_id, right_id));
			}
		}
	}

	for (name, sub) in &db.folders {
		collect_move_pairs(sub, &join_db_path(db_path, name), s, index, links, used);
	}
}

fn lookup_by_id(
	map: &HashMap<String, Option<(PairId, FileAttrs)>>,
	fingerprint: &str,
) -> Option<(PairId, FileAttrs)> {
	if fingerprint.is_empty() {
		return None;
	}
	map.get(fingerprint).and_then(|slot| slot.clone())
}

/// Move candidates must retain the database's size and time exactly (2 s
/// tolerance, no minute-offset leeway: false positives are worse than a
/// missed rename).
fn same_size_and_date(attrs: &FileAttrs, descr: &InSyncDescr) -> bool {
	attrs.size == descr.size && same_file_time(attrs.mtime, descr.mtime, DB_TIME_TOLERANCE, &[])
}


// vim: ts=4
