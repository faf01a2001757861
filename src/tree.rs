//! Paired item tree
//!
//! One node per name in the union of both trees, holding optional left and
//! right sides, a category, a direction and the active flag. Nodes carry
//! their own relative path instead of parent back-pointers; move links
//! between single-sided file pairs are node ids.

use crate::afs::{FileAttrs, SymlinkAttrs};
use crate::path::{AbstractPath, RelPath};
use crate::strategies::SyncDirection;

pub type PairId = u64;

/// Which side of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
	Left,
	Right,
}

impl Side {
	pub fn opposite(self) -> Side {
		match self {
			Side::Left => Side::Right,
			Side::Right => Side::Left,
		}
	}
}

/// Classification of a pair, independent of policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
	Equal,
	LeftOnly,
	RightOnly,
	LeftNewer,
	RightNewer,
	DifferentContent,
	DifferentMetadata,
	Conflict,
}

/// One side of a file pair. The name is the side's exact spelling; names of
/// the two sides may differ in case.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSide {
	pub name: String,
	pub attrs: FileAttrs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkSide {
	pub name: String,
	pub attrs: SymlinkAttrs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FolderSide {
	pub name: String,
}

#[derive(Debug, Clone)]
pub struct FilePair {
	pub id: PairId,

	/// Relative path of the containing folder
	pub parent_rel: RelPath,

	pub left: Option<FileSide>,
	pub right: Option<FileSide>,

	pub category: Category,

	/// Message of a `Conflict` category
	pub conflict: Option<String>,

	pub direction: SyncDirection,

	/// Set when the resolver could not assign a direction
	pub direction_conflict: Option<String>,

	pub active: bool,

	/// Link to the other row of a detected move
	pub move_ref: Option<PairId>,
}

#[derive(Debug, Clone)]
pub struct SymlinkPair {
	pub id: PairId,
	pub parent_rel: RelPath,
	pub left: Option<LinkSide>,
	pub right: Option<LinkSide>,
	pub category: Category,
	pub conflict: Option<String>,
	pub direction: SyncDirection,
	pub direction_conflict: Option<String>,
	pub active: bool,
}

#[derive(Debug, Clone)]
pub struct FolderPair {
	pub id: PairId,
	pub parent_rel: RelPath,
	pub left: Option<FolderSide>,
	pub right: Option<FolderSide>,
	pub category: Category,
	pub conflict: Option<String>,
	pub direction: SyncDirection,
	pub direction_conflict: Option<String>,
	pub active: bool,

	pub files: Vec<FilePair>,
	pub symlinks: Vec<SymlinkPair>,
	pub folders: Vec<FolderPair>,
}

/// The merged tree of one folder pair
#[derive(Debug)]
pub struct BaseFolderPair {
	pub left_base: AbstractPath,
	pub right_base: AbstractPath,

	pub files: Vec<FilePair>,
	pub symlinks: Vec<SymlinkPair>,
	pub folders: Vec<FolderPair>,
}

macro_rules! side_accessors {
	($t:ty) => {
		impl $t {
			/// The side's exact name; empty string for an absent side
			pub fn name_on(&self, side: Side) -> &str {
				let opt = match side {
					Side::Left => &self.left,
					Side::Right => &self.right,
				};
				opt.as_ref().map(|s| s.name.as_str()).unwrap_or("")
			}

			pub fn exists_on(&self, side: Side) -> bool {
				match side {
					Side::Left => self.left.is_some(),
					Side::Right => self.right.is_some(),
				}
			}

			/// Name used for display: the present side, left preferred
			pub fn display_name(&self) -> &str {
				if self.left.is_some() {
					self.name_on(Side::Left)
				} else {
					self.name_on(Side::Right)
				}
			}

			/// Relative path on one side (falls back to the other side's
			/// spelling when this side is absent)
			pub fn rel_on(&self, side: Side) -> RelPath {
				let name = if self.exists_on(side) {
					self.name_on(side)
				} else {
					self.display_name()
				};
				self.parent_rel.join(name)
			}

			/// Resolved target side of this pair's direction, if any
			pub fn target_side(&self) -> Option<Side> {
				match self.direction {
					SyncDirection::Left => Some(Side::Left),
					SyncDirection::Right => Some(Side::Right),
					SyncDirection::None => None,
				}
			}

			pub fn set_conflict(&mut self, message: impl Into<String>) {
				self.category = Category::Conflict;
				self.conflict = Some(message.into());
				self.direction = SyncDirection::None;
			}

			pub fn set_direction_conflict(&mut self, message: impl Into<String>) {
				self.direction = SyncDirection::None;
				self.direction_conflict = Some(message.into());
			}
		}
	};
}

side_accessors!(FilePair);
side_accessors!(SymlinkPair);
side_accessors!(FolderPair);

impl FilePair {
	pub fn attrs_on(&self, side: Side) -> Option<&FileAttrs> {
		match side {
			Side::Left => self.left.as_ref().map(|s| &s.attrs),
			Side::Right => self.right.as_ref().map(|s| &s.attrs),
		}
	}
}

impl SymlinkPair {
	pub fn attrs_on(&self, side: Side) -> Option<&SymlinkAttrs> {
		match side {
			Side::Left => self.left.as_ref().map(|s| &s.attrs),
			Side::Right => self.right.as_ref().map(|s| &s.attrs),
		}
	}
}

impl BaseFolderPair {
	pub fn new(left_base: AbstractPath, right_base: AbstractPath) -> Self {
		BaseFolderPair {
			left_base,
			right_base,
			files: Vec::new(),
			symlinks: Vec::new(),
			folders: Vec::new(),
		}
	}

	pub fn base_on(&self, side: Side) -> &AbstractPath {
		match side {
			Side::Left => &self.left_base,
			Side::Right => &self.right_base,
		}
	}

	/// Absolute location of a relative path on one side
	pub fn path_on(&self, side: Side, rel: &RelPath) -> AbstractPath {
		if rel.is_root() {
			self.base_on(side).clone()
		} else {
			self.base_on(side).join(rel.as_str())
		}
	}

	/// Visit every file pair, depth first
	pub fn for_each_file<F: FnMut(&FilePair)>(&self, mut f: F) {
		fn walk<F: FnMut(&FilePair)>(folders: &[FolderPair], files: &[FilePair], f: &mut F) {
			for file in files {
				f(file);
			}
			for folder in folders {
				walk(&folder.folders, &folder.files, f);
			}
		}
		walk(&self.folders, &self.files, &mut f);
	}

	pub fn for_each_file_mut<F: FnMut(&mut FilePair)>(&mut self, mut f: F) {
		fn walk<F: FnMut(&mut FilePair)>(
			folders: &mut [FolderPair],
			files: &mut [FilePair],
			f: &mut F,
		) {
			for file in files {
				f(file);
			}
			for folder in folders {
				walk(&mut folder.folders, &mut folder.files, f);
			}
		}
		walk(&mut self.folders, &mut self.files, &mut f);
	}

	pub fn for_each_symlink_mut<F: FnMut(&mut SymlinkPair)>(&mut self, mut f: F) {
		fn walk<F: FnMut(&mut SymlinkPair)>(
			folders: &mut [FolderPair],
			links: &mut [SymlinkPair],
			f: &mut F,
		) {
			for link in links {
				f(link);
			}
			for folder in folders {
				walk(&mut folder.folders, &mut folder.symlinks, f);
			}
		}
		walk(&mut self.folders, &mut self.symlinks, &mut f);
	}

	/// Whether every pair in the tree ended up `Equal`
	pub fn all_equal(&self) -> bool {
		fn folder_equal(folder: &FolderPair) -> bool {
			folder.category == Category::Equal
				&& folder.files.iter().all(|f| f.category == Category::Equal)
				&& folder.symlinks.iter().all(|s| s.category == Category::Equal)
				&& folder.folders.iter().all(folder_equal)
		}
		self.files.iter().all(|f| f.category == Category::Equal)
			&& self.symlinks.iter().all(|s| s.category == Category::Equal)
			&& self.folders.iter().all(folder_equal)
	}
}

/// Sequential id source for pair nodes
#[derive(Debug, Default)]
pub struct PairIdSource {
	next: PairId,
}

impl PairIdSource {
	pub fn next_id(&mut self) -> PairId {
		self.next += 1;
		self.next
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn file_pair(id: PairId, parent: &str, left: Option<&str>, right: Option<&str>) -> FilePair {
		let attrs = FileAttrs { size: 1, mtime: 0, fingerprint: String::new() };
		FilePair {
			id,
			parent_rel: RelPath::new(parent).unwrap(),
			left: left.map(|n| FileSide { name: n.to_string(), attrs: attrs.clone() }),
			right: right.map(|n| FileSide { name: n.to_string(), attrs }),
			category: Category::Equal,
			conflict: None,
			direction: SyncDirection::None,
			direction_conflict: None,
			active: true,
			move_ref: None,
		}
	}

	#[test]
	fn test_rel_on_uses_side_spelling() {
		let pair = file_pair(1, "sub", Some("Name.TXT"), Some("name.txt"));
		assert_eq!(pair.rel_on(Side::Left).as_str(), "sub/Name.TXT");
		assert_eq!(pair.rel_on(Side::Right).as_str(), "sub/name.txt");
	}

	#[test]
	fn test_rel_on_missing_side_falls_back() {
		let pair = file_pair(1, "sub", Some("a.txt"), None);
		assert_eq!(pair.rel_on(Side::Right).as_str(), "sub/a.txt");
		assert_eq!(pair.display_name(), "a.txt");
	}

	#[test]
	fn test_set_conflict_clears_direction() {
		let mut pair = file_pair(1, "", Some("x"), Some("x"));
		pair.direction = SyncDirection::Right;
		pair.set_conflict("kind clash");
		assert_eq!(pair.category, Category::Conflict);
		assert_eq!(pair.direction, SyncDirection::None);
		assert!(pair.conflict.as_deref().unwrap().contains("kind clash"));
	}

	#[test]
	fn test_id_source_is_sequential() {
		let mut ids = PairIdSource::default();
		assert_eq!(ids.next_id(), 1);
		assert_eq!(ids.next_id(), 2);
	}
}

// vim: ts=4
