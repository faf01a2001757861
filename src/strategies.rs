//! Consolidated strategy and mode enums
//!
//! Central location for the mode enums used in comparison, direction
//! resolution, deletion handling and versioning.
//!
//! Each enum includes:
//! - FromStr implementation for CLI and config parsing
//! - Display implementation producing the same kebab-case token

use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// COMPARE VARIANT
// ============================================================================

/// How equality of two files is judged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CompareVariant {
	/// Modification time within tolerance plus equal size (default)
	#[default]
	TimeSize,

	/// Byte-wise content comparison
	Content,

	/// Size-only comparison
	Size,
}

impl FromStr for CompareVariant {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"time-size" | "timesize" | "time" => Ok(Self::TimeSize),
			"content" => Ok(Self::Content),
			"size" => Ok(Self::Size),
			_ => Err(format!(
				"Unknown compare variant: {}. Valid options: time-size, content, size",
				s
			)),
		}
	}
}

impl std::fmt::Display for CompareVariant {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::TimeSize => write!(f, "time-size"),
			Self::Content => write!(f, "content"),
			Self::Size => write!(f, "size"),
		}
	}
}

// ============================================================================
// SYNC DIRECTION
// ============================================================================

/// Which side a pair's change is applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SyncDirection {
	/// Change the left side
	Left,

	/// Change the right side
	Right,

	/// Leave the pair untouched
	#[default]
	None,
}

impl FromStr for SyncDirection {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"left" => Ok(Self::Left),
			"right" => Ok(Self::Right),
			"none" => Ok(Self::None),
			_ => Err(format!("Unknown sync direction: {}. Valid options: left, right, none", s)),
		}
	}
}

impl std::fmt::Display for SyncDirection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Left => write!(f, "left"),
			Self::Right => write!(f, "right"),
			Self::None => write!(f, "none"),
		}
	}
}

// ============================================================================
// DIRECTION POLICY
// ============================================================================

/// Per-category direction table for the fixed-direction policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionConfig {
	pub left_only: SyncDirection,
	pub right_only: SyncDirection,
	pub left_newer: SyncDirection,
	pub right_newer: SyncDirection,
	pub different: SyncDirection,
	pub conflict: SyncDirection,
}

impl DirectionConfig {
	/// Right tree becomes an exact copy of the left tree
	pub fn mirror() -> Self {
		DirectionConfig {
			left_only: SyncDirection::Right,
			right_only: SyncDirection::Right,
			left_newer: SyncDirection::Right,
			right_newer: SyncDirection::Right,
			different: SyncDirection::Right,
			conflict: SyncDirection::Right,
		}
	}

	/// New and newer items are copied to the right, nothing is deleted
	pub fn update() -> Self {
		DirectionConfig {
			left_only: SyncDirection::Right,
			right_only: SyncDirection::None,
			left_newer: SyncDirection::Right,
			right_newer: SyncDirection::None,
			different: SyncDirection::None,
			conflict: SyncDirection::None,
		}
	}

	/// Fallback table used when a two-way run has no usable database:
	/// propagate the newer side, leave genuine ambiguity unresolved.
	pub fn prefer_newer() -> Self {
		DirectionConfig {
			left_only: SyncDirection::Right,
			right_only: SyncDirection::Left,
			left_newer: SyncDirection::Right,
			right_newer: SyncDirection::Left,
			different: SyncDirection::None,
			conflict: SyncDirection::None,
		}
	}
}

/// How per-pair sync directions are determined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DirectionPolicy {
	/// Database-driven change propagation
	TwoWay,

	/// Make right identical to left
	Mirror,

	/// Copy new/newer files to right, never delete
	Update,

	/// Explicit per-category table
	Custom(DirectionConfig),
}

impl Default for DirectionPolicy {
	fn default() -> Self {
		DirectionPolicy::TwoWay
	}
}

impl FromStr for DirectionPolicy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"two-way" | "twoway" => Ok(Self::TwoWay),
			"mirror" => Ok(Self::Mirror),
			"update" => Ok(Self::Update),
			_ => Err(format!(
				"Unknown direction policy: {}. Valid options: two-way, mirror, update",
				s
			)),
		}
	}
}

impl std::fmt::Display for DirectionPolicy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::TwoWay => write!(f, "two-way"),
			Self::Mirror => write!(f, "mirror"),
			Self::Update => write!(f, "update"),
			Self::Custom(_) => write!(f, "custom"),
		}
	}
}

// ============================================================================
// DELETION POLICY
// ============================================================================

/// Where deleted and overwritten items go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DeletionPolicy {
	/// Remove permanently
	Permanent,

	/// Move to the device's recycler when available (default)
	#[default]
	Recycler,

	/// Divert into the versioning tree
	Versioning,
}

impl FromStr for DeletionPolicy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"permanent" | "delete" => Ok(Self::Permanent),
			"recycler" | "recycle" | "trash" => Ok(Self::Recycler),
			"versioning" | "version" => Ok(Self::Versioning),
			_ => Err(format!(
				"Unknown deletion policy: {}. Valid options: permanent, recycler, versioning",
				s
			)),
		}
	}
}

impl std::fmt::Display for DeletionPolicy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Permanent => write!(f, "permanent"),
			Self::Recycler => write!(f, "recycler"),
			Self::Versioning => write!(f, "versioning"),
		}
	}
}

// ============================================================================
// VERSIONING STYLE
// ============================================================================

/// Naming scheme inside the versioning tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum VersioningStyle {
	/// Overwrite any previous version at the mirrored location
	#[default]
	Replace,

	/// `<root>/YYYY-MM-DD HHMMSS/<relative path>`
	TimestampFolder,

	/// `<name> YYYY-MM-DD HHMMSS<.ext>` in the mirrored subtree
	TimestampFile,
}

impl FromStr for VersioningStyle {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"replace" => Ok(Self::Replace),
			"timestamp-folder" | "folder" => Ok(Self::TimestampFolder),
			"timestamp-file" | "file" => Ok(Self::TimestampFile),
			_ => Err(format!(
				"Unknown versioning style: {}. Valid options: replace, timestamp-folder, timestamp-file",
				s
			)),
		}
	}
}

impl std::fmt::Display for VersioningStyle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Replace => write!(f, "replace"),
			Self::TimestampFolder => write!(f, "timestamp-folder"),
			Self::TimestampFile => write!(f, "timestamp-file"),
		}
	}
}

// ============================================================================
// SYMLINK POLICY
// ============================================================================

/// Symlink handling during traversal and sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SymlinkPolicy {
	/// Skip symlinks entirely
	Exclude,

	/// Sync the link itself (default)
	#[default]
	Direct,

	/// Follow the link and sync its target
	Follow,
}

impl FromStr for SymlinkPolicy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"exclude" | "skip" => Ok(Self::Exclude),
			"direct" | "preserve" => Ok(Self::Direct),
			"follow" => Ok(Self::Follow),
			_ => Err(format!(
				"Unknown symlink policy: {}. Valid options: exclude, direct, follow",
				s
			)),
		}
	}
}

impl std::fmt::Display for SymlinkPolicy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Exclude => write!(f, "exclude"),
			Self::Direct => write!(f, "direct"),
			Self::Follow => write!(f, "follow"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_compare_variant_from_str() {
		assert_eq!(CompareVariant::from_str("time-size").unwrap(), CompareVariant::TimeSize);
		assert_eq!(CompareVariant::from_str("content").unwrap(), CompareVariant::Content);
		assert_eq!(CompareVariant::from_str("size").unwrap(), CompareVariant::Size);
		assert!(CompareVariant::from_str("checksum").is_err());
	}

	#[test]
	fn test_direction_policy_from_str() {
		assert_eq!(DirectionPolicy::from_str("two-way").unwrap(), DirectionPolicy::TwoWay);
		assert_eq!(DirectionPolicy::from_str("mirror").unwrap(), DirectionPolicy::Mirror);
		assert_eq!(DirectionPolicy::from_str("update").unwrap(), DirectionPolicy::Update);
		assert!(DirectionPolicy::from_str("bogus").is_err());
	}

	#[test]
	fn test_mirror_table() {
		let table = DirectionConfig::mirror();
		assert_eq!(table.right_only, SyncDirection::Right);
		assert_eq!(table.conflict, SyncDirection::Right);
	}

	#[test]
	fn test_update_table_never_deletes() {
		let table = DirectionConfig::update();
		assert_eq!(table.right_only, SyncDirection::None);
		assert_eq!(table.right_newer, SyncDirection::None);
	}

	#[test]
	fn test_display_round_trip() {
		for policy in [DeletionPolicy::Permanent, DeletionPolicy::Recycler, DeletionPolicy::Versioning] {
			assert_eq!(DeletionPolicy::from_str(&policy.to_string()).unwrap(), policy);
		}
		for style in
			[VersioningStyle::Replace, VersioningStyle::TimestampFolder, VersioningStyle::TimestampFile]
		{
			assert_eq!(VersioningStyle::from_str(&style.to_string()).unwrap(), style);
		}
	}
}

// vim: ts=4
