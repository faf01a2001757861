//! Unified configuration for bisync runs
//!
//! One struct is the single source of truth: folder pairs, compare
//! settings, filters, deletion handling, versioning, retry policy and
//! per-device parallelism. Defaults come from `Config::default()`; the
//! binary may layer a TOML profile and CLI flags on top.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::SyncError;
use crate::filter::{SoftFilter, TimeSpan};
use crate::strategies::{
	CompareVariant, DeletionPolicy, DirectionPolicy, SymlinkPolicy, VersioningStyle,
};
use crate::versioning::VersioningLimits;

/// One folder pair, as path phrases (`/local/path`, `sftp://user@host/dir`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FolderPairConfig {
	pub left: String,
	pub right: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	// ========================================================================
	// FOLDER PAIRS
	// ========================================================================
	pub folder_pairs: Vec<FolderPairConfig>,

	// ========================================================================
	// COMPARISON
	// ========================================================================
	/// How file equality is judged
	pub compare_variant: CompareVariant,

	/// Modification-time tolerance in seconds (FAT stores 2-second stamps)
	pub file_time_tolerance_secs: i64,

	/// Whole-minute offsets additionally treated as equal (DST shifts)
	pub ignore_time_shift_minutes: Vec<u32>,

	/// Symlink handling during traversal and sync
	pub symlink_policy: SymlinkPolicy,

	// ========================================================================
	// DIRECTION POLICY
	// ========================================================================
	pub direction_policy: DirectionPolicy,

	/// Pair moved/renamed files via the database instead of copy + delete
	pub detect_moved_files: bool,

	// ========================================================================
	// FILTERS
	// ========================================================================
	/// Glob patterns over relative paths; empty means include everything
	pub include_patterns: Vec<String>,

	pub exclude_patterns: Vec<String>,

	/// Soft filter: time span of the modification time
	pub time_span: Option<TimeSpan>,

	/// Soft filter: size range in bytes
	pub min_size: Option<u64>,
	pub max_size: Option<u64>,

	// ========================================================================
	// DELETION & VERSIONING
	// ========================================================================
	pub deletion_policy: DeletionPolicy,

	/// Versioning tree root (path phrase); required by the versioning policy
	pub versioning_folder: Option<String>,

	pub versioning_style: VersioningStyle,

	/// 0 disables the respective limit
	pub version_max_age_days: u32,
	pub version_count_min: u32,
	pub version_count_max: u32,

	// ========================================================================
	// ERROR HANDLING
	// ========================================================================
	/// Transient errors are retried this many times before surfacing
	pub automatic_retry_count: usize,

	pub automatic_retry_delay_secs: u64,

	// ========================================================================
	// RESOURCES
	// ========================================================================
	/// Parallel operations per device, keyed by the device's display root
	pub device_parallelism: BTreeMap<String, usize>,

	pub default_parallelism: usize,

	/// Copy into a temp sibling and rename into place (disable only for
	/// backends where direct overwrite is preferable)
	pub fail_safe_file_copy: bool,

	/// Copy permissions where both sides share a backend type
	pub copy_permissions: bool,

	// ========================================================================
	// NETWORK CREDENTIALS
	// ========================================================================
	/// Password for SFTP devices of this run (TOML profile or environment;
	/// never part of the path phrase)
	#[serde(skip_serializing_if = "Option::is_none")]
	pub sftp_password: Option<String>,

	/// Negotiate zlib compression on SFTP sessions
	pub sftp_compress: bool,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			folder_pairs: Vec::new(),
			compare_variant: CompareVariant::TimeSize,
			file_time_tolerance_secs: 2,
			ignore_time_shift_minutes: Vec::new(),
			symlink_policy: SymlinkPolicy::Direct,
			direction_policy: DirectionPolicy::TwoWay,
			detect_moved_files: true,
			include_patterns: Vec::new(),
			exclude_patterns: Vec::new(),
			time_span: None,
			min_size: None,
			max_size: None,
			deletion_policy: DeletionPolicy::Recycler,
			versioning_folder: None,
			versioning_style: VersioningStyle::Replace,
			version_max_age_days: 0,
			version_count_min: 0,
			version_count_max: 0,
			automatic_retry_count: 0,
			automatic_retry_delay_secs: 5,
			device_parallelism: BTreeMap::new(),
			default_parallelism: 1,
			fail_safe_file_copy: true,
			copy_permissions: false,
			sftp_password: None,
			sftp_compress: false,
		}
	}
}

impl Config {
	pub fn soft_filter(&self) -> SoftFilter {
		SoftFilter { time_span: self.time_span, min_size: self.min_size, max_size: self.max_size }
	}

	pub fn versioning_limits(&self) -> VersioningLimits {
		VersioningLimits {
			max_age_days: self.version_max_age_days,
			count_min: self.version_count_min,
			count_max: self.version_count_max,
		}
	}

	pub fn validate(&self) -> Result<(), SyncError> {
		if self.folder_pairs.is_empty() {
			return Err(SyncError::InvalidConfig {
				message: "At least one folder pair is required".to_string(),
			});
		}
		for pair in &self.folder_pairs {
			if pair.left.trim().is_empty() || pair.right.trim().is_empty() {
				return Err(SyncError::InvalidConfig {
					message: "Folder pair with an empty side".to_string(),
				});
			}
		}
		if self.file_time_tolerance_secs < 0 {
			return Err(SyncError::InvalidConfig {
				message: "File time tolerance must not be negative".to_string(),
			});
		}
		if self.deletion_policy == DeletionPolicy::Versioning && self.versioning_folder.is_none() {
			return Err(SyncError::InvalidConfig {
				message: "Versioning requires a versioning folder".to_string(),
			});
		}
		if let (Some(min), Some(max)) = (self.min_size, self.max_size) {
			if min > max {
				return Err(SyncError::InvalidConfig {
					message: "Minimum file size exceeds the maximum".to_string(),
				});
			}
		}
		self.versioning_limits().validate()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn with_pair() -> Config {
		Config {
			folder_pairs: vec![FolderPairConfig { left: "/a".into(), right: "/b".into() }],
			..Default::default()
		}
	}

	#[test]
	fn test_defaults_are_valid_once_pairs_exist() {
		assert!(Config::default().validate().is_err());
		assert!(with_pair().validate().is_ok());
	}

	#[test]
	fn test_versioning_policy_requires_folder() {
		let mut config = with_pair();
		config.deletion_policy = DeletionPolicy::Versioning;
		assert!(config.validate().is_err());
		config.versioning_folder = Some("/versions".into());
		assert!(config.validate().is_ok());
	}

	#[test]
	fn test_version_count_floor_must_stay_below_ceiling() {
		let mut config = with_pair();
		config.version_count_min = 5;
		config.version_count_max = 5;
		assert!(config.validate().is_err());
		config.version_count_max = 6;
		assert!(config.validate().is_ok());
	}

	#[test]
	fn test_size_range_sanity() {
		let mut config = with_pair();
		config.min_size = Some(100);
		config.max_size = Some(10);
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_serde_round_trip() {
		let config = with_pair();
		let json = serde_json::to_string(&config).unwrap();
		let back: Config = serde_json::from_str(&json).unwrap();
		assert_eq!(back.folder_pairs.len(), 1);
		assert_eq!(back.file_time_tolerance_secs, 2);
	}
}

// vim: ts=4
