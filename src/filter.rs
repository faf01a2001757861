//! Hard and soft filters
//!
//! The hard filter (include/exclude glob patterns over relative paths)
//! decides which items exist for the engine at all: excluded subtrees are
//! not even enumerated. The soft filter (time span, size range) only clears
//! the active flag of surviving pairs; it never removes them.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::afs::FileAttrs;
use crate::error::SyncError;
use crate::path::RelPath;

/// Include/exclude path patterns applied at traversal time and again after
/// the merge.
#[derive(Debug)]
pub struct PathFilter {
	/// None means "include everything"
	include: Option<GlobSet>,
	exclude: GlobSet,
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet, SyncError> {
	let mut builder = GlobSetBuilder::new();
	for pattern in patterns {
		let glob = Glob::new(pattern).map_err(|e| SyncError::InvalidConfig {
			message: format!("Invalid filter pattern {}: {}", pattern, e),
		})?;
		builder.add(glob);
	}
	builder.build().map_err(|e| SyncError::InvalidConfig {
		message: format!("Cannot compile filter patterns: {}", e),
	})
}

impl PathFilter {
	pub fn new(include: &[String], exclude: &[String]) -> Result<Self, SyncError> {
		let include = if include.is_empty() { None } else { Some(build_glob_set(include)?) };
		Ok(PathFilter { include, exclude: build_glob_set(exclude)? })
	}

	/// Filter letting everything through
	pub fn pass_all() -> Self {
		PathFilter::new(&[], &[]).expect("empty pattern set always compiles")
	}

	/// Whether a file or symlink at `rel` takes part in the sync
	pub fn passes_item(&self, rel: &RelPath) -> bool {
		if self.exclude.is_match(rel.as_str()) {
			return false;
		}
		match &self.include {
			Some(include) => include.is_match(rel.as_str()),
			None => true,
		}
	}

	/// Whether a folder at `rel` is traversed. An excluded folder prunes its
	/// whole subtree.
	pub fn passes_folder(&self, rel: &RelPath) -> bool {
		!self.exclude.is_match(rel.as_str())
	}

	/// Pruning hint: could anything below this folder still match? With an
	/// include set a folder is descended even when the folder itself does
	/// not match, because a deeper path may.
	pub fn child_might_match(&self, rel: &RelPath) -> bool {
		self.passes_folder(rel)
	}
}

/// Time-span selector of the soft filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeSpan {
	Today,
	ThisMonth,
	ThisYear,
	LastDays(u32),
}

/// Soft filter: drives the active flag only
#[derive(Debug, Clone, Default)]
pub struct SoftFilter {
	pub time_span: Option<TimeSpan>,
	pub min_size: Option<u64>,
	pub max_size: Option<u64>,
}

impl SoftFilter {
	pub fn is_null(&self) -> bool {
		self.time_span.is_none() && self.min_size.is_none() && self.max_size.is_none()
	}

	/// Earliest modification time still inside the span, relative to `now`
	/// (local time).
	fn time_from(&self, now: chrono::DateTime<chrono::Local>) -> Option<i64> {
		use chrono::{Datelike, NaiveTime, TimeZone};

		let span = self.time_span?;
		let midnight = now
			.with_time(NaiveTime::MIN)
			.single()
			.unwrap_or(now);
		let from = match span {
			TimeSpan::Today => midnight.timestamp(),
			TimeSpan::LastDays(days) => midnight.timestamp() - i64::from(days) * 24 * 3600,
			TimeSpan::ThisMonth => chrono::Local
				.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
				.single()
				.map(|t| t.timestamp())
				.unwrap_or(0),
			TimeSpan::ThisYear => chrono::Local
				.with_ymd_and_hms(now.year(), 1, 1, 0, 0, 0)
				.single()
				.map(|t| t.timestamp())
				.unwrap_or(0),
		};
		Some(from)
	}

	/// Whether one side's file attributes fall inside the filter
	pub fn matches_side(&self, attrs: &FileAttrs) -> bool {
		self.matches_side_at(attrs, chrono::Local::now())
	}

	fn matches_side_at(&self, attrs: &FileAttrs, now: chrono::DateTime<chrono::Local>) -> bool {
		if let Some(from) = self.time_from(now) {
			if attrs.mtime < from {
				return false;
			}
		}
		if let Some(min) = self.min_size {
			if attrs.size < min {
				return false;
			}
		}
		if let Some(max) = self.max_size {
			if attrs.size > max {
				return false;
			}
		}
		true
	}

	/// Pair rule: with both sides present one matching side suffices;
	/// single-sided pairs are judged by the existing side.
	pub fn matches_pair(&self, left: Option<&FileAttrs>, right: Option<&FileAttrs>) -> bool {
		match (left, right) {
			(Some(l), Some(r)) => self.matches_side(l) || self.matches_side(r),
			(Some(l), None) => self.matches_side(l),
			(None, Some(r)) => self.matches_side(r),
			(None, None) => true,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rel(s: &str) -> RelPath {
		RelPath::new(s).unwrap()
	}

	fn attrs(size: u64, mtime: i64) -> FileAttrs {
		FileAttrs { size, mtime, fingerprint: String::new() }
	}

	#[test]
	fn test_exclude_wins() {
		let filter = PathFilter::new(&[], &["**/*.tmp".to_string()]).unwrap();
		assert!(!filter.passes_item(&rel("work/cache.tmp")));
		assert!(filter.passes_item(&rel("work/report.txt")));
	}

	#[test]
	fn test_include_restricts() {
		let filter = PathFilter::new(&["**/*.rs".to_string()], &[]).unwrap();
		assert!(filter.passes_item(&rel("src/main.rs")));
		assert!(!filter.passes_item(&rel("README.md")));
		// folders are still descended: a deeper path may match
		assert!(filter.child_might_match(&rel("src")));
	}

	#[test]
	fn test_excluded_folder_prunes_subtree() {
		let filter = PathFilter::new(&[], &["node_modules".to_string()]).unwrap();
		assert!(!filter.passes_folder(&rel("node_modules")));
		assert!(!filter.child_might_match(&rel("node_modules")));
		assert!(filter.passes_folder(&rel("src")));
	}

	#[test]
	fn test_soft_filter_size_range() {
		let filter = SoftFilter { min_size: Some(10), max_size: Some(100), ..Default::default() };
		assert!(!filter.matches_side(&attrs(5, 0)));
		assert!(filter.matches_side(&attrs(50, 0)));
		assert!(!filter.matches_side(&attrs(500, 0)));
	}

	#[test]
	fn test_soft_filter_pair_uses_or() {
		let filter = SoftFilter { min_size: Some(10), ..Default::default() };
		let small = attrs(1, 0);
		let big = attrs(100, 0);
		assert!(filter.matches_pair(Some(&small), Some(&big)));
		assert!(filter.matches_pair(Some(&big), None));
		assert!(!filter.matches_pair(Some(&small), None));
		assert!(!filter.matches_pair(Some(&small), Some(&small)));
	}

	#[test]
	fn test_soft_filter_time_span() {
		let filter = SoftFilter { time_span: Some(TimeSpan::LastDays(7)), ..Default::default() };
		let now = chrono::Local::now();
		let recent = attrs(1, now.timestamp() - 3600);
		let ancient = attrs(1, now.timestamp() - 365 * 24 * 3600);
		assert!(filter.matches_side(&recent));
		assert!(!filter.matches_side(&ancient));
	}

	#[test]
	fn test_null_soft_filter_matches_everything() {
		let filter = SoftFilter::default();
		assert!(filter.is_null());
		assert!(filter.matches_side(&attrs(0, -100)));
	}
}

// vim: ts=4
