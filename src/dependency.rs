//! Folder-pair dependency checks
//!
//! A folder pair whose base is contained in another pair's base would be
//! written twice in one run; versioning into a synced tree would feed the
//! versioning folder back into the sync. The former is surfaced as a
//! warning, the latter refuses the configuration.

use crate::error::SyncError;
use crate::path::AbstractPath;

/// One configured folder pair's resolved bases
#[derive(Debug, Clone)]
pub struct PairBases {
	pub left: AbstractPath,
	pub right: AbstractPath,
}

fn overlapping(a: &AbstractPath, b: &AbstractPath) -> bool {
	a.contains(b) || b.contains(a)
}

/// Warnings for folder pairs that share or nest their bases
pub fn check_pair_dependencies(pairs: &[PairBases]) -> Vec<String> {
	let mut warnings = Vec::new();

	for pair in pairs {
		if overlapping(&pair.left, &pair.right) {
			warnings.push(format!(
				"The folder pair is self-dependent: {} <-> {}",
				pair.left.display_path(),
				pair.right.display_path()
			));
		}
	}

	for (i, a) in pairs.iter().enumerate() {
		for b in &pairs[i + 1..] {
			for (x, y) in [
				(&a.left, &b.left),
				(&a.left, &b.right),
				(&a.right, &b.left),
				(&a.right, &b.right),
			] {
				if overlapping(x, y) {
					warnings.push(format!(
						"Folder pairs depend on each other: {} <-> {}",
						x.display_path(),
						y.display_path()
					));
				}
			}
		}
	}
	warnings
}

/// Refuse a versioning target inside a synced tree (or containing one)
pub fn check_versioning_dependencies(
	pairs: &[PairBases],
	versioning_root: &AbstractPath,
) -> Result<(), SyncError> {
	for pair in pairs {
		for base in [&pair.left, &pair.right] {
			if overlapping(base, versioning_root) {
				return Err(SyncError::DependentFolderPair {
					first: base.display_path(),
					second: versioning_root.display_path(),
				});
			}
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pair(left: &str, right: &str) -> PairBases {
		PairBases {
			left: AbstractPath::parse(left).unwrap(),
			right: AbstractPath::parse(right).unwrap(),
		}
	}

	#[test]
	fn test_independent_pairs_are_quiet() {
		let pairs = [pair("/data/a", "/backup/a"), pair("/data/b", "/backup/b")];
		assert!(check_pair_dependencies(&pairs).is_empty());
	}

	#[test]
	fn test_nested_pairs_warn() {
		let pairs = [pair("/data", "/backup"), pair("/data/sub", "/mirror")];
		let warnings = check_pair_dependencies(&pairs);
		assert_eq!(warnings.len(), 1);
		assert!(warnings[0].contains("/data"));
	}

	#[test]
	fn test_self_dependent_pair_warns() {
		let pairs = [pair("/data", "/data/inner")];
		let warnings = check_pair_dependencies(&pairs);
		assert_eq!(warnings.len(), 1);
		assert!(warnings[0].contains("self-dependent"));
	}

	#[test]
	fn test_versioning_inside_synced_tree_is_refused() {
		let pairs = [pair("/data", "/backup")];
		let versioning = AbstractPath::parse("/data/versions").unwrap();
		assert!(check_versioning_dependencies(&pairs, &versioning).is_err());

		let outside = AbstractPath::parse("/versions").unwrap();
		assert!(check_versioning_dependencies(&pairs, &outside).is_ok());
	}

	#[test]
	fn test_same_prefix_different_folder_is_independent() {
		// "/data/sync" vs "/data/sync2": string prefix, not path prefix
		let pairs = [pair("/data/sync", "/x"), pair("/data/sync2", "/y")];
		assert!(check_pair_dependencies(&pairs).is_empty());
	}
}

// vim: ts=4
