//! Utility functions for bisync

use base64::engine::Engine;

/// Hash a buffer using BLAKE3 and return the base64-encoded digest
pub fn hash(buf: &[u8]) -> String {
	hash_to_base64(blake3::hash(buf).as_bytes())
}

/// Convert a binary digest to a base64 string
pub fn hash_to_base64(hash: &[u8; 32]) -> String {
	base64::engine::general_purpose::URL_SAFE.encode(hash)
}

/// Four lowercase hex digits derived from arbitrary bytes.
///
/// Used for the short collision-avoidance suffix of temporary copy targets.
pub fn short_hex_digest(buf: &[u8]) -> String {
	let digest = blake3::hash(buf);
	hex::encode(&digest.as_bytes()[..2])
}

/// Truncate a string by repeated halving until it holds at most `max_points`
/// Unicode code points. Short inputs are returned unchanged, so that
/// name-length problems surface immediately instead of being masked.
pub fn truncate_code_points(name: &str, max_points: usize) -> String {
	let mut result = name.to_string();
	loop {
		let len = result.chars().count();
		if len <= max_points {
			return result;
		}
		result = result.chars().take(len / 2).collect();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_hash_deterministic() {
		let a = hash(b"payload");
		let b = hash(b"payload");
		assert_eq!(a, b);
		assert_eq!(a.len(), 44);
	}

	#[test]
	fn test_hash_distinguishes_inputs() {
		assert_ne!(hash(b"one"), hash(b"two"));
	}

	#[test]
	fn test_short_hex_digest() {
		let d = short_hex_digest(b"some-guid-bytes");
		assert_eq!(d.len(), 4);
		assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
	}

	#[test]
	fn test_truncate_keeps_short_names() {
		assert_eq!(truncate_code_points("report.txt", 200), "report.txt");
		assert_eq!(truncate_code_points("", 200), "");
	}

	#[test]
	fn test_truncate_halves_long_names() {
		let long: String = std::iter::repeat('x').take(300).collect();
		let cut = truncate_code_points(&long, 200);
		assert_eq!(cut.chars().count(), 150);
	}

	#[test]
	fn test_truncate_is_code_point_aware() {
		let long: String = std::iter::repeat('ű').take(250).collect();
		let cut = truncate_code_points(&long, 200);
		assert_eq!(cut.chars().count(), 125);
		assert!(cut.chars().all(|c| c == 'ű'));
	}
}

// vim: ts=4
