//! Abstract paths and device identity
//!
//! A location is `(device, relative path)`. The device carries the backend
//! kind plus its addressing parameters; relative paths use `/` internally
//! and are converted to backend-native form at the backend boundary.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use crate::error::SyncError;

pub const FTP_DEFAULT_PORT: u16 = 21;
pub const SFTP_DEFAULT_PORT: u16 = 22;

/// Backend kind, in device ordering rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceKind {
	Local,
	Ftp,
	Sftp,
	GDrive,
}

/// Identity of a filesystem location's backend.
///
/// Two paths are on the same device iff their devices compare equal.
/// Hostnames compare case-insensitively in ASCII, usernames case-sensitively,
/// ports numerically. The ordering is total within one process run.
#[derive(Debug, Clone)]
pub enum Device {
	Local { root: PathBuf },
	Ftp { host: String, port: u16, user: String },
	Sftp { host: String, port: u16, user: String },
	GDrive { user: String },
}

fn cmp_host(lhs: &str, rhs: &str) -> Ordering {
	let l = lhs.bytes().map(|b| b.to_ascii_lowercase());
	let r = rhs.bytes().map(|b| b.to_ascii_lowercase());
	l.cmp(r)
}

impl Device {
	pub fn kind(&self) -> DeviceKind {
		match self {
			Device::Local { .. } => DeviceKind::Local,
			Device::Ftp { .. } => DeviceKind::Ftp,
			Device::Sftp { .. } => DeviceKind::Sftp,
			Device::GDrive { .. } => DeviceKind::GDrive,
		}
	}

	/// Display form of the device root (no relative part)
	pub fn display_root(&self) -> String {
		AbstractPath { device: self.clone(), rel: RelPath::root() }.display_path()
	}
}

impl Ord for Device {
	fn cmp(&self, other: &Self) -> Ordering {
		match (self, other) {
			(Device::Local { root: l }, Device::Local { root: r }) => l.cmp(r),
			(
				Device::Ftp { host: lh, port: lp, user: lu },
				Device::Ftp { host: rh, port: rp, user: ru },
			)
			| (
				Device::Sftp { host: lh, port: lp, user: lu },
				Device::Sftp { host: rh, port: rp, user: ru },
			) => cmp_host(lh, rh).then_with(|| lu.cmp(ru)).then_with(|| lp.cmp(rp)),
			(Device::GDrive { user: l }, Device::GDrive { user: r }) => l.cmp(r),
			_ => self.kind().cmp(&other.kind()),
		}
	}
}

impl PartialOrd for Device {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl PartialEq for Device {
	fn eq(&self, other: &Self) -> bool {
		self.cmp(other) == Ordering::Equal
	}
}

impl Eq for Device {}

impl Hash for Device {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.kind().hash(state);
		match self {
			Device::Local { root } => root.hash(state),
			Device::Ftp { host, port, user } | Device::Sftp { host, port, user } => {
				for b in host.bytes() {
					b.to_ascii_lowercase().hash(state);
				}
				user.hash(state);
				port.hash(state);
			}
			Device::GDrive { user } => user.hash(state),
		}
	}
}

/// Relative path with `/` as the internal canonical separator.
///
/// The empty path denotes the device root. A path is valid when it contains
/// no backslashes, does not start or end with the separator and has no empty
/// components.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct RelPath(String);

impl RelPath {
	pub fn root() -> Self {
		RelPath(String::new())
	}

	/// Build from an already canonical string; fails on invalid input
	pub fn new(s: &str) -> Result<Self, SyncError> {
		if !is_valid_rel_path(s) {
			return Err(SyncError::InvalidConfig { message: format!("Invalid relative path: {:?}", s) });
		}
		Ok(RelPath(s.to_string()))
	}

	pub fn is_root(&self) -> bool {
		self.0.is_empty()
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Last component; empty for the root
	pub fn item_name(&self) -> &str {
		match self.0.rfind('/') {
			Some(pos) => &self.0[pos + 1..],
			None => &self.0,
		}
	}

	/// Everything above the last component; None at the root
	pub fn parent(&self) -> Option<RelPath> {
		if self.0.is_empty() {
			return None;
		}
		match self.0.rfind('/') {
			Some(pos) => Some(RelPath(self.0[..pos].to_string())),
			None => Some(RelPath::root()),
		}
	}

	/// Append a single component or a canonical sub-path
	pub fn join(&self, rel: &str) -> RelPath {
		debug_assert!(is_valid_rel_path(rel) && !rel.is_empty());
		if self.0.is_empty() {
			RelPath(rel.to_string())
		} else {
			RelPath(format!("{}/{}", self.0, rel))
		}
	}

	pub fn components(&self) -> impl Iterator<Item = &str> {
		self.0.split('/').filter(|c| !c.is_empty())
	}

	/// Whether `other` equals this path or lies below it
	pub fn contains(&self, other: &RelPath) -> bool {
		if self.0.is_empty() {
			return true;
		}
		other.0 == self.0 || other.0.starts_with(&format!("{}/", self.0))
	}
}

impl fmt::Display for RelPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Validity rule: no backslashes, no leading/trailing separator, no empty
/// components. The empty string (device root) is valid.
pub fn is_valid_rel_path(s: &str) -> bool {
	if s.is_empty() {
		return true;
	}
	if s.contains('\\') || s.starts_with('/') || s.ends_with('/') {
		return false;
	}
	!s.split('/').any(|c| c.is_empty())
}

/// A backend-independent location
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AbstractPath {
	pub device: Device,
	pub rel: RelPath,
}

impl AbstractPath {
	pub fn new(device: Device, rel: RelPath) -> Self {
		AbstractPath { device, rel }
	}

	pub fn device_root(device: Device) -> Self {
		AbstractPath { device, rel: RelPath::root() }
	}

	/// Parent location; None at the device root
	pub fn parent(&self) -> Option<AbstractPath> {
		self.rel.parent().map(|rel| AbstractPath { device: self.device.clone(), rel })
	}

	pub fn join(&self, rel: &str) -> AbstractPath {
		AbstractPath { device: self.device.clone(), rel: self.rel.join(rel) }
	}

	/// Append a whole relative path; the root relative path is identity
	pub fn join_rel(&self, rel: &RelPath) -> AbstractPath {
		if rel.is_root() {
			self.clone()
		} else {
			self.join(rel.as_str())
		}
	}

	pub fn item_name(&self) -> &str {
		self.rel.item_name()
	}

	/// Total order: device first, then relative path
	pub fn cmp_path(&self, other: &AbstractPath) -> Ordering {
		self.device.cmp(&other.device).then_with(|| self.rel.cmp(&other.rel))
	}

	/// Whether `other` is this path or lies below it (same device)
	pub fn contains(&self, other: &AbstractPath) -> bool {
		self.device == other.device && self.rel.contains(&other.rel)
	}

	/// User-facing path string, backend-prefixed for network devices
	pub fn display_path(&self) -> String {
		match &self.device {
			Device::Local { root } => {
				let mut path = root.clone();
				for comp in self.rel.components() {
					path.push(comp);
				}
				path.display().to_string()
			}
			Device::Ftp { host, port, user } => {
				let mut s = String::from("ftp://");
				if !user.is_empty() {
					s.push_str(&encode_username(user));
					s.push('@');
				}
				s.push_str(host);
				if *port != FTP_DEFAULT_PORT {
					s.push_str(&format!(":{}", port));
				}
				if !self.rel.is_root() {
					s.push('/');
					s.push_str(self.rel.as_str());
				}
				s
			}
			Device::Sftp { host, port, user } => {
				let mut s = String::from("sftp://");
				if !user.is_empty() {
					s.push_str(&encode_username(user));
					s.push('@');
				}
				s.push_str(host);
				if *port != SFTP_DEFAULT_PORT {
					s.push_str(&format!(":{}", port));
				}
				if !self.rel.is_root() {
					s.push('/');
					s.push_str(self.rel.as_str());
				}
				s
			}
			Device::GDrive { user } => {
				let mut s = format!("gdrive:/{}", user);
				if !self.rel.is_root() {
					s.push('/');
					s.push_str(self.rel.as_str());
				}
				s
			}
		}
	}

	/// Parse a backend-prefixed path phrase.
	///
	/// Anything without a recognized scheme is taken as a local path; local
	/// paths must be absolute.
	pub fn parse(phrase: &str) -> Result<AbstractPath, SyncError> {
		let phrase = phrase.trim();
		if let Some(rest) = strip_scheme(phrase, "ftp://") {
			parse_network(rest, DeviceKind::Ftp)
		} else if let Some(rest) = strip_scheme(phrase, "sftp://") {
			parse_network(rest, DeviceKind::Sftp)
		} else if let Some(rest) = strip_scheme(phrase, "gdrive:/") {
			let (user, rel) = match rest.find('/') {
				Some(pos) => (&rest[..pos], rest[pos + 1..].trim_matches('/')),
				None => (rest, ""),
			};
			if user.is_empty() {
				return Err(SyncError::InvalidConfig {
					message: format!("Missing account in path phrase: {}", phrase),
				});
			}
			Ok(AbstractPath::new(
				Device::GDrive { user: decode_username(user) },
				RelPath::new(rel)?,
			))
		} else {
			let path = PathBuf::from(phrase);
			if !path.is_absolute() {
				return Err(SyncError::InvalidConfig {
					message: format!("Folder path must be absolute: {}", phrase),
				});
			}
			Ok(AbstractPath::device_root(Device::Local { root: path }))
		}
	}
}

impl fmt::Display for AbstractPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.display_path())
	}
}

fn strip_scheme<'a>(phrase: &'a str, scheme: &str) -> Option<&'a str> {
	if phrase.len() >= scheme.len() && phrase[..scheme.len()].eq_ignore_ascii_case(scheme) {
		Some(&phrase[scheme.len()..])
	} else {
		None
	}
}

fn parse_network(rest: &str, kind: DeviceKind) -> Result<AbstractPath, SyncError> {
	let (authority, rel) = match rest.find('/') {
		Some(pos) => (&rest[..pos], rest[pos + 1..].trim_matches('/')),
		None => (rest, ""),
	};

	let (user, host_port) = match authority.rfind('@') {
		Some(pos) => (decode_username(&authority[..pos]), &authority[pos + 1..]),
		None => (String::new(), authority),
	};

	let (host, port) = match host_port.rfind(':') {
		Some(pos) => {
			let port = host_port[pos + 1..].parse::<u16>().map_err(|_| SyncError::InvalidConfig {
				message: format!("Invalid port number in path phrase: {}", host_port),
			})?;
			(host_port[..pos].to_string(), Some(port))
		}
		None => (host_port.to_string(), None),
	};

	if host.is_empty() {
		return Err(SyncError::InvalidConfig {
			message: format!("Missing host name in path phrase: {}", rest),
		});
	}

	let rel = RelPath::new(rel)?;
	let device = match kind {
		DeviceKind::Ftp => Device::Ftp { host, port: port.unwrap_or(FTP_DEFAULT_PORT), user },
		DeviceKind::Sftp => Device::Sftp { host, port: port.unwrap_or(SFTP_DEFAULT_PORT), user },
		_ => unreachable!(),
	};
	Ok(AbstractPath::new(device, rel))
}

// ============================================================================
// USERNAME CODEC
// ============================================================================

/// Percent-escape `%`, `@` and `:` in a username, in that order
pub fn encode_username(user: &str) -> String {
	user.replace('%', "%25").replace('@', "%40").replace(':', "%3A")
}

/// Inverse of [`encode_username`]; hex digits are matched case-insensitively
pub fn decode_username(encoded: &str) -> String {
	fn replace_escape(s: &str, escape: &str, plain: char) -> String {
		let mut out = String::with_capacity(s.len());
		let mut i = 0;
		while i < s.len() {
			if let Some(candidate) = s.get(i..i + escape.len()) {
				if candidate.eq_ignore_ascii_case(escape) {
					out.push(plain);
					i += escape.len();
					continue;
				}
			}
			let ch = s[i..].chars().next().expect("index is on a char boundary");
			out.push(ch);
			i += ch.len_utf8();
		}
		out
	}

	let s = replace_escape(encoded, "%3A", ':');
	let s = replace_escape(&s, "%40", '@');
	replace_escape(&s, "%25", '%')
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_rel_path_validity() {
		assert!(is_valid_rel_path(""));
		assert!(is_valid_rel_path("a"));
		assert!(is_valid_rel_path("a/b/c"));
		assert!(!is_valid_rel_path("/a"));
		assert!(!is_valid_rel_path("a/"));
		assert!(!is_valid_rel_path("a//b"));
		assert!(!is_valid_rel_path("a\\b"));
	}

	#[test]
	fn test_rel_path_parent_and_name() {
		let p = RelPath::new("sub/dir/file.txt").unwrap();
		assert_eq!(p.item_name(), "file.txt");
		assert_eq!(p.parent().unwrap().as_str(), "sub/dir");

		let top = RelPath::new("file.txt").unwrap();
		assert_eq!(top.parent().unwrap(), RelPath::root());
		assert!(RelPath::root().parent().is_none());
	}

	#[test]
	fn test_device_ordering() {
		let local = Device::Local { root: PathBuf::from("/data") };
		let ftp = Device::Ftp { host: "example.com".into(), port: 21, user: "u".into() };
		let sftp = Device::Sftp { host: "example.com".into(), port: 22, user: "u".into() };
		assert!(local < ftp);
		assert!(ftp < sftp);
	}

	#[test]
	fn test_host_compare_case_insensitive() {
		let a = Device::Sftp { host: "Example.COM".into(), port: 22, user: "u".into() };
		let b = Device::Sftp { host: "example.com".into(), port: 22, user: "u".into() };
		assert_eq!(a, b);
	}

	#[test]
	fn test_user_compare_case_sensitive() {
		let a = Device::Sftp { host: "h".into(), port: 22, user: "User".into() };
		let b = Device::Sftp { host: "h".into(), port: 22, user: "user".into() };
		assert_ne!(a, b);
	}

	#[test]
	fn test_parse_sftp_phrase() {
		let p = AbstractPath::parse("sftp://alice@files.example.com/backup/photos").unwrap();
		match &p.device {
			Device::Sftp { host, port, user } => {
				assert_eq!(host, "files.example.com");
				assert_eq!(*port, SFTP_DEFAULT_PORT);
				assert_eq!(user, "alice");
			}
			other => panic!("unexpected device: {:?}", other),
		}
		assert_eq!(p.rel.as_str(), "backup/photos");
		assert_eq!(p.display_path(), "sftp://alice@files.example.com/backup/photos");
	}

	#[test]
	fn test_parse_ftp_with_port() {
		let p = AbstractPath::parse("ftp://bob@ftp.example.com:2121/pub").unwrap();
		match &p.device {
			Device::Ftp { host, port, user } => {
				assert_eq!(host, "ftp.example.com");
				assert_eq!(*port, 2121);
				assert_eq!(user, "bob");
			}
			other => panic!("unexpected device: {:?}", other),
		}
		assert_eq!(p.display_path(), "ftp://bob@ftp.example.com:2121/pub");
	}

	#[test]
	fn test_parse_gdrive_phrase() {
		let p = AbstractPath::parse("gdrive:/user@example.org/docs").unwrap();
		match &p.device {
			Device::GDrive { user } => assert_eq!(user, "user@example.org"),
			other => panic!("unexpected device: {:?}", other),
		}
		assert_eq!(p.rel.as_str(), "docs");
	}

	#[test]
	fn test_parse_local_requires_absolute() {
		assert!(AbstractPath::parse("relative/dir").is_err());
		assert!(AbstractPath::parse("/absolute/dir").is_ok());
	}

	#[test]
	fn test_username_codec_round_trip() {
		for s in ["plain", "user@host", "a:b%c@d", "%%%", "::@@", ""] {
			assert_eq!(decode_username(&encode_username(s)), s);
		}
	}

	#[test]
	fn test_username_encode_order() {
		// '%' is escaped first so its expansion is not re-escaped
		assert_eq!(encode_username("%40"), "%2540");
		assert_eq!(decode_username("%2540"), "%40");
	}

	#[test]
	fn test_username_decode_case_insensitive() {
		assert_eq!(decode_username("a%3ab"), "a:b");
		assert_eq!(decode_username("a%3Ab"), "a:b");
	}

	#[test]
	fn test_contains() {
		let base = AbstractPath::parse("/data/sync").unwrap();
		let inner = base.join("sub").join("x.txt");
		assert!(base.contains(&inner));
		assert!(!inner.contains(&base));

		let other = AbstractPath::parse("/data/sync2").unwrap();
		assert!(!base.contains(&other));
	}
}

// vim: ts=4
