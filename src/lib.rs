//! # bisync - Bi-directional Folder Synchronizer
//!
//! bisync compares two folder trees reachable through pluggable backends
//! (local filesystem, SFTP), classifies every differing item, resolves a
//! sync direction per item — either by fixed policy or database-driven
//! two-way change detection — and executes copies, deletions and moves with
//! transactional overwrite, optional versioning of replaced content and
//! per-device parallelism caps.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bisync::config::{Config, FolderPairConfig};
//! use bisync::progress::CliStatusHandler;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         folder_pairs: vec![FolderPairConfig {
//!             left: "/data/photos".into(),
//!             right: "/backup/photos".into(),
//!         }],
//!         ..Default::default()
//!     };
//!     let handler = Arc::new(CliStatusHandler::new(false));
//!     let result = bisync::sync::synchronize(&config, handler).await?;
//!     println!("{} operations", result.operations());
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

pub mod afs;
pub mod compare;
pub mod config;
pub mod db;
pub mod dependency;
pub mod error;
pub mod executor;
pub mod filter;
pub mod logging;
pub mod path;
pub mod progress;
pub mod resolve;
pub mod session;
pub mod status;
pub mod strategies; // consolidated strategy/mode enums - declared early to avoid circular deps
pub mod sync;
pub mod tempbuf;
pub mod transact;
pub mod traverse;
pub mod tree;
pub mod util;
pub mod versioning;

// Re-export commonly used types and functions
pub use config::{Config, FolderPairConfig};
pub use error::{AbortTrigger, DbError, FsError, FsErrorKind, SyncError};
pub use path::{AbstractPath, Device, RelPath};
pub use status::{ErrorDecision, Phase, StatusHandler};
pub use strategies::{
	CompareVariant, DeletionPolicy, DirectionConfig, DirectionPolicy, SymlinkPolicy, SyncDirection,
	VersioningStyle,
};
pub use sync::{synchronize, SyncRunResult};
pub use tree::{BaseFolderPair, Category};

// vim: ts=4
