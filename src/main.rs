use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use bisync::config::{Config, FolderPairConfig};
use bisync::logging;
use bisync::progress::CliStatusHandler;
use bisync::strategies::{CompareVariant, DeletionPolicy, DirectionPolicy, VersioningStyle};
use bisync::sync;

#[derive(Parser)]
#[command(name = "bisync", version, about = "Bi-directional folder synchronizer")]
struct Cli {
	/// TOML profile holding the full configuration
	#[arg(short, long, value_name = "FILE")]
	profile: Option<PathBuf>,

	#[command(subcommand)]
	command: Commands,
}

#[derive(clap::Args)]
struct CommonOpts {
	/// Left base folder (path or sftp://user@host/dir)
	left: Option<String>,

	/// Right base folder
	right: Option<String>,

	/// Compare variant: time-size, content, size
	#[arg(long, value_name = "VARIANT")]
	compare: Option<String>,

	/// Exclude pattern (repeatable)
	#[arg(long = "exclude", value_name = "GLOB")]
	exclude: Vec<String>,

	/// Include pattern (repeatable; empty means everything)
	#[arg(long = "include", value_name = "GLOB")]
	include: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
	/// Compare folder pairs and list the differences
	Compare {
		#[command(flatten)]
		common: CommonOpts,
	},

	/// List the file versions stored in a versioning tree
	Versions {
		/// Versioning tree root (path or sftp://user@host/dir)
		folder: String,
	},

	/// Compare and synchronize folder pairs
	Sync {
		#[command(flatten)]
		common: CommonOpts,

		/// Direction policy: two-way, mirror, update
		#[arg(long, value_name = "POLICY")]
		mode: Option<String>,

		/// Deletion handling: permanent, recycler, versioning
		#[arg(long, value_name = "POLICY")]
		delete: Option<String>,

		/// Versioning tree root (implies --delete versioning)
		#[arg(long, value_name = "FOLDER")]
		versioning_folder: Option<String>,

		/// Versioning style: replace, timestamp-folder, timestamp-file
		#[arg(long, value_name = "STYLE")]
		versioning_style: Option<String>,

		/// Automatic retries for transient errors
		#[arg(long, value_name = "N")]
		retries: Option<usize>,

		/// Parallel operations per device
		#[arg(long, value_name = "N")]
		parallel: Option<usize>,

		/// Abort the run on the first unrecoverable error
		#[arg(long)]
		abort_on_error: bool,

		/// Disable move/rename detection
		#[arg(long)]
		no_move_detection: bool,
	},
}

fn load_profile(path: &PathBuf) -> Result<Config, Box<dyn Error>> {
	let text = std::fs::read_to_string(path)?;
	Ok(toml::from_str(&text)?)
}

fn apply_common(config: &mut Config, common: &CommonOpts) -> Result<(), Box<dyn Error>> {
	if let (Some(left), Some(right)) = (&common.left, &common.right) {
		config.folder_pairs =
			vec![FolderPairConfig { left: left.clone(), right: right.clone() }];
	}
	if let Some(variant) = &common.compare {
		config.compare_variant = CompareVariant::from_str(variant)?;
	}
	if !common.exclude.is_empty() {
		config.exclude_patterns = common.exclude.clone();
	}
	if !common.include.is_empty() {
		config.include_patterns = common.include.clone();
	}
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	logging::init_tracing();
	let cli = Cli::parse();

	let mut config = match &cli.profile {
		Some(path) => load_profile(path)?,
		None => Config::default(),
	};

	match &cli.command {
		Commands::Compare { common } => {
			apply_common(&mut config, common)?;
			let handler = Arc::new(CliStatusHandler::new(false));
			let run = sync::compare(&config, handler).await?;
			print!("{}", sync::format_differences(&run.bases));
			run.shutdown().await;
		}

		Commands::Versions { folder } => {
			let handler = Arc::new(CliStatusHandler::new(false));
			let versions = sync::list_versions(&config, folder, handler).await?;
			if versions.is_empty() {
				eprintln!("no stored versions under {}", folder);
			}
			for (original, stored) in &versions {
				println!("{}", original);
				for version in stored {
					println!("\t{}\t{}", version.stamp(), version.path.display_path());
				}
			}
		}

		Commands::Sync {
			common,
			mode,
			delete,
			versioning_folder,
			versioning_style,
			retries,
			parallel,
			abort_on_error,
			no_move_detection,
		} => {
			apply_common(&mut config, common)?;
			if let Some(mode) = mode {
				config.direction_policy = DirectionPolicy::from_str(mode)?;
			}
			if let Some(delete) = delete {
				config.deletion_policy = DeletionPolicy::from_str(delete)?;
			}
			if let Some(folder) = versioning_folder {
				config.versioning_folder = Some(folder.clone());
				config.deletion_policy = DeletionPolicy::Versioning;
			}
			if let Some(style) = versioning_style {
				config.versioning_style = VersioningStyle::from_str(style)?;
			}
			if let Some(retries) = retries {
				config.automatic_retry_count = *retries;
			}
			if let Some(parallel) = parallel {
				config.default_parallelism = *parallel;
			}
			if config.sftp_password.is_none() {
				config.sftp_password = std::env::var("BISYNC_SFTP_PASSWORD").ok();
			}
			config.detect_moved_files = !no_move_detection;

			let handler = Arc::new(CliStatusHandler::new(*abort_on_error));
			let result = sync::synchronize(&config, handler).await?;

			eprintln!();
			println!(
				"{} copied, {} folders created, {} deleted, {} moved, {} renamed, {} bytes",
				result.files_copied,
				result.folders_created,
				result.items_deleted,
				result.items_moved,
				result.metadata_updates,
				result.bytes_copied
			);
			if result.conflicts > 0 {
				println!("{} conflicts left unresolved", result.conflicts);
			}
			if !result.errors.is_empty() {
				println!("{} errors ignored", result.errors.len());
				std::process::exit(1);
			}
		}
	}
	Ok(())
}

// vim: ts=4
