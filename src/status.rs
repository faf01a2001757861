//! Status handler surface
//!
//! One object receives every phase change, progress tick, warning and error
//! of a run. Workers poll it for abort at each suspension point; the
//! decision returned by `report_error` drives the retry/ignore/abort loop
//! in the executor.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{AbortTrigger, SyncError};
use crate::logging::*;

/// Run phases with per-phase item/byte totals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	None,
	Scanning,
	ComparingContent,
	Synchronizing,
}

impl std::fmt::Display for Phase {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Phase::None => write!(f, "none"),
			Phase::Scanning => write!(f, "scanning"),
			Phase::ComparingContent => write!(f, "comparing content"),
			Phase::Synchronizing => write!(f, "synchronizing"),
		}
	}
}

/// What the user (or policy) decided about a surfaced error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDecision {
	Ignore,
	IgnoreAll,
	Retry,
	Abort,
}

/// Progress bookkeeping of one phase
#[derive(Debug, Default)]
pub struct ProgressCounters {
	pub items_processed: AtomicU64,
	pub bytes_processed: AtomicU64,
	pub items_total: AtomicU64,
	pub bytes_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
	pub items_processed: u64,
	pub bytes_processed: u64,
	pub items_total: u64,
	pub bytes_total: u64,
}

impl ProgressCounters {
	pub fn snapshot(&self) -> ProgressSnapshot {
		ProgressSnapshot {
			items_processed: self.items_processed.load(Ordering::Relaxed),
			bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
			items_total: self.items_total.load(Ordering::Relaxed),
			bytes_total: self.bytes_total.load(Ordering::Relaxed),
		}
	}

	pub fn reset(&self, items_total: u64, bytes_total: u64) {
		self.items_processed.store(0, Ordering::Relaxed);
		self.bytes_processed.store(0, Ordering::Relaxed);
		self.items_total.store(items_total, Ordering::Relaxed);
		self.bytes_total.store(bytes_total, Ordering::Relaxed);
	}
}

/// The single object a run reports everything through
pub trait StatusHandler: Send + Sync {
	fn init_phase(&self, items_total: u64, bytes_total: u64, phase: Phase);

	fn update_processed(&self, items: u64, bytes: u64);

	/// Totals may grow while a phase runs (e.g. late-found items)
	fn update_total(&self, items: u64, bytes: u64);

	fn report_status(&self, text: &str);

	fn log_info(&self, text: &str);

	/// `warning_active` lets the receiver disable a warning category for the
	/// rest of the run
	fn report_warning(&self, text: &str, warning_active: &mut bool);

	fn report_error(&self, text: &str, retry_number: usize) -> ErrorDecision;

	fn request_abort(&self, trigger: AbortTrigger);

	fn abort_requested(&self) -> Option<AbortTrigger>;

	/// Suspension-point check; unwinds workers cooperatively
	fn abort_if_requested(&self) -> Result<(), SyncError> {
		match self.abort_requested() {
			Some(trigger) => Err(SyncError::Aborted(trigger)),
			None => Ok(()),
		}
	}
}

const ABORT_NONE: u8 = 0;
const ABORT_USER: u8 = 1;
const ABORT_PROGRAM: u8 = 2;

/// Headless handler: counters plus tracing output.
///
/// Errors beyond the automatic retries are ignored or aborted depending on
/// `abort_on_error`; interactive decisions belong to a fancier frontend.
pub struct LogStatusHandler {
	pub counters: ProgressCounters,
	phase: Mutex<Phase>,
	abort: AtomicU8,
	abort_on_error: bool,
	errors_seen: AtomicUsize,
}

impl LogStatusHandler {
	pub fn new(abort_on_error: bool) -> Self {
		LogStatusHandler {
			counters: ProgressCounters::default(),
			phase: Mutex::new(Phase::None),
			abort: AtomicU8::new(ABORT_NONE),
			abort_on_error,
			errors_seen: AtomicUsize::new(0),
		}
	}

	pub fn current_phase(&self) -> Phase {
		*self.phase.lock().unwrap_or_else(|e| e.into_inner())
	}

	pub fn error_count(&self) -> usize {
		self.errors_seen.load(Ordering::Relaxed)
	}
}

impl StatusHandler for LogStatusHandler {
	fn init_phase(&self, items_total: u64, bytes_total: u64, phase: Phase) {
		*self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
		self.counters.reset(items_total, bytes_total);
		info!("phase: {} ({} items, {} bytes)", phase, items_total, bytes_total);
	}

	fn update_processed(&self, items: u64, bytes: u64) {
		self.counters.items_processed.fetch_add(items, Ordering::Relaxed);
		self.counters.bytes_processed.fetch_add(bytes, Ordering::Relaxed);
	}

	fn update_total(&self, items: u64, bytes: u64) {
		self.counters.items_total.fetch_add(items, Ordering::Relaxed);
		self.counters.bytes_total.fetch_add(bytes, Ordering::Relaxed);
	}

	fn report_status(&self, text: &str) {
		debug!("{}", text);
	}

	fn log_info(&self, text: &str) {
		info!("{}", text);
	}

	fn report_warning(&self, text: &str, warning_active: &mut bool) {
		if *warning_active {
			warn!("{}", text);
		}
	}

	fn report_error(&self, text: &str, retry_number: usize) -> ErrorDecision {
		self.errors_seen.fetch_add(1, Ordering::Relaxed);
		error!("{} (retry {})", text, retry_number);
		if self.abort_on_error {
			ErrorDecision::Abort
		} else {
			ErrorDecision::Ignore
		}
	}

	fn request_abort(&self, trigger: AbortTrigger) {
		let value = match trigger {
			AbortTrigger::User => ABORT_USER,
			AbortTrigger::Program => ABORT_PROGRAM,
		};
		self.abort.store(value, Ordering::SeqCst);
	}

	fn abort_requested(&self) -> Option<AbortTrigger> {
		match self.abort.load(Ordering::SeqCst) {
			ABORT_USER => Some(AbortTrigger::User),
			ABORT_PROGRAM => Some(AbortTrigger::Program),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_counters() {
		let handler = LogStatusHandler::new(false);
		handler.init_phase(10, 1000, Phase::Synchronizing);
		handler.update_processed(2, 300);
		handler.update_total(1, 50);

		let snap = handler.counters.snapshot();
		assert_eq!(snap.items_processed, 2);
		assert_eq!(snap.bytes_processed, 300);
		assert_eq!(snap.items_total, 11);
		assert_eq!(snap.bytes_total, 1050);
		assert_eq!(handler.current_phase(), Phase::Synchronizing);
	}

	#[test]
	fn test_abort_flow() {
		let handler = LogStatusHandler::new(false);
		assert!(handler.abort_if_requested().is_ok());

		handler.request_abort(AbortTrigger::User);
		assert_eq!(handler.abort_requested(), Some(AbortTrigger::User));
		assert!(matches!(
			handler.abort_if_requested(),
			Err(SyncError::Aborted(AbortTrigger::User))
		));
	}

	#[test]
	fn test_error_decision_policy() {
		let ignoring = LogStatusHandler::new(false);
		assert_eq!(ignoring.report_error("boom", 0), ErrorDecision::Ignore);
		assert_eq!(ignoring.error_count(), 1);

		let aborting = LogStatusHandler::new(true);
		assert_eq!(aborting.report_error("boom", 0), ErrorDecision::Abort);
	}
}

// vim: ts=4
