//! Progress display for CLI runs
//!
//! A status handler that keeps the run's counters and paints a throttled
//! one-line status to stderr. Errors beyond the automatic retries are
//! ignored (logged) or abort the run, depending on configuration;
//! interactive decisions belong to a richer frontend.

use std::io::Write;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::error::{AbortTrigger, SyncError};
use crate::logging::*;
use crate::status::{ErrorDecision, Phase, ProgressCounters, StatusHandler};

/// Display updates are throttled to avoid spamming the terminal
const UPDATE_INTERVAL_MS: u128 = 100;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

const ABORT_NONE: u8 = 0;
const ABORT_USER: u8 = 1;
const ABORT_PROGRAM: u8 = 2;

pub struct CliStatusHandler {
	counters: ProgressCounters,
	phase: Mutex<Phase>,
	last_update: Mutex<Instant>,
	items_seen: AtomicU64,
	abort: AtomicU8,
	abort_on_error: bool,
	errors_seen: AtomicUsize,
}

impl CliStatusHandler {
	pub fn new(abort_on_error: bool) -> Self {
		CliStatusHandler {
			counters: ProgressCounters::default(),
			phase: Mutex::new(Phase::None),
			last_update: Mutex::new(Instant::now()),
			items_seen: AtomicU64::new(0),
			abort: AtomicU8::new(ABORT_NONE),
			abort_on_error,
			errors_seen: AtomicUsize::new(0),
		}
	}

	pub fn error_count(&self) -> usize {
		self.errors_seen.load(Ordering::Relaxed)
	}

	fn paint(&self, text: &str) {
		let mut last = self.last_update.lock().unwrap_or_else(|e| e.into_inner());
		if last.elapsed().as_millis() < UPDATE_INTERVAL_MS {
			return;
		}
		*last = Instant::now();
		drop(last);

		let snap = self.counters.snapshot();
		let phase = *self.phase.lock().unwrap_or_else(|e| e.into_inner());
		let line = match phase {
			Phase::Scanning => format!("\r{}", text),
			_ => format!(
				"\r[{}] {}/{} items, {:.1}/{:.1} MB | {}",
				phase,
				snap.items_processed,
				snap.items_total,
				snap.bytes_processed as f64 / BYTES_PER_MB,
				snap.bytes_total as f64 / BYTES_PER_MB,
				text
			),
		};
		let _ = write!(std::io::stderr(), "{}", line);
		let _ = std::io::stderr().flush();
	}
}

impl StatusHandler for CliStatusHandler {
	fn init_phase(&self, items_total: u64, bytes_total: u64, phase: Phase) {
		*self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
		self.counters.reset(items_total, bytes_total);
		let _ = writeln!(std::io::stderr());
		info!("→ {} phase ({} items, {:.1} MB)", phase, items_total, bytes_total as f64 / BYTES_PER_MB);
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
		self.items_seen.fetch_add(1, Ordering::Relaxed);
		self.paint(text);
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

	fn abort_if_requested(&self) -> Result<(), SyncError> {
		match self.abort_requested() {
			Some(trigger) => Err(SyncError::Aborted(trigger)),
			None => Ok(()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_counters_accumulate() {
		let handler = CliStatusHandler::new(false);
		handler.init_phase(5, 500, Phase::Synchronizing);
		handler.update_processed(1, 100);
		handler.update_processed(1, 100);
		let snap = handler.counters.snapshot();
		assert_eq!(snap.items_processed, 2);
		assert_eq!(snap.bytes_processed, 200);
	}

	#[test]
	fn test_abort_on_error_policy() {
		let handler = CliStatusHandler::new(true);
		assert_eq!(handler.report_error("x", 0), ErrorDecision::Abort);
		assert_eq!(handler.error_count(), 1);
	}
}

// vim: ts=4
