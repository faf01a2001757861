//! Session pooling for network backends and per-device concurrency caps
//!
//! Pools are keyed by the full connection identity (host, port, user,
//! credentials, TLS, compression). A session is used for one operation or a
//! short logical group, then returned; sessions idle beyond the idle window
//! are dropped. Construction always happens outside the pool lock.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};

use crate::error::{FsError, FsErrorKind};
use crate::logging::*;
use crate::path::Device;

/// A session unused for this long is considered cold and dropped
pub const SESSION_IDLE_WINDOW: Duration = Duration::from_secs(20);

/// Reaper wake interval; one eviction per wake keeps reconnect storms away
/// from server connection limits
pub const REAPER_INTERVAL: Duration = Duration::from_secs(5);

/// Equality key of a pooled connection
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
	pub host: String,
	pub port: u16,
	pub user: String,
	pub password: String,
	pub use_tls: bool,
	pub use_zlib: bool,
}

impl fmt::Debug for SessionKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// credentials stay out of logs
		f.debug_struct("SessionKey")
			.field("host", &self.host)
			.field("port", &self.port)
			.field("user", &self.user)
			.field("use_tls", &self.use_tls)
			.field("use_zlib", &self.use_zlib)
			.finish()
	}
}

/// Contract a pooled session type implements.
///
/// A session owns a [`SessionTicket`], so dropping it anywhere (pool
/// eviction, stream teardown, error paths) keeps the process-wide count
/// accurate.
pub trait PoolableSession: Send + 'static {
	/// Whether the transport is still believed usable
	fn is_healthy(&self) -> bool;
}

/// Process-wide count of live sessions. Blocks shutdown until every session
/// is gone and refuses new sessions during teardown.
pub struct SessionCounter {
	active: AtomicUsize,
	open: AtomicBool,
	drained: Notify,
}

/// RAII registration of one live session
pub struct SessionTicket {
	counter: Arc<SessionCounter>,
}

impl Drop for SessionTicket {
	fn drop(&mut self) {
		if self.counter.active.fetch_sub(1, Ordering::SeqCst) == 1 {
			self.counter.drained.notify_waiters();
		}
	}
}

impl SessionCounter {
	pub fn new() -> Arc<Self> {
		Arc::new(SessionCounter {
			active: AtomicUsize::new(0),
			open: AtomicBool::new(true),
			drained: Notify::new(),
		})
	}

	pub fn active_count(&self) -> usize {
		self.active.load(Ordering::SeqCst)
	}

	/// Register one new session; refused during teardown
	pub fn register(self: &Arc<Self>) -> Result<SessionTicket, FsError> {
		if !self.open.load(Ordering::SeqCst) {
			return Err(FsError::new(
				FsErrorKind::TransportError,
				"",
				"Session layer is shutting down",
			));
		}
		self.active.fetch_add(1, Ordering::SeqCst);
		Ok(SessionTicket { counter: Arc::clone(self) })
	}

	/// Refuse new sessions and wait until the last one is released
	pub async fn shutdown(&self) {
		self.open.store(false, Ordering::SeqCst);
		while self.active.load(Ordering::SeqCst) > 0 {
			let notified = self.drained.notified();
			if self.active.load(Ordering::SeqCst) == 0 {
				break;
			}
			notified.await;
		}
	}
}

struct IdleSession<S> {
	session: S,
	since: Instant,
}

/// Keyed pool of idle sessions.
///
/// Map entries are never removed, only their vectors drained, so references
/// to a key's slot stay meaningful for the process lifetime.
pub struct SessionPool<S> {
	idle: Mutex<HashMap<SessionKey, Vec<IdleSession<S>>>>,
}

impl<S: PoolableSession> SessionPool<S> {
	pub fn new() -> Arc<Self> {
		Arc::new(SessionPool { idle: Mutex::new(HashMap::new()) })
	}

	/// Take a healthy idle session, or construct a fresh one outside the
	/// pool lock. The constructor is expected to register with the
	/// process-wide [`SessionCounter`].
	pub async fn checkout<F, Fut>(&self, key: &SessionKey, construct: F) -> Result<S, FsError>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<S, FsError>>,
	{
		{
			let mut idle = self.idle.lock().await;
			if let Some(list) = idle.get_mut(key) {
				while let Some(candidate) = list.pop() {
					if candidate.since.elapsed() <= SESSION_IDLE_WINDOW
						&& candidate.session.is_healthy()
					{
						return Ok(candidate.session);
					}
					// stale or broken: fall through and drop it
				}
			}
		}

		construct().await
	}

	/// Return a session after use; unhealthy ones are dropped
	pub async fn checkin(&self, key: &SessionKey, session: S) {
		if session.is_healthy() {
			let mut idle = self.idle.lock().await;
			idle.entry(key.clone())
				.or_default()
				.push(IdleSession { session, since: Instant::now() });
		}
	}

	/// Evict at most one expired idle session; returns whether one was found
	pub async fn evict_one_expired(&self) -> bool {
		let mut idle = self.idle.lock().await;
		for list in idle.values_mut() {
			if let Some(pos) = list.iter().position(|s| s.since.elapsed() > SESSION_IDLE_WINDOW) {
				list.swap_remove(pos);
				return true;
			}
		}
		false
	}

	/// Background task scanning for cold sessions. One eviction per wake.
	pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
		let pool = Arc::clone(self);
		tokio::spawn(async move {
			loop {
				tokio::time::sleep(REAPER_INTERVAL).await;
				if pool.evict_one_expired().await {
					trace!("evicted one idle session");
				}
			}
		})
	}
}

/// Per-device in-flight operation caps.
///
/// The traverser, content comparison and the executor all draw permits from
/// the same limiter, so a device's `effective_max` holds across both sides
/// of every active folder pair simultaneously.
pub struct DeviceLimiter {
	semaphores: HashMap<Device, Arc<Semaphore>>,
	limits: HashMap<Device, usize>,
	default_limit: usize,
}

/// Permits held for one scheduled operation
pub struct DeviceSlot {
	_permits: Vec<OwnedSemaphorePermit>,
}

impl DeviceLimiter {
	pub fn new(limits: impl IntoIterator<Item = (Device, usize)>, default_limit: usize) -> Self {
		let limits: HashMap<Device, usize> =
			limits.into_iter().map(|(d, n)| (d, n.max(1))).collect();
		let semaphores = limits
			.iter()
			.map(|(d, n)| (d.clone(), Arc::new(Semaphore::new(*n))))
			.collect();
		DeviceLimiter { semaphores, limits, default_limit: default_limit.max(1) }
	}

	pub fn effective_max(&self, device: &Device) -> usize {
		self.limits.get(device).copied().unwrap_or(self.default_limit)
	}

	fn semaphore(&self, device: &Device) -> Arc<Semaphore> {
		match self.semaphores.get(device) {
			Some(sem) => Arc::clone(sem),
			// device outside the configured run set
			None => Arc::new(Semaphore::new(self.default_limit)),
		}
	}

	pub async fn acquire(&self, device: &Device) -> DeviceSlot {
		let permit = self
			.semaphore(device)
			.acquire_owned()
			.await
			.expect("device semaphore never closes");
		DeviceSlot { _permits: vec![permit] }
	}

	/// Acquire both sides of an operation. The same device on both sides is
	/// charged once; distinct devices are acquired in device order so that
	/// concurrent pair acquisitions cannot deadlock.
	pub async fn acquire_pair(&self, left: &Device, right: &Device) -> DeviceSlot {
		if left == right {
			return self.acquire(left).await;
		}
		let (first, second) = if left < right { (left, right) } else { (right, left) };
		let p1 = self
			.semaphore(first)
			.acquire_owned()
			.await
			.expect("device semaphore never closes");
		let p2 = self
			.semaphore(second)
			.acquire_owned()
			.await
			.expect("device semaphore never closes");
		DeviceSlot { _permits: vec![p1, p2] }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::PathBuf;

	struct FakeSession {
		healthy: bool,
		_ticket: SessionTicket,
	}

	impl PoolableSession for FakeSession {
		fn is_healthy(&self) -> bool {
			self.healthy
		}
	}

	fn key() -> SessionKey {
		SessionKey {
			host: "h".into(),
			port: 22,
			user: "u".into(),
			password: "p".into(),
			use_tls: false,
			use_zlib: false,
		}
	}

	#[tokio::test]
	async fn test_checkout_reuses_healthy_session() {
		let counter = SessionCounter::new();
		let pool: Arc<SessionPool<FakeSession>> = SessionPool::new();

		let s = {
			let counter = Arc::clone(&counter);
			pool.checkout(&key(), || async move {
				Ok(FakeSession { healthy: true, _ticket: counter.register()? })
			})
			.await
			.unwrap()
		};
		assert_eq!(counter.active_count(), 1);
		pool.checkin(&key(), s).await;

		// second checkout must not construct
		let s2 = pool
			.checkout(&key(), || async { panic!("must reuse the pooled session") })
			.await
			.unwrap();
		assert_eq!(counter.active_count(), 1);
		drop(s2);
		assert_eq!(counter.active_count(), 0);
	}

	#[tokio::test]
	async fn test_unhealthy_sessions_are_dropped_on_checkin() {
		let counter = SessionCounter::new();
		let pool: Arc<SessionPool<FakeSession>> = SessionPool::new();

		let s = {
			let counter = Arc::clone(&counter);
			pool.checkout(&key(), || async move {
				Ok(FakeSession { healthy: false, _ticket: counter.register()? })
			})
			.await
			.unwrap()
		};
		pool.checkin(&key(), s).await;
		assert_eq!(counter.active_count(), 0);
	}

	#[tokio::test]
	async fn test_counter_refuses_sessions_after_shutdown() {
		let counter = SessionCounter::new();
		counter.shutdown().await;
		assert!(counter.register().is_err());
	}

	#[tokio::test]
	async fn test_shutdown_waits_for_tickets() {
		let counter = SessionCounter::new();
		let ticket = counter.register().unwrap();

		let waiter = {
			let counter = Arc::clone(&counter);
			tokio::spawn(async move { counter.shutdown().await })
		};
		tokio::task::yield_now().await;
		drop(ticket);
		waiter.await.unwrap();
		assert_eq!(counter.active_count(), 0);
	}

	#[tokio::test]
	async fn test_acquire_pair_charges_alias_once() {
		let device = Device::Local { root: PathBuf::from("/a") };
		let limiter = DeviceLimiter::new([(device.clone(), 1)], 4);

		// with aliasing charged once a single permit suffices
		let slot = limiter.acquire_pair(&device, &device).await;
		drop(slot);
		let slot = limiter.acquire_pair(&device, &device).await;
		drop(slot);
	}

	#[tokio::test]
	async fn test_effective_max() {
		let device = Device::Local { root: PathBuf::from("/a") };
		let limiter = DeviceLimiter::new([(device.clone(), 3)], 2);
		assert_eq!(limiter.effective_max(&device), 3);
		let other = Device::Local { root: PathBuf::from("/b") };
		assert_eq!(limiter.effective_max(&other), 2);
	}
}

// vim: ts=4
