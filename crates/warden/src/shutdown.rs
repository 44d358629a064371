//! Shutdown requests.
//!
//! Signal handlers never touch the child. They only fire a [`ShutdownLatch`];
//! the task that owns the [`Supervisor`](crate::Supervisor) waits on the latch
//! and runs the termination itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
	/// SIGINT or SIGTERM reached the supervising process.
	Signal(Signal),
	/// An explicit in-process request.
	Requested,
	/// Startup or the backend failed; the process should exit non-zero.
	Failure(String),
}

impl ShutdownReason {
	/// Signal to open the child's termination with.
	pub fn forward_signal(&self) -> Signal {
		match self {
			ShutdownReason::Signal(sig) => *sig,
			_ => Signal::SIGTERM,
		}
	}

	pub fn is_failure(&self) -> bool {
		matches!(self, ShutdownReason::Failure(_))
	}
}

/// Single-execution latch: the first request wins, later ones are ignored.
#[derive(Clone)]
pub struct ShutdownLatch {
	fired: Arc<AtomicBool>,
	tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Default for ShutdownLatch {
	fn default() -> Self {
		Self::new()
	}
}

impl ShutdownLatch {
	pub fn new() -> Self {
		let (tx, _) = watch::channel(None);
		Self {
			fired: Arc::new(AtomicBool::new(false)),
			tx: Arc::new(tx),
		}
	}

	/// Returns `true` if this call fired the latch.
	pub fn request(&self, reason: ShutdownReason) -> bool {
		if self.fired.swap(true, Ordering::AcqRel) {
			tracing::debug!("shutdown already requested, ignoring {:?}", reason);
			return false;
		}
		tracing::info!("shutdown requested: {:?}", reason);
		self.tx.send_replace(Some(reason));
		true
	}

	pub fn is_requested(&self) -> bool {
		self.fired.load(Ordering::Acquire)
	}

	pub fn reason(&self) -> Option<ShutdownReason> {
		self.tx.borrow().clone()
	}

	pub async fn wait(&self) -> ShutdownReason {
		let mut rx = self.tx.subscribe();
		loop {
			if let Some(reason) = rx.borrow_and_update().clone() {
				return reason;
			}
			if rx.changed().await.is_err() {
				return ShutdownReason::Requested;
			}
		}
	}
}

/// Fires `latch` on the first SIGINT or SIGTERM. Further signals are logged
/// and dropped while the termination runs.
pub fn listen_for_signals(latch: ShutdownLatch) -> std::io::Result<tokio::task::JoinHandle<()>> {
	let mut interrupt = signal(SignalKind::interrupt())?;
	let mut terminate = signal(SignalKind::terminate())?;

	Ok(tokio::spawn(async move {
		loop {
			let received = tokio::select! {
				Some(()) = interrupt.recv() => Signal::SIGINT,
				Some(()) = terminate.recv() => Signal::SIGTERM,
				else => return,
			};
			if !latch.request(ShutdownReason::Signal(received)) {
				tracing::info!("received {} while already shutting down", received);
			}
		}
	}))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test]
	async fn first_request_wins() {
		let latch = ShutdownLatch::new();
		assert!(!latch.is_requested());
		assert!(latch.request(ShutdownReason::Signal(Signal::SIGINT)));
		assert!(!latch.request(ShutdownReason::Failure("late".into())));
		assert_eq!(latch.wait().await, ShutdownReason::Signal(Signal::SIGINT));
		assert_eq!(latch.reason(), Some(ShutdownReason::Signal(Signal::SIGINT)));
	}

	#[tokio::test]
	async fn waiters_wake_on_request() {
		let latch = ShutdownLatch::new();
		let waiter = {
			let latch = latch.clone();
			tokio::spawn(async move { latch.wait().await })
		};
		tokio::time::sleep(Duration::from_millis(20)).await;
		latch.request(ShutdownReason::Requested);

		let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(reason, ShutdownReason::Requested);
	}

	#[test]
	fn forwarded_signal() {
		assert_eq!(ShutdownReason::Signal(Signal::SIGINT).forward_signal(), Signal::SIGINT);
		assert_eq!(ShutdownReason::Requested.forward_signal(), Signal::SIGTERM);
		assert!(ShutdownReason::Failure("x".into()).is_failure());
	}

	#[tokio::test]
	async fn sigterm_fires_latch() {
		let latch = ShutdownLatch::new();
		let _listener = listen_for_signals(latch.clone()).unwrap();

		nix::sys::signal::kill(nix::unistd::Pid::this(), Signal::SIGTERM).unwrap();

		let reason = tokio::time::timeout(Duration::from_secs(2), latch.wait())
			.await
			.unwrap();
		assert_eq!(reason, ShutdownReason::Signal(Signal::SIGTERM));
	}
}
