use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex, RwLock};

use crate::error::{BuildError, HealthError, StartError, TerminationError};
use crate::output::OutputCapture;
use crate::probe::HealthProbe;
use crate::types::*;

/// How long to wait for the kernel to report a SIGKILLed child as gone.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);
/// Output readers can outlive the build when a grandchild keeps the pipe open.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
	/// Directory for `<name>.log` files. `None` keeps output in memory only.
	pub log_dir: Option<PathBuf>,
	pub max_log_size: u64,
}

/// What the post-ready health watch does once the child turns unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhealthyPolicy {
	/// Flip the state and keep the child running.
	#[default]
	Report,
	/// Return from the watch so the caller can shut down.
	Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
	/// The child exited or a termination began.
	ChildStopped,
	/// The child turned unhealthy under [`UnhealthyPolicy::Terminate`].
	Unhealthy,
}

pub struct ChildHandle {
	pub pid: u32,
	pub spec: CommandSpec,
	pub started_at: Instant,
}

#[derive(Clone)]
struct BuildHandle {
	pid: u32,
	exit: watch::Receiver<Option<i32>>,
}

/// Owns at most one child process and publishes its lifecycle state.
pub struct Supervisor {
	state: StateCell,
	child: Mutex<Option<ChildHandle>>,
	exit: RwLock<Option<watch::Receiver<Option<i32>>>>,
	output: RwLock<Option<OutputCapture>>,
	// std mutex: also cleared from a drop guard
	build: std::sync::Mutex<Option<BuildHandle>>,
	closed: AtomicBool,
	terminate_lock: Mutex<()>,
	config: SupervisorConfig,
}

impl Supervisor {
	pub fn new(config: SupervisorConfig) -> Arc<Self> {
		Arc::new(Self {
			state: StateCell::new(SupervisorState::NotStarted),
			child: Mutex::new(None),
			exit: RwLock::new(None),
			output: RwLock::new(None),
			build: std::sync::Mutex::new(None),
			closed: AtomicBool::new(false),
			terminate_lock: Mutex::new(()),
			config,
		})
	}

	pub fn state(&self) -> SupervisorState {
		self.state.get()
	}

	pub fn watch(&self) -> StateWatch {
		self.state.watch()
	}

	/// True once [`Supervisor::shutdown`] has been called.
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	pub async fn status(&self) -> SupervisorStatus {
		let child = self.child.lock().await;
		SupervisorStatus {
			state: self.state.get(),
			pid: child.as_ref().map(|c| c.pid),
			uptime_secs: child.as_ref().map(|c| c.started_at.elapsed().as_secs()),
			command: child.as_ref().map(|c| c.spec.display()),
		}
	}

	pub async fn pid(&self) -> Option<u32> {
		self.child.lock().await.as_ref().map(|c| c.pid)
	}

	/// Output of the most recently started child.
	pub async fn output(&self) -> Option<OutputCapture> {
		self.output.read().await.clone()
	}

	/// Exit code of the most recent child, once it has been reaped.
	pub async fn exit_code(&self) -> Option<i32> {
		self.exit.read().await.as_ref().and_then(|rx| *rx.borrow())
	}

	/// Waits until the most recent child has exited and been reaped.
	pub async fn wait_for_exit(&self) -> Option<i32> {
		let rx = self.exit.read().await.clone();
		match rx {
			Some(mut rx) => rx.wait_for(Option::is_some).await.ok().and_then(|code| *code),
			None => None,
		}
	}

	/// Runs `build` unless `artifact` already exists.
	///
	/// A relative `artifact` is resolved against the build's working directory.
	/// Dropping the returned future kills the build's whole process group.
	pub async fn ensure_built(
		&self,
		build: &CommandSpec,
		artifact: &Path,
	) -> Result<BuildOutcome, BuildError> {
		let artifact = build.workdir.join(artifact);
		if artifact.exists() {
			tracing::debug!("artifact {} present, skipping build", artifact.display());
			return Ok(BuildOutcome::AlreadyBuilt);
		}

		if self.is_closed() {
			return Err(BuildError::Cancelled { command: build.display() });
		}

		let prev = self.state.get();
		let marked = !prev.has_live_child() && self.state.transition(prev, SupervisorState::Building);
		let _restore = RestoreState {
			state: &self.state,
			prev,
			armed: marked,
		};
		tracing::info!("{} missing, building: {}", artifact.display(), build.display());

		self.run_build(build, &artifact).await.map(|_| BuildOutcome::Built)
	}

	async fn run_build(&self, build: &CommandSpec, artifact: &Path) -> Result<(), BuildError> {
		let command = build.display();
		let capture = self.capture_for(&build.name);

		let (mut child, pid, exit_tx, mut exit) = {
			let mut slot = lock_build(&self.build);
			if self.is_closed() {
				return Err(BuildError::Cancelled { command });
			}
			let child = command_for(build).spawn().map_err(|source| BuildError::Spawn {
				command: command.clone(),
				source,
			})?;
			let pid = child.id().unwrap_or(0);
			let (tx, rx) = watch::channel(None);
			*slot = Some(BuildHandle {
				pid,
				exit: rx.clone(),
			});
			(child, pid, tx, rx)
		};
		let mut guard = BuildGuard {
			slot: &self.build,
			pid,
			reaped: false,
		};
		let pipes = pipe_output(&mut child, &capture);

		// reaped here, so a terminate can wait on the exit without polling this future
		tokio::spawn(async move {
			let code = match child.wait().await {
				Ok(status) => exit_code_of(status),
				Err(e) => {
					tracing::error!("waiting on build (pid {}) failed: {}", pid, e);
					-1
				}
			};
			let _ = exit_tx.send(Some(code));
		});

		let code = exit.wait_for(Option::is_some).await.ok().and_then(|c| *c).unwrap_or(-1);
		guard.reaped = true;
		drop(guard);
		for pipe in pipes {
			let _ = tokio::time::timeout(PIPE_DRAIN_TIMEOUT, pipe).await;
		}

		if code != 0 {
			if self.is_closed() {
				return Err(BuildError::Cancelled { command });
			}
			let tail = capture.snapshot().await;
			let tail = String::from_utf8_lossy(&tail);
			let tail: Vec<&str> = tail.lines().rev().take(20).collect();
			for line in tail.into_iter().rev() {
				tracing::error!("build: {}", line);
			}
			return Err(BuildError::Failed { command, code });
		}
		if !artifact.exists() {
			return Err(BuildError::MissingArtifact {
				command,
				artifact: artifact.to_path_buf(),
			});
		}

		tracing::info!("build finished: {}", artifact.display());
		Ok(())
	}

	/// Spawns the child in its own process group and moves to Starting.
	///
	/// Returns the child's pid. The call does not wait for readiness.
	pub async fn start(self: &Arc<Self>, spec: CommandSpec) -> Result<u32, StartError> {
		let mut slot = self.child.lock().await;

		if self.is_closed() {
			return Err(StartError::ShuttingDown);
		}
		let current = self.state.get();
		if current.has_live_child() || slot.is_some() {
			return Err(StartError::AlreadyRunning(current));
		}

		let capture = self.capture_for(&spec.name);
		let mut child = command_for(&spec).spawn().map_err(|source| StartError::Spawn {
			command: spec.display(),
			source,
		})?;

		let pid = child.id().unwrap_or(0);
		let _ = pipe_output(&mut child, &capture);

		let (exit_tx, exit_rx) = watch::channel(None);
		*self.exit.write().await = Some(exit_rx);
		*self.output.write().await = Some(capture.clone());
		self.state.set(SupervisorState::Starting);

		tracing::info!("started {} (pid {}): {}", spec.name, pid, spec.display());
		*slot = Some(ChildHandle {
			pid,
			spec: spec.clone(),
			started_at: Instant::now(),
		});
		drop(slot);

		let sup = Arc::clone(self);
		tokio::spawn(async move {
			sup.monitor(child, pid, spec.name, capture, exit_tx).await;
		});

		Ok(pid)
	}

	// Sole owner of the OS child: waits for it, reaps it, publishes the exit.
	async fn monitor(
		&self,
		mut child: Child,
		pid: u32,
		name: String,
		capture: OutputCapture,
		exit_tx: watch::Sender<Option<i32>>,
	) {
		let code = match child.wait().await {
			Ok(status) => exit_code_of(status),
			Err(e) => {
				tracing::error!("waiting on {} (pid {}) failed: {}", name, pid, e);
				-1
			}
		};

		// A terminate in progress has already taken the handle and owns the
		// state from here on.
		let owned = {
			let mut slot = self.child.lock().await;
			let owned = slot.as_ref().map(|c| c.pid) == Some(pid);
			if owned {
				*slot = None;
			}
			owned
		};

		let msg = format!("[warden] {} (pid {}) exited ({})\n", name, pid, code);
		capture.write(msg.as_bytes()).await;
		let _ = exit_tx.send(Some(code));

		if !owned {
			return;
		}
		for from in [
			SupervisorState::Starting,
			SupervisorState::Ready,
			SupervisorState::Unhealthy,
		] {
			if self.state.transition(from, SupervisorState::Stopped) {
				tracing::warn!("{} (pid {}) exited unexpectedly ({}) while {}", name, pid, code, from);
				break;
			}
		}
	}

	/// Polls `probe` until it succeeds or `budget` runs out.
	///
	/// Probe failures inside the budget are expected during startup and only
	/// logged at debug level.
	pub async fn await_healthy<P: HealthProbe>(
		&self,
		probe: &P,
		interval: Duration,
		budget: Duration,
	) -> Result<(), HealthError> {
		let deadline = tokio::time::Instant::now() + budget;
		let mut exit = self.exit.read().await.clone();
		let mut attempt: u32 = 0;

		loop {
			match self.state.get() {
				SupervisorState::Starting => {}
				other => {
					let code = exit.as_ref().and_then(|rx| *rx.borrow());
					return Err(match code {
						Some(code) => HealthError::ChildExited(code),
						None => HealthError::NotStarting(other),
					});
				}
			}

			attempt += 1;
			match tokio::time::timeout_at(deadline, probe.check()).await {
				Ok(Ok(())) => {
					if self.state.transition(SupervisorState::Starting, SupervisorState::Ready) {
						tracing::info!("backend ready after {} probe(s)", attempt);
						return Ok(());
					}
					continue;
				}
				Ok(Err(reason)) => tracing::debug!("probe {} failed: {}", attempt, reason),
				Err(_) => tracing::debug!("probe {} cut off by the deadline", attempt),
			}

			let now = tokio::time::Instant::now();
			if now >= deadline {
				break;
			}
			let wake = (now + interval).min(deadline);
			match exit.as_mut() {
				Some(rx) => {
					tokio::select! {
						_ = tokio::time::sleep_until(wake) => {}
						_ = rx.wait_for(Option::is_some) => {}
					}
				}
				None => tokio::time::sleep_until(wake).await,
			}
		}

		if self.state.transition(SupervisorState::Starting, SupervisorState::Unhealthy) {
			tracing::warn!("backend not healthy after {:?} ({} probes)", budget, attempt);
			return Err(HealthError::Timeout(budget));
		}
		let code = exit.as_ref().and_then(|rx| *rx.borrow());
		Err(match code {
			Some(code) => HealthError::ChildExited(code),
			None => HealthError::NotStarting(self.state.get()),
		})
	}

	/// Keeps probing after Ready. `threshold` consecutive failures flip
	/// Ready to Unhealthy; one success flips it back.
	pub async fn watch_health<P: HealthProbe>(
		&self,
		probe: &P,
		interval: Duration,
		threshold: u32,
		policy: UnhealthyPolicy,
	) -> WatchOutcome {
		let threshold = threshold.max(1);
		let mut failures: u32 = 0;

		loop {
			tokio::time::sleep(interval).await;

			match self.state.get() {
				SupervisorState::Ready | SupervisorState::Unhealthy => {}
				_ => return WatchOutcome::ChildStopped,
			}

			match probe.check().await {
				Ok(()) => {
					failures = 0;
					if self.state.transition(SupervisorState::Unhealthy, SupervisorState::Ready) {
						tracing::info!("backend recovered");
					}
				}
				Err(reason) => {
					failures += 1;
					tracing::debug!("health check failed ({}/{}): {}", failures, threshold, reason);
					if failures >= threshold
						&& self.state.transition(SupervisorState::Ready, SupervisorState::Unhealthy)
					{
						tracing::warn!("backend unhealthy: {}", reason);
						if policy == UnhealthyPolicy::Terminate {
							return WatchOutcome::Unhealthy;
						}
					}
				}
			}
		}
	}

	/// SIGTERM, wait `grace`, then SIGKILL. Always ends in Stopped.
	pub async fn terminate(&self, grace: Duration) -> Result<(), TerminationError> {
		self.terminate_with(Signal::SIGTERM, grace).await
	}

	/// Closes the supervisor for good, then terminates the build or child it
	/// runs. Later [`Supervisor::start`] and build calls fail instead of
	/// spawning.
	pub async fn shutdown(&self, signal: Signal, grace: Duration) -> Result<(), TerminationError> {
		self.closed.store(true, Ordering::SeqCst);
		self.terminate_with(signal, grace).await
	}

	/// Like [`Supervisor::terminate`] but opens with `signal`.
	///
	/// An in-flight build gets the same sequence before the child does.
	/// Concurrent calls are serialized; a call that finds nothing running
	/// returns `Ok` without signaling anything.
	pub async fn terminate_with(&self, signal: Signal, grace: Duration) -> Result<(), TerminationError> {
		let _guard = self.terminate_lock.lock().await;

		let build = lock_build(&self.build).clone();
		let build_result = match build {
			Some(build) => stop_group("build", build.pid, build.exit, signal, grace).await,
			None => Ok(()),
		};

		let handle = {
			let mut slot = self.child.lock().await;
			if slot.is_some() {
				self.state.set(SupervisorState::Terminating);
			}
			slot.take()
		};
		let Some(handle) = handle else {
			self.state.set(SupervisorState::Stopped);
			return build_result;
		};

		let result = self.stop_child(&handle, signal, grace).await;
		self.state.set(SupervisorState::Stopped);
		build_result.and(result)
	}

	async fn stop_child(
		&self,
		handle: &ChildHandle,
		signal: Signal,
		grace: Duration,
	) -> Result<(), TerminationError> {
		let exit = self.exit.read().await.clone();
		match exit {
			Some(exit) => stop_group(&handle.spec.name, handle.pid, exit, signal, grace).await,
			None => Ok(()),
		}
	}

	fn capture_for(&self, name: &str) -> OutputCapture {
		match &self.config.log_dir {
			Some(dir) => OutputCapture::with_log_file(dir, name, self.config.max_log_size),
			None => OutputCapture::in_memory(),
		}
	}
}

/// Shell convention: death by signal N reports 128 + N.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
	use std::os::unix::process::ExitStatusExt;
	status.code().or_else(|| status.signal().map(|sig| 128 + sig)).unwrap_or(-1)
}

fn command_for(spec: &CommandSpec) -> Command {
	let mut cmd = Command::new(&spec.program);
	cmd.args(&spec.args)
		.current_dir(&spec.workdir)
		.envs(&spec.env)
		.stdin(Stdio::null())
		.kill_on_drop(true)
		.process_group(0);

	match spec.output {
		OutputMode::Capture => {
			cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
		}
		OutputMode::Inherit => {
			cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
		}
	}
	cmd
}

fn pipe_output(child: &mut Child, capture: &OutputCapture) -> Vec<tokio::task::JoinHandle<()>> {
	let mut handles = Vec::new();
	if let Some(stdout) = child.stdout.take() {
		let out = capture.clone();
		handles.push(tokio::spawn(async move { out.pipe_from(stdout).await }));
	}
	if let Some(stderr) = child.stderr.take() {
		let out = capture.clone();
		handles.push(tokio::spawn(async move { out.pipe_from(stderr).await }));
	}
	handles
}

/// Signals the child's whole process group. A group that is already gone
/// counts as success.
fn signal_group(pid: u32, signal: Signal) -> Result<(), TerminationError> {
	match killpg(Pid::from_raw(pid as i32), signal) {
		Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
		Err(source) => Err(TerminationError::Signal { pid, source }),
	}
}

/// `signal`, wait `grace` for `exit`, then SIGKILL the group.
async fn stop_group(
	name: &str,
	pid: u32,
	mut exit: watch::Receiver<Option<i32>>,
	signal: Signal,
	grace: Duration,
) -> Result<(), TerminationError> {
	if exit.borrow().is_some() {
		return Ok(());
	}

	tracing::info!("stopping {} (pid {}) with {}", name, pid, signal);
	signal_group(pid, signal)?;

	if tokio::time::timeout(grace, exit.wait_for(Option::is_some)).await.is_ok() {
		tracing::info!("{} (pid {}) stopped", name, pid);
		return Ok(());
	}

	tracing::warn!("{} (pid {}) still alive after {:?}, killing", name, pid, grace);
	signal_group(pid, Signal::SIGKILL)?;
	if tokio::time::timeout(KILL_REAP_TIMEOUT, exit.wait_for(Option::is_some))
		.await
		.is_err()
	{
		tracing::error!("pid {} not reaped {:?} after SIGKILL", pid, KILL_REAP_TIMEOUT);
	}
	Err(TerminationError::Escalated { pid, grace })
}

fn lock_build(slot: &std::sync::Mutex<Option<BuildHandle>>) -> MutexGuard<'_, Option<BuildHandle>> {
	slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Kills the build's group if its future is dropped before the build exits.
struct BuildGuard<'a> {
	slot: &'a std::sync::Mutex<Option<BuildHandle>>,
	pid: u32,
	reaped: bool,
}

impl Drop for BuildGuard<'_> {
	fn drop(&mut self) {
		if !self.reaped {
			tracing::warn!("build (pid {}) abandoned, killing its process group", self.pid);
			let _ = killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
		}
		let mut slot = lock_build(self.slot);
		if slot.as_ref().map(|b| b.pid) == Some(self.pid) {
			*slot = None;
		}
	}
}

/// Puts the state back from Building when `ensure_built` ends, however it ends.
struct RestoreState<'a> {
	state: &'a StateCell,
	prev: SupervisorState,
	armed: bool,
}

impl Drop for RestoreState<'_> {
	fn drop(&mut self) {
		if self.armed {
			self.state.transition(SupervisorState::Building, self.prev);
		}
	}
}
