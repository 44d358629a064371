use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SupervisorState {
	NotStarted = 0,
	Building = 1,
	Starting = 2,
	Ready = 3,
	Unhealthy = 4,
	Terminating = 5,
	Stopped = 6,
}

impl SupervisorState {
	fn from_u8(v: u8) -> Self {
		match v {
			0 => SupervisorState::NotStarted,
			1 => SupervisorState::Building,
			2 => SupervisorState::Starting,
			3 => SupervisorState::Ready,
			4 => SupervisorState::Unhealthy,
			5 => SupervisorState::Terminating,
			_ => SupervisorState::Stopped,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			SupervisorState::NotStarted => "not_started",
			SupervisorState::Building => "building",
			SupervisorState::Starting => "starting",
			SupervisorState::Ready => "ready",
			SupervisorState::Unhealthy => "unhealthy",
			SupervisorState::Terminating => "terminating",
			SupervisorState::Stopped => "stopped",
		}
	}

	/// A child process exists in these states; spawning another is refused.
	pub fn has_live_child(&self) -> bool {
		matches!(
			self,
			SupervisorState::Starting
				| SupervisorState::Ready
				| SupervisorState::Unhealthy
				| SupervisorState::Terminating
		)
	}

	pub fn is_ready(&self) -> bool {
		matches!(self, SupervisorState::Ready)
	}
}

impl std::fmt::Display for SupervisorState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Atomic holder for the supervisor state.
///
/// The supervisor owns the only `StateCell`; everything else gets a
/// [`StateWatch`], which can read but never write.
#[derive(Debug, Clone)]
pub struct StateCell {
	inner: Arc<AtomicU8>,
}

impl StateCell {
	pub fn new(state: SupervisorState) -> Self {
		Self {
			inner: Arc::new(AtomicU8::new(state as u8)),
		}
	}

	pub fn get(&self) -> SupervisorState {
		SupervisorState::from_u8(self.inner.load(Ordering::Acquire))
	}

	pub fn set(&self, state: SupervisorState) {
		self.inner.store(state as u8, Ordering::Release);
	}

	/// Moves to `to` only if the current state is `from`.
	pub fn transition(&self, from: SupervisorState, to: SupervisorState) -> bool {
		self.inner
			.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}

	pub fn watch(&self) -> StateWatch {
		StateWatch {
			inner: Arc::clone(&self.inner),
		}
	}
}

/// Read-only view of a [`StateCell`]. Cheap to clone, lock-free to read.
#[derive(Debug, Clone)]
pub struct StateWatch {
	inner: Arc<AtomicU8>,
}

impl StateWatch {
	pub fn get(&self) -> SupervisorState {
		SupervisorState::from_u8(self.inner.load(Ordering::Acquire))
	}

	pub fn is_ready(&self) -> bool {
		self.get().is_ready()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
	Inherit,
	#[default]
	Capture,
}

/// An external command: used for both the build step and the child launch.
#[derive(Debug, Clone)]
pub struct CommandSpec {
	pub name: String,
	pub program: String,
	pub args: Vec<String>,
	pub workdir: PathBuf,
	pub env: HashMap<String, String>,
	pub output: OutputMode,
}

impl CommandSpec {
	pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			program: program.into(),
			args: Vec::new(),
			workdir: PathBuf::from("."),
			env: HashMap::new(),
			output: OutputMode::Capture,
		}
	}

	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.args = args.into_iter().map(Into::into).collect();
		self
	}

	pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.workdir = dir.into();
		self
	}

	pub fn env(mut self, env: HashMap<String, String>) -> Self {
		self.env = env;
		self
	}

	pub fn output(mut self, output: OutputMode) -> Self {
		self.output = output;
		self
	}

	pub fn display(&self) -> String {
		let mut s = self.program.clone();
		for arg in &self.args {
			s.push(' ');
			s.push_str(arg);
		}
		s
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
	AlreadyBuilt,
	Built,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
	pub state: SupervisorState,
	pub pid: Option<u32>,
	pub uptime_secs: Option<u64>,
	pub command: Option<String>,
}
