use std::path::PathBuf;
use std::time::Duration;

use crate::types::SupervisorState;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
	#[error("failed to spawn build `{command}`: {source}")]
	Spawn {
		command: String,
		#[source]
		source: std::io::Error,
	},

	#[error("build `{command}` exited with {code}")]
	Failed { command: String, code: i32 },

	#[error("build `{command}` succeeded but {} is missing", artifact.display())]
	MissingArtifact { command: String, artifact: PathBuf },

	#[error("build `{command}` cancelled by shutdown")]
	Cancelled { command: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
	#[error("a child is already live (state {0})")]
	AlreadyRunning(SupervisorState),

	#[error("supervisor is shutting down")]
	ShuttingDown,

	#[error("failed to spawn `{command}`: {source}")]
	Spawn {
		command: String,
		#[source]
		source: std::io::Error,
	},
}

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
	#[error("backend not healthy after {0:?}")]
	Timeout(Duration),

	#[error("backend exited during startup (exit {0})")]
	ChildExited(i32),

	#[error("no child is starting (state {0})")]
	NotStarting(SupervisorState),
}

#[derive(Debug, thiserror::Error)]
pub enum TerminationError {
	#[error("pid {pid} ignored the stop signal for {grace:?}, killed")]
	Escalated { pid: u32, grace: Duration },

	#[error("failed to signal pid {pid}: {source}")]
	Signal {
		pid: u32,
		#[source]
		source: nix::Error,
	},
}
