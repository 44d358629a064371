//! # warden
//!
//! Supervisor for a single child process.
//!
//! Builds the artifact when it is missing, spawns the child, gates readiness
//! on a health probe, and guarantees the child is stopped (SIGTERM, then
//! SIGKILL after a grace period) before the supervising process exits.
//! Other tasks observe the lifecycle only through a lock-free [`StateWatch`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use warden::{CommandSpec, Supervisor, SupervisorConfig, TcpProbe};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sup = Supervisor::new(SupervisorConfig::default());
//!
//! let spec = CommandSpec::new("backend", "java")
//! 	.args(["-jar", "app.jar", "--server.port=8002"])
//! 	.workdir("/app/backend");
//! sup.start(spec).await.unwrap();
//!
//! let probe = TcpProbe::new("127.0.0.1", 8002);
//! sup.await_healthy(&probe, Duration::from_millis(500), Duration::from_secs(60))
//! 	.await
//! 	.unwrap();
//!
//! sup.terminate(Duration::from_secs(10)).await.ok();
//! # }
//! ```

pub mod env;
pub mod error;
pub mod output;
pub mod probe;
pub mod shutdown;
pub mod supervisor;
pub mod types;

pub use error::{BuildError, HealthError, StartError, TerminationError};
pub use output::OutputCapture;
pub use probe::{AnyProbe, FnProbe, HealthProbe, HttpProbe, TcpProbe};
pub use shutdown::{listen_for_signals, ShutdownLatch, ShutdownReason};
pub use supervisor::{ChildHandle, Supervisor, SupervisorConfig, UnhealthyPolicy, WatchOutcome};
pub use types::*;

pub use nix::sys::signal::Signal;
