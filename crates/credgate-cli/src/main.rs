mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use config::Config;
use gatehouse::{AppState, HealthGatedProxy};
use tracing_subscriber::EnvFilter;
use warden::{
	listen_for_signals, AnyProbe, OutputMode, ShutdownLatch, ShutdownReason, Supervisor,
	TerminationError, WatchOutcome,
};

#[derive(Debug, Parser)]
#[command(name = "credgate", version, about = "Supervise a credentials backend behind a health-gated proxy")]
struct Cli {
	/// Config file (default: ./credgate.toml, then ~/.config/credgate/config.toml)
	#[arg(long, global = true)]
	config: Option<PathBuf>,

	/// Log filter, e.g. "debug" or "credgate=debug,warden=trace" (overrides RUST_LOG)
	#[arg(long, global = true)]
	log: Option<String>,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Build and start the backend and proxy requests to it once healthy (default)
	Serve {
		/// Listen address, e.g. 0.0.0.0:8001
		#[arg(long)]
		listen: Option<String>,
	},
	/// Build and run the backend in the foreground, without the proxy
	Run {
		/// Capture backend output instead of passing it through
		#[arg(long)]
		capture: bool,
	},
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();
	init_tracing(cli.log.as_deref());

	let config = match config::load(cli.config.as_deref()) {
		Ok(config) => config,
		Err(e) => {
			tracing::error!("{}", e);
			return ExitCode::FAILURE;
		}
	};

	match cli.command.unwrap_or(Command::Serve { listen: None }) {
		Command::Serve { listen } => serve(config, listen).await,
		Command::Run { capture } => run(config, capture).await,
	}
}

fn init_tracing(filter: Option<&str>) {
	let filter = match filter {
		Some(f) => EnvFilter::new(f),
		None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
	};
	tracing_subscriber::fmt().with_env_filter(filter).init();
}

// ── serve ───────────────────────────────────────────────────────────────────

async fn serve(config: Config, listen: Option<String>) -> ExitCode {
	let latch = ShutdownLatch::new();
	if let Err(e) = listen_for_signals(latch.clone()) {
		tracing::error!("failed to install signal handlers: {}", e);
		return ExitCode::FAILURE;
	}

	let probe = match config.probe() {
		Ok(p) => p,
		Err(e) => {
			tracing::error!("{}", e);
			return ExitCode::FAILURE;
		}
	};

	let supervisor = Supervisor::new(config.supervisor_config());
	let proxy = match HealthGatedProxy::new(config.target(), supervisor.watch()) {
		Ok(p) => p,
		Err(e) => {
			tracing::error!("failed to build HTTP client: {}", e);
			return ExitCode::FAILURE;
		}
	};

	let listen = listen.unwrap_or_else(|| config.server.listen.clone());
	let listener = match tokio::net::TcpListener::bind(&listen).await {
		Ok(l) => l,
		Err(e) => {
			tracing::error!("failed to bind {}: {}", listen, e);
			return ExitCode::FAILURE;
		}
	};

	let state = AppState {
		proxy,
		service: config.server.service.as_str().into(),
		supervisor: Some(Arc::clone(&supervisor)),
	};
	let app = gatehouse::router(state, &config.routes());

	let server = {
		let latch = latch.clone();
		let shutdown = latch.clone();
		tokio::spawn(async move {
			let stopped = async move {
				shutdown.wait().await;
			};
			if let Err(e) = gatehouse::serve(listener, app, stopped).await {
				latch.request(ShutdownReason::Failure(format!("HTTP server: {}", e)));
			}
		})
	};

	// The proxy is already answering (NotReady) while this runs.
	let lifecycle = {
		let supervisor = Arc::clone(&supervisor);
		let latch = latch.clone();
		let config = config.clone();
		tokio::spawn(async move {
			match run_lifecycle(&supervisor, &config, &probe).await {
				Ok(()) => {}
				Err(reason) if supervisor.is_closed() => tracing::debug!("lifecycle ended: {}", reason),
				Err(reason) => {
					tracing::error!("{}", reason);
					latch.request(ShutdownReason::Failure(reason));
				}
			}
		})
	};

	let reason = latch.wait().await;
	// closes the supervisor first, so the lifecycle task cannot spawn anything new
	stop_backend(&supervisor, &reason, &config).await;
	lifecycle.abort();
	let _ = lifecycle.await;
	let _ = server.await;

	exit_for(&reason)
}

async fn run_lifecycle(supervisor: &Arc<Supervisor>, config: &Config, probe: &AnyProbe) -> Result<(), String> {
	if let Some((build, artifact)) = config.build_command() {
		supervisor
			.ensure_built(&build, &artifact)
			.await
			.map_err(|e| e.to_string())?;
	}

	supervisor
		.start(config.backend_command())
		.await
		.map_err(|e| e.to_string())?;

	supervisor
		.await_healthy(probe, config.probe_interval(), config.health_budget())
		.await
		.map_err(|e| e.to_string())?;

	let policy = config.health.on_unhealthy;
	let outcome = supervisor
		.watch_health(probe, config.probe_interval(), config.health.failure_threshold, policy)
		.await;

	match outcome {
		WatchOutcome::Unhealthy => Err("backend turned unhealthy".to_string()),
		WatchOutcome::ChildStopped if policy == warden::UnhealthyPolicy::Terminate => {
			let code = supervisor.wait_for_exit().await.unwrap_or(-1);
			Err(format!("backend exited ({})", code))
		}
		// report policy: keep serving NotReady
		WatchOutcome::ChildStopped => Ok(()),
	}
}

async fn stop_backend(supervisor: &Supervisor, reason: &ShutdownReason, config: &Config) {
	match supervisor.shutdown(reason.forward_signal(), config.grace()).await {
		Ok(()) => tracing::info!("backend stopped"),
		Err(e @ TerminationError::Escalated { .. }) => tracing::warn!("{}", e),
		Err(e) => tracing::error!("{}", e),
	}
}

fn exit_for(reason: &ShutdownReason) -> ExitCode {
	if reason.is_failure() {
		ExitCode::FAILURE
	} else {
		ExitCode::SUCCESS
	}
}

// ── run ─────────────────────────────────────────────────────────────────────

async fn run(config: Config, capture: bool) -> ExitCode {
	let latch = ShutdownLatch::new();
	if let Err(e) = listen_for_signals(latch.clone()) {
		tracing::error!("failed to install signal handlers: {}", e);
		return ExitCode::FAILURE;
	}

	let output = if capture { OutputMode::Capture } else { OutputMode::Inherit };
	let supervisor = Supervisor::new(config.supervisor_config());

	if let Some((build, artifact)) = config.build_command() {
		let build = build.output(output);
		let built = supervisor.ensure_built(&build, &artifact);
		tokio::pin!(built);
		let finished = tokio::select! {
			result = &mut built => Ok(result),
			reason = latch.wait() => Err(reason),
		};
		let result = match finished {
			Ok(result) => result,
			Err(reason) => {
				// the build gets the forwarded signal, then its result is collected
				stop_backend(&supervisor, &reason, &config).await;
				let _ = built.await;
				return exit_for(&reason);
			}
		};
		if let Err(e) = result {
			tracing::error!("{}", e);
			return ExitCode::FAILURE;
		}
	}

	if let Err(e) = supervisor.start(config.backend_command().output(output)).await {
		tracing::error!("{}", e);
		return ExitCode::FAILURE;
	}

	tokio::select! {
		code = supervisor.wait_for_exit() => {
			let code = code.unwrap_or(-1);
			tracing::info!("backend exited ({})", code);
			ExitCode::from(u8::try_from(code).unwrap_or(1))
		}
		reason = latch.wait() => {
			stop_backend(&supervisor, &reason, &config).await;
			exit_for(&reason)
		}
	}
}
