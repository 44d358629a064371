use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use warden::*;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_dir(name: &str) -> PathBuf {
	let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
	let dir = std::env::temp_dir().join(format!("warden-test-{}-{}-{}", std::process::id(), n, name));
	let _ = std::fs::create_dir_all(&dir);
	dir
}

fn test_supervisor() -> Arc<Supervisor> {
	Supervisor::new(SupervisorConfig::default())
}

fn sh(name: &str, script: &str, dir: &std::path::Path) -> CommandSpec {
	CommandSpec::new(name, "sh").args(["-c", script]).workdir(dir)
}

fn sleeper(dir: &std::path::Path) -> CommandSpec {
	CommandSpec::new("sleeper", "sleep").args(["60"]).workdir(dir)
}

fn is_alive(pid: u32) -> bool {
	if kill(Pid::from_raw(pid as i32), None).is_err() {
		return false;
	}
	// reparented zombies are dead for our purposes
	match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
		Ok(stat) => !stat
			.rsplit(')')
			.next()
			.map(|rest| rest.trim_start().starts_with('Z'))
			.unwrap_or(false),
		Err(_) => true,
	}
}

fn build_count(dir: &std::path::Path) -> usize {
	std::fs::read_to_string(dir.join("builds.txt"))
		.map(|s| s.lines().count())
		.unwrap_or(0)
}

const COUNTING_BUILD: &str = "echo build >> builds.txt && touch app.jar";

// --- EnsureBuilt ---

#[tokio::test]
async fn ensure_built_skips_existing_artifact() {
	let sup = test_supervisor();
	let dir = temp_dir("prebuilt");
	std::fs::write(dir.join("app.jar"), b"jar").unwrap();

	let build = sh("build", COUNTING_BUILD, &dir);
	let outcome = sup.ensure_built(&build, "app.jar".as_ref()).await.unwrap();

	assert_eq!(outcome, BuildOutcome::AlreadyBuilt);
	assert_eq!(build_count(&dir), 0);
	assert_eq!(sup.state(), SupervisorState::NotStarted);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn ensure_built_builds_once() {
	let sup = test_supervisor();
	let dir = temp_dir("build-once");
	let build = sh("build", COUNTING_BUILD, &dir);

	let first = sup.ensure_built(&build, "app.jar".as_ref()).await.unwrap();
	let second = sup.ensure_built(&build, "app.jar".as_ref()).await.unwrap();

	assert_eq!(first, BuildOutcome::Built);
	assert_eq!(second, BuildOutcome::AlreadyBuilt);
	assert_eq!(build_count(&dir), 1);
	assert_eq!(sup.state(), SupervisorState::NotStarted);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn failed_build_aborts_before_start() {
	let sup = test_supervisor();
	let dir = temp_dir("build-fails");
	let build = sh("build", "echo compiling; echo broken >&2; exit 1", &dir);

	let result = sup.ensure_built(&build, "app.jar".as_ref()).await;
	match result {
		Err(BuildError::Failed { code, .. }) => assert_eq!(code, 1),
		other => panic!("expected build failure, got {:?}", other),
	}

	// startup stops here: nothing was spawned
	assert_eq!(sup.state(), SupervisorState::NotStarted);
	assert_eq!(sup.pid().await, None);
	assert!(sup.output().await.is_none());

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn build_without_artifact_is_an_error() {
	let sup = test_supervisor();
	let dir = temp_dir("no-artifact");
	let build = sh("build", "true", &dir);

	let result = sup.ensure_built(&build, "app.jar".as_ref()).await;
	assert!(matches!(result, Err(BuildError::MissingArtifact { .. })), "{:?}", result);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn build_spawn_failure() {
	let sup = test_supervisor();
	let dir = temp_dir("no-build-tool");
	let build = CommandSpec::new("build", "./does-not-exist").workdir(&dir);

	let result = sup.ensure_built(&build, "app.jar".as_ref()).await;
	assert!(matches!(result, Err(BuildError::Spawn { .. })), "{:?}", result);

	let _ = std::fs::remove_dir_all(&dir);
}

fn read_pid(path: &std::path::Path) -> u32 {
	std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
}

async fn wait_for_file(path: &std::path::Path) {
	let deadline = Instant::now() + Duration::from_secs(5);
	while !path.exists() {
		assert!(Instant::now() < deadline, "{} never appeared", path.display());
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	// give the writer a moment to finish the line
	tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn wait_until_dead(pid: u32) -> bool {
	let deadline = Instant::now() + Duration::from_secs(2);
	while is_alive(pid) {
		if Instant::now() > deadline {
			return false;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	true
}

const HANGING_BUILD: &str = "sleep 60 & echo $! > build.pid; wait";

#[tokio::test]
async fn dropped_build_kills_its_process_group() {
	let sup = test_supervisor();
	let dir = temp_dir("build-dropped");
	let build = sh("build", HANGING_BUILD, &dir);

	let result = tokio::time::timeout(
		Duration::from_millis(500),
		sup.ensure_built(&build, "app.jar".as_ref()),
	)
	.await;
	assert!(result.is_err(), "build should still be running");

	let grandchild = read_pid(&dir.join("build.pid"));
	assert!(wait_until_dead(grandchild).await, "build grandchild {} survived", grandchild);
	assert_eq!(sup.state(), SupervisorState::NotStarted);

	// the supervisor is still usable afterwards
	let build = sh("build", COUNTING_BUILD, &dir);
	let outcome = sup.ensure_built(&build, "app.jar".as_ref()).await.unwrap();
	assert_eq!(outcome, BuildOutcome::Built);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn shutdown_stops_running_build() {
	let sup = test_supervisor();
	let dir = temp_dir("build-shutdown");

	let building = {
		let sup = Arc::clone(&sup);
		let build = sh("build", HANGING_BUILD, &dir);
		tokio::spawn(async move { sup.ensure_built(&build, "app.jar".as_ref()).await })
	};
	wait_for_file(&dir.join("build.pid")).await;
	let grandchild = read_pid(&dir.join("build.pid"));
	assert!(is_alive(grandchild));
	assert_eq!(sup.state(), SupervisorState::Building);

	let stopped = Instant::now();
	sup.shutdown(Signal::SIGTERM, Duration::from_secs(2)).await.unwrap();
	assert!(stopped.elapsed() < Duration::from_secs(2));

	let result = building.await.unwrap();
	assert!(matches!(result, Err(BuildError::Cancelled { .. })), "{:?}", result);
	assert!(wait_until_dead(grandchild).await, "build grandchild {} survived", grandchild);
	assert_eq!(sup.state(), SupervisorState::Stopped);

	// closed for good: nothing new gets spawned
	let started = sup.start(sleeper(&dir)).await;
	assert!(matches!(started, Err(StartError::ShuttingDown)), "{:?}", started);
	let rebuilt = sup.ensure_built(&sh("build", COUNTING_BUILD, &dir), "app.jar".as_ref()).await;
	assert!(matches!(rebuilt, Err(BuildError::Cancelled { .. })), "{:?}", rebuilt);
	assert_eq!(build_count(&dir), 0);
	assert_eq!(sup.pid().await, None);

	let _ = std::fs::remove_dir_all(&dir);
}

// --- Start ---

#[tokio::test]
async fn start_moves_to_starting() {
	let sup = test_supervisor();
	let dir = temp_dir("start");

	let pid = sup.start(sleeper(&dir)).await.unwrap();
	assert!(pid > 0);
	assert_eq!(sup.state(), SupervisorState::Starting);
	assert!(is_alive(pid));

	let status = sup.status().await;
	assert_eq!(status.pid, Some(pid));
	assert_eq!(status.command.as_deref(), Some("sleep 60"));

	sup.terminate(Duration::from_secs(2)).await.unwrap();
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn second_start_is_refused_while_live() {
	let sup = test_supervisor();
	let dir = temp_dir("double-start");

	let pid = sup.start(sleeper(&dir)).await.unwrap();
	let second = sup.start(sleeper(&dir)).await;
	assert!(matches!(second, Err(StartError::AlreadyRunning(SupervisorState::Starting))));
	assert_eq!(sup.pid().await, Some(pid));

	sup.terminate(Duration::from_secs(2)).await.unwrap();

	// a fresh spawn is fine once stopped
	let again = sup.start(sleeper(&dir)).await.unwrap();
	assert_ne!(again, pid);
	sup.terminate(Duration::from_secs(2)).await.unwrap();

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn start_spawn_failure_leaves_state() {
	let sup = test_supervisor();
	let dir = temp_dir("bad-program");

	let result = sup.start(CommandSpec::new("ghost", "/nonexistent/java").workdir(&dir)).await;
	assert!(matches!(result, Err(StartError::Spawn { .. })));
	assert_eq!(sup.state(), SupervisorState::NotStarted);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn start_passes_env_and_captures_output() {
	let sup = test_supervisor();
	let dir = temp_dir("env");

	let mut env = std::collections::HashMap::new();
	env.insert("WARDEN_TEST_VAR".to_string(), "hello123".to_string());
	let spec = sh("env", "echo $WARDEN_TEST_VAR; pwd", &dir).env(env);
	sup.start(spec).await.unwrap();

	assert_eq!(sup.wait_for_exit().await, Some(0));
	tokio::time::sleep(Duration::from_millis(100)).await;

	let output = sup.output().await.unwrap().snapshot().await;
	let text = String::from_utf8_lossy(&output);
	assert!(text.contains("hello123"), "output was: {}", text);
	assert!(text.contains("warden-test-"), "output was: {}", text);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn output_goes_to_log_file() {
	let log_dir = temp_dir("logs");
	let dir = temp_dir("logs-workdir");
	let sup = Supervisor::new(SupervisorConfig {
		log_dir: Some(log_dir.clone()),
		max_log_size: 1024 * 1024,
	});

	sup.start(sh("backend", "echo to-the-file", &dir)).await.unwrap();
	sup.wait_for_exit().await;
	tokio::time::sleep(Duration::from_millis(100)).await;

	let text = std::fs::read_to_string(log_dir.join("backend.log")).unwrap();
	assert!(text.contains("to-the-file"), "log was: {}", text);

	let _ = std::fs::remove_dir_all(&log_dir);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn unexpected_exit_stops() {
	let sup = test_supervisor();
	let dir = temp_dir("crash");

	sup.start(sh("crasher", "exit 7", &dir)).await.unwrap();
	assert_eq!(sup.wait_for_exit().await, Some(7));
	tokio::time::sleep(Duration::from_millis(50)).await;

	assert_eq!(sup.state(), SupervisorState::Stopped);
	assert_eq!(sup.exit_code().await, Some(7));
	assert_eq!(sup.pid().await, None);

	let _ = std::fs::remove_dir_all(&dir);
}

// --- AwaitHealthy ---

fn flaky_probe(failures: u32, attempts: Arc<AtomicU32>) -> impl HealthProbe {
	FnProbe(move || {
		let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
		async move {
			if n <= failures {
				Err(format!("attempt {} refused", n))
			} else {
				Ok(())
			}
		}
	})
}

#[tokio::test]
async fn ready_after_five_failed_probes() {
	let sup = test_supervisor();
	let dir = temp_dir("flaky");
	sup.start(sleeper(&dir)).await.unwrap();

	let attempts = Arc::new(AtomicU32::new(0));
	let probe = flaky_probe(5, attempts.clone());
	sup.await_healthy(&probe, Duration::from_millis(20), Duration::from_secs(10))
		.await
		.unwrap();

	assert_eq!(attempts.load(Ordering::SeqCst), 6);
	assert_eq!(sup.state(), SupervisorState::Ready);

	sup.terminate(Duration::from_secs(2)).await.unwrap();
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn health_timeout_marks_unhealthy() {
	let sup = test_supervisor();
	let dir = temp_dir("never-ready");
	let pid = sup.start(sleeper(&dir)).await.unwrap();

	let probe = FnProbe(|| async { Err::<(), _>("refused".to_string()) });
	let started = Instant::now();
	let result = sup
		.await_healthy(&probe, Duration::from_millis(20), Duration::from_millis(200))
		.await;

	assert!(matches!(result, Err(HealthError::Timeout(_))), "{:?}", result);
	assert!(started.elapsed() < Duration::from_secs(2));
	assert_eq!(sup.state(), SupervisorState::Unhealthy);
	// the child is left alone; the caller decides
	assert!(is_alive(pid));

	sup.terminate(Duration::from_secs(2)).await.unwrap();
	assert!(!is_alive(pid));
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn child_exit_ends_health_wait() {
	let sup = test_supervisor();
	let dir = temp_dir("dies-early");
	sup.start(sh("backend", "sleep 0.1; exit 3", &dir)).await.unwrap();

	let probe = FnProbe(|| async { Err::<(), _>("refused".to_string()) });
	let started = Instant::now();
	let result = sup
		.await_healthy(&probe, Duration::from_millis(50), Duration::from_secs(30))
		.await;

	assert!(matches!(result, Err(HealthError::ChildExited(3))), "{:?}", result);
	assert!(started.elapsed() < Duration::from_secs(5));

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn await_healthy_without_child() {
	let sup = test_supervisor();
	let probe = FnProbe(|| async { Ok::<(), String>(()) });
	let result = sup
		.await_healthy(&probe, Duration::from_millis(10), Duration::from_millis(50))
		.await;
	assert!(matches!(result, Err(HealthError::NotStarting(SupervisorState::NotStarted))));
}

// --- Health watch ---

#[tokio::test]
async fn watch_flips_unhealthy_and_back() {
	let sup = test_supervisor();
	let dir = temp_dir("watch");
	sup.start(sleeper(&dir)).await.unwrap();

	let healthy = Arc::new(AtomicBool::new(true));
	let probe = {
		let healthy = healthy.clone();
		FnProbe(move || {
			let ok = healthy.load(Ordering::SeqCst);
			async move { if ok { Ok(()) } else { Err("down".to_string()) } }
		})
	};
	sup.await_healthy(&probe, Duration::from_millis(10), Duration::from_secs(5))
		.await
		.unwrap();

	let watcher = {
		let sup = Arc::clone(&sup);
		tokio::spawn(async move {
			sup.watch_health(&probe, Duration::from_millis(20), 2, UnhealthyPolicy::Report)
				.await
		})
	};

	healthy.store(false, Ordering::SeqCst);
	tokio::time::sleep(Duration::from_millis(200)).await;
	assert_eq!(sup.state(), SupervisorState::Unhealthy);

	healthy.store(true, Ordering::SeqCst);
	tokio::time::sleep(Duration::from_millis(200)).await;
	assert_eq!(sup.state(), SupervisorState::Ready);

	sup.terminate(Duration::from_secs(2)).await.unwrap();
	let outcome = tokio::time::timeout(Duration::from_secs(1), watcher).await.unwrap().unwrap();
	assert_eq!(outcome, WatchOutcome::ChildStopped);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn watch_terminate_policy_returns() {
	let sup = test_supervisor();
	let dir = temp_dir("watch-terminate");
	let pid = sup.start(sleeper(&dir)).await.unwrap();

	let ok = FnProbe(|| async { Ok::<(), String>(()) });
	sup.await_healthy(&ok, Duration::from_millis(10), Duration::from_secs(5))
		.await
		.unwrap();

	let down = FnProbe(|| async { Err::<(), _>("down".to_string()) });
	let outcome = tokio::time::timeout(
		Duration::from_secs(2),
		sup.watch_health(&down, Duration::from_millis(10), 1, UnhealthyPolicy::Terminate),
	)
	.await
	.unwrap();

	assert_eq!(outcome, WatchOutcome::Unhealthy);
	assert!(is_alive(pid));

	sup.terminate(Duration::from_secs(2)).await.unwrap();
	let _ = std::fs::remove_dir_all(&dir);
}

// --- Terminate ---

#[tokio::test]
async fn terminate_is_idempotent() {
	let sup = test_supervisor();
	let dir = temp_dir("idempotent");
	let pid = sup.start(sleeper(&dir)).await.unwrap();

	sup.terminate(Duration::from_secs(2)).await.unwrap();
	assert_eq!(sup.state(), SupervisorState::Stopped);
	assert!(!is_alive(pid));

	sup.terminate(Duration::from_secs(2)).await.unwrap();
	assert_eq!(sup.state(), SupervisorState::Stopped);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn terminate_before_start() {
	let sup = test_supervisor();
	sup.terminate(Duration::from_millis(100)).await.unwrap();
	assert_eq!(sup.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn terminate_escalates_to_kill() {
	let sup = test_supervisor();
	let dir = temp_dir("stubborn");
	let pid = sup
		.start(sh("stubborn", "trap '' TERM; sleep 60", &dir))
		.await
		.unwrap();
	tokio::time::sleep(Duration::from_millis(100)).await;

	let started = Instant::now();
	let result = sup.terminate(Duration::from_millis(300)).await;

	assert!(matches!(result, Err(TerminationError::Escalated { .. })), "{:?}", result);
	assert!(started.elapsed() >= Duration::from_millis(300));
	assert_eq!(sup.state(), SupervisorState::Stopped);
	assert!(!is_alive(pid));

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn concurrent_terminates_run_once() {
	let sup = test_supervisor();
	let dir = temp_dir("concurrent-terminate");
	let pid = sup.start(sleeper(&dir)).await.unwrap();

	let a = {
		let sup = Arc::clone(&sup);
		tokio::spawn(async move { sup.terminate(Duration::from_secs(2)).await })
	};
	let b = {
		let sup = Arc::clone(&sup);
		tokio::spawn(async move { sup.terminate(Duration::from_secs(2)).await })
	};

	assert!(a.await.unwrap().is_ok());
	assert!(b.await.unwrap().is_ok());
	assert_eq!(sup.state(), SupervisorState::Stopped);
	assert!(!is_alive(pid));

	let _ = std::fs::remove_dir_all(&dir);
}

// --- Shutdown requests ---

#[tokio::test]
async fn shutdown_request_leaves_no_child() {
	let sup = test_supervisor();
	let dir = temp_dir("signal");
	let pid = sup.start(sleeper(&dir)).await.unwrap();
	let grace = Duration::from_secs(2);

	let latch = ShutdownLatch::new();
	let owner = {
		let sup = Arc::clone(&sup);
		let latch = latch.clone();
		tokio::spawn(async move {
			let reason = latch.wait().await;
			sup.terminate_with(reason.forward_signal(), grace).await
		})
	};

	let requested = Instant::now();
	assert!(latch.request(ShutdownReason::Signal(Signal::SIGINT)));
	assert!(!latch.request(ShutdownReason::Signal(Signal::SIGTERM)));

	owner.await.unwrap().unwrap();
	assert!(requested.elapsed() < grace + Duration::from_millis(500));
	assert!(!is_alive(pid));
	assert_eq!(sup.state(), SupervisorState::Stopped);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn terminate_reaches_grandchildren() {
	let sup = test_supervisor();
	let dir = temp_dir("group");
	sup.start(sh("wrapper", "sleep 60 & echo $! > child.pid; wait", &dir))
		.await
		.unwrap();
	tokio::time::sleep(Duration::from_millis(200)).await;

	let grandchild: u32 = std::fs::read_to_string(dir.join("child.pid"))
		.unwrap()
		.trim()
		.parse()
		.unwrap();
	assert!(is_alive(grandchild));

	let _ = sup.terminate(Duration::from_secs(2)).await;
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert!(!is_alive(grandchild));

	let _ = std::fs::remove_dir_all(&dir);
}
