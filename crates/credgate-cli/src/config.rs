use gatehouse::{ProxyTarget, RouteSpec};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use warden::env::{self, EnvLayer};
use warden::{AnyProbe, CommandSpec, HttpProbe, OutputMode, SupervisorConfig, TcpProbe, UnhealthyPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {source}")]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("failed to parse {path}: {source}")]
	Parse {
		path: PathBuf,
		source: toml::de::Error,
	},
	#[error("health.kind = \"http\" requires health.url")]
	MissingHealthUrl,
	#[error("invalid health probe: {0}")]
	Probe(String),
	#[error("invalid proxy route: {0}")]
	Route(String),
}

// ── credgate.toml ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
	#[serde(default)]
	pub server: ServerConfig,
	#[serde(default)]
	pub backend: BackendConfig,
	#[serde(default)]
	pub build: BuildConfig,
	#[serde(default)]
	pub health: HealthConfig,
	#[serde(default)]
	pub proxy: ProxyConfig,
	#[serde(default)]
	pub shutdown: ShutdownConfig,
	#[serde(default)]
	pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	#[serde(default = "default_listen")]
	pub listen: String,
	#[serde(default = "default_service")]
	pub service: String,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			listen: default_listen(),
			service: default_service(),
		}
	}
}

fn default_listen() -> String {
	"0.0.0.0:8001".into()
}

fn default_service() -> String {
	"W3C Verifiable Credentials Proxy".into()
}

fn default_true() -> bool {
	true
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
	#[serde(default = "default_backend_name")]
	pub name: String,
	#[serde(default = "default_backend_program")]
	pub program: String,
	#[serde(default = "default_backend_args")]
	pub args: Vec<String>,
	#[serde(default = "default_workdir")]
	pub workdir: PathBuf,
	#[serde(flatten)]
	pub env: EnvLayer,
	#[serde(default)]
	pub output: OutputMode,
}

impl Default for BackendConfig {
	fn default() -> Self {
		Self {
			name: default_backend_name(),
			program: default_backend_program(),
			args: default_backend_args(),
			workdir: default_workdir(),
			env: default_env_layer(),
			output: OutputMode::Capture,
		}
	}
}

const DEFAULT_ARTIFACT: &str = "build/libs/verifiable-credentials-backend-0.0.1-SNAPSHOT.jar";

fn default_backend_name() -> String {
	"backend".into()
}

fn default_backend_program() -> String {
	"java".into()
}

fn default_backend_args() -> Vec<String> {
	vec!["-jar".into(), DEFAULT_ARTIFACT.into(), "--server.port=8002".into()]
}

fn default_workdir() -> PathBuf {
	PathBuf::from("/app/backend")
}

fn default_env_layer() -> EnvLayer {
	let mut layer = EnvLayer::default();
	layer.env_defaults.insert("JAVA_HOME".into(), "/usr/lib/jvm/java-17-openjdk-arm64".into());
	layer.path_prepend.push("${JAVA_HOME}/bin".into());
	layer
}

/// Build step, skipped when `artifact` already exists under `workdir`.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_build_program")]
	pub program: String,
	#[serde(default = "default_build_args")]
	pub args: Vec<String>,
	/// Defaults to the backend workdir.
	pub workdir: Option<PathBuf>,
	#[serde(default = "default_artifact")]
	pub artifact: PathBuf,
}

impl Default for BuildConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			program: default_build_program(),
			args: default_build_args(),
			workdir: None,
			artifact: default_artifact(),
		}
	}
}

fn default_build_program() -> String {
	"./gradlew".into()
}

fn default_build_args() -> Vec<String> {
	vec!["clean".into(), "build".into(), "-x".into(), "test".into()]
}

fn default_artifact() -> PathBuf {
	PathBuf::from(DEFAULT_ARTIFACT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
	#[default]
	Tcp,
	Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
	#[serde(default)]
	pub kind: ProbeKind,
	/// Probe URL for `kind = "http"`.
	pub url: Option<String>,
	#[serde(default = "default_interval_ms")]
	pub interval_ms: u64,
	#[serde(default = "default_budget_secs")]
	pub budget_secs: u64,
	#[serde(default = "default_probe_timeout_ms")]
	pub probe_timeout_ms: u64,
	#[serde(default = "default_failure_threshold")]
	pub failure_threshold: u32,
	#[serde(default)]
	pub on_unhealthy: UnhealthyPolicy,
}

impl Default for HealthConfig {
	fn default() -> Self {
		Self {
			kind: ProbeKind::Tcp,
			url: None,
			interval_ms: default_interval_ms(),
			budget_secs: default_budget_secs(),
			probe_timeout_ms: default_probe_timeout_ms(),
			failure_threshold: default_failure_threshold(),
			on_unhealthy: UnhealthyPolicy::Report,
		}
	}
}

fn default_interval_ms() -> u64 {
	500
}

fn default_budget_secs() -> u64 {
	120
}

fn default_probe_timeout_ms() -> u64 {
	2000
}

fn default_failure_threshold() -> u32 {
	3
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
	#[serde(default = "default_proxy_host")]
	pub host: String,
	#[serde(default = "default_proxy_port")]
	pub port: u16,
	#[serde(default = "default_timeout_secs")]
	pub timeout_secs: u64,
	#[serde(default = "default_routes")]
	pub routes: Vec<RouteConfig>,
}

impl Default for ProxyConfig {
	fn default() -> Self {
		Self {
			host: default_proxy_host(),
			port: default_proxy_port(),
			timeout_secs: default_timeout_secs(),
			routes: default_routes(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
	pub path: String,
	/// Upstream path; same as `path` when unset.
	pub upstream: Option<String>,
	pub timeout_secs: Option<u64>,
}

fn default_proxy_host() -> String {
	"127.0.0.1".into()
}

fn default_proxy_port() -> u16 {
	8002
}

fn default_timeout_secs() -> u64 {
	30
}

fn default_routes() -> Vec<RouteConfig> {
	["/api/issue", "/api/verify"]
		.into_iter()
		.map(|path| RouteConfig {
			path: path.into(),
			upstream: None,
			timeout_secs: None,
		})
		.collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
	#[serde(default = "default_grace_secs")]
	pub grace_secs: u64,
}

impl Default for ShutdownConfig {
	fn default() -> Self {
		Self {
			grace_secs: default_grace_secs(),
		}
	}
}

fn default_grace_secs() -> u64 {
	10
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
	/// Directory for `<name>.log`; output stays in memory when unset.
	pub log_dir: Option<PathBuf>,
	#[serde(default = "default_max_log_size")]
	pub max_log_size: u64,
}

impl Default for OutputConfig {
	fn default() -> Self {
		Self {
			log_dir: None,
			max_log_size: default_max_log_size(),
		}
	}
}

fn default_max_log_size() -> u64 {
	10 * 1024 * 1024
}

// ── Loading ─────────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
	if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|d| !d.is_empty()) {
		return PathBuf::from(dir).join("credgate");
	}
	let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
	home.join(".config").join("credgate")
}

/// First existing file among `./credgate.toml` and the user config dir.
fn find_config() -> Option<PathBuf> {
	[PathBuf::from("credgate.toml"), config_dir().join("config.toml")]
		.into_iter()
		.find(|p| p.exists())
}

/// Loads `explicit` if given, otherwise the first config file found.
/// No file at all means built-in defaults.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
	let path = match explicit {
		Some(p) => p.to_path_buf(),
		None => match find_config() {
			Some(p) => p,
			None => return Ok(Config::default()),
		},
	};
	let content = std::fs::read_to_string(&path)
		.map_err(|source| ConfigError::Read {
			path: path.clone(),
			source,
		})?;
	let config = parse(&content).map_err(|source| ConfigError::Parse {
		path: path.clone(),
		source,
	})?;
	config.validate()?;
	tracing::debug!("loaded config from {}", path.display());
	Ok(config)
}

pub fn parse(content: &str) -> Result<Config, toml::de::Error> {
	toml::from_str(content)
}

// ── Conversions ─────────────────────────────────────────────────────────────

impl Config {
	/// Checks what serde cannot: the route table must mount cleanly.
	pub fn validate(&self) -> Result<(), ConfigError> {
		for route in &self.proxy.routes {
			if let Some(upstream) = route.upstream.as_deref().filter(|u| !u.starts_with('/')) {
				return Err(ConfigError::Route(format!(
					"upstream {:?} for {} must start with '/'",
					upstream, route.path
				)));
			}
		}
		gatehouse::check_routes(&self.routes()).map_err(ConfigError::Route)
	}

	pub fn backend_command(&self) -> CommandSpec {
		let b = &self.backend;
		CommandSpec::new(&b.name, &b.program)
			.args(b.args.iter().cloned())
			.workdir(&b.workdir)
			.env(env::resolve_from_process(&b.env))
			.output(b.output)
	}

	/// The build command and the artifact it must produce.
	pub fn build_command(&self) -> Option<(CommandSpec, PathBuf)> {
		let build = &self.build;
		if !build.enabled {
			return None;
		}
		let workdir = build.workdir.clone().unwrap_or_else(|| self.backend.workdir.clone());
		let spec = CommandSpec::new("build", &build.program)
			.args(build.args.iter().cloned())
			.workdir(workdir)
			.env(env::resolve_from_process(&self.backend.env))
			.output(self.backend.output);
		Some((spec, build.artifact.clone()))
	}

	pub fn probe(&self) -> Result<AnyProbe, ConfigError> {
		match self.health.kind {
			ProbeKind::Tcp => Ok(AnyProbe::Tcp(TcpProbe::new(&self.proxy.host, self.proxy.port))),
			ProbeKind::Http => {
				let url = self.health.url.clone().ok_or(ConfigError::MissingHealthUrl)?;
				let timeout = Duration::from_millis(self.health.probe_timeout_ms);
				HttpProbe::new(url, timeout)
					.map(AnyProbe::Http)
					.map_err(|e| ConfigError::Probe(e.to_string()))
			}
		}
	}

	pub fn target(&self) -> ProxyTarget {
		ProxyTarget::new(&self.proxy.host, self.proxy.port)
	}

	pub fn routes(&self) -> Vec<RouteSpec> {
		self.proxy
			.routes
			.iter()
			.map(|r| RouteSpec {
				path: r.path.clone(),
				upstream: r.upstream.clone().unwrap_or_else(|| r.path.clone()),
				timeout: Duration::from_secs(r.timeout_secs.unwrap_or(self.proxy.timeout_secs)),
			})
			.collect()
	}

	pub fn supervisor_config(&self) -> SupervisorConfig {
		SupervisorConfig {
			log_dir: self.output.log_dir.clone(),
			max_log_size: self.output.max_log_size,
		}
	}

	pub fn probe_interval(&self) -> Duration {
		Duration::from_millis(self.health.interval_ms)
	}

	pub fn health_budget(&self) -> Duration {
		Duration::from_secs(self.health.budget_secs)
	}

	pub fn grace(&self) -> Duration {
		Duration::from_secs(self.shutdown.grace_secs)
	}
}
