//! Readiness probes.

use std::future::Future;
use std::time::Duration;

/// One readiness check against the child. `Err` carries a short reason that
/// ends up in debug logs; it is never surfaced to proxy callers.
pub trait HealthProbe: Send + Sync {
	fn check(&self) -> impl Future<Output = Result<(), String>> + Send;
}

/// Succeeds once a TCP connection to `addr` can be opened.
#[derive(Debug, Clone)]
pub struct TcpProbe {
	pub addr: String,
	pub timeout: Duration,
}

impl TcpProbe {
	pub fn new(host: &str, port: u16) -> Self {
		Self {
			addr: format!("{}:{}", host, port),
			timeout: Duration::from_secs(1),
		}
	}
}

impl HealthProbe for TcpProbe {
	async fn check(&self) -> Result<(), String> {
		match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&self.addr)).await {
			Ok(Ok(_)) => Ok(()),
			Ok(Err(e)) => Err(format!("connect {}: {}", self.addr, e)),
			Err(_) => Err(format!("connect {}: timed out", self.addr)),
		}
	}
}

/// Succeeds when `GET url` answers with a 2xx status.
#[derive(Debug, Clone)]
pub struct HttpProbe {
	pub url: String,
	client: reqwest::Client,
}

impl HttpProbe {
	pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
		let client = reqwest::Client::builder().timeout(timeout).build()?;
		Ok(Self {
			url: url.into(),
			client,
		})
	}
}

impl HealthProbe for HttpProbe {
	async fn check(&self) -> Result<(), String> {
		let resp = self
			.client
			.get(&self.url)
			.send()
			.await
			.map_err(|e| format!("GET {}: {}", self.url, e))?;
		if resp.status().is_success() {
			Ok(())
		} else {
			Err(format!("GET {}: HTTP {}", self.url, resp.status()))
		}
	}
}

/// Adapts a closure returning a future into a probe.
pub struct FnProbe<F>(pub F);

impl<F, Fut> HealthProbe for FnProbe<F>
where
	F: Fn() -> Fut + Send + Sync,
	Fut: Future<Output = Result<(), String>> + Send,
{
	fn check(&self) -> impl Future<Output = Result<(), String>> + Send {
		(self.0)()
	}
}

/// Probe selected at runtime from configuration.
#[derive(Debug, Clone)]
pub enum AnyProbe {
	Tcp(TcpProbe),
	Http(HttpProbe),
}

impl HealthProbe for AnyProbe {
	async fn check(&self) -> Result<(), String> {
		match self {
			AnyProbe::Tcp(p) => p.check().await,
			AnyProbe::Http(p) => p.check().await,
		}
	}
}
