use std::time::Duration;
use axum::body::Bytes;
use axum::http::Method;
use warden::StateWatch;

use crate::error::{error_chain, ProxyError};

/// Where requests go once the backend is ready. Fixed for the proxy's life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
	host: String,
	port: u16,
}

impl ProxyTarget {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Self {
			host: host.into(),
			port,
		}
	}

	pub fn host(&self) -> &str {
		&self.host
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	pub fn url(&self, route: &str) -> String {
		let sep = if route.starts_with('/') { "" } else { "/" };
		format!("http://{}:{}{}{}", self.host, self.port, sep, route)
	}
}

impl std::fmt::Display for ProxyTarget {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

/// Opaque payload. Nothing here is parsed or validated.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
	pub method: Method,
	pub content_type: Option<String>,
	pub body: Bytes,
}

impl UpstreamRequest {
	pub fn post(body: impl Into<Bytes>) -> Self {
		Self {
			method: Method::POST,
			content_type: None,
			body: body.into(),
		}
	}

	pub fn json(body: impl Into<Bytes>) -> Self {
		Self {
			content_type: Some("application/json".to_string()),
			..Self::post(body)
		}
	}
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
	pub status: u16,
	pub content_type: Option<String>,
	pub body: Bytes,
}

/// Forwards requests to the backend, but only while it is Ready.
#[derive(Clone)]
pub struct HealthGatedProxy {
	target: ProxyTarget,
	state: StateWatch,
	client: reqwest::Client,
}

impl HealthGatedProxy {
	pub fn new(target: ProxyTarget, state: StateWatch) -> Result<Self, reqwest::Error> {
		// one connection per call: no idle connections are kept around
		let client = reqwest::Client::builder()
			.pool_max_idle_per_host(0)
			.build()?;
		Ok(Self {
			target,
			state,
			client,
		})
	}

	pub fn target(&self) -> &ProxyTarget {
		&self.target
	}

	pub fn state(&self) -> &StateWatch {
		&self.state
	}

	/// Sends `request` to `target + route` and returns the upstream answer
	/// as-is, whatever its status.
	///
	/// Fails immediately with [`ProxyError::NotReady`] unless the backend is
	/// Ready; nothing is queued. Transport failures never touch the
	/// supervisor state.
	pub async fn forward(
		&self,
		route: &str,
		request: UpstreamRequest,
		timeout: Duration,
	) -> Result<UpstreamResponse, ProxyError> {
		let state = self.state.get();
		if !state.is_ready() {
			return Err(ProxyError::NotReady(state));
		}

		let url = self.target.url(route);
		let mut builder = self
			.client
			.request(request.method, &url)
			.timeout(timeout)
			.body(request.body);
		if let Some(ct) = &request.content_type {
			builder = builder.header(reqwest::header::CONTENT_TYPE, ct);
		}

		let resp = builder
			.send()
			.await
			.map_err(|e| ProxyError::UpstreamUnreachable(error_chain(&e)))?;

		let status = resp.status().as_u16();
		let content_type = resp
			.headers()
			.get(reqwest::header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string);
		let body = resp
			.bytes()
			.await
			.map_err(|e| ProxyError::UpstreamUnreachable(error_chain(&e)))?;

		tracing::debug!("{} -> {} ({} bytes)", url, status, body.len());
		Ok(UpstreamResponse {
			status,
			content_type,
			body,
		})
	}
}
