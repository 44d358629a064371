use std::sync::Arc;
use std::time::Duration;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use warden::{Supervisor, SupervisorState};

use crate::error::ProxyError;
use crate::proxy::{HealthGatedProxy, UpstreamRequest, UpstreamResponse};

/// One inbound path, forwarded 1:1 to an upstream path.
#[derive(Debug, Clone)]
pub struct RouteSpec {
	pub path: String,
	pub upstream: String,
	pub timeout: Duration,
}

impl RouteSpec {
	pub fn same(path: &str, timeout: Duration) -> Self {
		Self {
			path: path.to_string(),
			upstream: path.to_string(),
			timeout,
		}
	}
}

#[derive(Clone)]
pub struct AppState {
	pub proxy: HealthGatedProxy,
	pub service: Arc<str>,
	/// Read-only view for the status endpoints. Absent in tests that run the
	/// proxy without a child.
	pub supervisor: Option<Arc<Supervisor>>,
}

const RESERVED_PATHS: [&str; 3] = ["/api/health", "/api/supervisor", "/api/supervisor/output"];

/// Rejects route tables that [`router`] cannot mount: paths without a
/// leading `/`, duplicates, the status endpoints and axum capture syntax.
pub fn check_routes(routes: &[RouteSpec]) -> Result<(), String> {
	let mut seen = std::collections::HashSet::new();
	for route in routes {
		let path = route.path.as_str();
		if !path.starts_with('/') {
			return Err(format!("route path {:?} must start with '/'", path));
		}
		if RESERVED_PATHS.contains(&path) {
			return Err(format!("route path {} is reserved", path));
		}
		if path.contains(&['{', '}', '*'][..]) || path.split('/').any(|seg| seg.starts_with(':')) {
			return Err(format!("route path {} must be a literal path", path));
		}
		if !seen.insert(path) {
			return Err(format!("route path {} is listed twice", path));
		}
	}
	Ok(())
}

/// Builds the app: status endpoints plus one POST route per entry.
///
/// Proxied bodies are not size-limited.
///
/// # Panics
///
/// Panics on a route table that [`check_routes`] rejects.
pub fn router(state: AppState, routes: &[RouteSpec]) -> Router {
	let mut app = Router::new()
		.route(RESERVED_PATHS[0], get(health))
		.route(RESERVED_PATHS[1], get(supervisor_status))
		.route(RESERVED_PATHS[2], get(supervisor_output));

	for route in routes {
		let upstream = route.upstream.clone();
		let timeout = route.timeout;
		app = app.route(
			&route.path,
			post(move |State(state): State<AppState>, headers: HeaderMap, body: Bytes| {
				let upstream = upstream.clone();
				async move { forward(state, &upstream, timeout, headers, body).await }
			})
			.layer(DefaultBodyLimit::disable()),
		);
	}

	app.layer(TraceLayer::new_for_http()).with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
	status: &'static str,
	service: String,
}

#[derive(Serialize)]
struct ErrorResponse {
	error: String,
}

#[derive(Serialize)]
struct SupervisorResponse {
	state: SupervisorState,
	ready: bool,
	pid: Option<u32>,
	uptime_secs: Option<u64>,
	command: Option<String>,
	target: String,
}

// Liveness of the proxy itself, not of the backend.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
	Json(HealthResponse {
		status: "healthy",
		service: state.service.to_string(),
	})
}

async fn supervisor_status(State(state): State<AppState>) -> Json<SupervisorResponse> {
	let target = state.proxy.target().to_string();
	let resp = match &state.supervisor {
		Some(sup) => {
			let status = sup.status().await;
			SupervisorResponse {
				state: status.state,
				ready: status.state.is_ready(),
				pid: status.pid,
				uptime_secs: status.uptime_secs,
				command: status.command,
				target,
			}
		}
		None => {
			let current = state.proxy.state().get();
			SupervisorResponse {
				state: current,
				ready: current.is_ready(),
				pid: None,
				uptime_secs: None,
				command: None,
				target,
			}
		}
	};
	Json(resp)
}

async fn supervisor_output(
	State(state): State<AppState>,
) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
	let capture = match &state.supervisor {
		Some(sup) => sup.output().await,
		None => None,
	};
	let capture = capture.ok_or_else(|| {
		(
			StatusCode::NOT_FOUND,
			Json(ErrorResponse {
				error: "no captured output".to_string(),
			}),
		)
	})?;
	let snapshot = capture.snapshot().await;
	Ok(String::from_utf8_lossy(&snapshot).to_string())
}

async fn forward(
	state: AppState,
	upstream: &str,
	timeout: Duration,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	let request = UpstreamRequest {
		content_type: headers
			.get(CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string),
		..UpstreamRequest::post(body)
	};

	match state.proxy.forward(upstream, request, timeout).await {
		Ok(resp) => upstream_response(resp),
		Err(e) => {
			match &e {
				ProxyError::NotReady(_) => tracing::debug!("{}: {}", upstream, e),
				ProxyError::UpstreamUnreachable(_) => tracing::warn!("{}: {}", upstream, e),
			}
			error_response(&e)
		}
	}
}

fn upstream_response(resp: UpstreamResponse) -> Response {
	let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
	let mut response = (status, resp.body).into_response();
	let headers = response.headers_mut();
	match resp.content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
		Some(ct) => {
			headers.insert(CONTENT_TYPE, ct);
		}
		None => {
			headers.remove(CONTENT_TYPE);
		}
	}
	response
}

fn error_response(err: &ProxyError) -> Response {
	(
		err.status_code(),
		Json(ErrorResponse {
			error: err.to_string(),
		}),
	)
		.into_response()
}

/// Serves `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: tokio::net::TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
	F: std::future::Future<Output = ()> + Send + 'static,
{
	if let Ok(addr) = listener.local_addr() {
		tracing::info!("HTTP listening on {}", addr);
	}
	axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}
