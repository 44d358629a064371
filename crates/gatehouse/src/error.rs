use axum::http::StatusCode;
use warden::SupervisorState;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
	#[error("backend not ready (state {0})")]
	NotReady(SupervisorState),

	#[error("failed to reach backend: {0}")]
	UpstreamUnreachable(String),
}

impl ProxyError {
	pub fn status_code(&self) -> StatusCode {
		match self {
			ProxyError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
		}
	}
}

/// Flattens an error and its sources into one line, e.g.
/// `error sending request: client error (Connect): tcp connect error: Connection refused`.
pub fn error_chain(err: &dyn std::error::Error) -> String {
	let mut msg = err.to_string();
	let mut source = err.source();
	while let Some(e) = source {
		let text = e.to_string();
		if !msg.contains(&text) {
			msg.push_str(": ");
			msg.push_str(&text);
		}
		source = e.source();
	}
	msg
}
