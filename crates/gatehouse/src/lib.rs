//! # gatehouse
//!
//! HTTP front for a backend supervised by [`warden`].
//!
//! Inbound routes are forwarded 1:1 to the backend once its supervisor
//! reports Ready. Until then every request fails fast with `503` and
//! `{"error": ...}`; transport failures become `502` with the same shape.
//! Bodies and upstream status codes pass through untouched.

pub mod api;
pub mod error;
pub mod proxy;

pub use api::{check_routes, router, serve, AppState, RouteSpec};
pub use error::ProxyError;
pub use proxy::{HealthGatedProxy, ProxyTarget, UpstreamRequest, UpstreamResponse};
