//! Environment layering for child processes.
//!
//! The child inherits the parent environment; [`resolve`] computes only the
//! variables to add or override on top of it.

use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvLayer {
	/// Always set, replacing any inherited value.
	#[serde(default)]
	pub env: HashMap<String, String>,
	/// Set only when the parent environment lacks the variable.
	#[serde(default)]
	pub env_defaults: HashMap<String, String>,
	/// Prepended to `PATH`, in order. `${VAR}` is expanded against the
	/// resolved environment.
	#[serde(default)]
	pub path_prepend: Vec<String>,
}

pub fn resolve<F>(layer: &EnvLayer, lookup: F) -> HashMap<String, String>
where
	F: Fn(&str) -> Option<String>,
{
	let mut out = HashMap::new();

	for (key, val) in &layer.env_defaults {
		if lookup(key).is_none() {
			out.insert(key.clone(), val.clone());
		}
	}
	for (key, val) in &layer.env {
		out.insert(key.clone(), val.clone());
	}

	if !layer.path_prepend.is_empty() {
		let get = |name: &str| out.get(name).cloned().or_else(|| lookup(name));
		let mut parts: Vec<String> = layer
			.path_prepend
			.iter()
			.map(|entry| expand(entry, &get))
			.filter(|entry| !entry.is_empty())
			.collect();
		if let Some(base) = get("PATH").filter(|p| !p.is_empty()) {
			parts.push(base);
		}
		out.insert("PATH".to_string(), parts.join(":"));
	}

	out
}

/// Resolve against the current process environment.
pub fn resolve_from_process(layer: &EnvLayer) -> HashMap<String, String> {
	resolve(layer, |key| std::env::var(key).ok())
}

/// Expands `${NAME}` references. Unknown names expand to nothing.
pub fn expand<F>(input: &str, get: F) -> String
where
	F: Fn(&str) -> Option<String>,
{
	let mut out = String::with_capacity(input.len());
	let mut rest = input;
	while let Some(start) = rest.find("${") {
		out.push_str(&rest[..start]);
		let after = &rest[start + 2..];
		match after.find('}') {
			Some(end) => {
				out.push_str(&get(&after[..end]).unwrap_or_default());
				rest = &after[end + 1..];
			}
			None => {
				out.push_str(&rest[start..]);
				rest = "";
			}
		}
	}
	out.push_str(rest);
	out
}
