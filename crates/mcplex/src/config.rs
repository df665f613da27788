use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::store::{Group, LocalStore, Service, TransportType};

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

const DEFAULT_LISTEN: &str = "0.0.0.0:3000";
const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_TOOLS_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_STATS_BUFFER: usize = 1024;

/// RawConfig represents the inputs a user can pass in. Config is the internal
/// representation of this.
#[derive(serde::Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	/// Gateway address in the format "ip:port"
	listen: Option<String>,

	#[serde(default, with = "serde_dur_option")]
	metadata_timeout: Option<Duration>,
	#[serde(default, with = "serde_dur_option")]
	initialize_timeout: Option<Duration>,
	#[serde(default, with = "serde_dur_option")]
	call_timeout: Option<Duration>,
	#[serde(default, with = "serde_dur_option")]
	ping_interval: Option<Duration>,
	#[serde(default, with = "serde_dur_option")]
	tools_cache_ttl: Option<Duration>,

	/// Capacity of the stats channel; records are dropped beyond it.
	stats_buffer: Option<usize>,

	logging: Option<RawLogging>,

	/// Static bearer tokens mapped to verified user ids.
	#[serde(default)]
	tokens: Vec<RawToken>,

	#[serde(default)]
	services: Vec<RawService>,
	#[serde(default)]
	groups: Vec<RawGroup>,
	#[serde(default)]
	overrides: Vec<RawOverride>,
}

#[derive(serde::Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawLogging {
	/// "text" (default) or "json"
	format: Option<String>,
}

#[derive(serde::Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawToken {
	pub token: String,
	pub user_id: i64,
}

#[derive(serde::Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawService {
	pub id: i64,
	pub name: String,
	pub display_name: Option<String>,
	#[serde(default)]
	pub description: String,
	#[serde(rename = "type")]
	pub transport: TransportType,
	pub command: Option<String>,
	#[serde(default)]
	pub args: Vec<String>,
	#[serde(default)]
	pub env: BTreeMap<String, String>,
	pub url: Option<String>,
	#[serde(default)]
	pub headers: BTreeMap<String, String>,
	#[serde(default)]
	pub allow_user_override: bool,
	#[serde(default = "default_enabled")]
	pub enabled: bool,
}

#[derive(serde::Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawGroup {
	pub id: i64,
	pub user_id: i64,
	pub name: String,
	pub display_name: Option<String>,
	#[serde(default)]
	pub description: String,
	pub service_ids: Vec<i64>,
	#[serde(default = "default_enabled")]
	pub enabled: bool,
}

#[derive(serde::Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawOverride {
	pub user_id: i64,
	pub service_id: i64,
	pub env: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
	true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
	Text,
	Json,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub listen: SocketAddr,
	pub metadata_timeout: Duration,
	pub initialize_timeout: Duration,
	pub call_timeout: Duration,
	pub ping_interval: Duration,
	pub tools_cache_ttl: Duration,
	pub stats_buffer: usize,
	pub log_format: LogFormat,
	/// token -> verified user id
	pub tokens: HashMap<String, i64>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("invalid listen address {0:?}: {1}")]
	Listen(String, std::net::AddrParseError),
	#[error("invalid logging format {0:?}; expected \"text\" or \"json\"")]
	LogFormat(String),
	#[error("service {0:?}: stdio services require a command")]
	MissingCommand(String),
	#[error("service {0:?}: {1} services require a url")]
	MissingUrl(String, TransportType),
	#[error("duplicate service name {0:?}")]
	DuplicateService(String),
	#[error("duplicate group name {0:?}")]
	DuplicateGroup(String),
	#[error("failed to parse config: {0}")]
	Parse(#[from] serde_yaml::Error),
}

impl RawConfig {
	pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
		Ok(serde_yaml::from_str(contents)?)
	}

	/// Materialize the local metadata store from the inline service, group,
	/// and override declarations.
	pub fn build_store(&self) -> Result<Arc<LocalStore>, ConfigError> {
		let store = LocalStore::new();
		let mut names = HashSet::new();
		for raw in self.services.iter().cloned() {
			if !names.insert(raw.name.clone()) {
				return Err(ConfigError::DuplicateService(raw.name));
			}
			store.insert_service(raw.into_service()?);
		}
		let mut names = HashSet::new();
		for raw in self.groups.iter().cloned() {
			if !names.insert(raw.name.clone()) {
				return Err(ConfigError::DuplicateGroup(raw.name));
			}
			store.insert_group(raw.into_group());
		}
		for raw in self.overrides.iter().cloned() {
			store.insert_overlay(raw.user_id, raw.service_id, raw.env);
		}
		Ok(store)
	}
}

impl Config {
	pub fn from_raw(raw: &RawConfig) -> Result<Self, ConfigError> {
		let listen = raw.listen.as_deref().unwrap_or(DEFAULT_LISTEN);
		let listen = listen
			.parse::<SocketAddr>()
			.map_err(|e| ConfigError::Listen(listen.to_string(), e))?;
		let log_format = match raw.logging.as_ref().and_then(|l| l.format.as_deref()) {
			None | Some("text") => LogFormat::Text,
			Some("json") => LogFormat::Json,
			Some(other) => return Err(ConfigError::LogFormat(other.to_string())),
		};
		Ok(Config {
			listen,
			metadata_timeout: raw.metadata_timeout.unwrap_or(DEFAULT_METADATA_TIMEOUT),
			initialize_timeout: raw.initialize_timeout.unwrap_or(DEFAULT_INITIALIZE_TIMEOUT),
			call_timeout: raw.call_timeout.unwrap_or(DEFAULT_CALL_TIMEOUT),
			ping_interval: raw.ping_interval.unwrap_or(DEFAULT_PING_INTERVAL),
			tools_cache_ttl: raw.tools_cache_ttl.unwrap_or(DEFAULT_TOOLS_CACHE_TTL),
			stats_buffer: raw.stats_buffer.unwrap_or(DEFAULT_STATS_BUFFER),
			log_format,
			tokens: raw
				.tokens
				.iter()
				.map(|t| (t.token.clone(), t.user_id))
				.collect(),
		})
	}
}

impl RawService {
	pub fn into_service(self) -> Result<Service, ConfigError> {
		match self.transport {
			TransportType::Stdio if self.command.is_none() => {
				return Err(ConfigError::MissingCommand(self.name));
			},
			TransportType::Sse | TransportType::StreamableHttp if self.url.is_none() => {
				return Err(ConfigError::MissingUrl(self.name, self.transport));
			},
			_ => {},
		}
		Ok(Service {
			id: self.id,
			display_name: self.display_name.unwrap_or_else(|| self.name.clone()),
			name: self.name,
			description: self.description,
			transport: self.transport,
			command: self.command,
			args: self.args,
			default_env: self.env,
			endpoint_url: self.url,
			headers: self.headers,
			allow_user_override: self.allow_user_override,
			enabled: self.enabled,
		})
	}
}

impl RawGroup {
	pub fn into_group(self) -> Group {
		// Membership is deduplicated on load, preserving order.
		let mut seen = std::collections::HashSet::new();
		let service_ids = self
			.service_ids
			.into_iter()
			.filter(|id| seen.insert(*id))
			.collect();
		Group {
			id: self.id,
			user_id: self.user_id,
			display_name: self.display_name.unwrap_or_else(|| self.name.clone()),
			name: self.name,
			description: self.description,
			service_ids,
			enabled: self.enabled,
		}
	}
}

fn parse_duration(s: &str) -> Result<Duration, String> {
	let ns = go_parse_duration::parse_duration(s).map_err(|_| format!("invalid duration {s:?}"))?;
	if ns < 0 {
		return Err(format!("invalid duration {s:?}: must not be negative"));
	}
	Ok(Duration::from_nanos(ns as u64))
}

pub mod serde_dur_option {
	use super::*;

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s: Option<String> = Option::deserialize(deserializer)?;
		match s {
			None => Ok(None),
			Some(s) => parse_duration(&s)
				.map(Some)
				.map_err(serde::de::Error::custom),
		}
	}
}
