use std::path::{Path, PathBuf};
use std::time::Duration;

use dsync_core::SessionConfig;
use serde::Deserialize;

/// Hub tunables, read from TOML. Every key is optional.
///
/// ```toml
/// session_mailbox = 128
/// idle_linger_ms = 60000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HubConfig {
	/// Capacity of the hub's inbound command channel.
	pub hub_mailbox: usize,
	/// Capacity of each session worker's mailbox.
	pub session_mailbox: usize,
	/// Capacity of each client's output mailbox.
	pub client_mailbox: usize,
	/// How long a worker without a client waits on an empty mailbox before
	/// retiring.
	pub idle_linger_ms: u64,
	/// Period of the worker's flush tick.
	pub flush_interval_ms: u64,
	/// How long a sent tag counts as in flight.
	pub tag_grace_ms: u64,
	/// Upper bound on a graceful shutdown.
	pub shutdown_timeout_ms: u64,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			hub_mailbox: 1024,
			session_mailbox: 256,
			client_mailbox: 256,
			idle_linger_ms: 30_000,
			flush_interval_ms: 1_000,
			tag_grace_ms: 10_000,
			shutdown_timeout_ms: 5_000,
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read {}: {source}", path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("invalid hub config: {0}")]
	Parse(#[from] toml::de::Error),
}

impl HubConfig {
	pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
		Ok(toml::from_str(text)?)
	}

	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
			path: path.to_path_buf(),
			source,
		})?;
		Self::from_toml_str(&text)
	}

	pub fn idle_linger(&self) -> Duration {
		Duration::from_millis(self.idle_linger_ms)
	}

	/// Never zero; a zero period would spin the worker.
	pub fn flush_interval(&self) -> Duration {
		Duration::from_millis(self.flush_interval_ms.max(1))
	}

	pub fn shutdown_timeout(&self) -> Duration {
		Duration::from_millis(self.shutdown_timeout_ms)
	}

	pub fn session_config(&self) -> SessionConfig {
		SessionConfig {
			tag_grace: Duration::from_millis(self.tag_grace_ms),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn empty_document_yields_defaults() {
		assert_eq!(HubConfig::from_toml_str("").unwrap(), HubConfig::default());
		assert_eq!(HubConfig::default().session_config().tag_grace, Duration::from_secs(10));
	}

	#[test]
	fn partial_document_overrides_named_keys() {
		let config = HubConfig::from_toml_str("session_mailbox = 8\nidle_linger_ms = 250\n").unwrap();
		assert_eq!(config.session_mailbox, 8);
		assert_eq!(config.idle_linger(), Duration::from_millis(250));
		assert_eq!(config.hub_mailbox, HubConfig::default().hub_mailbox);
	}

	#[test]
	fn unknown_key_is_rejected() {
		assert!(matches!(HubConfig::from_toml_str("mailbox = 3"), Err(ConfigError::Parse(_))));
	}

	#[test]
	fn zero_flush_interval_is_clamped() {
		let config = HubConfig::from_toml_str("flush_interval_ms = 0").unwrap();
		assert_eq!(config.flush_interval(), Duration::from_millis(1));
	}

	#[test]
	fn load_reads_file_and_reports_missing_path() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "tag_grace_ms = 2500").unwrap();
		let config = HubConfig::load(file.path()).unwrap();
		assert_eq!(config.session_config().tag_grace, Duration::from_millis(2500));

		let missing = file.path().with_extension("absent");
		assert!(matches!(HubConfig::load(&missing), Err(ConfigError::Io { .. })));
	}
}
