//! TOML configuration shared by the binary and embedders.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level configuration. Every section and key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
	pub dispatcher: DispatcherConfig,
	pub calls: CallConfig,
	pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
	/// Run mode name, parsed by the dispatcher (`wait`, `nowait`, `once`).
	pub run_mode: String,
	/// Initial capacity of the readiness buffer.
	pub max_events: usize,
}

impl Default for DispatcherConfig {
	fn default() -> Self {
		Self {
			run_mode: "wait".into(),
			max_events: 64,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CallConfig {
	/// Default pending-call timeout in milliseconds.
	pub timeout_ms: u64,
}

impl Default for CallConfig {
	fn default() -> Self {
		Self { timeout_ms: 25_000 }
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
	/// `tracing` env-filter directive used when `RUST_LOG` is unset.
	pub filter: String,
}

impl Default for LogConfig {
	fn default() -> Self {
		Self {
			filter: "busline=info".into(),
		}
	}
}

impl Config {
	pub fn from_toml(text: &str) -> Result<Self> {
		let config: Self = toml::from_str(text).map_err(|err| Error::Config(err.to_string()))?;
		config.check()?;
		Ok(config)
	}

	pub fn load(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let text = std::fs::read_to_string(path).map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
		Self::from_toml(&text)
	}

	pub fn call_timeout(&self) -> Duration {
		Duration::from_millis(self.calls.timeout_ms)
	}

	fn check(&self) -> Result<()> {
		if self.calls.timeout_ms == 0 {
			return Err(Error::Config("calls.timeout_ms must be greater than zero".into()));
		}
		if self.dispatcher.max_events == 0 {
			return Err(Error::Config("dispatcher.max_events must be greater than zero".into()));
		}
		Ok(())
	}
}
