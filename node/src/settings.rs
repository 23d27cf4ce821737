//! Node configuration: defaults in code, overridden by an optional TOML
//! file and `BASALT__`-prefixed environment variables.

use std::{path::Path, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::{
	block_processor::BlockProcessorConfig,
	bootstrap::BootstrapConfig,
	elections::ActiveElectionsConfig,
	primitives::Amount,
};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NodeSection {
	pub peering_port: u16,
	pub bootstrap_listen_port: u16,
	/// Seed peers, `host:port`.
	pub preconfigured_peers: Vec<String>,
}

impl Default for NodeSection {
	fn default() -> Self {
		NodeSection {
			peering_port: 7075,
			bootstrap_listen_port: 7076,
			preconfigured_peers: Vec::new(),
		}
	}
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ElectionsSection {
	pub size: usize,
	pub hinted_limit_percent: usize,
	pub hinted_threshold_percent: u8,
	pub timeout_secs: u64,
	/// Decimal raw amount; the full supply when absent.
	pub online_weight: Option<String>,
	pub recently_confirmed_size: usize,
}

impl Default for ElectionsSection {
	fn default() -> Self {
		let defaults = ActiveElectionsConfig::default();
		ElectionsSection {
			size: defaults.size,
			hinted_limit_percent: defaults.hinted_limit_percent,
			hinted_threshold_percent: defaults.hinted_threshold_percent,
			timeout_secs: defaults.election_timeout.as_secs(),
			online_weight: None,
			recently_confirmed_size: defaults.recently_confirmed_size,
		}
	}
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BootstrapSection {
	pub base_connections: usize,
	pub max_connections: usize,
	pub io_timeout_secs: u64,
}

impl Default for BootstrapSection {
	fn default() -> Self {
		let defaults = BootstrapConfig::default();
		BootstrapSection {
			base_connections: defaults.base_connections,
			max_connections: defaults.max_connections,
			io_timeout_secs: defaults.io_timeout.as_secs(),
		}
	}
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProcessorSection {
	pub max_queue: usize,
	pub unchecked_max_entries: usize,
}

impl Default for ProcessorSection {
	fn default() -> Self {
		let defaults = BlockProcessorConfig::default();
		ProcessorSection {
			max_queue: defaults.max_queue,
			unchecked_max_entries: defaults.unchecked_max_entries,
		}
	}
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WalletSection {
	pub kdf_t_cost: u32,
	pub kdf_m_cost_kib: u32,
	pub kdf_p_cost: u32,
	pub fan_out: usize,
}

impl Default for WalletSection {
	fn default() -> Self {
		WalletSection { kdf_t_cost: 1, kdf_m_cost_kib: 64 * 1024, kdf_p_cost: 1, fan_out: 1024 }
	}
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
	pub node: NodeSection,
	pub elections: ElectionsSection,
	pub bootstrap: BootstrapSection,
	pub processor: ProcessorSection,
	pub wallet: WalletSection,
}

impl Settings {
	/// Load from `<config_root>/basalt.toml` (if present) merged with the
	/// environment.
	pub fn new(config_root: Option<&Path>) -> Result<Self, ConfigError> {
		let mut builder = Config::builder();
		if let Some(root) = config_root {
			builder = builder.add_source(
				File::from(root.join("basalt.toml")).required(false),
			);
		}
		builder
			.add_source(Environment::with_prefix("BASALT").separator("__"))
			.build()?
			.try_deserialize()
	}

	pub fn active_elections_config(&self) -> ActiveElectionsConfig {
		ActiveElectionsConfig {
			size: self.elections.size,
			hinted_limit_percent: self.elections.hinted_limit_percent,
			hinted_threshold_percent: self.elections.hinted_threshold_percent,
			election_timeout: Duration::from_secs(self.elections.timeout_secs),
			online_weight: self
				.elections
				.online_weight
				.as_deref()
				.and_then(|raw| raw.parse::<u128>().ok())
				.map(Amount::new)
				.unwrap_or(Amount::MAX),
			recently_confirmed_size: self.elections.recently_confirmed_size,
		}
	}

	pub fn bootstrap_config(&self) -> BootstrapConfig {
		BootstrapConfig {
			base_connections: self.bootstrap.base_connections,
			max_connections: self.bootstrap.max_connections,
			io_timeout: Duration::from_secs(self.bootstrap.io_timeout_secs),
			..Default::default()
		}
	}

	pub fn processor_config(&self) -> BlockProcessorConfig {
		BlockProcessorConfig {
			max_queue: self.processor.max_queue,
			unchecked_max_entries: self.processor.unchecked_max_entries,
			..Default::default()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_without_config_file() {
		let settings = Settings::new(None).unwrap();
		assert_eq!(settings.node.peering_port, 7075);
		assert_eq!(settings.bootstrap.base_connections, 4);
		assert_eq!(settings.active_elections_config().online_weight, Amount::MAX);
	}

	#[test]
	fn online_weight_parses_from_decimal_string() {
		let settings = Settings {
			elections: ElectionsSection {
				online_weight: Some("1000000".to_string()),
				..Default::default()
			},
			..Default::default()
		};
		assert_eq!(
			settings.active_elections_config().online_weight,
			Amount::new(1_000_000)
		);
	}
}
