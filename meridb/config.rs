// Copyright 2019-2021 Meridb Developers.
// This file is part of Meridb.

// Meridb is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Meridb is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Meridb.  If not, see <http://www.gnu.org/licenses/>.

//! Server configuration: TOML file plus command line overrides.

use std::fmt;
use std::path::{Path, PathBuf};

use rustc_hex::FromHex;
use serde_derive::Deserialize;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Instance name; used in log lines only.
    pub instance: String,
    /// Root data directory.
    pub data_dir: PathBuf,
    /// Listen address, host:port.
    pub listen: String,
    /// Worker threads cap; zero means one per CPU.
    pub worker_threads: usize,
    /// Cipher of the system database.
    pub system_cipher_id: String,
    /// Hex-encoded key for the system database cipher.
    pub system_cipher_key: String,
    /// Capacity of each database's table cache.
    pub table_cache_capacity: usize,
    /// Dead connection reap interval, seconds.
    pub reap_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            instance: "meridb".to_owned(),
            data_dir: PathBuf::from("./data"),
            listen: "127.0.0.1:50700".to_owned(),
            worker_threads: 0,
            system_cipher_id: "none".to_owned(),
            system_cipher_key: String::new(),
            table_cache_capacity: 32,
            reap_interval_secs: 30,
        }
    }
}

/// Configuration loading failure.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

impl ServerConfig {
    /// Loads the configuration file.
    pub fn load(path: &Path) -> Result<ServerConfig, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("cannot read {}: {}", path.display(), e)))?;
        let config: ServerConfig = toml::from_str(&text)
            .map_err(|e| ConfigError(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.table_cache_capacity == 0 {
            return Err(ConfigError("table_cache_capacity must not be zero".into()));
        }
        self.cipher_key()?;
        Ok(())
    }

    /// Decodes the hex system cipher key.
    pub fn cipher_key(&self) -> Result<Vec<u8>, ConfigError> {
        if self.system_cipher_key.is_empty() {
            return Ok(Vec::new());
        }
        self.system_cipher_key
            .from_hex()
            .map_err(|e| ConfigError(format!("system_cipher_key is not valid hex: {}", e)))
    }

    /// Effective worker thread count.
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ServerConfig;

    #[test]
    fn parses_full_config() {
        let config: ServerConfig = toml::from_str(
            r#"
            instance = "prod1"
            data_dir = "/var/lib/meridb"
            listen = "0.0.0.0:50700"
            worker_threads = 8
            system_cipher_id = "aes128"
            system_cipher_key = "000102030405060708090a0b0c0d0e0f"
            table_cache_capacity = 64
            reap_interval_secs = 15
            "#,
        )
        .unwrap();
        assert_eq!(config.instance, "prod1");
        assert_eq!(config.effective_worker_threads(), 8);
        assert_eq!(config.cipher_key().unwrap().len(), 16);
    }

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.system_cipher_id, "none");
        assert!(config.cipher_key().unwrap().is_empty());
    }

    #[test]
    fn bad_hex_key_is_rejected() {
        let config = ServerConfig {
            system_cipher_key: "zz".to_owned(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
