//! Bridge Configuration
//!
//! Everything the relay binary needs, read from the environment.
//!
//! | Variable | Default |
//! |---|---|
//! | `HYDRA_URL` | `http://localhost:4001` |
//! | `HYDRA_FILTER_ADDRESS` | none |
//! | `HYDRA_NETWORK_ID` | `0` |
//! | `HYDRA_TX_ERA` | `Tx BabbageEra` |
//! | `HYDRA_TX_FEE` | `0` |
//! | `HYDRA_SUBMIT_TIMEOUT_SECS` | `30` |
//! | `ADMIN_KEY_FILE` | `admin.sk` |
//! | `HYDRA_LOCAL_SLOT` | `0` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::ledger::connection::LedgerConfig;

/// Default node API endpoint.
pub const DEFAULT_HEAD_URL: &str = "http://localhost:4001";

/// Default era tag for submitted transactions.
pub const DEFAULT_ERA_TAG: &str = "Tx BabbageEra";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable is set but unusable.
    #[error("invalid {name}: {reason}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// What was wrong.
        reason: String,
    },
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Node API URL, `http(s)` or `ws(s)`.
    pub head_url: String,
    /// Address filter for the websocket feed.
    pub filter_address: Option<String>,
    /// 0 for testnets, 1 for mainnet.
    pub network_id: u8,
    /// Era tag placed on submitted transactions.
    pub era_tag: String,
    /// Fee deducted per transaction, in lovelace.
    pub fee: u64,
    /// Submission verdict timeout.
    pub submit_timeout: Duration,
    /// Session key text envelope; a fresh key is generated when missing.
    pub key_file: PathBuf,
    /// Engine slot whose packets are delivered locally.
    pub local_slot: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            head_url: DEFAULT_HEAD_URL.to_string(),
            filter_address: None,
            network_id: 0,
            era_tag: DEFAULT_ERA_TAG.to_string(),
            fee: 0,
            submit_timeout: Duration::from_secs(30),
            key_file: PathBuf::from("admin.sk"),
            local_slot: 0,
        }
    }
}

impl BridgeConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            head_url: lookup("HYDRA_URL").unwrap_or(defaults.head_url),
            filter_address: lookup("HYDRA_FILTER_ADDRESS").filter(|a| !a.is_empty()),
            network_id: parse_or(&lookup, "HYDRA_NETWORK_ID", defaults.network_id)?,
            era_tag: lookup("HYDRA_TX_ERA").unwrap_or(defaults.era_tag),
            fee: parse_or(&lookup, "HYDRA_TX_FEE", defaults.fee)?,
            submit_timeout: Duration::from_secs(parse_or(
                &lookup,
                "HYDRA_SUBMIT_TIMEOUT_SECS",
                defaults.submit_timeout.as_secs(),
            )?),
            key_file: lookup("ADMIN_KEY_FILE").map(PathBuf::from).unwrap_or(defaults.key_file),
            local_slot: parse_or(&lookup, "HYDRA_LOCAL_SLOT", defaults.local_slot)?,
        };

        if config.network_id > 15 {
            return Err(ConfigError::Invalid {
                name: "HYDRA_NETWORK_ID",
                reason: format!("{} does not fit in four bits", config.network_id),
            });
        }
        config.head_url()?;
        Ok(config)
    }

    /// Parsed node URL.
    pub fn head_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.head_url).map_err(|e| ConfigError::Invalid {
            name: "HYDRA_URL",
            reason: e.to_string(),
        })
    }

    /// Settings for [`LedgerConnection::connect`](crate::ledger::LedgerConnection::connect).
    pub fn ledger_config(&self) -> Result<LedgerConfig, ConfigError> {
        Ok(LedgerConfig {
            head_url: self.head_url()?,
            filter_address: self.filter_address.clone(),
            era_tag: self.era_tag.clone(),
            submit_timeout: self.submit_timeout,
        })
    }
}

fn parse_or<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: format!("{:?}: {}", raw, e),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.head_url, "http://localhost:4001");
        assert_eq!(config.network_id, 0);
        assert_eq!(config.era_tag, "Tx BabbageEra");
        assert_eq!(config.fee, 0);
        assert_eq!(config.submit_timeout, Duration::from_secs(30));
        assert_eq!(config.key_file, PathBuf::from("admin.sk"));
        assert_eq!(config.local_slot, 0);
        assert!(config.filter_address.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("HYDRA_URL", "https://head.example:443"),
            ("HYDRA_FILTER_ADDRESS", "addr_test1vz"),
            ("HYDRA_NETWORK_ID", "1"),
            ("HYDRA_TX_FEE", "170000"),
            ("HYDRA_SUBMIT_TIMEOUT_SECS", " 5 "),
            ("ADMIN_KEY_FILE", "/keys/me.sk"),
            ("HYDRA_LOCAL_SLOT", "3"),
        ]))
        .unwrap();
        assert_eq!(config.network_id, 1);
        assert_eq!(config.fee, 170_000);
        assert_eq!(config.submit_timeout, Duration::from_secs(5));
        assert_eq!(config.local_slot, 3);

        let ledger = config.ledger_config().unwrap();
        assert_eq!(ledger.head_url.as_str(), "https://head.example/");
        assert_eq!(ledger.filter_address.as_deref(), Some("addr_test1vz"));
        assert_eq!(ledger.era_tag, "Tx BabbageEra");
    }

    #[test]
    fn test_empty_filter_is_none() {
        let config = BridgeConfig::from_lookup(lookup(&[("HYDRA_FILTER_ADDRESS", "")])).unwrap();
        assert!(config.filter_address.is_none());
    }

    #[test]
    fn test_invalid_values() {
        for (name, value) in [
            ("HYDRA_TX_FEE", "lots"),
            ("HYDRA_NETWORK_ID", "16"),
            ("HYDRA_LOCAL_SLOT", "-1"),
            ("HYDRA_URL", "not a url"),
        ] {
            match BridgeConfig::from_lookup(lookup(&[(name, value)])) {
                Err(ConfigError::Invalid { name: reported, .. }) => assert_eq!(reported, name),
                Ok(_) => panic!("{}={} accepted", name, value),
            }
        }
    }
}
