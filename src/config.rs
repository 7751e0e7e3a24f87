use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Largest pool a single server will seed; the free set is held in memory.
pub const MAX_POOL_SIZE: u32 = 65_536;

/// How the free set hands out addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationPolicy {
    /// Lowest free address first. Deterministic.
    #[default]
    Lowest,
    /// Uniformly random pop from the free set.
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    pub router: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub lease_duration_seconds: u32,
    #[serde(default = "default_offer_hold")]
    pub offer_hold_seconds: u32,
    #[serde(default)]
    pub allocation: AllocationPolicy,
    #[serde(default)]
    pub leases_file: Option<PathBuf>,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_http_listen")]
    pub http_listen: SocketAddr,
    #[serde(default)]
    pub sweep_interval_seconds: Option<u64>,
}

fn default_offer_hold() -> u32 {
    60
}

fn default_listen_port() -> u16 {
    67
}

fn default_http_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            pool_start: Ipv4Addr::new(192, 168, 1, 100),
            pool_end: Ipv4Addr::new(192, 168, 1, 200),
            router: Some(Ipv4Addr::new(192, 168, 1, 1)),
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
            lease_duration_seconds: 3600,
            offer_hold_seconds: default_offer_hold(),
            allocation: AllocationPolicy::Lowest,
            leases_file: Some(PathBuf::from("leases.json")),
            listen_port: default_listen_port(),
            http_listen: default_http_listen(),
            sweep_interval_seconds: Some(30),
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.check_pool_range()?;

        if self.ip_in_pool(self.server_ip) {
            return Err(Error::InvalidConfig(
                "server_ip must not be within the pool range".to_string(),
            ));
        }

        if let Some(router) = self.router
            && self.ip_in_pool(router)
        {
            return Err(Error::InvalidConfig(
                "router must not be within the pool range".to_string(),
            ));
        }

        if self.lease_duration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        if self.offer_hold_seconds == 0 {
            return Err(Error::InvalidConfig(
                "offer_hold_seconds must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval_seconds == Some(0) {
            return Err(Error::InvalidConfig(
                "sweep_interval_seconds must be greater than 0 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Checks that the pool range is ordered and small enough to seed.
    pub fn check_pool_range(&self) -> Result<()> {
        let start = u32::from(self.pool_start);
        let end = u32::from(self.pool_end);

        if start > end {
            return Err(Error::InvalidConfig(
                "pool_start must be less than or equal to pool_end".to_string(),
            ));
        }

        if end - start >= MAX_POOL_SIZE {
            return Err(Error::InvalidConfig(format!(
                "pool range holds {} addresses, at most {} allowed",
                self.pool_size(),
                MAX_POOL_SIZE
            )));
        }

        Ok(())
    }

    pub fn ip_in_pool(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        let start = u32::from(self.pool_start);
        let end = u32::from(self.pool_end);
        addr >= start && addr <= end
    }

    pub fn pool_size(&self) -> u64 {
        let start = u64::from(u32::from(self.pool_start));
        let end = u64::from(u32::from(self.pool_end));
        (end + 1).saturating_sub(start)
    }

    /// Every address in `pool_start..=pool_end`, ascending.
    pub fn pool_addresses(&self) -> Vec<Ipv4Addr> {
        (u32::from(self.pool_start)..=u32::from(self.pool_end))
            .map(Ipv4Addr::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_start_greater_than_end() {
        let config = Config {
            pool_start: Ipv4Addr::new(192, 168, 1, 200),
            pool_end: Ipv4Addr::new(192, 168, 1, 100),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_pool_rejected() {
        let config = Config {
            server_ip: Ipv4Addr::new(192, 168, 0, 1),
            pool_start: Ipv4Addr::new(0, 0, 0, 0),
            pool_end: Ipv4Addr::new(255, 255, 255, 255),
            router: None,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig(reason)) if reason.contains("4294967296")
        ));

        let config = Config {
            server_ip: Ipv4Addr::new(10, 2, 0, 0),
            pool_start: Ipv4Addr::new(10, 0, 0, 0),
            pool_end: Ipv4Addr::new(10, 0, 255, 255),
            router: None,
            ..Default::default()
        };
        assert_eq!(config.pool_size(), u64::from(MAX_POOL_SIZE));
        assert!(config.validate().is_ok());

        let config = Config {
            pool_end: Ipv4Addr::new(10, 1, 0, 0),
            ..config
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_ip_in_pool() {
        let config = Config {
            server_ip: Ipv4Addr::new(192, 168, 1, 150),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_router_in_pool() {
        let config = Config {
            router: Some(Ipv4Addr::new(192, 168, 1, 120)),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_durations_rejected() {
        let config = Config {
            lease_duration_seconds: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            offer_hold_seconds: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            sweep_interval_seconds: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ip_in_pool() {
        let config = Config::default();
        assert!(config.ip_in_pool(Ipv4Addr::new(192, 168, 1, 150)));
        assert!(!config.ip_in_pool(Ipv4Addr::new(192, 168, 1, 50)));
        assert!(!config.ip_in_pool(Ipv4Addr::new(192, 168, 1, 250)));
    }

    #[test]
    fn test_pool_size_and_addresses() {
        let config = Config::default();
        assert_eq!(config.pool_size(), 101);

        let addresses = config.pool_addresses();
        assert_eq!(addresses.len(), 101);
        assert_eq!(addresses.first(), Some(&Ipv4Addr::new(192, 168, 1, 100)));
        assert_eq!(addresses.last(), Some(&Ipv4Addr::new(192, 168, 1, 200)));
    }

    #[test]
    fn test_missing_optional_fields_use_defaults() {
        let json = r#"{
            "server_ip": "10.0.0.254",
            "subnet_mask": "255.255.255.0",
            "pool_start": "10.0.0.1",
            "pool_end": "10.0.0.10",
            "router": null,
            "dns_servers": [],
            "lease_duration_seconds": 600
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.offer_hold_seconds, 60);
        assert_eq!(config.allocation, AllocationPolicy::Lowest);
        assert_eq!(config.listen_port, 67);
        assert!(config.leases_file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_allocation_policy_serde() {
        let policy: AllocationPolicy = serde_json::from_str("\"random\"").unwrap();
        assert_eq!(policy, AllocationPolicy::Random);
        assert_eq!(
            serde_json::to_string(&AllocationPolicy::Lowest).unwrap(),
            "\"lowest\""
        );
    }
}
