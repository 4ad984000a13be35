use std::{env, net::SocketAddr};

use anyhow::Result;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use state_store::UnknownBlobPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub data_dir: String,
    /// Remove reclaimable blob directories while restoring on startup.
    pub restore_clean: bool,
    pub gc_interval_secs: u64,
    pub unknown_blob_policy: UnknownBlobPolicy,
    pub structured_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let data_dir = env::current_dir().unwrap().join("blobd_storage/data");
        ServerConfig {
            listen_addr: "0.0.0.0:8700".to_string(),
            data_dir: data_dir.to_str().unwrap().to_string(),
            restore_clean: true,
            gc_interval_secs: 5,
            unknown_blob_policy: UnknownBlobPolicy::default(),
            structured_logging: false,
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.data_dir.is_empty() {
            return Err(anyhow::anyhow!("data_dir cannot be empty"));
        }
        if self.gc_interval_secs == 0 {
            return Err(anyhow::anyhow!("gc_interval_secs must be at least 1"));
        }
        Ok(())
    }
}
