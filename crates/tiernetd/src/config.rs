//! tiernetd.toml configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tiernet_discovery::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    pub cluster: ClusterConfig,
    pub parent: ParentConfig,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 10100)),
            data_dir: PathBuf::from("/var/lib/tiernet"),
            cluster: ClusterConfig::default(),
            parent: ParentConfig::default(),
        }
    }
}

/// Identity of a cluster tier, as announced to its parent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub id: Option<String>,
    /// Address the parent calls back on. Defaults to the listen address.
    pub advertise_address: Option<String>,
    pub advertise_port: Option<u16>,
}

/// How to reach the parent tier. The retry settings also govern the root
/// tier's callbacks to its clusters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParentConfig {
    pub url: Option<String>,
    #[serde(flatten)]
    pub retry: RetryPolicy,
}

/// Settings a cluster tier cannot run without.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterIdentity {
    pub cluster_id: String,
    pub parent_url: String,
    pub advertise_address: String,
    pub advertise_port: u16,
}

impl TierConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: TierConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("tiernet.redb")
    }

    pub fn cluster_identity(&self) -> anyhow::Result<ClusterIdentity> {
        let cluster_id = self
            .cluster
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .context("cluster mode needs cluster.id")?;
        let parent_url = self
            .parent
            .url
            .clone()
            .filter(|url| !url.is_empty())
            .context("cluster mode needs parent.url")?;
        let advertise_address = self
            .cluster
            .advertise_address
            .clone()
            .unwrap_or_else(|| self.listen.ip().to_string());
        Ok(ClusterIdentity {
            cluster_id,
            parent_url,
            advertise_address,
            advertise_port: self.cluster.advertise_port.unwrap_or(self.listen.port()),
        })
    }
}
