//! fleet.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::duration::hms;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub tenant_defaults: TenantConfig,
    /// Per-tenant overrides, keyed by tenant name.
    pub tenants: HashMap<String, TenantConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            data_dir: PathBuf::from("/var/lib/fleetgrid"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between rollout scheduler ticks.
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_secs: 10 }
    }
}

/// Settings a tenant can tune for its device fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    /// Sleep interval handed to polling devices.
    #[serde(with = "hms")]
    pub polling_time: Duration,
    /// Lower bound for any sleep interval handed to devices.
    #[serde(with = "hms")]
    pub min_polling_time: Duration,
    /// How many polls a device should fit in before a maintenance window opens.
    pub maintenance_window_poll_count: u32,
    /// Allow more than one concurrently active deployment per target.
    pub multi_assignments: bool,
    /// Cap on device-reported status entries per action.
    pub max_status_entries_per_action: u32,
    /// Cap on detail messages carried by a single feedback.
    pub max_messages_per_status: u32,
    pub max_targets_per_rollout_group: u32,
    /// Cap on the number of groups a rollout is split into.
    pub max_groups_per_rollout: u32,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            polling_time: Duration::from_secs(300),
            min_polling_time: Duration::from_secs(30),
            maintenance_window_poll_count: 3,
            multi_assignments: false,
            max_status_entries_per_action: 100,
            max_messages_per_status: 50,
            max_targets_per_rollout_group: 20_000,
            max_groups_per_rollout: 500,
        }
    }
}

impl TenantConfig {
    /// The configured polling interval, never shorter than the minimum.
    pub fn effective_polling_time(&self) -> Duration {
        self.polling_time.max(self.min_polling_time)
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Settings for `tenant`, falling back to the defaults section.
    pub fn tenant(&self, tenant: &str) -> &TenantConfig {
        self.tenants.get(tenant).unwrap_or(&self.tenant_defaults)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler.tick_secs == 0 {
            anyhow::bail!("scheduler.tick_secs must be positive");
        }
        validate_tenant("tenant_defaults", &self.tenant_defaults)?;
        for (name, tenant) in &self.tenants {
            validate_tenant(name, tenant)?;
        }
        Ok(())
    }
}

fn validate_tenant(name: &str, tenant: &TenantConfig) -> anyhow::Result<()> {
    if tenant.maintenance_window_poll_count == 0 {
        anyhow::bail!("{name}: maintenance_window_poll_count must be positive");
    }
    if tenant.max_status_entries_per_action == 0 {
        anyhow::bail!("{name}: max_status_entries_per_action must be positive");
    }
    if tenant.max_groups_per_rollout == 0 {
        anyhow::bail!("{name}: max_groups_per_rollout must be positive");
    }
    Ok(())
}
