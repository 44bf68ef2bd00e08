//! Hypervisor providers.
//!
//! Each provider implements [`Virtualizer`]; the registry dispenses a fresh
//! handle per call so connection state is shared but every caller observes
//! its own cancellation.

pub mod cloud_hypervisor;
pub mod libvirt;

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::vm_config::VmConfig;

/// Common VM lifecycle states every provider maps into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Starting,
    Running,
    Paused,
    Suspended,
    Shutdown,
    Poweroff,
    Error,
    Unknown,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Paused => "paused",
            VmState::Suspended => "suspended",
            VmState::Shutdown => "shutdown",
            VmState::Poweroff => "poweroff",
            VmState::Error => "error",
            VmState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a VM. Queried on demand, never cached.
#[derive(Debug, Clone)]
pub struct VmInfo {
    /// Provider-specific state string, kept for operator-facing output.
    pub raw_state: String,
    pub state: VmState,
    /// Current and maximum memory, in KiB as reported by the hypervisor.
    pub memory_kb: u64,
    pub max_memory_kb: u64,
    pub cpu_time_ns: u64,
    pub num_vcpus: u32,
}

/// Host-level counters for the fingerprint.
#[derive(Debug, Clone, Default)]
pub struct HostInfo {
    pub cores: u32,
    pub memory_kb: u64,
    pub free_memory_kb: u64,
    pub running_domains: u32,
    pub inactive_domains: u32,
    pub storage_pools: u32,
    /// Hypervisor (emulator) version, encoded `major*1_000_000 + minor*1_000 + release`.
    pub emulator_version: u64,
    /// Management library version, same encoding.
    pub library_version: u64,
}

/// One guest interface as seen from the host.
#[derive(Debug, Clone)]
pub struct NetworkInterfaceInfo {
    /// Name of the hypervisor network the bridge belongs to, when resolvable.
    pub network: Option<String>,
    pub bridge: Option<String>,
    pub mac: Option<String>,
    /// Host-side device (tap) name.
    pub host_device: Option<String>,
    /// Guest-reported device name, when an in-guest agent answers.
    pub guest_device: Option<String>,
    pub addrs: Vec<IpAddr>,
}

/// A DHCP lease held by a network's address authority.
#[derive(Debug, Clone, PartialEq)]
pub struct DhcpLease {
    pub mac: String,
    pub ip: IpAddr,
    pub hostname: Option<String>,
    pub expiry: DateTime<Utc>,
}

/// The minimal "look up networks" capability the network controller needs.
///
/// Passed explicitly so the controller never holds a reference back to the
/// full provider.
#[async_trait::async_trait]
pub trait NetworkLookup: Send + Sync {
    async fn list(&self) -> Result<Vec<Box<dyn VirtNetwork>>>;
    async fn lookup(&self, name: &str) -> Result<Box<dyn VirtNetwork>>;
}

/// One virtual network, addressable by name.
#[async_trait::async_trait]
pub trait VirtNetwork: Send + Sync {
    fn name(&self) -> &str;
    async fn bridge_name(&self) -> Result<String>;
    async fn is_active(&self) -> Result<bool>;
    async fn dhcp_leases(&self) -> Result<Vec<DhcpLease>>;
    /// Pin `{ip, mac, name}` in the network's DHCP database, live + config.
    async fn add_dhcp_host(&self, xml: &str) -> Result<()>;
    async fn remove_dhcp_host(&self, xml: &str) -> Result<()>;
    async fn xml_desc(&self) -> Result<String>;
    /// Host-side address of the network's bridge (the DHCP server identity).
    async fn bridge_addr(&self) -> Result<Ipv4Addr>;
}

/// Capability set shared by all hypervisor providers.
#[async_trait::async_trait]
pub trait Virtualizer: Send + Sync {
    /// Provider name used for registry lookup and fingerprint prefixes.
    fn name(&self) -> &str;

    /// Open connections, ensure the storage pool, and get ready to serve.
    async fn init(&self) -> Result<()>;

    /// Define and start a VM. Fails with `DomainExists` for a name collision;
    /// every effect of a failed start is rolled back before returning.
    async fn create_vm(&self, config: &VmConfig) -> Result<()>;

    /// Stop a VM without undefining it. A VM that is already gone or already
    /// off counts as success.
    async fn stop_vm(&self, name: &str) -> Result<()>;

    /// Stop and undefine a VM, removing generated config files.
    async fn destroy_vm(&self, name: &str) -> Result<()>;

    async fn get_vm(&self, name: &str) -> Result<VmInfo>;

    async fn get_info(&self) -> Result<HostInfo>;

    async fn get_network_interfaces(&self, name: &str) -> Result<Vec<NetworkInterfaceInfo>>;

    /// Networks capability handed to the network controller.
    fn network_lookup(&self) -> Arc<dyn NetworkLookup>;

    /// Host capability attributes for the fingerprint. Keys already prefixed
    /// with `driver.virt` are published as-is; everything else is nested
    /// under the provider's namespace by the registry.
    async fn fingerprint_attrs(&self) -> HashMap<String, String>;

    /// Whether the driver should generate a first-boot ISO for this provider.
    fn uses_cloud_init(&self) -> bool;

    /// Fresh handle over the same underlying connection, with its own
    /// cancellation observation. Fails with `ConnectionClosed` after the
    /// driver context has been cancelled.
    async fn dispense(&self) -> Result<Box<dyn Virtualizer>>;
}

impl std::fmt::Debug for dyn Virtualizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Virtualizer").field("name", &self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_state_display_matches_wire_form() {
        for (state, s) in [
            (VmState::Starting, "starting"),
            (VmState::Running, "running"),
            (VmState::Paused, "paused"),
            (VmState::Suspended, "suspended"),
            (VmState::Shutdown, "shutdown"),
            (VmState::Poweroff, "poweroff"),
            (VmState::Error, "error"),
            (VmState::Unknown, "unknown"),
        ] {
            assert_eq!(state.to_string(), s);
        }
    }
}
