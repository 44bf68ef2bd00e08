//! libvirt-backed hypervisor provider.
//!
//! One lazily opened connection is shared by every dispensed handle. Each
//! call checks liveness and reopens if the daemon went away; cancelling the
//! driver context closes the connection for good, after which dispensing
//! fails with `ConnectionClosed`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use serde::Deserialize;
use tokio::sync::{Mutex, watch};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::network::Network;
use virt::storage_pool::StoragePool;
use virt::sys;

use crate::cloudinit::{CloudInitConfig, IsoBuilder};
use crate::config::EmulatorConfig;
use crate::domain::DomainXmlBuilder;
use crate::error::{Result, VirtError};
use crate::providers::{
    DhcpLease, HostInfo, NetworkInterfaceInfo, NetworkLookup, VirtNetwork, Virtualizer, VmInfo,
    VmState,
};
use crate::vm_config::VmConfig;

/// Directory-backed storage pool owned by this provider.
pub const STORAGE_POOL_NAME: &str = "virt-sp";

const DEFAULT_URI: &str = "qemu:///system";

/// Where libvirt's dnsmasq publishes its lease database, one file per bridge.
const DNSMASQ_STATUS_DIR: &str = "/var/lib/libvirt/dnsmasq";

thread_local! {
    static AUTH_CREDENTIALS: std::cell::RefCell<Option<(String, String)>> =
        std::cell::RefCell::new(None);
}

/// Fills in username/password credentials from [`AUTH_CREDENTIALS`]; used as
/// the fn pointer passed to `ConnectAuth::new`, which cannot take a closure.
fn auth_callback(creds: &mut Vec<virt::connect::ConnectCredential>) {
    AUTH_CREDENTIALS.with(|cell| {
        let Some((user, password)) = cell.borrow().clone() else {
            return;
        };
        for cred in creds.iter_mut() {
            match cred.typed as u32 {
                sys::VIR_CRED_AUTHNAME => {
                    cred.result = Some(user.clone());
                }
                sys::VIR_CRED_PASSPHRASE => {
                    cred.result = Some(password.clone());
                }
                _ => {}
            }
        }
    });
}

enum ConnState {
    /// Never opened, or dropped after a liveness failure.
    Disconnected,
    Connected(Connect),
    /// Driver context cancelled; stays closed forever.
    Closed,
}

struct Connection {
    uri: String,
    user: Option<String>,
    password: Option<String>,
    state: Mutex<ConnState>,
}

impl Connection {
    fn new(emulator: &EmulatorConfig) -> Self {
        Self {
            uri: emulator
                .uri
                .clone()
                .unwrap_or_else(|| DEFAULT_URI.to_string()),
            user: emulator.user.clone(),
            password: emulator.password.clone(),
            state: Mutex::new(ConnState::Disconnected),
        }
    }

    fn open(&self) -> Result<Connect> {
        tracing::info!("Connecting to hypervisor at {}", self.uri);
        let conn = match (&self.user, &self.password) {
            (Some(user), Some(password)) => {
                // `virt::connect::ConnectAuthCallback` is a bare fn pointer
                // (it cannot capture variables), so the credentials are
                // stashed in a thread-local for `auth_callback` to read.
                AUTH_CREDENTIALS.with(|cell| {
                    *cell.borrow_mut() = Some((user.clone(), password.clone()));
                });
                let mut auth = virt::connect::ConnectAuth::new(
                    vec![sys::VIR_CRED_AUTHNAME, sys::VIR_CRED_PASSPHRASE],
                    auth_callback,
                );
                let result = Connect::open_auth(Some(&self.uri), &mut auth, 0);
                AUTH_CREDENTIALS.with(|cell| {
                    *cell.borrow_mut() = None;
                });
                result?
            }
            _ => Connect::open(Some(&self.uri))?,
        };
        Ok(conn)
    }

    /// Run `f` against a live connection, opening or reopening as needed.
    async fn with<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connect) -> Result<T>,
    {
        let mut state = self.state.lock().await;
        let alive = match &*state {
            ConnState::Closed => return Err(VirtError::ConnectionClosed),
            ConnState::Connected(conn) => conn.is_alive().unwrap_or(false),
            ConnState::Disconnected => false,
        };
        if !alive {
            if matches!(&*state, ConnState::Connected(_)) {
                tracing::warn!("Hypervisor connection lost, reopening");
            }
            *state = ConnState::Connected(self.open()?);
        }
        match &*state {
            ConnState::Connected(conn) => f(conn),
            _ => Err(VirtError::ConnectionClosed),
        }
    }

    async fn ensure_alive(&self) -> Result<()> {
        self.with(|_| Ok(())).await
    }

    /// Close permanently. Dispenses fail from here on.
    async fn close(&self) {
        let mut state = self.state.lock().await;
        if let ConnState::Connected(conn) = &mut *state {
            let _ = conn.close();
        }
        *state = ConnState::Closed;
    }
}

fn lookup_domain(conn: &Connect, name: &str) -> Result<Domain> {
    Domain::lookup_by_name(conn, name).map_err(|e| {
        if e.code() == virt::error::ErrorNumber::NoDomain {
            VirtError::DomainNotFound(name.to_string())
        } else {
            e.into()
        }
    })
}

fn lookup_network(conn: &Connect, name: &str) -> Result<Network> {
    Network::lookup_by_name(conn, name).map_err(|e| {
        if e.code() == virt::error::ErrorNumber::NoNetwork {
            VirtError::NetworkNotFound(name.to_string())
        } else {
            e.into()
        }
    })
}

/// Map a raw libvirt domain state into the common set, keeping the raw name.
fn map_domain_state(state: sys::virDomainState) -> (VmState, &'static str) {
    match state {
        sys::VIR_DOMAIN_RUNNING => (VmState::Running, "running"),
        sys::VIR_DOMAIN_BLOCKED => (VmState::Running, "blocked"),
        sys::VIR_DOMAIN_PAUSED => (VmState::Paused, "paused"),
        sys::VIR_DOMAIN_SHUTDOWN => (VmState::Shutdown, "shutdown"),
        sys::VIR_DOMAIN_SHUTOFF => (VmState::Poweroff, "shutoff"),
        sys::VIR_DOMAIN_CRASHED => (VmState::Error, "crashed"),
        sys::VIR_DOMAIN_PMSUSPENDED => (VmState::Suspended, "pmsuspended"),
        _ => (VmState::Unknown, "nostate"),
    }
}

fn format_version(encoded: u64) -> String {
    format!(
        "{}.{}.{}",
        encoded / 1_000_000,
        (encoded / 1_000) % 1_000,
        encoded % 1_000
    )
}

fn pool_xml(data_dir: &std::path::Path) -> String {
    format!(
        "<pool type='dir'>\
           <name>{STORAGE_POOL_NAME}</name>\
           <target><path>{}</path></target>\
         </pool>",
        data_dir.display()
    )
}

#[derive(Clone)]
pub struct LibvirtProvider {
    data_dir: PathBuf,
    conn: Arc<Connection>,
    iso: Arc<IsoBuilder>,
    /// VM names whose generated config files are kept on destroy.
    preserved: Arc<Mutex<std::collections::HashSet<String>>>,
    shutdown: watch::Receiver<bool>,
}

impl LibvirtProvider {
    pub fn new(
        emulator: &EmulatorConfig,
        data_dir: PathBuf,
        iso: Arc<IsoBuilder>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            data_dir,
            conn: Arc::new(Connection::new(emulator)),
            iso,
            preserved: Arc::new(Mutex::new(std::collections::HashSet::new())),
            shutdown,
        }
    }

    fn iso_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.iso"))
    }

    /// Find the `virt-sp` pool among active pools, creating a directory pool
    /// over the data dir when it is missing.
    fn ensure_storage_pool(&self, conn: &Connect) -> Result<()> {
        let pools = conn.list_all_storage_pools(sys::VIR_CONNECT_LIST_STORAGE_POOLS_ACTIVE)?;
        if pools
            .iter()
            .any(|p| p.get_name().map(|n| n == STORAGE_POOL_NAME).unwrap_or(false))
        {
            return Ok(());
        }

        tracing::info!(
            "Creating storage pool {STORAGE_POOL_NAME} at {}",
            self.data_dir.display()
        );
        let pool = StoragePool::define_xml(conn, &pool_xml(&self.data_dir), 0)?;
        pool.build(0)?;
        pool.create(0)?;
        Ok(())
    }

    fn refresh_storage_pool(&self, conn: &Connect) -> Result<()> {
        let pool = StoragePool::lookup_by_name(conn, STORAGE_POOL_NAME)?;
        pool.refresh(0)?;
        Ok(())
    }

    fn remove_config_files(&self, name: &str) {
        for path in [self.iso_path(name), self.data_dir.join(format!("{name}.img"))] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!("Could not remove {}: {e}", path.display());
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Virtualizer for LibvirtProvider {
    fn name(&self) -> &str {
        "libvirt"
    }

    async fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        self.conn.with(|conn| self.ensure_storage_pool(conn)).await?;

        // Close the connection when the driver context goes away.
        let conn = self.conn.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let _ = shutdown.changed().await;
            conn.close().await;
        });
        Ok(())
    }

    async fn create_vm(&self, config: &VmConfig) -> Result<()> {
        let exists = self
            .conn
            .with(|conn| match lookup_domain(conn, &config.name) {
                Ok(_) => Ok(true),
                Err(VirtError::DomainNotFound(_)) => Ok(false),
                Err(e) => Err(e),
            })
            .await?;
        if exists {
            return Err(VirtError::DomainExists(config.name.clone()));
        }

        let iso_path = self.iso_path(&config.name);
        let generate_iso = self.uses_cloud_init() && config.domain_xml.is_none();
        if generate_iso {
            self.iso
                .build(&CloudInitConfig::from_vm_config(config), &iso_path)
                .await?;
        }

        // Every step from here must undo its effects on failure.
        let result = async {
            self.conn.with(|conn| self.refresh_storage_pool(conn)).await?;

            let xml = match &config.domain_xml {
                Some(xml) => xml.clone(),
                None => DomainXmlBuilder::new(config)
                    .cloudinit_iso(&iso_path)
                    .build()?,
            };

            self.conn
                .with(|conn| {
                    let domain = Domain::define_xml(conn, &xml)?;
                    if let Err(e) = domain.create() {
                        // Keep the host clean: a defined-but-unstartable
                        // domain would block the next attempt.
                        if let Err(undef) = domain.undefine() {
                            tracing::warn!(
                                "Undefine of {} after failed start also failed: {undef}",
                                config.name
                            );
                        }
                        return Err(e.into());
                    }
                    Ok(())
                })
                .await
        }
        .await;

        if let Err(e) = result {
            if generate_iso {
                if let Err(rm) = std::fs::remove_file(&iso_path) {
                    tracing::warn!("Could not remove {}: {rm}", iso_path.display());
                }
            }
            return Err(e);
        }

        if !config.remove_config_files {
            self.preserved.lock().await.insert(config.name.clone());
        }
        tracing::info!("Created and started domain {}", config.name);
        Ok(())
    }

    async fn stop_vm(&self, name: &str) -> Result<()> {
        self.conn
            .with(|conn| {
                let domain = match lookup_domain(conn, name) {
                    Ok(domain) => domain,
                    // Already gone is what a stop wants anyway.
                    Err(VirtError::DomainNotFound(_)) => return Ok(()),
                    Err(e) => return Err(e),
                };
                match domain.destroy_flags(sys::VIR_DOMAIN_DESTROY_GRACEFUL) {
                    Ok(_) => Ok(()),
                    Err(e) if e.code() == virt::error::ErrorNumber::OperationInvalid => {
                        // Domain is already off.
                        Ok(())
                    }
                    Err(_) => match domain.destroy() {
                        Ok(_) => Ok(()),
                        Err(e)
                            if e.code() == virt::error::ErrorNumber::OperationInvalid
                                || e.code() == virt::error::ErrorNumber::NoDomain =>
                        {
                            Ok(())
                        }
                        Err(e) => Err(e.into()),
                    },
                }
            })
            .await
    }

    async fn destroy_vm(&self, name: &str) -> Result<()> {
        self.stop_vm(name).await?;
        self.conn
            .with(|conn| {
                let domain = match lookup_domain(conn, name) {
                    Ok(domain) => domain,
                    Err(VirtError::DomainNotFound(_)) => return Ok(()),
                    Err(e) => return Err(e),
                };
                match domain.undefine() {
                    Ok(_) => Ok(()),
                    Err(e) if e.code() == virt::error::ErrorNumber::NoDomain => Ok(()),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        if !self.preserved.lock().await.remove(name) {
            self.remove_config_files(name);
        }
        tracing::info!("Destroyed domain {name}");
        Ok(())
    }

    async fn get_vm(&self, name: &str) -> Result<VmInfo> {
        self.conn
            .with(|conn| {
                let domain = lookup_domain(conn, name)?;
                let info = domain.get_info()?;
                let (state, raw_state) = map_domain_state(info.state);
                Ok(VmInfo {
                    raw_state: raw_state.to_string(),
                    state,
                    memory_kb: info.memory,
                    max_memory_kb: info.max_mem,
                    cpu_time_ns: info.cpu_time,
                    num_vcpus: info.nr_virt_cpu,
                })
            })
            .await
    }

    async fn get_info(&self) -> Result<HostInfo> {
        self.conn
            .with(|conn| {
                let node = conn.get_node_info()?;
                let free_memory = conn.get_free_memory().unwrap_or(0);
                Ok(HostInfo {
                    cores: node.cpus,
                    memory_kb: node.memory,
                    free_memory_kb: free_memory / 1024,
                    running_domains: conn.num_of_domains()?,
                    inactive_domains: conn.num_of_defined_domains()?,
                    storage_pools: conn
                        .list_all_storage_pools(sys::VIR_CONNECT_LIST_STORAGE_POOLS_ACTIVE)?
                        .len() as u32,
                    emulator_version: conn.get_hyp_version()? as u64,
                    library_version: conn.get_lib_version()? as u64,
                })
            })
            .await
    }

    async fn get_network_interfaces(&self, name: &str) -> Result<Vec<NetworkInterfaceInfo>> {
        let (xml, guest_ifaces, networks) = self
            .conn
            .with(|conn| {
                let domain = lookup_domain(conn, name)?;
                let xml = domain.get_xml_desc(0)?;
                // Guest-reported names and addresses need the agent; absence
                // is normal early in boot.
                let guest = domain
                    .interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_AGENT, 0)
                    .unwrap_or_default();
                let networks: Vec<(String, String)> = conn
                    .list_all_networks(sys::VIR_CONNECT_LIST_NETWORKS_ACTIVE)?
                    .iter()
                    .filter_map(|n| Some((n.get_name().ok()?, n.get_bridge_name().ok()?)))
                    .collect();
                Ok((xml, guest, networks))
            })
            .await?;

        let mut out = Vec::new();
        for parsed in crate::domain::parse_interfaces(&xml)? {
            let network = parsed.bridge.as_ref().and_then(|bridge| {
                networks
                    .iter()
                    .find(|(_, b)| b == bridge)
                    .map(|(n, _)| n.clone())
            });
            let guest_match = parsed.mac.as_ref().and_then(|mac| {
                guest_ifaces
                    .iter()
                    .find(|iface| iface.hwaddr.eq_ignore_ascii_case(mac))
            });
            out.push(NetworkInterfaceInfo {
                network,
                bridge: parsed.bridge,
                mac: parsed.mac,
                host_device: parsed.device,
                guest_device: guest_match.map(|iface| iface.name.clone()),
                addrs: guest_match
                    .map(|iface| {
                        iface
                            .addrs
                            .iter()
                            .filter_map(|a| a.addr.parse::<IpAddr>().ok())
                            .collect()
                    })
                    .unwrap_or_default(),
            });
        }
        Ok(out)
    }

    fn network_lookup(&self) -> Arc<dyn NetworkLookup> {
        Arc::new(LibvirtNetworkLookup {
            conn: self.conn.clone(),
        })
    }

    async fn fingerprint_attrs(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        match self.get_info().await {
            Ok(info) => {
                attrs.insert(
                    "driver.virt.libvirt.version".to_string(),
                    format_version(info.library_version),
                );
                attrs.insert(
                    "driver.virt.emulator.version".to_string(),
                    format_version(info.emulator_version),
                );
                attrs.insert(
                    "driver.virt.active".to_string(),
                    info.running_domains.to_string(),
                );
                attrs.insert(
                    "driver.virt.inactive".to_string(),
                    info.inactive_domains.to_string(),
                );
            }
            Err(e) => {
                tracing::warn!("Fingerprint could not query host info: {e}");
                return attrs;
            }
        }

        let lookup = self.network_lookup();
        if let Ok(networks) = lookup.list().await {
            for network in networks {
                let name = network.name().to_string();
                let state = match network.is_active().await {
                    Ok(true) => "active",
                    Ok(false) => "inactive",
                    Err(_) => "unknown",
                };
                attrs.insert(format!("driver.virt.{name}.state"), state.to_string());
                if let Ok(bridge) = network.bridge_name().await {
                    attrs.insert(format!("driver.virt.{name}.bridge_name"), bridge);
                }
            }
        }
        attrs
    }

    fn uses_cloud_init(&self) -> bool {
        true
    }

    async fn dispense(&self) -> Result<Box<dyn Virtualizer>> {
        self.conn.ensure_alive().await?;
        Ok(Box::new(self.clone()))
    }
}

struct LibvirtNetworkLookup {
    conn: Arc<Connection>,
}

#[async_trait::async_trait]
impl NetworkLookup for LibvirtNetworkLookup {
    async fn list(&self) -> Result<Vec<Box<dyn VirtNetwork>>> {
        let names = self
            .conn
            .with(|conn| {
                Ok(conn
                    .list_all_networks(sys::VIR_CONNECT_LIST_NETWORKS_ACTIVE)?
                    .iter()
                    .filter_map(|n| n.get_name().ok())
                    .collect::<Vec<_>>())
            })
            .await?;
        Ok(names
            .into_iter()
            .map(|name| {
                Box::new(LibvirtNetwork {
                    name,
                    conn: self.conn.clone(),
                }) as Box<dyn VirtNetwork>
            })
            .collect())
    }

    async fn lookup(&self, name: &str) -> Result<Box<dyn VirtNetwork>> {
        self.conn
            .with(|conn| lookup_network(conn, name).map(|_| ()))
            .await?;
        Ok(Box::new(LibvirtNetwork {
            name: name.to_string(),
            conn: self.conn.clone(),
        }))
    }
}

struct LibvirtNetwork {
    name: String,
    conn: Arc<Connection>,
}

impl LibvirtNetwork {
    async fn with_network<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Network) -> Result<T>,
    {
        let name = self.name.clone();
        self.conn
            .with(move |conn| {
                let network = lookup_network(conn, &name)?;
                f(&network)
            })
            .await
    }
}

#[async_trait::async_trait]
impl VirtNetwork for LibvirtNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bridge_name(&self) -> Result<String> {
        self.with_network(|n| Ok(n.get_bridge_name()?)).await
    }

    async fn is_active(&self) -> Result<bool> {
        self.with_network(|n| Ok(n.is_active()?)).await
    }

    async fn dhcp_leases(&self) -> Result<Vec<DhcpLease>> {
        let bridge = self.bridge_name().await?;
        let path = PathBuf::from(DNSMASQ_STATUS_DIR).join(format!("{bridge}.status"));
        let bytes = tokio::fs::read(&path).await?;
        parse_lease_db(&bytes)
    }

    async fn add_dhcp_host(&self, xml: &str) -> Result<()> {
        let xml = xml.to_string();
        self.with_network(move |n| {
            n.update(
                sys::VIR_NETWORK_UPDATE_COMMAND_ADD_LAST,
                sys::VIR_NETWORK_SECTION_IP_DHCP_HOST,
                -1,
                &xml,
                sys::VIR_NETWORK_UPDATE_AFFECT_LIVE | sys::VIR_NETWORK_UPDATE_AFFECT_CONFIG,
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_dhcp_host(&self, xml: &str) -> Result<()> {
        let xml = xml.to_string();
        self.with_network(move |n| {
            n.update(
                sys::VIR_NETWORK_UPDATE_COMMAND_DELETE,
                sys::VIR_NETWORK_SECTION_IP_DHCP_HOST,
                -1,
                &xml,
                sys::VIR_NETWORK_UPDATE_AFFECT_LIVE | sys::VIR_NETWORK_UPDATE_AFFECT_CONFIG,
            )?;
            Ok(())
        })
        .await
    }

    async fn xml_desc(&self) -> Result<String> {
        self.with_network(|n| Ok(n.get_xml_desc(0)?)).await
    }

    async fn bridge_addr(&self) -> Result<Ipv4Addr> {
        let bridge = self.bridge_name().await?;
        crate::net::ipv4_of_iface(&bridge).ok_or_else(|| {
            VirtError::NetworkNotFound(format!("bridge {bridge} has no IPv4 address"))
        })
    }
}

/// One lease entry in dnsmasq's status database.
#[derive(Debug, Deserialize)]
struct DnsmasqLease {
    #[serde(rename = "ip-address")]
    ip_address: String,
    #[serde(rename = "mac-address")]
    mac_address: String,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(rename = "expiry-time")]
    expiry_time: i64,
}

fn parse_lease_db(bytes: &[u8]) -> Result<Vec<DhcpLease>> {
    let raw: Vec<DnsmasqLease> = serde_json::from_slice(bytes)?;
    Ok(raw
        .into_iter()
        .filter_map(|lease| {
            Some(DhcpLease {
                ip: lease.ip_address.parse().ok()?,
                mac: lease.mac_address,
                hostname: lease.hostname,
                expiry: DateTime::from_timestamp(lease.expiry_time, 0)?,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn domain_states_map_into_the_closed_set() {
        assert_eq!(
            map_domain_state(sys::VIR_DOMAIN_RUNNING),
            (VmState::Running, "running")
        );
        assert_eq!(
            map_domain_state(sys::VIR_DOMAIN_SHUTOFF),
            (VmState::Poweroff, "shutoff")
        );
        assert_eq!(
            map_domain_state(sys::VIR_DOMAIN_CRASHED),
            (VmState::Error, "crashed")
        );
        assert_eq!(
            map_domain_state(sys::VIR_DOMAIN_PMSUSPENDED),
            (VmState::Suspended, "pmsuspended")
        );
        assert_eq!(
            map_domain_state(sys::VIR_DOMAIN_NOSTATE),
            (VmState::Unknown, "nostate")
        );
    }

    #[test]
    fn versions_decode_from_libvirt_encoding() {
        assert_eq!(format_version(10_002_003), "10.2.3");
        assert_eq!(format_version(0), "0.0.0");
    }

    #[test]
    fn pool_xml_names_the_data_dir() {
        let xml = pool_xml(std::path::Path::new("/var/lib/virt"));
        assert!(xml.contains("<name>virt-sp</name>"));
        assert!(xml.contains("<path>/var/lib/virt</path>"));
        assert!(xml.contains("type='dir'"));
    }

    #[test]
    fn lease_db_parses_and_skips_malformed_entries() {
        let json = br#"[
            {
                "ip-address": "192.168.122.50",
                "mac-address": "52:54:00:ab:cd:ef",
                "hostname": "90abcdef",
                "client-id": "01:52:54:00:ab:cd:ef",
                "expiry-time": 4102444800
            },
            {
                "ip-address": "not-an-ip",
                "mac-address": "52:54:00:00:00:01",
                "expiry-time": 4102444800
            }
        ]"#;

        let leases = parse_lease_db(json).unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].mac, "52:54:00:ab:cd:ef");
        assert_eq!(leases[0].hostname.as_deref(), Some("90abcdef"));
        assert!(leases[0].expiry > Utc::now());
    }

    #[test]
    fn cloudinit_config_carries_the_vm_identity() {
        let config = VmConfig {
            name: "90abcdef".to_string(),
            hostname: "myhost".to_string(),
            run_cmds: vec!["touch /ran".to_string()],
            default_user_password: Some("secret".to_string()),
            ..Default::default()
        };
        let ci = CloudInitConfig::from_vm_config(&config);
        assert_eq!(ci.instance_id, "90abcdef");
        assert_eq!(ci.hostname, "myhost");
        assert_eq!(ci.vendor.run_cmds, vec!["touch /ran".to_string()]);
        assert_eq!(ci.vendor.password.as_deref(), Some("secret"));
    }
}
