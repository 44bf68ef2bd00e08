//! cloud-hypervisor-backed provider.
//!
//! Each VM is its own `cloud-hypervisor` process, managed over the REST API
//! on its Unix socket. Networking rides on an existing host bridge: the VMM
//! creates a tap device which is then enslaved to the configured bridge, and
//! leases come from the dnsmasq serving that bridge.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::DateTime;
use ch_client::{ApiClient, models};
use tokio::process::Command;
use tokio::sync::{Mutex, watch};

use crate::cloudinit::{CloudInitConfig, IsoBuilder};
use crate::domain::tap_device_name;
use crate::error::{Result, VirtError};
use crate::providers::{
    DhcpLease, HostInfo, NetworkInterfaceInfo, NetworkLookup, VirtNetwork, Virtualizer, VmInfo,
    VmState,
};
use crate::vm_config::VmConfig;

/// Guest firmware cloud-hypervisor boots when the task does not bring a
/// kernel of its own.
const DEFAULT_FIRMWARE: &str = "/usr/share/cloud-hypervisor/CLOUDHV.fd";

/// Standalone dnsmasq lease database for host bridges.
const DNSMASQ_LEASE_FILE: &str = "/var/lib/misc/dnsmasq.leases";

/// How long a graceful power-button shutdown may take before the VMM is
/// killed outright.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

struct ChVm {
    child: tokio::process::Child,
    client: ApiClient,
    run_dir: PathBuf,
    bridge: Option<String>,
    mac: String,
    tap: String,
    vcpus: u32,
}

#[derive(Clone)]
pub struct CloudHypervisorProvider {
    data_dir: PathBuf,
    firmware: PathBuf,
    iso: Arc<IsoBuilder>,
    vms: Arc<Mutex<HashMap<String, ChVm>>>,
    closed: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

impl CloudHypervisorProvider {
    pub fn new(
        data_dir: PathBuf,
        firmware: Option<PathBuf>,
        iso: Arc<IsoBuilder>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            data_dir,
            firmware: firmware.unwrap_or_else(|| PathBuf::from(DEFAULT_FIRMWARE)),
            iso,
            vms: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    fn run_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join("ch").join(name)
    }

    fn iso_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.iso"))
    }

    fn build_vm_config(
        &self,
        config: &VmConfig,
        iso_path: &std::path::Path,
        tap: &str,
        mac: &str,
    ) -> models::VmConfig {
        models::VmConfig {
            cpus: Some(models::CpusConfig {
                boot_vcpus: config.cpus,
                max_vcpus: config.cpus,
            }),
            memory: Some(models::MemoryConfig {
                size: (config.memory_mb * 1024 * 1024) as i64,
                shared: Some(true),
            }),
            payload: Some(models::PayloadConfig {
                firmware: Some(self.firmware.display().to_string()),
                ..Default::default()
            }),
            disks: Some(vec![
                models::DiskConfig {
                    path: config.primary_disk.display().to_string(),
                    readonly: Some(false),
                    direct: Some(true),
                },
                models::DiskConfig {
                    path: iso_path.display().to_string(),
                    readonly: Some(true),
                    direct: Some(true),
                },
            ]),
            net: Some(vec![models::NetConfig {
                tap: Some(tap.to_string()),
                mac: Some(mac.to_string()),
            }]),
            rng: Some(models::RngConfig {
                src: "/dev/urandom".to_string(),
            }),
            serial: Some(models::ConsoleConfig {
                mode: models::ConsoleMode::Tty,
                file: None,
            }),
            console: Some(models::ConsoleConfig {
                mode: models::ConsoleMode::Off,
                file: None,
            }),
        }
    }

    async fn cleanup_vm_files(&self, name: &str) {
        for path in [self.iso_path(name), self.data_dir.join(format!("{name}.img"))] {
            if path.exists() {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!("Could not remove {}: {e}", path.display());
                }
            }
        }
        let run_dir = self.run_dir(name);
        if run_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&run_dir).await {
                tracing::warn!("Could not remove {}: {e}", run_dir.display());
            }
        }
    }
}

/// Deterministic, locally administered MAC for a VM name, so lease discovery
/// has a stable address to look for.
fn mac_for_vm(name: &str) -> String {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    let v = hasher.finish();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        (v >> 16) as u8,
        (v >> 8) as u8,
        v as u8
    )
}

fn map_ch_state(state: models::VmState) -> (VmState, &'static str) {
    match state {
        models::VmState::Created => (VmState::Starting, "created"),
        models::VmState::Running => (VmState::Running, "running"),
        models::VmState::Shutdown => (VmState::Poweroff, "shutdown"),
        models::VmState::Paused => (VmState::Paused, "paused"),
        models::VmState::BreakPoint => (VmState::Unknown, "breakpoint"),
    }
}

async fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip").args(args).output().await?;
    if !output.status.success() {
        return Err(VirtError::from_output(format!("ip {}", args.join(" ")), &output));
    }
    Ok(())
}

#[async_trait::async_trait]
impl Virtualizer for CloudHypervisorProvider {
    fn name(&self) -> &str {
        "cloud-hypervisor"
    }

    async fn init(&self) -> Result<()> {
        std::fs::create_dir_all(self.data_dir.join("ch"))?;
        which::which("cloud-hypervisor")
            .map_err(|e| VirtError::Validation(vec![format!("cloud-hypervisor not found: {e}")]))?;

        let closed = self.closed.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let _ = shutdown.changed().await;
            closed.store(true, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn create_vm(&self, config: &VmConfig) -> Result<()> {
        if self.vms.lock().await.contains_key(&config.name) {
            return Err(VirtError::DomainExists(config.name.clone()));
        }

        let iso_path = self.iso_path(&config.name);
        self.iso
            .build(&CloudInitConfig::from_vm_config(config), &iso_path)
            .await?;

        let run_dir = self.run_dir(&config.name);
        tokio::fs::create_dir_all(&run_dir).await?;
        let api_socket = run_dir.join("api.sock");
        if api_socket.exists() {
            let _ = tokio::fs::remove_file(&api_socket).await;
        }

        tracing::info!("Spawning cloud-hypervisor for {}", config.name);
        let mut child = Command::new("cloud-hypervisor")
            .arg("--api-socket")
            .arg(&api_socket)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let tap = tap_device_name(&config.name);
        let mac = mac_for_vm(&config.name);
        let client = ApiClient::new(&api_socket);

        let result = async {
            // The API socket appears once the VMM is up.
            let ping = || async { client.vmm_ping().await };
            ping.retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(50))
                    .with_max_times(20),
            )
            .await?;

            client
                .create_vm(&self.build_vm_config(config, &iso_path, &tap, &mac))
                .await?;
            client.boot_vm().await?;

            // The VMM created the tap; hook it into the task's bridge.
            if let Some(net) = &config.network_interface {
                run_ip(&["link", "set", "dev", &tap, "master", &net.bridge.name]).await?;
                run_ip(&["link", "set", "dev", &tap, "up"]).await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            let _ = child.start_kill();
            let _ = child.wait().await;
            self.cleanup_vm_files(&config.name).await;
            return Err(e);
        }

        self.vms.lock().await.insert(
            config.name.clone(),
            ChVm {
                child,
                client,
                run_dir,
                bridge: config
                    .network_interface
                    .as_ref()
                    .map(|net| net.bridge.name.clone()),
                mac,
                tap,
                vcpus: config.cpus,
            },
        );
        tracing::info!("Created and booted vm {}", config.name);
        Ok(())
    }

    async fn stop_vm(&self, name: &str) -> Result<()> {
        let client = {
            let vms = self.vms.lock().await;
            let Some(vm) = vms.get(name) else {
                return Ok(());
            };
            vm.client.clone()
        };

        if let Err(e) = client.power_button_vm().await {
            if e.is_not_found() {
                return Ok(());
            }
            tracing::warn!("Power button for {name} failed, forcing shutdown: {e}");
        }

        let wait_for_off = async {
            loop {
                match client.vm_info().await {
                    Ok(info) if info.state == models::VmState::Shutdown => return,
                    Ok(_) => tokio::time::sleep(Duration::from_millis(500)).await,
                    Err(_) => return,
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, wait_for_off)
            .await
            .is_err()
        {
            tracing::warn!("{name} did not power off in time, shutting the VM down hard");
            if let Err(e) = client.shutdown_vm().await {
                if !e.is_not_found() {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn destroy_vm(&self, name: &str) -> Result<()> {
        self.stop_vm(name).await?;

        let Some(mut vm) = self.vms.lock().await.remove(name) else {
            return Ok(());
        };
        if let Err(e) = vm.client.delete_vm().await {
            if !e.is_not_found() {
                tracing::warn!("Deleting vm {name} from the VMM failed: {e}");
            }
        }
        let _ = vm.client.shutdown_vmm().await;
        let _ = vm.child.start_kill();
        let _ = vm.child.wait().await;

        self.cleanup_vm_files(name).await;
        tracing::info!("Destroyed vm {name}");
        Ok(())
    }

    async fn get_vm(&self, name: &str) -> Result<VmInfo> {
        let mut vms = self.vms.lock().await;
        let Some(vm) = vms.get_mut(name) else {
            return Err(VirtError::DomainNotFound(name.to_string()));
        };

        // A dead VMM process means the VM is gone, whatever the API said last.
        if vm.child.try_wait()?.is_some() {
            vms.remove(name);
            return Err(VirtError::DomainNotFound(name.to_string()));
        }

        let vcpus = vm.vcpus;
        let info = match vm.client.vm_info().await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                return Err(VirtError::DomainNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let (state, raw_state) = map_ch_state(info.state);
        let memory_kb = info.memory_actual_size.unwrap_or(0) as u64 / 1024;
        Ok(VmInfo {
            raw_state: raw_state.to_string(),
            state,
            memory_kb,
            max_memory_kb: memory_kb,
            // cloud-hypervisor does not expose guest CPU time on vm.info.
            cpu_time_ns: 0,
            num_vcpus: vcpus,
        })
    }

    async fn get_info(&self) -> Result<HostInfo> {
        let sys = sysinfo::System::new_with_specifics(
            sysinfo::RefreshKind::nothing()
                .with_memory(sysinfo::MemoryRefreshKind::everything())
                .with_cpu(sysinfo::CpuRefreshKind::everything()),
        );
        Ok(HostInfo {
            cores: sys.cpus().len() as u32,
            memory_kb: sys.total_memory() / 1024,
            free_memory_kb: sys.available_memory() / 1024,
            running_domains: self.vms.lock().await.len() as u32,
            inactive_domains: 0,
            storage_pools: 0,
            emulator_version: 0,
            library_version: 0,
        })
    }

    async fn get_network_interfaces(&self, name: &str) -> Result<Vec<NetworkInterfaceInfo>> {
        let vms = self.vms.lock().await;
        let Some(vm) = vms.get(name) else {
            return Err(VirtError::DomainNotFound(name.to_string()));
        };
        Ok(vec![NetworkInterfaceInfo {
            network: vm.bridge.clone(),
            bridge: vm.bridge.clone(),
            mac: Some(vm.mac.clone()),
            host_device: Some(vm.tap.clone()),
            guest_device: None,
            addrs: Vec::new(),
        }])
    }

    fn network_lookup(&self) -> Arc<dyn NetworkLookup> {
        Arc::new(BridgeNetworkLookup)
    }

    async fn fingerprint_attrs(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        if let Ok(output) = Command::new("cloud-hypervisor").arg("--version").output().await {
            if output.status.success() {
                let version = String::from_utf8_lossy(&output.stdout)
                    .trim()
                    .trim_start_matches("cloud-hypervisor ")
                    .trim_start_matches('v')
                    .to_string();
                attrs.insert("version".to_string(), version);
            }
        }
        attrs.insert(
            "active".to_string(),
            self.vms.lock().await.len().to_string(),
        );
        attrs
    }

    fn uses_cloud_init(&self) -> bool {
        true
    }

    async fn dispense(&self) -> Result<Box<dyn Virtualizer>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VirtError::ConnectionClosed);
        }
        Ok(Box::new(self.clone()))
    }
}

/// Networks for this provider are plain host bridges: the network name is
/// the bridge device, and leases come from the standalone dnsmasq serving it.
struct BridgeNetworkLookup;

#[async_trait::async_trait]
impl NetworkLookup for BridgeNetworkLookup {
    async fn list(&self) -> Result<Vec<Box<dyn VirtNetwork>>> {
        let names = host_interface_names()?;
        Ok(names
            .into_iter()
            .map(|name| Box::new(BridgeNetwork { name }) as Box<dyn VirtNetwork>)
            .collect())
    }

    async fn lookup(&self, name: &str) -> Result<Box<dyn VirtNetwork>> {
        if !host_interface_names()?.iter().any(|n| n == name) {
            return Err(VirtError::NetworkNotFound(name.to_string()));
        }
        Ok(Box::new(BridgeNetwork {
            name: name.to_string(),
        }))
    }
}

fn host_interface_names() -> Result<Vec<String>> {
    let mut names: Vec<String> = nix::ifaddrs::getifaddrs()
        .map_err(std::io::Error::from)?
        .map(|ifaddr| ifaddr.interface_name)
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

struct BridgeNetwork {
    name: String,
}

#[async_trait::async_trait]
impl VirtNetwork for BridgeNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bridge_name(&self) -> Result<String> {
        Ok(self.name.clone())
    }

    async fn is_active(&self) -> Result<bool> {
        Ok(true)
    }

    async fn dhcp_leases(&self) -> Result<Vec<DhcpLease>> {
        let bytes = tokio::fs::read(DNSMASQ_LEASE_FILE).await?;
        Ok(parse_dnsmasq_leases(&String::from_utf8_lossy(&bytes)))
    }

    async fn add_dhcp_host(&self, _xml: &str) -> Result<()> {
        Err(VirtError::NotSupported("dhcp reservations on host bridges"))
    }

    async fn remove_dhcp_host(&self, _xml: &str) -> Result<()> {
        Err(VirtError::NotSupported("dhcp reservations on host bridges"))
    }

    async fn xml_desc(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn bridge_addr(&self) -> Result<Ipv4Addr> {
        crate::net::ipv4_of_iface(&self.name).ok_or_else(|| {
            VirtError::NetworkNotFound(format!("bridge {} has no IPv4 address", self.name))
        })
    }
}

/// Parse dnsmasq's text lease file: `expiry mac ip hostname client-id`.
fn parse_dnsmasq_leases(contents: &str) -> Vec<DhcpLease> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let expiry: i64 = fields.next()?.parse().ok()?;
            let mac = fields.next()?.to_string();
            let ip = fields.next()?.parse().ok()?;
            let hostname = fields.next().map(|h| {
                if h == "*" {
                    String::new()
                } else {
                    h.to_string()
                }
            });
            Some(DhcpLease {
                mac,
                ip,
                hostname,
                expiry: DateTime::from_timestamp(expiry, 0)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_stable_and_locally_administered() {
        let a = mac_for_vm("90abcdef");
        let b = mac_for_vm("90abcdef");
        assert_eq!(a, b);
        assert!(a.starts_with("52:54:00:"));
        assert_ne!(a, mac_for_vm("other-vm"));
    }

    #[test]
    fn ch_states_map_into_the_closed_set() {
        assert_eq!(
            map_ch_state(models::VmState::Created),
            (VmState::Starting, "created")
        );
        assert_eq!(
            map_ch_state(models::VmState::Running),
            (VmState::Running, "running")
        );
        assert_eq!(
            map_ch_state(models::VmState::Shutdown),
            (VmState::Poweroff, "shutdown")
        );
    }

    #[test]
    fn dnsmasq_text_leases_parse() {
        let contents = "\
4102444800 52:54:00:ab:cd:ef 192.168.1.50 90abcdef 01:52:54:00:ab:cd:ef
4102444800 52:54:00:00:00:01 192.168.1.51 * *
garbage line
";
        let leases = parse_dnsmasq_leases(contents);
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].hostname.as_deref(), Some("90abcdef"));
        // `*` means the client reported no hostname.
        assert_eq!(leases[1].hostname.as_deref(), Some(""));
    }

    #[test]
    fn vm_config_translates_to_the_api_shape() {
        let (_tx, rx) = watch::channel(false);
        let provider = CloudHypervisorProvider::new(
            PathBuf::from("/var/lib/virt"),
            None,
            Arc::new(IsoBuilder::for_tests()),
            rx,
        );

        let config = VmConfig {
            name: "90abcdef".to_string(),
            memory_mb: 2048,
            cpus: 2,
            primary_disk: PathBuf::from("/var/lib/virt/90abcdef.img"),
            disk_format: "qcow2".to_string(),
            hostname: "90abcdef".to_string(),
            network_interface: Some(crate::vm_config::NetworkInterfaceConfig {
                bridge: crate::vm_config::BridgeConfig {
                    name: "virbr0".to_string(),
                    ports: vec![],
                },
            }),
            ..Default::default()
        };

        let api = provider.build_vm_config(
            &config,
            std::path::Path::new("/var/lib/virt/90abcdef.iso"),
            "vt-90abcdef",
            "52:54:00:00:00:01",
        );
        assert_eq!(api.cpus.as_ref().unwrap().boot_vcpus, 2);
        assert_eq!(api.memory.as_ref().unwrap().size, 2048 * 1024 * 1024);
        assert_eq!(api.memory.as_ref().unwrap().shared, Some(true));
        let disks = api.disks.as_ref().unwrap();
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[1].readonly, Some(true));
        let net = &api.net.as_ref().unwrap()[0];
        assert_eq!(net.tap.as_deref(), Some("vt-90abcdef"));
    }
}
