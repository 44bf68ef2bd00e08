//! Host-side network attachment for VMs.
//!
//! On start: resolve the configured bridge to a hypervisor network, discover
//! the guest's DHCP lease by MAC, pin it with a best-effort reservation, and
//! install per-port DNAT and forward rules. On stop: tear all of it down
//! again, tolerating anything that is already gone.

pub mod dhcp;
pub mod iptables;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

use crate::error::{Result, VirtError};
use crate::providers::{DhcpLease, NetworkLookup, VirtNetwork};
use crate::vm_config::{NetworkInterfaceConfig, PortMapping};
pub use iptables::Iptables;

use iptables::{Rule, dnat_rule, forward_rule};

pub const DHCP_LEASE_DISCOVERY_INTERVAL: Duration = Duration::from_secs(1);
pub const DHCP_LEASE_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything a VM start changed on the host, recorded for symmetric
/// teardown. Rules appear in insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeardownSpec {
    pub rules: Vec<Rule>,
    pub network: Option<String>,
    pub reservation_xml: Option<String>,
    pub lease: Option<LeaseRecord>,
}

impl TeardownSpec {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.reservation_xml.is_none() && self.lease.is_none()
    }
}

/// The discovered lease, kept so teardown can release it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub mac: String,
    pub ip: Ipv4Addr,
    /// Bridge device the lease was observed on.
    pub bridge: String,
}

/// Inputs for [`NetworkController::vm_started_build`].
#[derive(Debug, Clone)]
pub struct NetBuildRequest {
    pub domain_name: String,
    pub hostname: String,
    /// MAC addresses of the VM's interfaces.
    pub hwaddrs: Vec<String>,
    pub interfaces: Vec<NetworkInterfaceConfig>,
    /// Reserved ports keyed by label.
    pub ports: HashMap<String, PortMapping>,
}

pub struct NetworkController {
    iptables: Iptables,
    lease_interval: Duration,
    lease_timeout: Duration,
    iface_cache: Mutex<HashMap<IpAddr, String>>,
    shutdown: watch::Receiver<bool>,
}

impl NetworkController {
    pub fn new(iptables: Iptables, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            iptables,
            lease_interval: DHCP_LEASE_DISCOVERY_INTERVAL,
            lease_timeout: DHCP_LEASE_DISCOVERY_TIMEOUT,
            iface_cache: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    #[cfg(test)]
    fn with_timing(mut self, interval: Duration, timeout: Duration) -> Self {
        self.lease_interval = interval;
        self.lease_timeout = timeout;
        self
    }

    /// Install the driver's chains and jump rules. Must run before any
    /// `vm_started_build`; safe to repeat.
    pub async fn ensure_iptables(&self) -> Result<()> {
        self.iptables.ensure_chains().await
    }

    /// Wire up networking for a freshly started VM.
    ///
    /// Returns the discovered guest address and the teardown spec, or `None`
    /// when the task has no network configuration.
    pub async fn vm_started_build(
        &self,
        lookup: &dyn NetworkLookup,
        req: &NetBuildRequest,
    ) -> Result<Option<(IpAddr, TeardownSpec)>> {
        let Some(interface) = req.interfaces.first() else {
            return Ok(None);
        };
        let bridge = &interface.bridge;

        let network = self.network_for_bridge(lookup, &bridge.name).await?;
        tracing::info!(
            "Resolved bridge {} to network {} for {}",
            bridge.name,
            network.name(),
            req.domain_name
        );

        let lease = self
            .discover_lease(network.as_ref(), &req.hwaddrs, &req.hostname)
            .await?;
        let IpAddr::V4(vm_ip) = lease.ip else {
            return Err(VirtError::NetworkNotFound(format!(
                "lease for {} is not IPv4",
                req.domain_name
            )));
        };
        tracing::info!("Discovered address {vm_ip} for {}", req.domain_name);

        let mut spec = TeardownSpec {
            network: Some(network.name().to_string()),
            lease: Some(LeaseRecord {
                mac: lease.mac.clone(),
                ip: vm_ip,
                bridge: bridge.name.clone(),
            }),
            ..Default::default()
        };

        // Reservation is best-effort: a network without a config section
        // (or one we cannot update) still serves the VM fine.
        let reservation = format!(
            "<host mac='{}' name='{}' ip='{}'/>",
            lease.mac, req.domain_name, vm_ip
        );
        match network.add_dhcp_host(&reservation).await {
            Ok(()) => spec.reservation_xml = Some(reservation),
            Err(e) => {
                tracing::warn!(
                    "Could not reserve {vm_ip} for {}: {e}",
                    req.domain_name
                );
            }
        }

        if let Err(e) = self
            .install_port_rules(interface, req, vm_ip, &mut spec)
            .await
        {
            // Reverse whatever made it in before surfacing the failure.
            if let Err(cleanup) = self.vm_terminated_teardown(lookup, &spec).await {
                tracing::error!(
                    "Rollback after failed network setup for {} left residue: {cleanup}",
                    req.domain_name
                );
            }
            return Err(e);
        }

        Ok(Some((IpAddr::V4(vm_ip), spec)))
    }

    async fn install_port_rules(
        &self,
        interface: &NetworkInterfaceConfig,
        req: &NetBuildRequest,
        vm_ip: Ipv4Addr,
        spec: &mut TeardownSpec,
    ) -> Result<()> {
        for label in &interface.bridge.ports {
            let mapping = req.ports.get(label).ok_or_else(|| {
                VirtError::Validation(vec![format!(
                    "port label {label:?} has no reserved port"
                )])
            })?;
            let host_iface = self.host_iface_for(mapping.host_ip).await?;

            let nat = dnat_rule(
                mapping.host_ip,
                &host_iface,
                mapping.host_port,
                IpAddr::V4(vm_ip),
                mapping.container_port,
            );
            self.iptables.append(&nat).await?;
            spec.rules.push(nat);

            let fwd = forward_rule(IpAddr::V4(vm_ip), mapping.container_port);
            self.iptables.append(&fwd).await?;
            spec.rules.push(fwd);

            tracing::info!(
                "Forwarding {}:{} -> {}:{} for {}",
                mapping.host_ip,
                mapping.host_port,
                vm_ip,
                mapping.container_port,
                req.domain_name
            );
        }
        Ok(())
    }

    /// Undo everything a `vm_started_build` recorded. Individual failures are
    /// collected, never aborting the rest; repeated calls are no-ops.
    pub async fn vm_terminated_teardown(
        &self,
        lookup: &dyn NetworkLookup,
        spec: &TeardownSpec,
    ) -> Result<()> {
        let mut errors = Vec::new();

        for rule in &spec.rules {
            if let Err(e) = self.iptables.delete_if_exists(rule).await {
                errors.push(format!("rule removal: {e}"));
            }
        }

        if let (Some(network_name), Some(xml)) = (&spec.network, &spec.reservation_xml) {
            match self.remove_reservation(lookup, network_name, xml, spec).await {
                Ok(()) => {}
                Err(e) => errors.push(format!("reservation removal: {e}")),
            }
        }

        if let Some(lease) = &spec.lease {
            match ipv4_of_iface(&lease.bridge) {
                Some(server_ip) => {
                    if let Err(e) =
                        dhcp::send_release(&lease.bridge, &lease.mac, lease.ip, server_ip).await
                    {
                        tracing::warn!(
                            "DHCP release for {} on {} failed: {e}",
                            lease.ip,
                            lease.bridge
                        );
                    }
                }
                None => {
                    tracing::warn!(
                        "No address on bridge {}, skipping DHCP release for {}",
                        lease.bridge,
                        lease.ip
                    );
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(VirtError::Teardown(errors))
        }
    }

    async fn remove_reservation(
        &self,
        lookup: &dyn NetworkLookup,
        network_name: &str,
        xml: &str,
        spec: &TeardownSpec,
    ) -> Result<()> {
        let network = lookup.lookup(network_name).await?;
        let desc = network.xml_desc().await?;
        let still_present = spec
            .lease
            .as_ref()
            .map(|lease| desc.contains(&lease.mac))
            .unwrap_or(true);
        if still_present {
            network.remove_dhcp_host(xml).await?;
        }
        Ok(())
    }

    async fn network_for_bridge(
        &self,
        lookup: &dyn NetworkLookup,
        bridge: &str,
    ) -> Result<Box<dyn VirtNetwork>> {
        for network in lookup.list().await? {
            match network.bridge_name().await {
                Ok(name) if name == bridge => return Ok(network),
                Ok(_) => {}
                Err(e) => tracing::debug!("Skipping network {}: {e}", network.name()),
            }
        }
        Err(VirtError::NetworkNotFound(bridge.to_string()))
    }

    /// Poll the network's leases until one matches the VM or the window
    /// closes. Candidate rule: MAC in `hwaddrs`, hostname empty or equal,
    /// not expired; ties resolved towards the latest expiry.
    async fn discover_lease(
        &self,
        network: &dyn VirtNetwork,
        hwaddrs: &[String],
        hostname: &str,
    ) -> Result<DhcpLease> {
        let deadline = Instant::now() + self.lease_timeout;
        let mut ticker = tokio::time::interval(self.lease_interval);
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match network.dhcp_leases().await {
                        Ok(leases) => {
                            if let Some(lease) = pick_lease(&leases, hwaddrs, hostname, Utc::now()) {
                                return Ok(lease);
                            }
                        }
                        // The lease database may simply not exist yet.
                        Err(e) => tracing::debug!("Lease query failed, retrying: {e}"),
                    }
                    if Instant::now() >= deadline {
                        return Err(VirtError::Timeout(format!(
                            "waiting for a DHCP lease on network {}",
                            network.name()
                        )));
                    }
                }
                _ = shutdown.changed() => {
                    return Err(VirtError::ConnectionClosed);
                }
            }
        }
    }

    async fn host_iface_for(&self, ip: IpAddr) -> Result<String> {
        let mut cache = self.iface_cache.lock().await;
        if let Some(iface) = cache.get(&ip) {
            return Ok(iface.clone());
        }
        let iface = iface_for_ip(ip).ok_or_else(|| {
            VirtError::NetworkNotFound(format!("no host interface holds {ip}"))
        })?;
        cache.insert(ip, iface.clone());
        Ok(iface)
    }
}

/// The lease selection rule, kept pure so it can be tested exhaustively.
pub fn pick_lease(
    leases: &[DhcpLease],
    hwaddrs: &[String],
    hostname: &str,
    now: DateTime<Utc>,
) -> Option<DhcpLease> {
    leases
        .iter()
        .filter(|lease| {
            hwaddrs
                .iter()
                .any(|mac| mac.eq_ignore_ascii_case(&lease.mac))
        })
        .filter(|lease| {
            lease
                .hostname
                .as_deref()
                .is_none_or(|h| h.is_empty() || h == hostname)
        })
        .filter(|lease| lease.expiry > now)
        .max_by_key(|lease| lease.expiry)
        .cloned()
}

/// Name of the host interface holding `ip`.
pub(crate) fn iface_for_ip(ip: IpAddr) -> Option<String> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifaddr in addrs {
        let Some(storage) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = storage.as_sockaddr_in() {
            if IpAddr::V4(sin.ip()) == ip {
                return Some(ifaddr.interface_name);
            }
        } else if let Some(sin6) = storage.as_sockaddr_in6() {
            if IpAddr::V6(sin6.ip()) == ip {
                return Some(ifaddr.interface_name);
            }
        }
    }
    None
}

/// First IPv4 address configured on `dev`.
pub(crate) fn ipv4_of_iface(dev: &str) -> Option<Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifaddr in addrs {
        if ifaddr.interface_name != dev {
            continue;
        }
        if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            return Some(sin.ip());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::iptables::tests::{FakeRunner, SharedRunner};
    use super::*;
    use crate::vm_config::BridgeConfig;
    use chrono::TimeDelta;
    use std::collections::VecDeque;
    use std::sync::Arc;

    fn lease(mac: &str, ip: &str, hostname: Option<&str>, expires_in_secs: i64) -> DhcpLease {
        DhcpLease {
            mac: mac.to_string(),
            ip: ip.parse().unwrap(),
            hostname: hostname.map(str::to_string),
            expiry: Utc::now() + TimeDelta::seconds(expires_in_secs),
        }
    }

    const MAC: &str = "52:54:00:ab:cd:ef";

    #[test]
    fn pick_lease_filters_and_maximizes_expiry() {
        let now = Utc::now();
        let leases = vec![
            lease("aa:aa:aa:aa:aa:aa", "192.168.122.7", None, 600),
            lease(MAC, "192.168.122.8", Some("other-host"), 600),
            lease(MAC, "192.168.122.9", None, -10),
            lease(MAC, "192.168.122.10", Some(""), 300),
            lease(MAC, "192.168.122.11", Some("90abcdef"), 900),
        ];

        let winner = pick_lease(&leases, &[MAC.to_string()], "90abcdef", now).unwrap();
        assert_eq!(winner.ip, "192.168.122.11".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn pick_lease_matches_mac_case_insensitively() {
        let leases = vec![lease("52:54:00:AB:CD:EF", "192.168.122.5", None, 60)];
        assert!(pick_lease(&leases, &[MAC.to_string()], "x", Utc::now()).is_some());
    }

    #[test]
    fn pick_lease_empty_candidate_set() {
        let leases = vec![lease("aa:aa:aa:aa:aa:aa", "192.168.122.7", None, 600)];
        assert!(pick_lease(&leases, &[MAC.to_string()], "x", Utc::now()).is_none());
    }

    #[test]
    fn loopback_interface_resolution() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(iface_for_ip(ip).as_deref(), Some("lo"));
        assert_eq!(ipv4_of_iface("lo"), Some(Ipv4Addr::LOCALHOST));
        assert_eq!(ipv4_of_iface("does-not-exist"), None);
    }

    struct MockNetwork {
        name: String,
        bridge: String,
        lease_batches: Mutex<VecDeque<Vec<DhcpLease>>>,
        added: std::sync::Mutex<Vec<String>>,
        removed: std::sync::Mutex<Vec<String>>,
        desc: String,
        reject_reservation: bool,
    }

    impl MockNetwork {
        fn new(bridge: &str, batches: Vec<Vec<DhcpLease>>) -> Self {
            Self {
                name: "default".to_string(),
                bridge: bridge.to_string(),
                lease_batches: Mutex::new(batches.into()),
                added: std::sync::Mutex::new(Vec::new()),
                removed: std::sync::Mutex::new(Vec::new()),
                desc: format!("<network><ip><dhcp><host mac='{MAC}'/></dhcp></ip></network>"),
                reject_reservation: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl VirtNetwork for Arc<MockNetwork> {
        fn name(&self) -> &str {
            &self.name
        }
        async fn bridge_name(&self) -> Result<String> {
            Ok(self.bridge.clone())
        }
        async fn is_active(&self) -> Result<bool> {
            Ok(true)
        }
        async fn dhcp_leases(&self) -> Result<Vec<DhcpLease>> {
            let mut batches = self.lease_batches.lock().await;
            if batches.len() > 1 {
                Ok(batches.pop_front().unwrap())
            } else {
                Ok(batches.front().cloned().unwrap_or_default())
            }
        }
        async fn add_dhcp_host(&self, xml: &str) -> Result<()> {
            if self.reject_reservation {
                return Err(VirtError::NotSupported("dhcp host entries"));
            }
            self.added.lock().unwrap().push(xml.to_string());
            Ok(())
        }
        async fn remove_dhcp_host(&self, xml: &str) -> Result<()> {
            self.removed.lock().unwrap().push(xml.to_string());
            Ok(())
        }
        async fn xml_desc(&self) -> Result<String> {
            Ok(self.desc.clone())
        }
        async fn bridge_addr(&self) -> Result<Ipv4Addr> {
            Ok(Ipv4Addr::LOCALHOST)
        }
    }

    struct MockLookup {
        networks: Vec<Arc<MockNetwork>>,
    }

    #[async_trait::async_trait]
    impl NetworkLookup for MockLookup {
        async fn list(&self) -> Result<Vec<Box<dyn VirtNetwork>>> {
            Ok(self
                .networks
                .iter()
                .map(|n| Box::new(n.clone()) as Box<dyn VirtNetwork>)
                .collect())
        }
        async fn lookup(&self, name: &str) -> Result<Box<dyn VirtNetwork>> {
            self.networks
                .iter()
                .find(|n| n.name == name)
                .map(|n| Box::new(n.clone()) as Box<dyn VirtNetwork>)
                .ok_or_else(|| VirtError::NetworkNotFound(name.to_string()))
        }
    }

    fn controller(runner: Arc<FakeRunner>) -> (NetworkController, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let ctrl = NetworkController::new(Iptables::with_runner(Box::new(SharedRunner(runner))), rx)
            .with_timing(Duration::from_millis(5), Duration::from_millis(200));
        (ctrl, tx)
    }

    fn build_request(ports: Vec<&str>) -> NetBuildRequest {
        let mut port_map = HashMap::new();
        port_map.insert(
            "http".to_string(),
            PortMapping {
                host_ip: "127.0.0.1".parse().unwrap(),
                host_port: 8080,
                container_port: 8000,
            },
        );
        NetBuildRequest {
            domain_name: "90abcdef".to_string(),
            hostname: "90abcdef".to_string(),
            hwaddrs: vec![MAC.to_string()],
            interfaces: vec![NetworkInterfaceConfig {
                bridge: BridgeConfig {
                    name: "virbr0".to_string(),
                    ports: ports.into_iter().map(str::to_string).collect(),
                },
            }],
            ports: port_map,
        }
    }

    #[tokio::test]
    async fn empty_net_config_is_a_noop() {
        let runner = Arc::new(FakeRunner::new());
        let (ctrl, _shutdown) = controller(runner.clone());
        let lookup = MockLookup { networks: vec![] };

        let mut req = build_request(vec![]);
        req.interfaces.clear();

        let result = ctrl.vm_started_build(&lookup, &req).await.unwrap();
        assert!(result.is_none());
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn build_discovers_lease_and_installs_rules() {
        let runner = Arc::new(FakeRunner::new());
        let (ctrl, _shutdown) = controller(runner.clone());

        // Lease shows up on the third poll.
        let network = Arc::new(MockNetwork::new(
            "virbr0",
            vec![
                vec![],
                vec![],
                vec![lease(MAC, "192.168.122.50", Some(""), 3600)],
            ],
        ));
        let lookup = MockLookup {
            networks: vec![network.clone()],
        };

        let (ip, spec) = ctrl
            .vm_started_build(&lookup, &build_request(vec!["http"]))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(ip, "192.168.122.50".parse::<IpAddr>().unwrap());
        assert_eq!(spec.rules.len(), 2);
        assert_eq!(spec.rules[0].chain, iptables::PREROUTING_CHAIN);
        assert_eq!(spec.rules[1].chain, iptables::FORWARD_CHAIN);
        assert_eq!(spec.network.as_deref(), Some("default"));
        assert!(spec.reservation_xml.as_deref().unwrap().contains(MAC));
        assert_eq!(network.added.lock().unwrap().len(), 1);

        // Both rules were appended on the host, in insertion order.
        let appended: Vec<_> = runner
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|argv| argv.get(2).map(String::as_str) == Some("-A"))
            .cloned()
            .collect();
        assert_eq!(appended.len(), 2);
        assert!(appended[0].contains(&"DNAT".to_string()));
        assert!(appended[1].contains(&"ACCEPT".to_string()));
    }

    #[tokio::test]
    async fn lease_discovery_timeout_installs_nothing() {
        let runner = Arc::new(FakeRunner::new());
        let (ctrl, _shutdown) = controller(runner.clone());
        let network = Arc::new(MockNetwork::new("virbr0", vec![vec![]]));
        let lookup = MockLookup {
            networks: vec![network],
        };

        let err = ctrl
            .vm_started_build(&lookup, &build_request(vec!["http"]))
            .await
            .unwrap_err();
        assert!(matches!(err, VirtError::Timeout(_)));
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_bridge_fails() {
        let runner = Arc::new(FakeRunner::new());
        let (ctrl, _shutdown) = controller(runner);
        let network = Arc::new(MockNetwork::new("br-other", vec![vec![]]));
        let lookup = MockLookup {
            networks: vec![network],
        };

        let err = ctrl
            .vm_started_build(&lookup, &build_request(vec!["http"]))
            .await
            .unwrap_err();
        assert!(matches!(err, VirtError::NetworkNotFound(_)));
    }

    #[tokio::test]
    async fn reservation_failure_is_best_effort() {
        let runner = Arc::new(FakeRunner::new());
        let (ctrl, _shutdown) = controller(runner);
        let mut network = MockNetwork::new(
            "virbr0",
            vec![vec![lease(MAC, "192.168.122.50", None, 3600)]],
        );
        network.reject_reservation = true;
        let lookup = MockLookup {
            networks: vec![Arc::new(network)],
        };

        let (_, spec) = ctrl
            .vm_started_build(&lookup, &build_request(vec!["http"]))
            .await
            .unwrap()
            .unwrap();
        assert!(spec.reservation_xml.is_none());
        assert_eq!(spec.rules.len(), 2);
    }

    #[tokio::test]
    async fn teardown_aggregates_failures_but_attempts_everything() {
        let runner = Arc::new(FakeRunner::new());
        // All rules are present; the second deletion blows up.
        runner.script("-C", vec![0]);
        runner.script("-D", vec![0, 2, 0]);
        let (ctrl, _shutdown) = controller(runner.clone());

        let network = Arc::new(MockNetwork::new("virbr0", vec![vec![]]));
        let lookup = MockLookup {
            networks: vec![network.clone()],
        };

        let vm_ip: IpAddr = "192.168.122.50".parse().unwrap();
        let spec = TeardownSpec {
            rules: vec![
                dnat_rule("127.0.0.1".parse().unwrap(), "lo", 8080, vm_ip, 8000),
                dnat_rule("127.0.0.1".parse().unwrap(), "lo", 8081, vm_ip, 8001),
                forward_rule(vm_ip, 8000),
            ],
            network: Some("default".to_string()),
            reservation_xml: Some(format!("<host mac='{MAC}' ip='192.168.122.50'/>")),
            lease: Some(LeaseRecord {
                mac: MAC.to_string(),
                ip: "192.168.122.50".parse().unwrap(),
                bridge: "lo".to_string(),
            }),
        };

        let err = ctrl.vm_terminated_teardown(&lookup, &spec).await.unwrap_err();
        match err {
            VirtError::Teardown(errors) => assert_eq!(errors.len(), 1),
            other => panic!("expected teardown error, got {other}"),
        }

        // All three deletions were attempted.
        let deletes = runner
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|argv| argv.get(2).map(String::as_str) == Some("-D"))
            .count();
        assert_eq!(deletes, 3);
        // Reservation removal still happened.
        assert_eq!(network.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn teardown_of_empty_spec_succeeds() {
        let runner = Arc::new(FakeRunner::new());
        let (ctrl, _shutdown) = controller(runner);
        let lookup = MockLookup { networks: vec![] };

        ctrl.vm_terminated_teardown(&lookup, &TeardownSpec::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let runner = Arc::new(FakeRunner::new());
        // Rules absent: -C misses, nothing is deleted.
        runner.script("-C", vec![1]);
        let (ctrl, _shutdown) = controller(runner.clone());

        let network = Arc::new(MockNetwork::new("virbr0", vec![vec![]]));
        let lookup = MockLookup {
            networks: vec![network],
        };

        let vm_ip: IpAddr = "192.168.122.50".parse().unwrap();
        let spec = TeardownSpec {
            rules: vec![forward_rule(vm_ip, 8000)],
            ..Default::default()
        };

        ctrl.vm_terminated_teardown(&lookup, &spec).await.unwrap();
        ctrl.vm_terminated_teardown(&lookup, &spec).await.unwrap();
        let deletes = runner
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|argv| argv.get(2).map(String::as_str) == Some("-D"))
            .count();
        assert_eq!(deletes, 0);
    }
}
