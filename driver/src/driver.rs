//! Orchestrator-facing driver facade.
//!
//! Concurrency model: a task map guarded by a lock, one monitor task per VM,
//! and a single driver-scoped shutdown channel that closes the hypervisor
//! connection, aborts lease discovery, and stops all monitors.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast, mpsc, watch};

use crate::cloudinit::IsoBuilder;
use crate::config::Config;
use crate::error::{Result, VirtError};
use crate::image::{ImageTools, resolve_image};
use crate::net::{Iptables, NetBuildRequest, NetworkController};
use crate::providers::cloud_hypervisor::CloudHypervisorProvider;
use crate::providers::libvirt::LibvirtProvider;
use crate::providers::Virtualizer;
use crate::registry::ProviderRegistry;
use crate::state::TaskStateBlob;
use crate::task::{ExitResult, ResourceUsage, TaskHandle, TaskStatus};
use crate::vm_config::{
    BackingStore, GuestFile, MountConfig, TaskConfig, VmConfig, vm_name_for_task,
};

/// Cadence of the fingerprint stream; the first emit happens immediately.
pub const FINGERPRINT_INTERVAL: Duration = Duration::from_secs(30);

/// Environment file materialized inside every guest.
const ENV_FILE_PATH: &str = "/etc/profile.d/virt.sh";

/// Task lifecycle events published to subscribers.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Started {
        task_id: String,
        vm_name: String,
        timestamp: DateTime<Utc>,
    },
    Exited {
        task_id: String,
        exit_code: i32,
        timestamp: DateTime<Utc>,
    },
    Destroyed {
        task_id: String,
        timestamp: DateTime<Utc>,
    },
}

/// Result of a successful `start_task`.
#[derive(Debug, Clone)]
pub struct StartedTask {
    pub vm_name: String,
    /// Opaque state blob the orchestrator persists for recovery.
    pub handle: Vec<u8>,
    /// Address the workload is reachable at, when networking was configured.
    pub network: Option<DriverNetwork>,
}

#[derive(Debug, Clone)]
pub struct DriverNetwork {
    pub ip: IpAddr,
}

pub struct VirtDriver {
    config: Config,
    registry: Arc<ProviderRegistry>,
    net: Arc<NetworkController>,
    tasks: Arc<RwLock<HashMap<String, Arc<TaskHandle>>>>,
    events_tx: broadcast::Sender<TaskEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl VirtDriver {
    /// Build the driver: instantiate every enabled provider, initialize it
    /// and the host networking, and nominate the default dispenser.
    pub async fn setup(config: Config) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let iso = Arc::new(IsoBuilder::new()?);
        let mut registry = ProviderRegistry::new();

        if config.providers.libvirt.enabled {
            let provider = LibvirtProvider::new(
                &config.emulator,
                config.data_dir.clone(),
                iso.clone(),
                shutdown_rx.clone(),
            );
            provider.init().await?;
            let name = provider.name().to_string();
            registry.register(&name, config.providers.libvirt.default, Arc::new(provider));
        }
        if config.providers.cloud_hypervisor.enabled {
            let provider = CloudHypervisorProvider::new(
                config.data_dir.clone(),
                config.providers.cloud_hypervisor.firmware.clone(),
                iso.clone(),
                shutdown_rx.clone(),
            );
            provider.init().await?;
            let name = provider.name().to_string();
            registry.register(
                &name,
                config.providers.cloud_hypervisor.default,
                Arc::new(provider),
            );
        }
        if registry.is_empty() {
            return Err(VirtError::Validation(vec![
                "no hypervisor provider is enabled".to_string(),
            ]));
        }

        let net = NetworkController::new(Iptables::new()?, shutdown_rx);
        net.ensure_iptables().await?;

        let (events_tx, _) = broadcast::channel(64);
        Ok(Self {
            config,
            registry: Arc::new(registry),
            net: Arc::new(net),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
            shutdown_tx,
        })
    }

    /// Cancel the driver context: connections close, polling loops abort,
    /// and monitors stop without touching task state.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Provision and boot a VM for the task, wire up its network, and start
    /// monitoring it.
    pub async fn start_task(&self, cfg: TaskConfig) -> Result<StartedTask> {
        if self.tasks.read().await.contains_key(&cfg.id) {
            return Err(VirtError::TaskExists(cfg.id.clone()));
        }

        let vm_name = vm_name_for_task(&cfg.id);
        let image_tools = ImageTools::new()?;

        let base_image = resolve_image(&cfg.image, &self.config.image_paths, &cfg.alloc_dir)?;
        let base_format = image_tools.probe_format(&base_image).await?;

        let (primary_disk, disk_format, backing) = if cfg.use_thin_copy {
            let overlay = self.config.data_dir.join(format!("{vm_name}.img"));
            image_tools
                .thin_clone(&base_image, &base_format, &overlay, cfg.memory_mb)
                .await?;
            (
                overlay,
                "qcow2".to_string(),
                Some(BackingStore {
                    path: base_image.clone(),
                    format: base_format,
                }),
            )
        } else {
            (base_image.clone(), base_format, None)
        };

        let hostname = cfg.hostname.clone().unwrap_or_else(|| vm_name.clone());
        let vm_config = VmConfig {
            name: vm_name.clone(),
            memory_mb: cfg.memory_mb,
            cpus: cfg.cpus,
            cpuset: cfg.cpuset.clone(),
            primary_disk,
            primary_disk_mb: cfg.primary_disk_size,
            disk_format,
            backing,
            os: cfg.os.clone(),
            hostname,
            mounts: task_dir_mounts(&cfg),
            files: vec![build_env_file(&cfg.env)],
            boot_cmds: cfg.boot_cmds.clone(),
            run_cmds: cfg.cmds.clone(),
            user_data: cfg.user_data.clone(),
            default_user_password: cfg.default_user_password.clone(),
            ssh_key: cfg.default_user_authorized_ssh_key.clone(),
            network_interface: cfg.network_interface.clone(),
            domain_xml: None,
            remove_config_files: self.config.remove_config_files,
        };

        let mut allowed = self.config.image_paths.clone();
        allowed.push(cfg.alloc_dir.clone());
        allowed.push(self.config.data_dir.clone());
        vm_config.validate(&allowed)?;

        let provider = self.registry.default_provider().await?;
        provider.create_vm(&vm_config).await?;

        let network = match self.attach_network(provider.as_ref(), &cfg, &vm_config).await {
            Ok(network) => network,
            Err(e) => {
                // The domain is up but unreachable; take it down again.
                tracing::error!("Network setup for task {} failed, rolling back: {e}", cfg.id);
                if let Err(destroy_err) = provider.destroy_vm(&vm_name).await {
                    tracing::error!(
                        "Rollback of domain {vm_name} failed, manual cleanup needed: {destroy_err}"
                    );
                }
                return Err(e);
            }
        };

        let started_at = Utc::now();
        let blob = TaskStateBlob::new(cfg.clone(), started_at).encode()?;

        let handle = Arc::new(TaskHandle::new(cfg.id.clone(), vm_name.clone(), started_at));
        if let Some((_, spec)) = &network {
            handle.set_teardown(spec.clone()).await;
        }
        self.tasks
            .write()
            .await
            .insert(cfg.id.clone(), handle.clone());

        self.spawn_task_loop(handle, provider);
        let _ = self.events_tx.send(TaskEvent::Started {
            task_id: cfg.id.clone(),
            vm_name: vm_name.clone(),
            timestamp: started_at,
        });
        tracing::info!("Started task {} as vm {vm_name}", cfg.id);

        Ok(StartedTask {
            vm_name,
            handle: blob,
            network: network.map(|(ip, _)| DriverNetwork { ip }),
        })
    }

    async fn attach_network(
        &self,
        provider: &dyn Virtualizer,
        cfg: &TaskConfig,
        vm_config: &VmConfig,
    ) -> Result<Option<(IpAddr, crate::net::TeardownSpec)>> {
        if cfg.network_interface.is_none() {
            return Ok(None);
        }

        let hwaddrs: Vec<String> = provider
            .get_network_interfaces(&vm_config.name)
            .await?
            .into_iter()
            .filter_map(|iface| iface.mac)
            .collect();

        let request = NetBuildRequest {
            domain_name: vm_config.name.clone(),
            hostname: vm_config.hostname.clone(),
            hwaddrs,
            interfaces: cfg.network_interface.clone().into_iter().collect(),
            ports: cfg.ports.clone(),
        };
        self.net
            .vm_started_build(provider.network_lookup().as_ref(), &request)
            .await
    }

    /// Monitor the VM until it exits, then reverse its host-side network
    /// effects and publish the exit event.
    fn spawn_task_loop(&self, handle: Arc<TaskHandle>, provider: Box<dyn Virtualizer>) {
        let net = self.net.clone();
        let events_tx = self.events_tx.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let (exit_tx, mut exit_rx) = mpsc::channel(1);
            handle
                .monitor(provider.as_ref(), exit_tx, shutdown_rx)
                .await;

            let Ok(result) = exit_rx.try_recv() else {
                // Cancelled; leave every host effect for recovery.
                return;
            };

            if let Some(spec) = handle.take_teardown().await {
                if let Err(e) = net
                    .vm_terminated_teardown(provider.network_lookup().as_ref(), &spec)
                    .await
                {
                    tracing::error!(
                        "Network teardown for task {} left residue: {e}",
                        handle.task_id
                    );
                }
            }

            let _ = events_tx.send(TaskEvent::Exited {
                task_id: handle.task_id.clone(),
                exit_code: result.exit_code,
                timestamp: Utc::now(),
            });
        });
    }

    /// Stop the task's VM. Missing tasks and missing VMs are not errors, so
    /// the orchestrator can retry stops freely.
    pub async fn stop_task(
        &self,
        task_id: &str,
        _timeout: Duration,
        _signal: Option<&str>,
    ) -> Result<()> {
        let Some(handle) = self.tasks.read().await.get(task_id).cloned() else {
            tracing::debug!("Stop for unknown task {task_id}, nothing to do");
            return Ok(());
        };

        match self.registry.provider_for_vm(&handle.vm_name).await {
            Ok(provider) => provider.stop_vm(&handle.vm_name).await,
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Destroy the task's VM and forget the task. Refuses while the task is
    /// running unless forced.
    pub async fn destroy_task(&self, task_id: &str, force: bool) -> Result<()> {
        let Some(handle) = self.tasks.read().await.get(task_id).cloned() else {
            return Ok(());
        };

        if handle.is_running().await && !force {
            return Err(VirtError::TaskStillRunning(task_id.to_string()));
        }

        let provider = match self.registry.provider_for_vm(&handle.vm_name).await {
            Ok(provider) => {
                provider.destroy_vm(&handle.vm_name).await?;
                Some(provider)
            }
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        // The monitor normally tears the network down on exit; a forced
        // destroy of a live task has to do it here.
        if let Some(spec) = handle.take_teardown().await {
            let lookup = match &provider {
                Some(p) => p.network_lookup(),
                None => self.registry.default_provider().await?.network_lookup(),
            };
            if let Err(e) = self.net.vm_terminated_teardown(lookup.as_ref(), &spec).await {
                tracing::error!("Network teardown for task {task_id} left residue: {e}");
            }
        }

        self.tasks.write().await.remove(task_id);
        let _ = self.events_tx.send(TaskEvent::Destroyed {
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
        });
        tracing::info!("Destroyed task {task_id}");
        Ok(())
    }

    pub async fn inspect_task(&self, task_id: &str) -> Result<TaskStatus> {
        let handle = self.handle(task_id).await?;
        Ok(handle.status().await)
    }

    /// Channel that delivers the task's single exit result once the monitor
    /// terminates; immediately for already-exited tasks.
    pub async fn wait_task(&self, task_id: &str) -> Result<mpsc::Receiver<ExitResult>> {
        let handle = self.handle(task_id).await?;
        Ok(handle.wait().await)
    }

    pub async fn task_stats(&self, task_id: &str) -> Result<ResourceUsage> {
        let handle = self.handle(task_id).await?;
        match self.registry.provider_for_vm(&handle.vm_name).await {
            Ok(provider) => handle.stats(provider.as_ref()).await,
            Err(e) if e.is_not_found() => Err(VirtError::TaskNotFound(task_id.to_string())),
            Err(e) => Err(e),
        }
    }

    pub fn task_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.events_tx.subscribe()
    }

    pub async fn signal_task(&self, _task_id: &str, _signal: &str) -> Result<()> {
        Err(VirtError::NotSupported("signalling vm tasks"))
    }

    pub async fn exec_task(&self, _task_id: &str, _cmd: &[String]) -> Result<()> {
        Err(VirtError::NotSupported("exec into vm tasks"))
    }

    /// Rebuild a task handle from its persisted state blob after a driver
    /// restart. The VM must still be known to some provider.
    pub async fn recover_task(&self, blob: &[u8]) -> Result<()> {
        let state = TaskStateBlob::decode(blob)?;
        let task_id = state.task_config.id.clone();

        if self.tasks.read().await.contains_key(&task_id) {
            tracing::debug!("Task {task_id} already known, nothing to recover");
            return Ok(());
        }

        let vm_name = vm_name_for_task(&task_id);
        let (owner, info) = match self.registry.get_vm(&vm_name).await {
            Ok(found) => found,
            Err(e) if e.is_not_found() => {
                return Err(VirtError::TaskNotFound(task_id));
            }
            Err(e) => return Err(e),
        };

        let handle = Arc::new(TaskHandle::recovered(
            task_id.clone(),
            vm_name,
            state.started_at,
            info.state,
        ));
        let resumed = !handle.is_exited().await;
        self.tasks
            .write()
            .await
            .insert(task_id.clone(), handle.clone());

        if resumed {
            let provider = self.registry.get(&owner).await?;
            self.spawn_task_loop(handle, provider);
        }
        tracing::info!(
            "Recovered task {task_id} from provider {owner} (resumed monitor: {resumed})"
        );
        Ok(())
    }

    /// Host capability stream. Emits immediately on subscription, then every
    /// 30 seconds until the driver context is cancelled.
    pub fn fingerprint(&self) -> mpsc::Receiver<HashMap<String, String>> {
        let (tx, rx) = mpsc::channel(1);
        let registry = self.registry.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FINGERPRINT_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => return,
                }

                let mut attrs = registry.fingerprint().await;
                attrs.insert("driver.virt".to_string(), "true".to_string());
                if let Some(name) = registry.default_name() {
                    attrs.insert("driver.virt.driver".to_string(), name);
                }
                if tx.send(attrs).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    async fn handle(&self, task_id: &str) -> Result<Arc<TaskHandle>> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| VirtError::TaskNotFound(task_id.to_string()))
    }
}

/// Mounts for the task's standard directories, shared into the guest.
fn task_dir_mounts(cfg: &TaskConfig) -> Vec<MountConfig> {
    [
        (&cfg.alloc_dir, "alloc", "/alloc"),
        (&cfg.local_dir, "local", "/local"),
        (&cfg.secrets_dir, "secrets", "/secrets"),
    ]
    .into_iter()
    .map(|(source, tag, destination)| MountConfig {
        source: source.clone(),
        tag: tag.to_string(),
        destination: destination.to_string(),
        read_only: false,
    })
    .collect()
}

/// The guest profile script exporting the task's environment. Content is
/// base64 so arbitrary values survive the trip through cloud-init.
fn build_env_file(env: &HashMap<String, String>) -> GuestFile {
    use base64::Engine as _;

    let mut keys: Vec<_> = env.keys().collect();
    keys.sort();
    let mut script = String::new();
    for key in keys {
        script.push_str(&format!("export {key}={}\n", env[key]));
    }

    GuestFile {
        path: ENV_FILE_PATH.to_string(),
        content: base64::engine::general_purpose::STANDARD.encode(script),
        permissions: "0777".to_string(),
        encoding: Some("b64".to_string()),
        owner: None,
        group: None,
    }
}
