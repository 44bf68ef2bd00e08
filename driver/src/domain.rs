//! Translate the normalized VM config into a libvirt domain description.
//!
//! The description is modeled as typed structs serialized with quick-xml, so
//! the same shapes can parse a domain description back when the driver needs
//! to read interfaces out of an existing domain.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VirtError};
use crate::vm_config::VmConfig;

/// Kernel interface names are capped at 15 characters plus NUL.
const MAX_IFACE_LEN: usize = 15;

/// Host-side tap device for a VM, predictable from the VM name.
pub fn tap_device_name(vm_name: &str) -> String {
    let mut name = format!("vt-{vm_name}");
    name.truncate(MAX_IFACE_LEN);
    name
}

#[derive(Debug, Serialize)]
#[serde(rename = "domain")]
struct DomainXml {
    #[serde(rename = "@type")]
    kind: String,
    name: String,
    memory: Memory,
    #[serde(rename = "memoryBacking")]
    memory_backing: MemoryBacking,
    vcpu: Vcpu,
    cpu: Cpu,
    os: Os,
    sysinfo: SysInfo,
    features: Features,
    on_poweroff: String,
    on_reboot: String,
    on_crash: String,
    pm: Pm,
    devices: Devices,
}

#[derive(Debug, Serialize)]
struct Memory {
    #[serde(rename = "@unit")]
    unit: String,
    #[serde(rename = "$text")]
    value: u64,
}

#[derive(Debug, Serialize)]
struct MemoryBacking {
    source: MemorySource,
    access: MemoryAccess,
}

#[derive(Debug, Serialize)]
struct MemorySource {
    #[serde(rename = "@type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct MemoryAccess {
    #[serde(rename = "@mode")]
    mode: String,
}

#[derive(Debug, Serialize)]
struct Vcpu {
    #[serde(rename = "@placement")]
    placement: String,
    #[serde(rename = "@cpuset", skip_serializing_if = "Option::is_none")]
    cpuset: Option<String>,
    #[serde(rename = "$text")]
    count: u32,
}

#[derive(Debug, Serialize)]
struct Cpu {
    #[serde(rename = "@mode")]
    mode: String,
}

#[derive(Debug, Serialize)]
struct Os {
    #[serde(rename = "type")]
    kind: OsType,
    smbios: Smbios,
}

#[derive(Debug, Serialize)]
struct OsType {
    #[serde(rename = "@arch", skip_serializing_if = "Option::is_none")]
    arch: Option<String>,
    #[serde(rename = "@machine", skip_serializing_if = "Option::is_none")]
    machine: Option<String>,
    #[serde(rename = "$text")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct Smbios {
    #[serde(rename = "@mode")]
    mode: String,
}

#[derive(Debug, Serialize)]
struct SysInfo {
    #[serde(rename = "@type")]
    kind: String,
    system: SysInfoSystem,
}

#[derive(Debug, Serialize)]
struct SysInfoSystem {
    entry: Vec<SysInfoEntry>,
}

#[derive(Debug, Serialize)]
struct SysInfoEntry {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "$text")]
    value: String,
}

#[derive(Debug, Serialize)]
struct Features {
    acpi: Empty,
    apic: Empty,
    vmport: Vmport,
}

#[derive(Debug, Serialize)]
struct Empty {}

#[derive(Debug, Serialize)]
struct Vmport {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, Serialize)]
struct Pm {
    #[serde(rename = "suspend-to-mem")]
    suspend_to_mem: Toggle,
    #[serde(rename = "suspend-to-disk")]
    suspend_to_disk: Toggle,
}

#[derive(Debug, Serialize)]
struct Toggle {
    #[serde(rename = "@enabled")]
    enabled: String,
}

#[derive(Debug, Serialize)]
struct Devices {
    disk: Vec<Disk>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    filesystem: Vec<Filesystem>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    interface: Vec<Interface>,
    rng: Rng,
    serial: SerialDevice,
    console: ConsoleDevice,
}

#[derive(Debug, Serialize)]
struct Disk {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(rename = "@device")]
    device: String,
    driver: DiskDriver,
    source: DiskSource,
    #[serde(rename = "backingStore", skip_serializing_if = "Option::is_none")]
    backing_store: Option<BackingStoreXml>,
    target: DiskTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    readonly: Option<Empty>,
}

#[derive(Debug, Serialize)]
struct DiskDriver {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct DiskSource {
    #[serde(rename = "@file")]
    file: String,
}

#[derive(Debug, Serialize)]
struct BackingStoreXml {
    #[serde(rename = "@type")]
    kind: String,
    format: BackingFormat,
    source: DiskSource,
}

#[derive(Debug, Serialize)]
struct BackingFormat {
    #[serde(rename = "@type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct DiskTarget {
    #[serde(rename = "@dev")]
    dev: String,
    #[serde(rename = "@bus")]
    bus: String,
}

#[derive(Debug, Serialize)]
struct Filesystem {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(rename = "@accessmode")]
    accessmode: String,
    driver: FsDriver,
    source: FsSource,
    target: FsTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    readonly: Option<Empty>,
}

#[derive(Debug, Serialize)]
struct FsDriver {
    #[serde(rename = "@type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct FsSource {
    #[serde(rename = "@dir")]
    dir: String,
}

#[derive(Debug, Serialize)]
struct FsTarget {
    #[serde(rename = "@dir")]
    dir: String,
}

#[derive(Debug, Serialize)]
struct Interface {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    mac: Option<Mac>,
    source: InterfaceSource,
    target: InterfaceTarget,
    model: Model,
}

#[derive(Debug, Serialize)]
struct Mac {
    #[serde(rename = "@address")]
    address: String,
}

#[derive(Debug, Serialize)]
struct InterfaceSource {
    #[serde(rename = "@bridge")]
    bridge: String,
}

#[derive(Debug, Serialize)]
struct InterfaceTarget {
    #[serde(rename = "@dev")]
    dev: String,
}

#[derive(Debug, Serialize)]
struct Model {
    #[serde(rename = "@type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct Rng {
    #[serde(rename = "@model")]
    model: String,
    backend: RngBackend,
}

#[derive(Debug, Serialize)]
struct RngBackend {
    #[serde(rename = "@model")]
    model: String,
    #[serde(rename = "$text")]
    device: String,
}

#[derive(Debug, Serialize)]
struct SerialDevice {
    #[serde(rename = "@type")]
    kind: String,
    target: SerialTarget,
}

#[derive(Debug, Serialize)]
struct SerialTarget {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(rename = "@port")]
    port: u32,
}

#[derive(Debug, Serialize)]
struct ConsoleDevice {
    #[serde(rename = "@type")]
    kind: String,
    target: ConsoleTarget,
}

#[derive(Debug, Serialize)]
struct ConsoleTarget {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(rename = "@port")]
    port: u32,
}

/// Shapes a [`VmConfig`] into domain XML.
pub struct DomainXmlBuilder<'a> {
    config: &'a VmConfig,
    cloudinit_iso: Option<PathBuf>,
    mac: Option<String>,
}

impl<'a> DomainXmlBuilder<'a> {
    pub fn new(config: &'a VmConfig) -> Self {
        Self {
            config,
            cloudinit_iso: None,
            mac: None,
        }
    }

    /// Attach the first-boot ISO as a read-only sata CDROM.
    pub fn cloudinit_iso(mut self, path: &Path) -> Self {
        self.cloudinit_iso = Some(path.to_path_buf());
        self
    }

    /// Pin the interface MAC; left to the hypervisor when absent.
    pub fn mac(mut self, mac: Option<String>) -> Self {
        self.mac = mac;
        self
    }

    pub fn build(self) -> Result<String> {
        let config = self.config;

        let mut disks = vec![Disk {
            kind: "file".to_string(),
            device: "disk".to_string(),
            driver: DiskDriver {
                name: "qemu".to_string(),
                kind: config.disk_format.clone(),
            },
            source: DiskSource {
                file: config.primary_disk.display().to_string(),
            },
            backing_store: config.backing.as_ref().map(|backing| BackingStoreXml {
                kind: "file".to_string(),
                format: BackingFormat {
                    kind: backing.format.clone(),
                },
                source: DiskSource {
                    file: backing.path.display().to_string(),
                },
            }),
            target: DiskTarget {
                dev: "vda".to_string(),
                bus: "virtio".to_string(),
            },
            readonly: None,
        }];
        if let Some(iso) = &self.cloudinit_iso {
            disks.push(Disk {
                kind: "file".to_string(),
                device: "cdrom".to_string(),
                driver: DiskDriver {
                    name: "qemu".to_string(),
                    kind: "raw".to_string(),
                },
                source: DiskSource {
                    file: iso.display().to_string(),
                },
                backing_store: None,
                target: DiskTarget {
                    dev: "sda".to_string(),
                    bus: "sata".to_string(),
                },
                readonly: Some(Empty {}),
            });
        }

        let filesystems = config
            .mounts
            .iter()
            .map(|mount| Filesystem {
                kind: "mount".to_string(),
                accessmode: "passthrough".to_string(),
                driver: FsDriver {
                    kind: "virtiofs".to_string(),
                },
                source: FsSource {
                    dir: mount.source.display().to_string(),
                },
                target: FsTarget {
                    dir: mount.tag.clone(),
                },
                readonly: mount.read_only.then_some(Empty {}),
            })
            .collect();

        let interfaces = config
            .network_interface
            .iter()
            .map(|net| Interface {
                kind: "bridge".to_string(),
                mac: self.mac.as_ref().map(|address| Mac {
                    address: address.clone(),
                }),
                source: InterfaceSource {
                    bridge: net.bridge.name.clone(),
                },
                target: InterfaceTarget {
                    dev: tap_device_name(&config.name),
                },
                model: Model {
                    kind: "virtio".to_string(),
                },
            })
            .collect();

        let domain = DomainXml {
            kind: "kvm".to_string(),
            name: config.name.clone(),
            memory: Memory {
                unit: "M".to_string(),
                value: config.memory_mb,
            },
            memory_backing: MemoryBacking {
                // virtiofs needs shared memory pages between guest and host.
                source: MemorySource {
                    kind: "memfd".to_string(),
                },
                access: MemoryAccess {
                    mode: "shared".to_string(),
                },
            },
            vcpu: Vcpu {
                placement: "static".to_string(),
                cpuset: config.cpuset.clone(),
                count: config.cpus,
            },
            cpu: Cpu {
                mode: "host-passthrough".to_string(),
            },
            os: Os {
                kind: OsType {
                    arch: config.os.as_ref().map(|os| os.arch.clone()),
                    machine: config.os.as_ref().map(|os| os.machine.clone()),
                    kind: "hvm".to_string(),
                },
                smbios: Smbios {
                    mode: "sysinfo".to_string(),
                },
            },
            sysinfo: SysInfo {
                kind: "smbios".to_string(),
                system: SysInfoSystem {
                    entry: vec![SysInfoEntry {
                        name: "serial".to_string(),
                        value: "ds=nocloud".to_string(),
                    }],
                },
            },
            features: Features {
                acpi: Empty {},
                apic: Empty {},
                vmport: Vmport {
                    state: "off".to_string(),
                },
            },
            on_poweroff: "destroy".to_string(),
            on_reboot: "destroy".to_string(),
            on_crash: "destroy".to_string(),
            pm: Pm {
                suspend_to_mem: Toggle {
                    enabled: "no".to_string(),
                },
                suspend_to_disk: Toggle {
                    enabled: "no".to_string(),
                },
            },
            devices: Devices {
                disk: disks,
                filesystem: filesystems,
                interface: interfaces,
                rng: Rng {
                    model: "virtio".to_string(),
                    backend: RngBackend {
                        model: "random".to_string(),
                        device: "/dev/urandom".to_string(),
                    },
                },
                serial: SerialDevice {
                    kind: "pty".to_string(),
                    target: SerialTarget {
                        kind: "isa-serial".to_string(),
                        port: 0,
                    },
                },
                console: ConsoleDevice {
                    kind: "pty".to_string(),
                    target: ConsoleTarget {
                        kind: "serial".to_string(),
                        port: 0,
                    },
                },
            },
        };

        quick_xml::se::to_string(&domain).map_err(|e| VirtError::DomainXml(e.to_string()))
    }
}

/// Interface facts read back out of a domain description.
#[derive(Debug, Clone)]
pub struct ParsedInterface {
    pub mac: Option<String>,
    pub bridge: Option<String>,
    pub device: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DomainQuery {
    #[serde(default)]
    devices: DevicesQuery,
}

#[derive(Debug, Default, Deserialize)]
struct DevicesQuery {
    #[serde(default)]
    interface: Vec<InterfaceQuery>,
}

#[derive(Debug, Deserialize)]
struct InterfaceQuery {
    #[serde(default)]
    mac: Option<MacQuery>,
    #[serde(default)]
    source: Option<SourceQuery>,
    #[serde(default)]
    target: Option<TargetQuery>,
}

#[derive(Debug, Deserialize)]
struct MacQuery {
    #[serde(rename = "@address")]
    address: String,
}

#[derive(Debug, Deserialize)]
struct SourceQuery {
    #[serde(rename = "@bridge", default)]
    bridge: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TargetQuery {
    #[serde(rename = "@dev", default)]
    dev: Option<String>,
}

/// Pull the interfaces out of a domain description, tolerating all the
/// elements libvirt adds that this driver never wrote.
pub fn parse_interfaces(xml: &str) -> Result<Vec<ParsedInterface>> {
    let domain: DomainQuery =
        quick_xml::de::from_str(xml).map_err(|e| VirtError::DomainXml(e.to_string()))?;
    Ok(domain
        .devices
        .interface
        .into_iter()
        .map(|iface| ParsedInterface {
            mac: iface.mac.map(|m| m.address),
            bridge: iface.source.and_then(|s| s.bridge),
            device: iface.target.and_then(|t| t.dev),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm_config::{BackingStore, BridgeConfig, MountConfig, NetworkInterfaceConfig, OsVariant};
    use std::path::PathBuf;

    fn base_config() -> VmConfig {
        VmConfig {
            name: "90abcdef".to_string(),
            memory_mb: 4096,
            cpus: 2,
            primary_disk: PathBuf::from("/images/base.qcow2"),
            primary_disk_mb: 10240,
            disk_format: "qcow2".to_string(),
            hostname: "90abcdef".to_string(),
            network_interface: Some(NetworkInterfaceConfig {
                bridge: BridgeConfig {
                    name: "virbr0".to_string(),
                    ports: vec!["http".to_string()],
                },
            }),
            ..Default::default()
        }
    }

    #[test]
    fn builds_expected_elements() {
        let config = base_config();
        let xml = DomainXmlBuilder::new(&config)
            .cloudinit_iso(Path::new("/var/lib/virt/90abcdef.iso"))
            .build()
            .unwrap();

        assert!(xml.contains(r#"<domain type="kvm">"#));
        assert!(xml.contains("<name>90abcdef</name>"));
        assert!(xml.contains(r#"<memory unit="M">4096</memory>"#));
        assert!(xml.contains(r#"<source type="memfd"/>"#));
        assert!(xml.contains(r#"<access mode="shared"/>"#));
        assert!(xml.contains(r#"<vcpu placement="static">2</vcpu>"#));
        assert!(xml.contains(r#"<cpu mode="host-passthrough"/>"#));
        assert!(xml.contains(">hvm</type>"));
        assert!(xml.contains("ds=nocloud"));
        assert!(xml.contains("<on_poweroff>destroy</on_poweroff>"));
        assert!(xml.contains("<on_reboot>destroy</on_reboot>"));
        assert!(xml.contains("<on_crash>destroy</on_crash>"));
        assert!(xml.contains(r#"<suspend-to-mem enabled="no"/>"#));
        assert!(xml.contains(r#"<vmport state="off"/>"#));
        assert!(xml.contains(r#"<target dev="vda" bus="virtio"/>"#));
        assert!(xml.contains(r#"<target dev="sda" bus="sata"/>"#));
        assert!(xml.contains("/var/lib/virt/90abcdef.iso"));
        assert!(xml.contains(r#"<source bridge="virbr0"/>"#));
        assert!(xml.contains(r#"<target dev="vt-90abcdef"/>"#));
        assert!(xml.contains(r#"<model type="virtio"/>"#));
        assert!(xml.contains("/dev/urandom"));
        assert!(xml.contains(r#"<target type="isa-serial" port="0"/>"#));
        assert!(xml.contains(r#"<target type="serial" port="0"/>"#));
    }

    #[test]
    fn thin_clone_gets_a_backing_store() {
        let mut config = base_config();
        config.primary_disk = PathBuf::from("/var/lib/virt/90abcdef.img");
        config.backing = Some(BackingStore {
            path: PathBuf::from("/images/base.qcow2"),
            format: "raw".to_string(),
        });

        let xml = DomainXmlBuilder::new(&config).build().unwrap();
        assert!(xml.contains(r#"<backingStore type="file">"#));
        assert!(xml.contains(r#"<format type="raw"/>"#));
        assert!(xml.contains("/images/base.qcow2"));
    }

    #[test]
    fn os_variant_and_cpuset_are_applied() {
        let mut config = base_config();
        config.os = Some(OsVariant {
            arch: "x86_64".to_string(),
            machine: "q35".to_string(),
        });
        config.cpuset = Some("0-3".to_string());

        let xml = DomainXmlBuilder::new(&config).build().unwrap();
        assert!(xml.contains(r#"arch="x86_64""#));
        assert!(xml.contains(r#"machine="q35""#));
        assert!(xml.contains(r#"cpuset="0-3""#));
    }

    #[test]
    fn mounts_become_virtiofs_filesystems() {
        let mut config = base_config();
        config.mounts = vec![MountConfig {
            source: PathBuf::from("/srv/alloc"),
            tag: "alloc".to_string(),
            destination: "/alloc".to_string(),
            read_only: true,
        }];

        let xml = DomainXmlBuilder::new(&config).build().unwrap();
        assert!(xml.contains(r#"<filesystem type="mount" accessmode="passthrough">"#));
        assert!(xml.contains(r#"<driver type="virtiofs"/>"#));
        assert!(xml.contains(r#"<source dir="/srv/alloc"/>"#));
        assert!(xml.contains(r#"<target dir="alloc"/>"#));
        assert!(xml.contains("<readonly/>"));
    }

    #[test]
    fn valid_config_always_builds() {
        // validate() passing must imply build() succeeding
        let allowed = vec![PathBuf::from("/images")];
        for config in [
            base_config(),
            {
                let mut c = base_config();
                c.os = Some(OsVariant {
                    arch: "aarch64".to_string(),
                    machine: "virt".to_string(),
                });
                c
            },
            {
                let mut c = base_config();
                c.network_interface = None;
                c
            },
        ] {
            config.validate(&allowed).unwrap();
            DomainXmlBuilder::new(&config).build().unwrap();
        }
    }

    #[test]
    fn parses_interfaces_from_libvirt_enriched_xml() {
        let xml = r#"
        <domain type="kvm" id="7">
          <name>90abcdef</name>
          <uuid>7f1bb160-e7c6-4c7d-9c4d-3cf2b4a90566</uuid>
          <devices>
            <emulator>/usr/bin/qemu-system-x86_64</emulator>
            <disk type="file" device="disk">
              <source file="/images/base.qcow2"/>
              <target dev="vda" bus="virtio"/>
            </disk>
            <interface type="bridge">
              <mac address="52:54:00:ab:cd:ef"/>
              <source bridge="virbr0"/>
              <target dev="vt-90abcdef"/>
              <model type="virtio"/>
              <alias name="net0"/>
            </interface>
            <memballoon model="virtio"/>
          </devices>
        </domain>"#;

        let interfaces = parse_interfaces(xml).unwrap();
        assert_eq!(interfaces.len(), 1);
        assert_eq!(interfaces[0].mac.as_deref(), Some("52:54:00:ab:cd:ef"));
        assert_eq!(interfaces[0].bridge.as_deref(), Some("virbr0"));
        assert_eq!(interfaces[0].device.as_deref(), Some("vt-90abcdef"));
    }

    #[test]
    fn built_xml_parses_back() {
        let config = base_config();
        let xml = DomainXmlBuilder::new(&config)
            .mac(Some("52:54:00:ab:cd:ef".to_string()))
            .build()
            .unwrap();

        let interfaces = parse_interfaces(&xml).unwrap();
        assert_eq!(interfaces.len(), 1);
        assert_eq!(interfaces[0].mac.as_deref(), Some("52:54:00:ab:cd:ef"));
        assert_eq!(interfaces[0].bridge.as_deref(), Some("virbr0"));
    }
}
