//! Provider registry.
//!
//! Keeps one prototype per configured provider and dispenses a fresh handle
//! per call, so connection state is shared while every caller gets its own
//! cancellation view. Also aggregates provider fingerprints under a common
//! attribute namespace.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, VirtError};
use crate::providers::{Virtualizer, VmInfo};

/// Attribute prefix that providers may use to publish directly.
const ATTR_PASSTHROUGH_PREFIX: &str = "driver.virt";

struct RegisteredProvider {
    name: String,
    default: bool,
    prototype: Arc<dyn Virtualizer>,
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<RegisteredProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an initialized provider. The first registration becomes the
    /// default unless a later one is explicitly nominated.
    pub fn register(&mut self, name: &str, default: bool, provider: Arc<dyn Virtualizer>) {
        tracing::info!("Registered provider {name} (default: {default})");
        self.providers.push(RegisteredProvider {
            name: name.to_string(),
            default,
            prototype: provider,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name.clone()).collect()
    }

    /// Name of the provider that would serve `default_provider`.
    pub fn default_name(&self) -> Option<String> {
        self.providers
            .iter()
            .find(|p| p.default)
            .or_else(|| self.providers.first())
            .map(|p| p.name.clone())
    }

    /// Dispense a handle for a named provider.
    pub async fn get(&self, name: &str) -> Result<Box<dyn Virtualizer>> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| VirtError::ProviderNotFound(name.to_string()))?;
        provider.prototype.dispense().await
    }

    /// Dispense a handle for the default provider.
    pub async fn default_provider(&self) -> Result<Box<dyn Virtualizer>> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.default)
            .or_else(|| self.providers.first())
            .ok_or_else(|| VirtError::ProviderNotFound("default".to_string()))?;
        provider.prototype.dispense().await
    }

    /// Ask each provider for the VM; the first one that does not report
    /// not-found wins.
    pub async fn get_vm(&self, name: &str) -> Result<(String, VmInfo)> {
        for provider in &self.providers {
            match provider.prototype.get_vm(name).await {
                Ok(info) => return Ok((provider.name.clone(), info)),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(VirtError::DomainNotFound(name.to_string()))
    }

    /// Dispense a handle for the provider that owns the VM.
    pub async fn provider_for_vm(&self, name: &str) -> Result<Box<dyn Virtualizer>> {
        let (owner, _) = self.get_vm(name).await?;
        self.get(&owner).await
    }

    /// Aggregate fingerprints across providers. Attributes already under the
    /// `driver.virt` namespace pass through unchanged; everything else is
    /// nested under `driver.virt.provider.<name>.`.
    pub async fn fingerprint(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        for provider in &self.providers {
            for (key, value) in provider.prototype.fingerprint_attrs().await {
                if key.starts_with(ATTR_PASSTHROUGH_PREFIX) {
                    attrs.insert(key, value);
                } else {
                    attrs.insert(
                        format!("driver.virt.provider.{}.{key}", provider.name),
                        value,
                    );
                }
            }
        }
        attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{
        HostInfo, NetworkInterfaceInfo, NetworkLookup, VmState,
    };
    use crate::vm_config::VmConfig;

    /// Registry test double: knows one VM name and a fixed attribute set.
    struct StubProvider {
        name: String,
        owns: Option<String>,
        attrs: HashMap<String, String>,
    }

    impl StubProvider {
        fn new(name: &str, owns: Option<&str>) -> Arc<Self> {
            let mut attrs = HashMap::new();
            attrs.insert("version".to_string(), "1.2.3".to_string());
            attrs.insert(
                "driver.virt.active".to_string(),
                "1".to_string(),
            );
            Arc::new(Self {
                name: name.to_string(),
                owns: owns.map(str::to_string),
                attrs,
            })
        }
    }

    #[async_trait::async_trait]
    impl Virtualizer for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }
        async fn init(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn create_vm(&self, _config: &VmConfig) -> crate::error::Result<()> {
            Ok(())
        }
        async fn stop_vm(&self, _name: &str) -> crate::error::Result<()> {
            Ok(())
        }
        async fn destroy_vm(&self, _name: &str) -> crate::error::Result<()> {
            Ok(())
        }
        async fn get_vm(&self, name: &str) -> crate::error::Result<VmInfo> {
            if self.owns.as_deref() == Some(name) {
                Ok(VmInfo {
                    raw_state: "running".to_string(),
                    state: VmState::Running,
                    memory_kb: 0,
                    max_memory_kb: 0,
                    cpu_time_ns: 0,
                    num_vcpus: 1,
                })
            } else {
                Err(VirtError::DomainNotFound(name.to_string()))
            }
        }
        async fn get_info(&self) -> crate::error::Result<HostInfo> {
            Ok(HostInfo::default())
        }
        async fn get_network_interfaces(
            &self,
            _name: &str,
        ) -> crate::error::Result<Vec<NetworkInterfaceInfo>> {
            Ok(Vec::new())
        }
        fn network_lookup(&self) -> Arc<dyn NetworkLookup> {
            unimplemented!("not used in registry tests")
        }
        async fn fingerprint_attrs(&self) -> HashMap<String, String> {
            self.attrs.clone()
        }
        fn uses_cloud_init(&self) -> bool {
            true
        }
        async fn dispense(&self) -> crate::error::Result<Box<dyn Virtualizer>> {
            Ok(Box::new(StubProviderHandle {
                name: self.name.clone(),
            }))
        }
    }

    /// Dispensed handle; only needs to witness that dispensing happened.
    struct StubProviderHandle {
        name: String,
    }

    #[async_trait::async_trait]
    impl Virtualizer for StubProviderHandle {
        fn name(&self) -> &str {
            &self.name
        }
        async fn init(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn create_vm(&self, _config: &VmConfig) -> crate::error::Result<()> {
            Ok(())
        }
        async fn stop_vm(&self, _name: &str) -> crate::error::Result<()> {
            Ok(())
        }
        async fn destroy_vm(&self, _name: &str) -> crate::error::Result<()> {
            Ok(())
        }
        async fn get_vm(&self, name: &str) -> crate::error::Result<VmInfo> {
            Err(VirtError::DomainNotFound(name.to_string()))
        }
        async fn get_info(&self) -> crate::error::Result<HostInfo> {
            Ok(HostInfo::default())
        }
        async fn get_network_interfaces(
            &self,
            _name: &str,
        ) -> crate::error::Result<Vec<NetworkInterfaceInfo>> {
            Ok(Vec::new())
        }
        fn network_lookup(&self) -> Arc<dyn NetworkLookup> {
            unimplemented!("not used in registry tests")
        }
        async fn fingerprint_attrs(&self) -> HashMap<String, String> {
            HashMap::new()
        }
        fn uses_cloud_init(&self) -> bool {
            true
        }
        async fn dispense(&self) -> crate::error::Result<Box<dyn Virtualizer>> {
            Err(VirtError::NotSupported("nested dispense"))
        }
    }

    fn registry() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register("libvirt", false, StubProvider::new("libvirt", Some("vm-a")));
        registry.register(
            "cloud-hypervisor",
            true,
            StubProvider::new("cloud-hypervisor", Some("vm-b")),
        );
        registry
    }

    #[tokio::test]
    async fn explicit_default_wins() {
        let registry = registry();
        let handle = registry.default_provider().await.unwrap();
        assert_eq!(handle.name(), "cloud-hypervisor");
    }

    #[tokio::test]
    async fn first_registered_is_default_fallback() {
        let mut registry = ProviderRegistry::new();
        registry.register("libvirt", false, StubProvider::new("libvirt", None));
        registry.register("other", false, StubProvider::new("other", None));
        let handle = registry.default_provider().await.unwrap();
        assert_eq!(handle.name(), "libvirt");
    }

    #[tokio::test]
    async fn get_vm_traverses_providers() {
        let registry = registry();
        let (owner, info) = registry.get_vm("vm-b").await.unwrap();
        assert_eq!(owner, "cloud-hypervisor");
        assert_eq!(info.state, VmState::Running);

        let err = registry.get_vm("vm-c").await.unwrap_err();
        assert!(matches!(err, VirtError::DomainNotFound(_)));
    }

    #[tokio::test]
    async fn unknown_provider_name_errors() {
        let registry = registry();
        let err = registry.get("vmware").await.unwrap_err();
        assert!(matches!(err, VirtError::ProviderNotFound(_)));
    }

    #[tokio::test]
    async fn fingerprint_prefixes_unqualified_attributes() {
        let registry = registry();
        let attrs = registry.fingerprint().await;

        // Unqualified keys are nested per provider.
        assert_eq!(
            attrs.get("driver.virt.provider.libvirt.version").unwrap(),
            "1.2.3"
        );
        assert_eq!(
            attrs
                .get("driver.virt.provider.cloud-hypervisor.version")
                .unwrap(),
            "1.2.3"
        );
        // Already-qualified keys pass through unchanged.
        assert_eq!(attrs.get("driver.virt.active").unwrap(), "1");
        assert!(!attrs.contains_key("driver.virt.provider.libvirt.driver.virt.active"));
    }
}
