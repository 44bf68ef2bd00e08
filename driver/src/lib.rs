//! Workload driver that runs virtual machines as first-class tasks.
//!
//! For every task the driver provisions a disk (with optional copy-on-write
//! cloning), synthesizes a first-boot cloud-init ISO, defines and starts a
//! domain in the configured hypervisor, wires up host-side port forwarding,
//! waits until the guest obtains an address, and monitors the VM until it
//! exits, at which point every host-side effect is reclaimed.
//!
//! [`driver::VirtDriver`] is the orchestrator-facing entry point; the
//! hypervisor backends live behind the [`providers::Virtualizer`] trait.

pub mod cloudinit;
pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod image;
pub mod net;
pub mod providers;
pub mod registry;
pub mod state;
pub mod task;
pub mod vm_config;

pub use config::Config;
pub use driver::VirtDriver;
pub use error::{Result, VirtError};
